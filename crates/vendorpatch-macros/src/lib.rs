//! `#[Task]` and `#[Module]` attribute macros.
//!
//! A `#[Task]` struct is the step's config table (it must derive
//! `Deserialize` + `Default` and carry `enabled: bool` and
//! `label: Option<String>`) and must provide
//! `fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()>`.
//! The macro adds `plan`/`exec` glue and the task's constants.
//!
//! A `#[Module]` struct lists its tasks and implements `Module` and
//! `ModuleExec` for them. `detect` names the table whose presence enables
//! the module when that is not the module's own config table.

use proc_macro::TokenStream;

use quote::quote;
use syn::{
    Attribute, Expr, ExprArray, ExprLit, ExprPath, ItemStruct, Lit, Meta, Token, parse::Parser,
    spanned::Spanned,
};

#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Task(attr: TokenStream, item: TokenStream) -> TokenStream {
    match task_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Module(attr: TokenStream, item: TokenStream) -> TokenStream {
    match module_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

fn lit_str(expr: &Expr) -> syn::Result<String> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => Ok(s.value()),
        _ => Err(syn::Error::new(expr.span(), "expected string literal")),
    }
}

fn array_elems(expr: &Expr) -> syn::Result<impl Iterator<Item = &Expr>> {
    match expr {
        Expr::Array(ExprArray { elems, .. }) => Ok(elems.iter()),
        _ => Err(syn::Error::new(expr.span(), "expected array literal")),
    }
}

fn array_strings(expr: &Expr) -> syn::Result<Vec<String>> {
    array_elems(expr)?.map(lit_str).collect()
}

fn array_paths(expr: &Expr) -> syn::Result<Vec<syn::Path>> {
    array_elems(expr)?
        .map(|e| match e {
            Expr::Path(ExprPath { path, .. }) => Ok(path.clone()),
            _ => Err(syn::Error::new(e.span(), "expected path (identifier)")),
        })
        .collect()
}

fn type_of(expr: &Expr) -> syn::Result<syn::Type> {
    match expr {
        Expr::Path(ExprPath { path, .. }) => Ok(syn::Type::Path(syn::TypePath {
            qself: None,
            path: path.clone(),
        })),
        _ => Err(syn::Error::new(expr.span(), "expected type path")),
    }
}

fn without_our_attrs(attrs: &[Attribute]) -> Vec<Attribute> {
    attrs
        .iter()
        .filter(|a| !(a.path().is_ident("Task") || a.path().is_ident("Module")))
        .cloned()
        .collect()
}

/// Parse `key = value, ...` pairs and hand each to `on_pair`.
fn for_each_pair(
    attr: TokenStream,
    what: &str,
    mut on_pair: impl FnMut(&str, &Expr, proc_macro2::Span) -> syn::Result<()>,
) -> syn::Result<()> {
    let parser = syn::punctuated::Punctuated::<Meta, Token![,]>::parse_terminated;
    for m in parser.parse(attr)? {
        let Meta::NameValue(nv) = m else {
            return Err(syn::Error::new(m.span(), "expected key = value"));
        };
        let Some(key) = nv.path.get_ident().map(|i| i.to_string()) else {
            return Err(syn::Error::new(nv.path.span(), "expected ident key"));
        };
        on_pair(&key, &nv.value, nv.path.span()).map_err(|e| {
            syn::Error::new(e.span(), format!("{what}: {e}"))
        })?;
    }
    Ok(())
}

fn task_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = without_our_attrs(&st.attrs);
    let ident = st.ident.clone();

    let mut id: Option<String> = None;
    let mut module: Option<String> = None;
    let mut phase: Option<String> = None;
    let mut config_path: Option<String> = None;
    let mut provides: Vec<String> = Vec::new();
    let mut after: Vec<String> = Vec::new();
    let mut default_label: Option<String> = None;

    for_each_pair(attr, "Task", |key, v, span| {
        match key {
            "id" => id = Some(lit_str(v)?),
            "module" => module = Some(lit_str(v)?),
            "phase" => phase = Some(lit_str(v)?),
            "config_path" => config_path = Some(lit_str(v)?),
            "provides" => provides = array_strings(v)?,
            "after" => after = array_strings(v)?,
            "default_label" => default_label = Some(lit_str(v)?),
            other => {
                return Err(syn::Error::new(
                    span,
                    format!("unknown attribute key '{other}'"),
                ));
            }
        }
        Ok(())
    })?;

    let missing = |what: &str| syn::Error::new(ident.span(), format!("Task: missing {what}"));
    let id = id.ok_or_else(|| missing("id"))?;
    let module = module.ok_or_else(|| missing("module"))?;
    let phase = phase.ok_or_else(|| missing("phase"))?;
    let default_label = default_label.ok_or_else(|| missing("default_label"))?;

    // Default config location: <module>.steps.<last id segment>.
    let config_path = match config_path {
        Some(p) => p,
        None => {
            let Some(step) = id.strip_prefix(&format!("{module}.")) else {
                return Err(syn::Error::new(
                    ident.span(),
                    "Task: config_path omitted but id does not start with '<module>.'",
                ));
            };
            let step = step.rsplit('.').next().unwrap_or(step);
            format!("{module}.steps.{step}")
        }
    };

    let expanded = quote! {
        #st

        impl #ident {
            pub const ID: &'static str = #id;
            pub const MODULE: &'static str = #module;
            pub const PHASE: &'static str = #phase;
            pub const CONFIG_PATH: &'static str = #config_path;

            pub fn load(doc: &crate::config::ConfigDoc) -> crate::Result<Self> {
                doc.section::<Self>(#config_path)
            }

            pub fn plan(doc: &crate::config::ConfigDoc, plan: &mut crate::planner::Plan) -> crate::Result<()> {
                let cfg = Self::load(doc)?;
                if !cfg.enabled {
                    return Ok(());
                }
                plan.add(crate::planner::Task {
                    id: #id.to_string(),
                    label: cfg.label.clone().unwrap_or_else(|| #default_label.to_string()),
                    module: #module.to_string(),
                    phase: #phase.to_string(),
                    after: vec![#(#after.to_string()),*],
                    provides: vec![#(#provides.to_string()),*],
                })
            }

            pub fn exec(doc: &crate::config::ConfigDoc, ctx: &mut crate::executor::ExecCtx) -> crate::Result<()> {
                let cfg = Self::load(doc)?;
                if !cfg.enabled {
                    return Ok(());
                }
                ctx.set_task(#id);
                if ctx.dry_run {
                    ctx.log(&format!("DRY-RUN: exec {}", #id));
                    return Ok(());
                }
                let span = tracing::info_span!("task", id = #id, phase = #phase);
                let _guard = span.enter();
                Self::run(&cfg, doc, ctx)
            }
        }
    };

    Ok(expanded.into())
}

fn module_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = without_our_attrs(&st.attrs);
    let ident = st.ident.clone();

    let mut id: Option<String> = None;
    let mut config_ty: Option<syn::Type> = None;
    let mut config_path: Option<String> = None;
    let mut detect: Option<String> = None;
    let mut tasks: Option<Vec<syn::Path>> = None;

    for_each_pair(attr, "Module", |key, v, span| {
        match key {
            "id" => id = Some(lit_str(v)?),
            "config" => config_ty = Some(type_of(v)?),
            "config_path" => config_path = Some(lit_str(v)?),
            "detect" => detect = Some(lit_str(v)?),
            "tasks" => tasks = Some(array_paths(v)?),
            other => {
                return Err(syn::Error::new(
                    span,
                    format!("unknown attribute key '{other}'"),
                ));
            }
        }
        Ok(())
    })?;

    let missing = |what: &str| syn::Error::new(ident.span(), format!("Module: missing {what}"));
    let id = id.ok_or_else(|| missing("id"))?;
    let config_ty = config_ty.ok_or_else(|| missing("config"))?;
    let config_path = config_path.unwrap_or_else(|| id.clone());
    // The module is active when this table exists; defaults to its own table.
    let detect = detect.unwrap_or_else(|| config_path.clone());
    let tasks = tasks.ok_or_else(|| missing("tasks"))?;

    let plan_tasks = tasks.iter().map(|p| quote! { #p::plan(doc, plan)?; });
    let reg_tasks = tasks.iter().map(|p| quote! { reg.add(#p::ID, #p::exec)?; });

    let expanded = quote! {
        #st

        impl crate::modules::Module for #ident {
            fn id(&self) -> &'static str {
                #id
            }

            fn detect(&self, doc: &crate::config::ConfigDoc) -> bool {
                doc.has_table_path(#detect)
            }

            fn plan(&self, doc: &crate::config::ConfigDoc, plan: &mut crate::planner::Plan) -> crate::Result<()> {
                let cfg = doc.section::<#config_ty>(#config_path)?;
                if !cfg.enabled {
                    return Ok(());
                }
                #(#plan_tasks)*
                Ok(())
            }
        }

        impl crate::executor::ModuleExec for #ident {
            fn register_tasks(reg: &mut crate::executor::TaskRegistry) -> crate::Result<()> {
                #(#reg_tasks)*
                Ok(())
            }
        }
    };

    Ok(expanded.into())
}
