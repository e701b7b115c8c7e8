use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;

use serde::Deserialize;
use vendorpatch_macros::{Module, Task};

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::manifest::{SourceManifest, StageReport, prune_stale, stage_all};
use crate::modules::util;
use crate::vendor::VendorConfig;
use crate::vendor::git::{GitTree, Vcs};

fn default_true() -> bool {
    true
}

fn default_dest() -> String {
    "@build/staged".into()
}

/// A command run before copying, e.g. a script that writes a version header.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GenerateHook {
    pub run: Vec<String>,
    /// Defaults to the manifest root inside the checkout.
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_dest")]
    pub dest: String,
    /// Delete staged files the manifest no longer lists.
    pub prune: bool,
    pub generate: Vec<GenerateHook>,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dest: default_dest(),
            prune: false,
            generate: Vec::new(),
        }
    }
}

pub fn staging_root(doc: &ConfigDoc, ctx: &ExecCtx) -> Result<PathBuf> {
    let cfg: StageConfig = doc.section("stage")?;
    ctx.workspace_paths_or_init(doc)?.resolve_config_path(&cfg.dest)
}

/// Refresh the staged tree from the checkout and record what was copied.
pub fn stage_sources(doc: &ConfigDoc, ctx: &ExecCtx) -> Result<StageReport> {
    let cfg: StageConfig = doc.section("stage")?;
    let vendor: VendorConfig = doc.section("vendor")?;
    let ws = ctx.workspace_paths_or_init(doc)?;
    let manifest = SourceManifest::from_doc(doc)?;
    let checkout = ws.resolve_config_path(&vendor.checkout)?;
    let dest = ws.resolve_config_path(&cfg.dest)?;

    if let Some(rev) = manifest.revision() {
        let vcs = GitTree::new(&checkout, false);
        if vcs.is_work_tree(ctx)? {
            let head = vcs.head(ctx)?;
            if !head.starts_with(rev) {
                return Err(Error::msg(format!(
                    "manifest was written for upstream {rev} but {} is at {head}; \
                     switch to the manifest for this revision",
                    checkout.display()
                )));
            }
        } else {
            ctx.warn(&format!(
                "cannot verify manifest revision {rev}: {} is not a git work tree",
                checkout.display()
            ));
        }
    }

    let source_dir = manifest.source_dir(&checkout);
    for hook in &cfg.generate {
        let Some((program, args)) = hook.run.split_first() else {
            return Err(Error::msg("stage.generate entry has an empty `run`"));
        };
        let cwd = match ws.resolve_optional(hook.cwd.as_deref())? {
            Some(p) => p,
            None => source_dir.clone(),
        };
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&cwd).envs(&hook.env);
        ctx.run_cmd(cmd)?;
    }

    if cfg.prune {
        for removed in prune_stale(&manifest, &dest)? {
            ctx.log(&format!("pruned {removed}"));
        }
    }

    let report = stage_all(&manifest, &checkout, &dest)?;
    ctx.log(&format!(
        "staged {} file(s) into {} ({} changed)",
        report.files.len(),
        dest.display(),
        report.changed_count()
    ));

    let out = util::module_dir(doc, ctx, "stage")?.join("manifest.json");
    util::write_json_pretty(
        &out,
        &serde_json::json!({
            "revision": manifest.revision(),
            "checkout": checkout.display().to_string(),
            "dest": dest.display().to_string(),
            "staged_at": util::now_rfc3339(),
            "files": report.files,
        }),
    )?;
    Ok(report)
}

#[Task(
    id = "stage.sources",
    module = "stage",
    phase = "stage",
    provides = ["sources:staged"],
    after = ["core.init", "sources:patched?", "vendor:dual?"],
    default_label = "Stage manifest files"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourcesTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for SourcesTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl SourcesTask {
    fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        stage_sources(doc, ctx).map(|_| ())
    }
}

#[Module(
    id = "stage",
    config = StageConfig,
    config_path = "stage",
    detect = "manifest",
    tasks = [SourcesTask]
)]
pub struct StageModule;
