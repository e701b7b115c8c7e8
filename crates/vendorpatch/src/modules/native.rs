use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use vendorpatch_macros::{Module, Task};

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::{stage, util};
use crate::native::artifacts::{NamingPolicy, copy_replacing, normalize_extension, stage_artifacts};
use crate::native::{BuildRequest, BuildType, ToolchainConfig, ToolchainHints};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtensionConfig {
    /// Target name in CMake; the produced file starts with it.
    pub name: String,
    pub naming: NamingPolicy,
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            naming: NamingPolicy::StripAbiSuffix,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ArtifactsConfig {
    /// Package directory auxiliary executables are copied into.
    pub package_bin_dir: Option<String>,
    /// Also copy the normalized extension there.
    pub include_extension: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NativeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub cmake: String,
    pub generator: Option<String>,
    /// Defaults to the staged tree.
    pub source_dir: Option<String>,
    pub build_dir: String,
    pub build_type: BuildType,
    pub library_output_dir: String,
    pub binary_output_dir: String,
    pub parallelism: Option<usize>,
    pub defines: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub toolchain: ToolchainConfig,
    pub extension: Option<ExtensionConfig>,
    pub artifacts: ArtifactsConfig,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cmake: "cmake".into(),
            generator: None,
            source_dir: None,
            build_dir: "@build/native".into(),
            build_type: BuildType::Release,
            library_output_dir: "@out/lib".into(),
            binary_output_dir: "@build/native/bin".into(),
            parallelism: None,
            defines: BTreeMap::new(),
            env: BTreeMap::new(),
            toolchain: ToolchainConfig::default(),
            extension: None,
            artifacts: ArtifactsConfig::default(),
        }
    }
}

/// Resolve `[native]` into a request. Toolchain probe commands only run when
/// `probe_hints` is set, since only configure consumes them.
pub fn build_request(doc: &ConfigDoc, ctx: &ExecCtx, probe_hints: bool) -> Result<BuildRequest> {
    let cfg: NativeConfig = doc.section("native")?;
    let ws = ctx.workspace_paths_or_init(doc)?;
    let source_dir = match ws.resolve_optional(cfg.source_dir.as_deref())? {
        Some(p) => p,
        None => stage::staging_root(doc, ctx)?,
    };
    let hints = if probe_hints {
        ToolchainHints::probe(ctx, &cfg.toolchain, &ws.root)?
    } else {
        ToolchainHints::default()
    };
    Ok(BuildRequest {
        cmake: cfg.cmake.clone(),
        source_dir,
        build_dir: ws.resolve_config_path(&cfg.build_dir)?,
        library_output_dir: ws.resolve_config_path(&cfg.library_output_dir)?,
        binary_output_dir: ws.resolve_config_path(&cfg.binary_output_dir)?,
        build_type: cfg.build_type,
        generator: cfg.generator.clone(),
        hints,
        defines: cfg.defines.clone(),
        env: cfg.env.clone(),
        parallelism: ctx.overrides.jobs.or(cfg.parallelism),
    })
}

#[derive(Debug, Clone, Default)]
pub struct Collected {
    pub extension: Option<PathBuf>,
    pub binaries: Vec<PathBuf>,
}

/// Rename the extension to its stable name and copy executables into the
/// package, then write `manifest.json` listing both with their hashes.
pub fn collect(doc: &ConfigDoc, ctx: &ExecCtx) -> Result<Collected> {
    let cfg: NativeConfig = doc.section("native")?;
    let req = build_request(doc, ctx, false)?;
    let ws = ctx.workspace_paths_or_init(doc)?;

    let extension = match &cfg.extension {
        Some(ext) if !ext.name.trim().is_empty() => {
            let path = normalize_extension(&req.library_output_dir, ext.name.trim(), &ext.naming)?;
            ctx.log(&format!("extension: {}", path.display()));
            Some(path)
        }
        Some(_) => return Err(Error::msg("native.extension.name is empty")),
        None => None,
    };

    let mut binaries = Vec::new();
    if let Some(bin_dir) = ws.resolve_optional(cfg.artifacts.package_bin_dir.as_deref())? {
        binaries = stage_artifacts(&req.binary_output_dir, &bin_dir)?;
        if cfg.artifacts.include_extension {
            if let Some(ext) = &extension {
                let name = ext
                    .file_name()
                    .ok_or_else(|| Error::msg(format!("bad extension path {}", ext.display())))?;
                binaries.push(copy_replacing(ext, &bin_dir.join(name))?);
            }
        }
        for b in &binaries {
            ctx.log(&format!("packaged {}", b.display()));
        }
    }

    let entry = |p: &Path| -> Result<serde_json::Value> {
        Ok(serde_json::json!({
            "path": p.display().to_string(),
            "sha256": util::sha256_file_hex(p)?,
        }))
    };
    let report = serde_json::json!({
        "build_type": req.build_type.as_str(),
        "extension": extension.as_deref().map(entry).transpose()?,
        "binaries": binaries.iter().map(|p| entry(p)).collect::<Result<Vec<_>>>()?,
        "collected_at": util::now_rfc3339(),
    });
    util::write_json_pretty(&util::module_dir(doc, ctx, "native")?.join("manifest.json"), &report)?;

    Ok(Collected {
        extension,
        binaries,
    })
}

#[Task(
    id = "native.configure",
    module = "native",
    phase = "configure",
    provides = ["native:configured"],
    after = ["sources:done"],
    default_label = "CMake configure"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConfigureTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for ConfigureTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl ConfigureTask {
    fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        build_request(doc, ctx, true)?.configure(ctx)
    }
}

#[Task(
    id = "native.build",
    module = "native",
    phase = "build",
    provides = ["native:built"],
    after = ["native.configure"],
    default_label = "CMake build"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BuildTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for BuildTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl BuildTask {
    fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        build_request(doc, ctx, false)?.build(ctx)
    }
}

#[Task(
    id = "native.collect",
    module = "native",
    phase = "package",
    provides = ["native:collected"],
    after = ["native.build"],
    default_label = "Collect native artifacts"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for CollectTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl CollectTask {
    fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        collect(doc, ctx).map(|_| ())
    }
}

#[Module(
    id = "native",
    config = NativeConfig,
    config_path = "native",
    tasks = [ConfigureTask, BuildTask, CollectTask]
)]
pub struct NativeModule;
