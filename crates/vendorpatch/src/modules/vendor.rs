use serde::Deserialize;
use vendorpatch_macros::{Module, Task};

use crate::config::ConfigDoc;
use crate::error::Result;
use crate::executor::ExecCtx;
use crate::manifest::SourceManifest;
use crate::modules::util;
use crate::vendor::{VendorConfig, WorkspaceManager};

fn default_true() -> bool {
    true
}

/// Workspace manager for the `[vendor]` table of `doc`.
pub fn manager(doc: &ConfigDoc, ctx: &ExecCtx) -> Result<WorkspaceManager> {
    let cfg: VendorConfig = doc.section("vendor")?;
    let ws = ctx.workspace_paths_or_init(doc)?;
    let run_dir = util::run_dir(doc, ctx)?;
    WorkspaceManager::from_config(&cfg, &ws, &run_dir)
}

#[Task(
    id = "vendor.init",
    module = "vendor",
    phase = "patch",
    provides = ["sources:patched"],
    after = ["core.init"],
    default_label = "Sync checkout and apply patch"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InitTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for InitTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl InitTask {
    fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let force = ctx.overrides.force;
        manager(doc, ctx)?.initialize(ctx, force)
    }
}

/// Off unless `[vendor.steps.dual] enabled = true`.
#[Task(
    id = "vendor.dual",
    module = "vendor",
    phase = "workspace",
    provides = ["vendor:dual"],
    after = ["vendor.init?"],
    default_label = "Prepare pristine/modified workspace"
)]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DualTask {
    pub enabled: bool,
    pub label: Option<String>,
}

impl DualTask {
    fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let manifest = SourceManifest::from_doc(doc)?;
        manager(doc, ctx)?.initialize_dual_workspace(ctx, &manifest)
    }
}

#[Module(
    id = "vendor",
    config = VendorConfig,
    config_path = "vendor",
    tasks = [InitTask, DualTask]
)]
pub struct VendorModule;
