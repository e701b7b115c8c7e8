use clap::{Parser, Subcommand};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use vendorpatch::{ErrorKind, Result};
use vendorpatch::config::ConfigDoc;
use vendorpatch::executor::{ExecCtx, RunOverrides, StdoutSink, config_base_dir};
use vendorpatch::manifest::SourceManifest;
use vendorpatch::modules::{self, native, stage, vendor};
use vendorpatch::planner::Plan;
use vendorpatch::vendor::{DiffStrategy, VendorConfig};
use vendorpatch::workspace::WorkspaceConfig;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Workflow definition TOML
    #[arg(short, long, global = true, default_value = "vendorpatch.toml")]
    config: PathBuf,
    /// Emit tracing events as JSON on stderr (filter with VP_LOG)
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the computed task plan
    Plan {
        /// Print GraphViz dot instead of a linear plan
        #[arg(long)]
        dot: bool,
    },
    /// Execute the whole plan: patch, stage, build, collect
    Run {
        /// Print what would run without executing task bodies
        #[arg(long)]
        dry_run: bool,
        /// Native build parallelism (0 = CPU count)
        #[arg(long)]
        jobs: Option<usize>,
        /// Re-initialize a checkout with unrecorded edits
        #[arg(long)]
        force: bool,
    },
    /// Print the fully-resolved TOML (after imports/extends)
    Resolve,
    /// Sync the pinned checkout and apply the patch
    Init {
        /// Discard unrecorded edits in the checkout
        #[arg(long)]
        force: bool,
        /// Also prepare the pristine/modified workspace
        #[arg(long)]
        dual: bool,
    },
    /// Regenerate the patch file from the current edits
    #[command(name = "gen-patch", alias = "generate-patch")]
    GenPatch {
        /// checkout or dual (defaults to vendor.strategy)
        #[arg(long)]
        strategy: Option<String>,
    },
    /// Print the edits that gen-patch would record
    Diff {
        #[arg(long)]
        strategy: Option<String>,
        /// Passed through to `git diff` (checkout strategy), e.g. `--stat` or a pathspec
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        git_args: Vec<String>,
    },
    /// Copy manifest files into the staging tree
    Stage,
    /// Stage, configure, build and collect the native extension
    Build {
        #[arg(long)]
        jobs: Option<usize>,
    },
    /// Remove the pristine/modified workspace
    Teardown,
    /// Show checkout, marker and patch state
    Status,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_json);
    match dispatch(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.kind() == ErrorKind::Other => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("error: {}: {e}", e.kind().as_str());
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_env("VP_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .without_time()
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn dispatch(args: Args) -> Result<()> {
    let path = args.config.as_path();
    match args.cmd {
        Command::Plan { dot } => cmd_plan(path, dot),
        Command::Run {
            dry_run,
            jobs,
            force,
        } => cmd_run(path, dry_run, RunOverrides { jobs, force }),
        Command::Resolve => cmd_resolve(path),
        Command::Init { force, dual } => cmd_init(path, force, dual),
        Command::GenPatch { strategy } => cmd_gen_patch(path, strategy.as_deref()),
        Command::Diff {
            strategy,
            git_args,
        } => cmd_diff(path, strategy.as_deref(), git_args),
        Command::Stage => cmd_steps(path, &[stage::SourcesTask::ID], RunOverrides::default()),
        Command::Build { jobs } => cmd_build(path, jobs),
        Command::Teardown => cmd_teardown(path),
        Command::Status => cmd_status(path),
    }
}

fn load_plan(doc: &ConfigDoc) -> Result<Plan> {
    let mut plan = Plan::default();
    for m in &modules::builtin_modules() {
        if m.detect(doc) {
            m.plan(doc, &mut plan)?;
        }
    }
    plan.finalize_default()?;
    Ok(plan)
}

/// Failed-task logs land under `<build_dir>/error-logs`.
fn context(doc: &ConfigDoc, overrides: RunOverrides, dry_run: bool) -> Result<ExecCtx> {
    let ws: WorkspaceConfig = doc.section("workspace")?;
    let paths = vendorpatch::workspace::load_paths(&ws, &config_base_dir(doc)?)?;
    let sink = Arc::new(StdoutSink::with_error_logs_root(
        paths.build_dir.join("error-logs"),
    ));
    Ok(ExecCtx::new(dry_run, sink).with_overrides(overrides))
}

fn cmd_plan(path: &Path, dot: bool) -> Result<()> {
    let doc = vendorpatch::config::load(path)?;
    let plan = load_plan(&doc)?;

    if dot {
        print!("{}", plan.to_dot()?);
        return Ok(());
    }

    for (i, task) in plan.ordered()?.iter().enumerate() {
        println!(
            "{:>2}. {:<22}  {:<8} {:<10}  {}",
            i + 1,
            task.id,
            task.module,
            task.phase,
            task.label
        );
    }
    Ok(())
}

fn cmd_resolve(path: &Path) -> Result<()> {
    let doc = vendorpatch::config::load(path)?;
    let s = toml::to_string_pretty(&doc.value).unwrap_or_else(|_| format!("{:?}", doc.value));
    print!("{s}");
    Ok(())
}

fn cmd_run(path: &Path, dry_run: bool, overrides: RunOverrides) -> Result<()> {
    let doc = vendorpatch::config::load(path)?;
    let plan = load_plan(&doc)?;
    let reg = vendorpatch::executor::builtin_registry()?;
    let mut ctx = context(&doc, overrides, dry_run)?;
    vendorpatch::executor::execute_plan(&doc, &plan, &reg, &mut ctx)
}

/// Run `core.init` plus the named tasks, in plan order.
fn cmd_steps(path: &Path, ids: &[&str], overrides: RunOverrides) -> Result<()> {
    let doc = vendorpatch::config::load(path)?;
    run_steps(&doc, ids, &mut context(&doc, overrides, false)?)
}

fn run_steps(doc: &ConfigDoc, ids: &[&str], ctx: &mut ExecCtx) -> Result<()> {
    let plan = load_plan(doc)?;
    let mut wanted = vec![modules::core::INIT_TASK];
    wanted.extend_from_slice(ids);
    let sub = plan.select(&wanted)?;
    let reg = vendorpatch::executor::builtin_registry()?;
    vendorpatch::executor::execute_plan(doc, &sub, &reg, ctx)
}

fn cmd_init(path: &Path, force: bool, dual: bool) -> Result<()> {
    let doc = vendorpatch::config::load(path)?;
    let overrides = RunOverrides {
        force,
        ..RunOverrides::default()
    };
    let mut ctx = context(&doc, overrides, false)?;
    run_steps(&doc, &[vendor::InitTask::ID], &mut ctx)?;
    if dual {
        ctx.set_task(vendor::DualTask::ID);
        let manifest = SourceManifest::from_doc(&doc)?;
        vendor::manager(&doc, &ctx)?.initialize_dual_workspace(&ctx, &manifest)?;
    }
    Ok(())
}

fn cmd_build(path: &Path, jobs: Option<usize>) -> Result<()> {
    let doc = vendorpatch::config::load(path)?;
    let plan = load_plan(&doc)?;
    let mut ids = Vec::new();
    if plan.get(stage::SourcesTask::ID).is_some() {
        ids.push(stage::SourcesTask::ID);
    }
    ids.extend([
        native::ConfigureTask::ID,
        native::BuildTask::ID,
        native::CollectTask::ID,
    ]);
    let overrides = RunOverrides {
        jobs,
        ..RunOverrides::default()
    };
    run_steps(&doc, &ids, &mut context(&doc, overrides, false)?)
}

fn strategy_for(doc: &ConfigDoc, raw: Option<&str>) -> Result<DiffStrategy> {
    match raw {
        Some(s) => DiffStrategy::parse(s),
        None => Ok(doc.section::<VendorConfig>("vendor")?.strategy),
    }
}

fn manifest_for(doc: &ConfigDoc, strategy: DiffStrategy) -> Result<Option<SourceManifest>> {
    match strategy {
        DiffStrategy::Dual => SourceManifest::from_doc(doc).map(Some),
        DiffStrategy::Checkout => Ok(None),
    }
}

fn cmd_gen_patch(path: &Path, strategy: Option<&str>) -> Result<()> {
    let doc = vendorpatch::config::load(path)?;
    let strategy = strategy_for(&doc, strategy)?;
    let manifest = manifest_for(&doc, strategy)?;
    let mut ctx = context(&doc, RunOverrides::default(), false)?;
    ctx.set_task("vendor.gen-patch");

    let mgr = vendor::manager(&doc, &ctx)?;
    let provider = mgr.diff_provider(strategy, manifest.as_ref())?;
    for file in mgr.patch_engine().generate_patch(&ctx, provider.as_ref())? {
        println!("{file}");
    }
    Ok(())
}

fn cmd_diff(path: &Path, strategy: Option<&str>, git_args: Vec<String>) -> Result<()> {
    let doc = vendorpatch::config::load(path)?;
    let strategy = strategy_for(&doc, strategy)?;
    let manifest = manifest_for(&doc, strategy)?;
    let mut ctx = context(&doc, RunOverrides::default(), false)?;
    ctx.set_task("vendor.diff");

    let mgr = vendor::manager(&doc, &ctx)?;
    let provider = mgr.diff_provider_with_args(strategy, manifest.as_ref(), git_args)?;
    let diff = mgr.patch_engine().show_pending_diff(&ctx, provider.as_ref())?;
    let mut out = std::io::stdout().lock();
    out.write_all(&diff)?;
    out.flush()?;
    Ok(())
}

fn cmd_teardown(path: &Path) -> Result<()> {
    let doc = vendorpatch::config::load(path)?;
    let mut ctx = context(&doc, RunOverrides::default(), false)?;
    ctx.set_task("vendor.teardown");
    vendor::manager(&doc, &ctx)?.teardown(&ctx)
}

fn cmd_status(path: &Path) -> Result<()> {
    let doc = vendorpatch::config::load(path)?;
    let mut ctx = context(&doc, RunOverrides::default(), false)?;
    ctx.set_task("vendor.status");
    let mgr = vendor::manager(&doc, &ctx)?;
    let paths = mgr.paths();

    println!("checkout: {}", paths.checkout.display());
    println!("  state: {}", mgr.tree_state(&ctx)?);
    if mgr.vcs().is_work_tree(&ctx)? {
        println!("  head: {}", mgr.vcs().head(&ctx)?);
    }
    match mgr.state_file().read()? {
        Some(m) => println!("  marker: {} ({})", m.phase.as_str(), m.updated_at),
        None => println!("  marker: none"),
    }
    println!("patch: {}", paths.patch_file.display());
    match mgr.patch_engine().fingerprint()? {
        Some(sha) => println!("  sha256: {sha}"),
        None => println!("  missing"),
    }
    println!(
        "dual workspace: {}",
        if paths.modified_dir.exists() {
            "present"
        } else {
            "absent"
        }
    );
    let staged = stage::staging_root(&doc, &ctx)?;
    if staged.is_dir() {
        println!("staged: {}", staged.display());
    }
    Ok(())
}
