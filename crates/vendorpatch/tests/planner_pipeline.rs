use std::sync::Arc;

use vendorpatch::config::ConfigDoc;
use vendorpatch::executor::{ExecCtx, ExecEvent, MemorySink};
use vendorpatch::planner::Plan;

fn build_plan(doc: &ConfigDoc) -> vendorpatch::Result<Plan> {
    let mut plan = Plan::default();
    for m in vendorpatch::modules::builtin_modules() {
        if m.detect(doc) {
            m.plan(doc, &mut plan)?;
        }
    }
    plan.finalize_default()?;
    Ok(plan)
}

fn ordered_ids(plan: &Plan) -> Vec<String> {
    plan.ordered()
        .expect("ordered")
        .into_iter()
        .map(|t| t.id.clone())
        .collect()
}

const FULL: &str = r#"
[workspace]
root_dir = "."

[vendor]
checkout = "third_party/resample"
patch = "patches/resample.patch"

[manifest]
root = "src"
files = ["CMakeLists.txt", "a/one.h", "a/one.cc"]

[native]
build_type = "Debug"

[native.extension]
name = "resample"
"#;

#[test]
fn full_workflow_runs_patch_stage_build_collect_in_order() {
    let doc = ConfigDoc::parse_inline("vendorpatch.toml", FULL).expect("parse");
    let plan = build_plan(&doc).expect("plan");
    assert_eq!(
        ordered_ids(&plan),
        vec![
            "core.init",
            "vendor.init",
            "stage.sources",
            "core.barrier.sources",
            "native.configure",
            "native.build",
            "native.collect",
        ]
    );
}

#[test]
fn dual_step_runs_between_init_and_staging_when_enabled() {
    let raw = format!("{FULL}\n[vendor.steps.dual]\nenabled = true\n");
    let doc = ConfigDoc::parse_inline("vendorpatch.toml", &raw).expect("parse");
    let ids = ordered_ids(&build_plan(&doc).expect("plan"));
    let pos = |id: &str| ids.iter().position(|x| x == id).expect(id);
    assert!(pos("vendor.init") < pos("vendor.dual"));
    assert!(pos("vendor.dual") < pos("stage.sources"));
}

#[test]
fn disabling_vendor_keeps_the_build_orderable() {
    let raw = FULL.replace(
        "[vendor]\n",
        "[vendor]\nenabled = false\n",
    );
    let doc = ConfigDoc::parse_inline("vendorpatch.toml", &raw).expect("parse");
    let ids = ordered_ids(&build_plan(&doc).expect("plan"));
    assert!(!ids.iter().any(|id| id.starts_with("vendor.")));
    assert_eq!(ids.first().map(String::as_str), Some("core.init"));
    assert_eq!(ids.last().map(String::as_str), Some("native.collect"));
}

#[test]
fn without_manifest_there_is_no_staging() {
    let doc = ConfigDoc::parse_inline(
        "vendorpatch.toml",
        "[vendor]\ncheckout = \"upstream\"\n",
    )
    .expect("parse");
    let ids = ordered_ids(&build_plan(&doc).expect("plan"));
    assert_eq!(ids, vec!["core.init", "vendor.init", "core.barrier.sources"]);
}

#[test]
fn unknown_tables_are_rejected_at_plan_time() {
    let raw = format!("{FULL}\n[python]\nversion = \"3.11\"\n");
    let doc = ConfigDoc::parse_inline("vendorpatch.toml", &raw).expect("parse");
    let err = build_plan(&doc).expect_err("unknown table");
    assert!(err.to_string().contains("'python'"), "{err}");
}

#[test]
fn dry_run_visits_every_task_without_side_effects() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let raw = FULL.replace(
        "root_dir = \".\"",
        &format!("root_dir = \"{}\"", tmp.path().display()),
    );
    let doc = ConfigDoc::parse_inline(tmp.path().join("vendorpatch.toml"), &raw).expect("parse");
    let plan = build_plan(&doc).expect("plan");
    let reg = vendorpatch::executor::builtin_registry().expect("registry");

    let sink = Arc::new(MemorySink::default());
    let mut ctx = ExecCtx::new(true, sink.clone());
    vendorpatch::executor::execute_plan(&doc, &plan, &reg, &mut ctx).expect("dry run");

    let started: Vec<String> = sink
        .events()
        .into_iter()
        .filter_map(|ev| match ev {
            ExecEvent::TaskStarted { id } => Some(id),
            _ => None,
        })
        .collect();
    assert_eq!(started, ordered_ids(&plan));
    assert!(!tmp.path().join("third_party").exists());
    assert!(!tmp.path().join("patches").exists());
}
