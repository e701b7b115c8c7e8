use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use vendorpatch::ErrorKind;
use vendorpatch::config::ConfigDoc;
use vendorpatch::executor::{ExecCtx, MemorySink};
use vendorpatch::manifest::SourceManifest;
use vendorpatch::modules::vendor::manager;
use vendorpatch::vendor::state::Phase;
use vendorpatch::vendor::{DiffStrategy, TreeState};

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(["-c", "user.name=vp", "-c", "user.email=vp@example.invalid"])
        .args(args)
        .current_dir(dir)
        .status()
        .expect("spawn git");
    assert!(status.success(), "git {args:?} failed in {}", dir.display());
}

fn commit_all(dir: &Path, msg: &str) {
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-q", "-m", msg]);
}

/// A project root holding an upstream repo at `upstream/`.
fn project() -> (tempfile::TempDir, ConfigDoc) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path();
    let upstream = root.join("upstream");
    fs::create_dir_all(upstream.join("src/a")).expect("mkdir");
    fs::write(upstream.join("src/a/one.h"), "int one(void);\n").expect("write");
    fs::write(
        upstream.join("src/a/one.cc"),
        "#include \"one.h\"\nint one(void) {\n  return 1;\n}\n",
    )
    .expect("write");
    fs::write(upstream.join("README"), "upstream\n").expect("write");
    git(&upstream, &["init", "-q"]);
    commit_all(&upstream, "initial");

    let raw = format!(
        r#"
[workspace]
root_dir = "{}"
build_dir = "build"

[vendor]
checkout = "upstream"
patch = "patches/upstream.patch"
pinning = "none"

[manifest]
root = "src"
files = ["a/one.h", "a/one.cc"]
"#,
        root.display()
    );
    let doc = ConfigDoc::parse_inline(root.join("vendorpatch.toml"), &raw).expect("parse");
    (tmp, doc)
}

fn ctx() -> ExecCtx {
    ExecCtx::new(false, Arc::new(MemorySink::default()))
}

fn read(p: impl AsRef<Path>) -> String {
    fs::read_to_string(p.as_ref()).expect("read")
}

fn upstream(tmp: &tempfile::TempDir) -> PathBuf {
    tmp.path().join("upstream")
}

#[test]
fn checkout_edits_round_trip_through_the_patch_file() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let (tmp, doc) = project();
    let ctx = ctx();
    let mgr = manager(&doc, &ctx).expect("manager");

    mgr.initialize(&ctx, false).expect("init without patch");
    assert_eq!(mgr.tree_state(&ctx).expect("state"), TreeState::Pristine);

    let one_cc = upstream(&tmp).join("src/a/one.cc");
    let edited = "#include \"one.h\"\nint one(void) {\n  return 2;\n}\n";
    fs::write(&one_cc, edited).expect("edit");
    assert_eq!(mgr.tree_state(&ctx).expect("state"), TreeState::Dirty);

    let provider = mgr
        .diff_provider(DiffStrategy::Checkout, None)
        .expect("provider");
    let files = mgr
        .patch_engine()
        .generate_patch(&ctx, provider.as_ref())
        .expect("gen-patch");
    assert_eq!(files.into_iter().collect::<Vec<_>>(), vec!["src/a/one.cc"]);
    let patch = read(tmp.path().join("patches/upstream.patch"));
    assert!(patch.contains("--- a/src/a/one.cc"), "{patch}");
    assert!(patch.contains("+  return 2;"), "{patch}");
    assert_eq!(mgr.tree_state(&ctx).expect("state"), TreeState::Patched);

    // Re-initializing resets and re-applies; the edit survives.
    mgr.initialize(&ctx, false).expect("re-init");
    assert_eq!(read(&one_cc), edited);
    let marker = mgr.state_file().read().expect("marker").expect("present");
    assert_eq!(marker.phase, Phase::Patched);
    assert!(marker.patch_sha256.is_some());
}

#[test]
fn unrecorded_edits_block_init_until_forced() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let (tmp, doc) = project();
    let ctx = ctx();
    let mgr = manager(&doc, &ctx).expect("manager");
    mgr.initialize(&ctx, false).expect("init");

    let readme = upstream(&tmp).join("README");
    fs::write(&readme, "local scribble\n").expect("edit");
    let err = mgr.initialize(&ctx, false).expect_err("dirty");
    assert_eq!(err.kind(), ErrorKind::InconsistentCheckout);
    assert_eq!(read(&readme), "local scribble\n");

    mgr.initialize(&ctx, true).expect("forced");
    assert_eq!(read(&readme), "upstream\n");
}

#[test]
fn stale_patch_fails_and_leaves_checkout_pristine() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let (tmp, doc) = project();
    let ctx = ctx();
    let mgr = manager(&doc, &ctx).expect("manager");
    let up = upstream(&tmp);

    fs::write(
        up.join("src/a/one.cc"),
        "#include \"one.h\"\nint one(void) {\n  return 2;\n}\n",
    )
    .expect("edit");
    let provider = mgr
        .diff_provider(DiffStrategy::Checkout, None)
        .expect("provider");
    mgr.patch_engine()
        .generate_patch(&ctx, provider.as_ref())
        .expect("gen-patch");

    // Upstream moves on and rewrites the patched lines.
    git(&up, &["checkout", "-q", "--", "."]);
    let moved = "#include \"one.h\"\nint one(void) {\n  return 100;\n}\n";
    fs::write(up.join("src/a/one.cc"), moved).expect("upstream change");
    commit_all(&up, "upstream change");

    let err = mgr.initialize(&ctx, false).expect_err("stale patch");
    assert_eq!(err.kind(), ErrorKind::PatchApply);
    assert!(err.to_string().contains("upstream.patch"), "{err}");

    assert_eq!(read(up.join("src/a/one.cc")), moved);
    assert_eq!(mgr.tree_state(&ctx).expect("state"), TreeState::Pristine);
    let marker = mgr.state_file().read().expect("marker").expect("present");
    assert_eq!(marker.phase, Phase::Pristine);
}

#[test]
fn patch_that_adds_a_file_round_trips() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let (tmp, doc) = project();
    let ctx = ctx();
    let mgr = manager(&doc, &ctx).expect("manager");
    let up = upstream(&tmp);

    let patch = "diff --git a/src/a/two.h b/src/a/two.h\n\
new file mode 100644\n\
--- /dev/null\n\
+++ b/src/a/two.h\n\
@@ -0,0 +1 @@\n\
+int two(void);\n";
    fs::create_dir_all(tmp.path().join("patches")).expect("mkdir");
    fs::write(tmp.path().join("patches/upstream.patch"), patch).expect("write patch");

    mgr.initialize(&ctx, false).expect("init");
    assert_eq!(read(up.join("src/a/two.h")), "int two(void);\n");
    assert_eq!(mgr.tree_state(&ctx).expect("state"), TreeState::Patched);

    // The created file is part of `git diff HEAD`, so regeneration keeps it.
    let provider = mgr
        .diff_provider(DiffStrategy::Checkout, None)
        .expect("provider");
    let files = mgr
        .patch_engine()
        .generate_patch(&ctx, provider.as_ref())
        .expect("gen-patch");
    assert!(files.contains("src/a/two.h"));

    mgr.initialize(&ctx, false).expect("re-init");
    assert_eq!(read(up.join("src/a/two.h")), "int two(void);\n");
}

#[test]
fn dual_workspace_edits_become_the_patch() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let (tmp, doc) = project();
    let ctx = ctx();
    let mgr = manager(&doc, &ctx).expect("manager");
    let manifest = SourceManifest::from_doc(&doc).expect("manifest");
    mgr.initialize(&ctx, false).expect("init");

    mgr.initialize_dual_workspace(&ctx, &manifest)
        .expect("dual init");
    let dual = tmp.path().join("build/patch-workspace");
    assert_eq!(
        read(dual.join("pristine/src/a/one.h")),
        read(upstream(&tmp).join("src/a/one.h"))
    );
    let err = mgr
        .initialize_dual_workspace(&ctx, &manifest)
        .expect_err("second dual init");
    assert_eq!(err.kind(), ErrorKind::WorkspaceExists);

    fs::write(
        dual.join("modified/src/a/one.h"),
        "int one(void);\nint one_more(void);\n",
    )
    .expect("edit modified");
    let provider = mgr
        .diff_provider(DiffStrategy::Dual, Some(&manifest))
        .expect("provider");
    let files = mgr
        .patch_engine()
        .generate_patch(&ctx, provider.as_ref())
        .expect("gen-patch");
    assert_eq!(files.into_iter().collect::<Vec<_>>(), vec!["src/a/one.h"]);

    mgr.teardown(&ctx).expect("teardown");
    assert!(!dual.exists());
    mgr.teardown(&ctx).expect("teardown twice");

    // The dual diff applies to the real checkout.
    mgr.initialize(&ctx, false).expect("apply dual patch");
    assert_eq!(
        read(upstream(&tmp).join("src/a/one.h")),
        "int one(void);\nint one_more(void);\n"
    );

    // A fresh dual workspace starts from the patched content.
    mgr.initialize_dual_workspace(&ctx, &manifest)
        .expect("dual init again");
    assert_eq!(
        read(dual.join("modified/src/a/one.h")),
        "int one(void);\nint one_more(void);\n"
    );
    assert_eq!(read(dual.join("pristine/src/a/one.h")), "int one(void);\n");
}

fn gen_patch(mgr: &vendorpatch::vendor::WorkspaceManager, ctx: &ExecCtx) -> Vec<String> {
    let provider = mgr
        .diff_provider(DiffStrategy::Checkout, None)
        .expect("provider");
    mgr.patch_engine()
        .generate_patch(ctx, provider.as_ref())
        .expect("gen-patch")
        .into_iter()
        .collect()
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[test]
fn refreshed_patch_replaces_the_one_already_applied() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let (tmp, doc) = project();
    let ctx = ctx();
    let mgr = manager(&doc, &ctx).expect("manager");
    let up = upstream(&tmp);
    let one_cc = up.join("src/a/one.cc");

    fs::write(&one_cc, "#include \"one.h\"\nint one(void) {\n  return 2;\n}\n").expect("edit");
    gen_patch(&mgr, &ctx);
    mgr.initialize(&ctx, false).expect("init with v1");
    assert_eq!(mgr.tree_state(&ctx).expect("state"), TreeState::Patched);

    // A newer patch arrives from version control.
    let patch_file = tmp.path().join("patches/upstream.patch");
    let v2 = read(&patch_file).replace("+  return 2;", "+  return 3;");
    fs::write(&patch_file, v2).expect("write v2");
    assert_eq!(mgr.tree_state(&ctx).expect("state"), TreeState::Superseded);

    // Hand edits on top of the old patch still count as dirty.
    fs::write(up.join("README"), "local scribble\n").expect("scribble");
    assert_eq!(mgr.tree_state(&ctx).expect("state"), TreeState::Dirty);
    fs::write(up.join("README"), "upstream\n").expect("restore");

    mgr.initialize(&ctx, false).expect("init with v2");
    assert!(read(&one_cc).contains("return 3;"));
    assert_eq!(mgr.tree_state(&ctx).expect("state"), TreeState::Patched);

    // Removing the patch altogether also resets cleanly.
    fs::remove_file(&patch_file).expect("remove patch");
    assert_eq!(mgr.tree_state(&ctx).expect("state"), TreeState::Superseded);
    mgr.initialize(&ctx, false).expect("init without patch");
    assert!(read(&one_cc).contains("return 1;"));
    assert_eq!(mgr.tree_state(&ctx).expect("state"), TreeState::Pristine);
}

#[test]
fn binary_edit_round_trips_through_the_patch_file() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let (tmp, doc) = project();
    let up = upstream(&tmp);
    let blob = up.join("src/a/blob.bin");
    fs::write(&blob, [0u8, 1, 2, 3, 0, 255]).expect("blob");
    commit_all(&up, "add blob");

    let ctx = ctx();
    let mgr = manager(&doc, &ctx).expect("manager");
    mgr.initialize(&ctx, false).expect("init");

    let edited = [0u8, 9, 8, 7, 0, 254, 0];
    fs::write(&blob, edited).expect("edit blob");
    assert_eq!(gen_patch(&mgr, &ctx), vec!["src/a/blob.bin"]);
    let patch = fs::read(tmp.path().join("patches/upstream.patch")).expect("patch");
    assert!(contains_bytes(&patch, b"GIT binary patch"));
    assert_eq!(mgr.tree_state(&ctx).expect("state"), TreeState::Patched);

    mgr.initialize(&ctx, false).expect("re-init");
    assert_eq!(fs::read(&blob).expect("blob"), edited);
}

#[test]
fn non_utf8_edit_round_trips_through_the_patch_file() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let (tmp, doc) = project();
    let ctx = ctx();
    let mgr = manager(&doc, &ctx).expect("manager");
    mgr.initialize(&ctx, false).expect("init");

    let one_h = upstream(&tmp).join("src/a/one.h");
    let latin1: &[u8] = b"int one(void); /* caf\xe9 */\n";
    fs::write(&one_h, latin1).expect("edit");
    assert_eq!(gen_patch(&mgr, &ctx), vec!["src/a/one.h"]);
    let patch = fs::read(tmp.path().join("patches/upstream.patch")).expect("patch");
    assert!(contains_bytes(&patch, b"+int one(void); /* caf\xe9 */"));

    mgr.initialize(&ctx, false).expect("re-init");
    assert_eq!(fs::read(&one_h).expect("one.h"), latin1);
}

#[test]
fn pending_diff_accepts_git_diff_arguments() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let (tmp, doc) = project();
    let ctx = ctx();
    let mgr = manager(&doc, &ctx).expect("manager");
    let up = upstream(&tmp);
    fs::write(up.join("README"), "upstream, edited\n").expect("edit");
    fs::write(up.join("src/a/one.h"), "int one(void);\nint two(void);\n").expect("edit");

    let pending = |args: &[&str]| {
        let provider = mgr
            .diff_provider_with_args(
                DiffStrategy::Checkout,
                None,
                args.iter().map(|a| a.to_string()).collect(),
            )
            .expect("provider");
        let out = mgr
            .patch_engine()
            .show_pending_diff(&ctx, provider.as_ref())
            .expect("diff");
        String::from_utf8_lossy(&out).into_owned()
    };

    let stat = pending(&["--stat"]);
    assert!(stat.contains("2 files changed"), "{stat}");

    let only_readme = pending(&["--", "README"]);
    assert!(only_readme.contains("+upstream, edited"), "{only_readme}");
    assert!(!only_readme.contains("one.h"), "{only_readme}");
}
