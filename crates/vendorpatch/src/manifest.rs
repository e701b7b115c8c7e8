//! The curated allow-list of upstream files and the staging copy driven by it.
//!
//! Entries are plain relative paths under `root` inside the checkout. There is
//! no globbing: anything not listed is never staged.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use filetime::FileTime;
use serde::{Deserialize, Serialize};

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::modules::util;

/// `[manifest]` as written in the workflow config.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
    pub root: String,
    pub files: Vec<String>,
    /// Upstream revision (commit prefix) this list was written against.
    pub revision: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceManifest {
    root: PathBuf,
    files: Vec<String>,
    revision: Option<String>,
}

impl SourceManifest {
    pub fn new(root: &str, files: Vec<String>, revision: Option<String>) -> Result<Self> {
        let root = normalize_root(root)?;
        let mut seen = BTreeSet::new();
        let mut out = Vec::with_capacity(files.len());
        for raw in files {
            let entry = normalize_entry(&raw)?;
            if !seen.insert(entry.clone()) {
                return Err(Error::msg(format!(
                    "manifest entry '{}' is listed more than once",
                    entry
                )));
            }
            out.push(entry);
        }
        let revision = revision
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        Ok(Self {
            root,
            files: out,
            revision,
        })
    }

    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        let cfg: ManifestConfig = doc.section("manifest")?;
        if cfg.files.is_empty() {
            return Err(Error::msg("manifest.files is empty"));
        }
        Self::new(&cfg.root, cfg.files, cfg.revision)
    }

    /// Sub-directory of the checkout the entries are relative to.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }

    pub fn source_dir(&self, checkout_root: &Path) -> PathBuf {
        checkout_root.join(&self.root)
    }

    /// Entry paths relative to the checkout root, in manifest order.
    pub fn checkout_paths(&self) -> Vec<String> {
        self.files
            .iter()
            .map(|f| checkout_relative(&self.root, f))
            .collect()
    }
}

pub fn checkout_relative(root: &Path, entry: &str) -> String {
    if root.as_os_str().is_empty() {
        entry.to_string()
    } else {
        format!("{}/{}", root.to_string_lossy().trim_end_matches('/'), entry)
    }
}

fn normalize_root(raw: &str) -> Result<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "." {
        return Ok(PathBuf::new());
    }
    let joined = normalize_rel(raw, "manifest.root")?;
    Ok(PathBuf::from(joined))
}

fn normalize_entry(raw: &str) -> Result<String> {
    let entry = raw.trim();
    if entry.is_empty() {
        return Err(Error::msg("manifest entry is empty"));
    }
    if entry.contains(['*', '?', '[']) {
        return Err(Error::msg(format!(
            "manifest entry '{}' contains a glob character; list files explicitly",
            entry
        )));
    }
    normalize_rel(entry, "manifest entry")
}

fn normalize_rel(raw: &str, what: &str) -> Result<String> {
    let mut segs = Vec::new();
    for c in Path::new(raw).components() {
        match c {
            Component::Normal(s) => segs.push(s.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(Error::msg(format!("{what} '{raw}' contains '..'")));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::msg(format!("{what} '{raw}' must be relative")));
            }
        }
    }
    if segs.is_empty() {
        return Err(Error::msg(format!("{what} '{raw}' is empty")));
    }
    Ok(segs.join("/"))
}

#[derive(Debug, Clone, Serialize)]
pub struct StagedFile {
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    /// False when the staged copy already had this content.
    pub changed: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StageReport {
    pub files: Vec<StagedFile>,
}

impl StageReport {
    pub fn changed_count(&self) -> usize {
        self.files.iter().filter(|f| f.changed).count()
    }
}

/// Copy every manifest entry from `checkout_root/<root>/<entry>` to
/// `staging_root/<entry>`. Every entry is checked before anything is copied.
pub fn stage_all(
    manifest: &SourceManifest,
    checkout_root: &Path,
    staging_root: &Path,
) -> Result<StageReport> {
    let src_root = manifest.source_dir(checkout_root);

    let mut sources = Vec::with_capacity(manifest.files().len());
    for entry in manifest.files() {
        let src = src_root.join(entry);
        let meta = match fs::metadata(&src) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::missing_source(format!(
                    "manifest entry '{}' does not exist in the checkout ({})",
                    entry,
                    src.display()
                )));
            }
            Err(e) => {
                return Err(Error::msg(format!("failed to stat {}: {e}", src.display())));
            }
        };
        if !meta.is_file() {
            return Err(Error::missing_source(format!(
                "manifest entry '{}' is not a regular file ({})",
                entry,
                src.display()
            )));
        }
        sources.push((entry, src, meta));
    }

    util::ensure_dir(staging_root)?;
    let mut report = StageReport::default();
    for (entry, src, meta) in sources {
        let dst = staging_root.join(entry);
        let before = match fs::symlink_metadata(&dst) {
            Ok(m) if m.is_dir() => {
                return Err(Error::msg(format!(
                    "staged path {} is a directory",
                    dst.display()
                )));
            }
            Ok(_) => {
                let hash = util::sha256_file_hex(&dst).ok();
                // A read-only copy from a previous run would make fs::copy fail.
                fs::remove_file(&dst).map_err(|e| {
                    Error::msg(format!("failed to replace {}: {e}", dst.display()))
                })?;
                hash
            }
            Err(_) => None,
        };

        copy_preserving_times(&src, &dst, &meta)?;
        let sha256 = util::sha256_file_hex(&dst)?;
        report.files.push(StagedFile {
            path: entry.clone(),
            changed: before.as_deref() != Some(sha256.as_str()),
            sha256,
            bytes: meta.len(),
        });
    }
    Ok(report)
}

fn copy_preserving_times(src: &Path, dst: &Path, meta: &fs::Metadata) -> Result<()> {
    if let Some(parent) = dst.parent() {
        util::ensure_dir(parent)?;
    }
    fs::copy(src, dst).map_err(|e| {
        Error::msg(format!(
            "failed to copy {} -> {}: {e}",
            src.display(),
            dst.display()
        ))
    })?;
    filetime::set_file_times(
        dst,
        FileTime::from_last_access_time(meta),
        FileTime::from_last_modification_time(meta),
    )
    .map_err(|e| Error::msg(format!("failed to set times on {}: {e}", dst.display())))
}

/// Delete staged files the manifest no longer lists, then any directories
/// left empty. Returns the removed files relative to `staging_root`.
pub fn prune_stale(manifest: &SourceManifest, staging_root: &Path) -> Result<Vec<String>> {
    if !staging_root.is_dir() {
        return Ok(Vec::new());
    }
    let keep: BTreeSet<&str> = manifest.files().iter().map(String::as_str).collect();

    let mut removed = Vec::new();
    for entry in walkdir::WalkDir::new(staging_root).contents_first(true) {
        let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
        let p = entry.path();
        if p == staging_root {
            continue;
        }
        if entry.file_type().is_dir() {
            if fs::read_dir(p)?.next().is_none() {
                fs::remove_dir(p)
                    .map_err(|e| Error::msg(format!("failed to remove {}: {e}", p.display())))?;
            }
            continue;
        }
        let rel = p
            .strip_prefix(staging_root)
            .map_err(|e| Error::msg(format!("strip_prefix failed: {e}")))?;
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if !keep.contains(rel.as_str()) {
            fs::remove_file(p)
                .map_err(|e| Error::msg(format!("failed to remove {}: {e}", p.display())))?;
            removed.push(rel);
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn manifest(files: &[&str]) -> SourceManifest {
        SourceManifest::new("", files.iter().map(|s| s.to_string()).collect(), None)
            .expect("manifest")
    }

    fn write(p: &Path, body: &str) {
        fs::create_dir_all(p.parent().expect("parent")).expect("mkdir");
        fs::write(p, body).expect("write");
    }

    #[test]
    fn rejects_duplicates_parent_dirs_and_globs() {
        let mk = |f: &str| SourceManifest::new("", vec!["a/one.h".into(), f.into()], None);
        assert!(mk("./a/one.h").expect_err("dup").to_string().contains("more than once"));
        assert!(mk("a/../b.h").expect_err("dotdot").to_string().contains("'..'"));
        assert!(mk("a/*.cc").expect_err("glob").to_string().contains("glob"));
        assert!(mk("/abs.h").expect_err("abs").to_string().contains("relative"));
    }

    #[test]
    fn checkout_paths_include_root() {
        let m = SourceManifest::new("src/", vec!["feat/a.h".into()], None).expect("manifest");
        assert_eq!(m.checkout_paths(), vec!["src/feat/a.h".to_string()]);
    }

    #[test]
    fn missing_entry_names_the_path_and_stages_nothing() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let checkout = tmp.path().join("checkout");
        let staged = tmp.path().join("staged");
        write(&checkout.join("a/one.h"), "h\n");
        write(&checkout.join("z/last.cc"), "z\n");

        let err = stage_all(&manifest(&["a/one.h", "b/gone.cc", "z/last.cc"]), &checkout, &staged)
            .expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::MissingSource);
        assert!(err.to_string().contains("'b/gone.cc'"), "{err}");
        assert!(!staged.join("a/one.h").exists());
        assert!(!staged.join("z/last.cc").exists());
    }

    #[test]
    fn directory_entry_is_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let checkout = tmp.path().join("checkout");
        fs::create_dir_all(checkout.join("a")).expect("mkdir");
        let err = stage_all(&manifest(&["a"]), &checkout, &tmp.path().join("s"))
            .expect_err("dir");
        assert_eq!(err.kind(), ErrorKind::MissingSource);
    }

    #[test]
    fn restaging_is_idempotent_and_keeps_mtime() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let checkout = tmp.path().join("checkout");
        let staged = tmp.path().join("staged");
        write(&checkout.join("a/one.cc"), "int one();\n");
        let src = checkout.join("a/one.cc");
        filetime::set_file_mtime(&src, FileTime::from_unix_time(1_600_000_000, 0))
            .expect("set mtime");

        let m = manifest(&["a/one.cc"]);
        let first = stage_all(&m, &checkout, &staged).expect("stage");
        assert_eq!(first.changed_count(), 1);
        let second = stage_all(&m, &checkout, &staged).expect("restage");
        assert_eq!(second.changed_count(), 0);

        let staged_meta = fs::metadata(staged.join("a/one.cc")).expect("meta");
        assert_eq!(
            FileTime::from_last_modification_time(&staged_meta).unix_seconds(),
            1_600_000_000
        );
        assert_eq!(
            fs::read(staged.join("a/one.cc")).expect("read"),
            b"int one();\n"
        );
    }

    #[test]
    fn prune_removes_unlisted_files_and_empty_dirs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let staged = tmp.path();
        write(&staged.join("a/one.h"), "h");
        write(&staged.join("old/stale.cc"), "x");

        let removed = prune_stale(&manifest(&["a/one.h"]), staged).expect("prune");
        assert_eq!(removed, vec!["old/stale.cc".to_string()]);
        assert!(!staged.join("old").exists());
        assert!(staged.join("a/one.h").exists());
    }
}
