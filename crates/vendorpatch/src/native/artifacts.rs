use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::modules::util;

const SHARED_LIB_EXTS: &[&str] = &["so", "dylib", "dll", "pyd"];

// `resample.cpython-39-x86_64-linux-gnu.so` -> `resample.so`
const ABI_SUFFIX_PATTERN: &str = r"^(?P<stem>[^.]+)\.[^.]+\.(?P<ext>so|dylib|pyd|dll)$";

/// How the produced extension is renamed to the name the host runtime loads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum NamingPolicy {
    Keep,
    #[default]
    StripAbiSuffix,
    Rename {
        pattern: String,
        replacement: String,
    },
}

impl NamingPolicy {
    pub fn apply(&self, file_name: &str) -> Result<String> {
        let out = match self {
            NamingPolicy::Keep => file_name.to_string(),
            NamingPolicy::StripAbiSuffix => compile(ABI_SUFFIX_PATTERN)?
                .replace(file_name, "$stem.$ext")
                .into_owned(),
            NamingPolicy::Rename {
                pattern,
                replacement,
            } => compile(pattern)?
                .replace(file_name, replacement.as_str())
                .into_owned(),
        };
        if out.is_empty() || out.contains(['/', '\\']) {
            return Err(Error::msg(format!(
                "naming policy turned '{file_name}' into invalid file name '{out}'"
            )));
        }
        Ok(out)
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::msg(format!("invalid naming pattern '{pattern}': {e}")))
}

fn is_shared_lib(file_name: &str) -> bool {
    let lower = file_name.to_ascii_lowercase();
    SHARED_LIB_EXTS
        .iter()
        .any(|ext| lower.ends_with(&format!(".{ext}")))
        || lower.contains(".so.")
}

fn top_level_files(dir: &Path) -> Result<Vec<(String, PathBuf, fs::Metadata)>> {
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
        let meta = fs::metadata(entry.path())
            .map_err(|e| Error::msg(format!("failed to stat {}: {e}", entry.path().display())))?;
        if !meta.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        out.push((name, entry.path().to_path_buf(), meta));
    }
    Ok(out)
}

/// Find the extension built for `name` in `dir` and give it its stable name.
/// With several candidates the most recently written one wins.
pub fn normalize_extension(dir: &Path, name: &str, policy: &NamingPolicy) -> Result<PathBuf> {
    if !dir.is_dir() {
        return Err(Error::build(format!(
            "extension output dir {} does not exist",
            dir.display()
        )));
    }
    let prefixes = [format!("{name}."), format!("lib{name}.")];
    let mut candidates: Vec<(String, PathBuf, SystemTime)> = top_level_files(dir)?
        .into_iter()
        .filter(|(file, _, _)| is_shared_lib(file) && prefixes.iter().any(|p| file.starts_with(p)))
        .map(|(file, path, meta)| {
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            (file, path, mtime)
        })
        .collect();
    candidates.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| a.0.cmp(&b.0)));

    let Some((file, path, _)) = candidates.into_iter().next() else {
        return Err(Error::build(format!(
            "the build produced no extension named '{name}' in {}",
            dir.display()
        )));
    };

    let stable = policy.apply(&file)?;
    if stable == file {
        return Ok(path);
    }
    let target = dir.join(&stable);
    if target.exists() {
        fs::remove_file(&target)
            .map_err(|e| Error::msg(format!("failed to replace {}: {e}", target.display())))?;
    }
    fs::rename(&path, &target).map_err(|e| {
        Error::msg(format!(
            "failed to rename {} -> {}: {e}",
            path.display(),
            target.display()
        ))
    })?;
    Ok(target)
}

#[cfg(unix)]
fn is_executable(_name: &str, meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(name: &str, _meta: &fs::Metadata) -> bool {
    name.to_ascii_lowercase().ends_with(".exe")
}

/// Copy every auxiliary executable at the top level of `build_output_dir`
/// into `package_bin_dir`, replacing same-named files.
pub fn stage_artifacts(build_output_dir: &Path, package_bin_dir: &Path) -> Result<Vec<PathBuf>> {
    if !build_output_dir.is_dir() {
        return Err(Error::build(format!(
            "binary output dir {} does not exist",
            build_output_dir.display()
        )));
    }
    util::ensure_dir(package_bin_dir)?;
    let mut copied = Vec::new();
    for (name, src, meta) in top_level_files(build_output_dir)? {
        if is_shared_lib(&name) || !is_executable(&name, &meta) {
            continue;
        }
        copied.push(copy_replacing(&src, &package_bin_dir.join(&name))?);
    }
    Ok(copied)
}

pub fn copy_replacing(src: &Path, dst: &Path) -> Result<PathBuf> {
    if let Some(parent) = dst.parent() {
        util::ensure_dir(parent)?;
    }
    if dst.exists() {
        fs::remove_file(dst)
            .map_err(|e| Error::msg(format!("failed to replace {}: {e}", dst.display())))?;
    }
    fs::copy(src, dst).map_err(|e| {
        Error::msg(format!(
            "failed to copy {} -> {}: {e}",
            src.display(),
            dst.display()
        ))
    })?;
    Ok(dst.to_path_buf())
}
