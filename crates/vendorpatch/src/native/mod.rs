//! CMake invocation over the staged source tree.

pub mod artifacts;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;

use crate::error::{Error, ErrorKind, Result};
use crate::executor::ExecCtx;
use crate::modules::util;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum BuildType {
    #[serde(alias = "debug")]
    Debug,
    #[default]
    #[serde(alias = "release")]
    Release,
    #[serde(alias = "relwithdebinfo")]
    RelWithDebInfo,
    #[serde(alias = "minsizerel")]
    MinSizeRel,
}

impl BuildType {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildType::Debug => "Debug",
            BuildType::Release => "Release",
            BuildType::RelWithDebInfo => "RelWithDebInfo",
            BuildType::MinSizeRel => "MinSizeRel",
        }
    }
}

/// Where toolchain hints come from. Commands are argv arrays whose trimmed
/// stdout supplies the value, e.g. asking the host runtime's interpreter.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    pub prefix_path: Vec<String>,
    pub prefix_path_command: Vec<String>,
    pub cxx11_abi: Option<bool>,
    pub cxx11_abi_command: Vec<String>,
    pub cxx_flags: Vec<String>,
}

/// Settings that keep the native build ABI-compatible with the host runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolchainHints {
    pub prefix_path: Vec<String>,
    /// `_GLIBCXX_USE_CXX11_ABI`; left unset when `None`.
    pub cxx11_abi: Option<bool>,
    pub cxx_flags: Vec<String>,
}

impl ToolchainHints {
    pub fn probe(ctx: &ExecCtx, cfg: &ToolchainConfig, cwd: &Path) -> Result<Self> {
        let mut prefix_path = cfg.prefix_path.clone();
        if let Some(out) = probe_output(ctx, &cfg.prefix_path_command, cwd)? {
            prefix_path.extend(
                out.split(['\n', ';'])
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToOwned::to_owned),
            );
        }

        let cxx11_abi = match probe_output(ctx, &cfg.cxx11_abi_command, cwd)? {
            Some(out) => Some(parse_flag(&out).ok_or_else(|| {
                Error::msg(format!(
                    "native.toolchain.cxx11_abi_command printed '{out}', expected 0/1/true/false"
                ))
            })?),
            None => cfg.cxx11_abi,
        };

        Ok(Self {
            prefix_path,
            cxx11_abi,
            cxx_flags: cfg.cxx_flags.clone(),
        })
    }

    fn cxx_flags_value(&self) -> Option<String> {
        let mut flags = Vec::new();
        if let Some(abi) = self.cxx11_abi {
            flags.push(format!("-D_GLIBCXX_USE_CXX11_ABI={}", u8::from(abi)));
        }
        flags.extend(self.cxx_flags.iter().cloned());
        (!flags.is_empty()).then(|| flags.join(" "))
    }
}

fn probe_output(ctx: &ExecCtx, argv: &[String], cwd: &Path) -> Result<Option<String>> {
    let Some((program, args)) = argv.split_first() else {
        return Ok(None);
    };
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(cwd);
    let out = ctx.capture_cmd(cmd)?;
    let text = String::from_utf8_lossy(&out).trim().to_string();
    ctx.log(&format!("{program} -> {text}"));
    Ok(Some(text))
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub cmake: String,
    pub source_dir: PathBuf,
    pub build_dir: PathBuf,
    /// The host package's module directory; the extension lands here.
    pub library_output_dir: PathBuf,
    pub binary_output_dir: PathBuf,
    pub build_type: BuildType,
    pub generator: Option<String>,
    pub hints: ToolchainHints,
    pub defines: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    /// `Some(0)` means one job per CPU; `None` leaves it to the generator.
    pub parallelism: Option<usize>,
}

impl BuildRequest {
    pub fn configure_args(&self) -> Vec<String> {
        let mut args = vec![
            "-S".to_string(),
            path_arg(&self.source_dir),
            "-B".to_string(),
            path_arg(&self.build_dir),
            format!("-DCMAKE_BUILD_TYPE={}", self.build_type.as_str()),
            format!(
                "-DCMAKE_LIBRARY_OUTPUT_DIRECTORY={}",
                path_arg(&self.library_output_dir)
            ),
            format!(
                "-DCMAKE_RUNTIME_OUTPUT_DIRECTORY={}",
                path_arg(&self.binary_output_dir)
            ),
        ];
        if !self.hints.prefix_path.is_empty() {
            args.push(format!(
                "-DCMAKE_PREFIX_PATH={}",
                self.hints.prefix_path.join(";")
            ));
        }
        if let Some(flags) = self.hints.cxx_flags_value() {
            args.push(format!("-DCMAKE_CXX_FLAGS={flags}"));
        }
        if let Some(generator) = self.generator.as_deref().filter(|g| !g.trim().is_empty()) {
            args.push("-G".into());
            args.push(generator.to_string());
        }
        args.extend(self.defines.iter().map(|(k, v)| format!("-D{k}={v}")));
        args
    }

    pub fn jobs(&self) -> Option<usize> {
        self.parallelism
            .map(|n| if n == 0 { num_cpus::get() } else { n })
    }

    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "--build".to_string(),
            path_arg(&self.build_dir),
            "--config".to_string(),
            self.build_type.as_str().to_string(),
        ];
        if let Some(jobs) = self.jobs() {
            args.push("--parallel".into());
            args.push(jobs.to_string());
        }
        args
    }

    fn cmake(&self, args: Vec<String>) -> Command {
        let mut cmd = Command::new(&self.cmake);
        cmd.args(args).envs(&self.env);
        cmd
    }

    pub fn configure(&self, ctx: &ExecCtx) -> Result<()> {
        if !self.source_dir.join("CMakeLists.txt").is_file() {
            return Err(Error::build(format!(
                "no CMakeLists.txt in {}",
                self.source_dir.display()
            )));
        }
        for dir in [&self.build_dir, &self.library_output_dir, &self.binary_output_dir] {
            util::ensure_dir(dir)?;
        }
        ctx.run_cmd(self.cmake(self.configure_args()))
            .map_err(|e| e.with_kind(ErrorKind::Build).context("cmake configure failed"))
    }

    pub fn build(&self, ctx: &ExecCtx) -> Result<()> {
        ctx.run_cmd(self.cmake(self.build_args()))
            .map_err(|e| e.with_kind(ErrorKind::Build).context("cmake build failed"))
    }

    pub fn configure_and_build(&self, ctx: &ExecCtx) -> Result<()> {
        self.configure(ctx)?;
        self.build(ctx)
    }
}

fn path_arg(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}
