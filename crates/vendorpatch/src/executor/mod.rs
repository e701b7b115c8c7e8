use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Instant;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::output::{ERROR_TAIL_LINES, OutputTail, sanitize_line};
use crate::planner::Plan;
use crate::workspace::{WorkspaceConfig, WorkspacePaths};

pub type TaskExecFn = fn(&ConfigDoc, &mut ExecCtx) -> Result<()>;

#[derive(Default)]
struct SharedExecState {
    // Set by core.init; later tasks read it instead of re-resolving.
    workspace_paths: Mutex<Option<WorkspacePaths>>,
}

#[derive(Debug, Clone)]
pub enum ExecEvent {
    TaskStarted {
        id: String,
    },
    TaskLog {
        id: String,
        line: String,
    },
    TaskFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    ExecutorDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

/// Prints task progress to stdout and writes a log file for every failed task.
#[derive(Default)]
pub struct StdoutSink {
    error_logs_root: Option<PathBuf>,
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    tasks_ok: usize,
    tasks_failed: usize,
    failed_tasks: Vec<String>,
    task_logs: BTreeMap<String, VecDeque<String>>,
    error_logs_dir: Option<PathBuf>,
    error_log_paths: Vec<PathBuf>,
}

impl StdoutSink {
    /// Error logs go to `<root>/<timestamp>/<task>.log` instead of `./build/error-logs`.
    pub fn with_error_logs_root(root: impl Into<PathBuf>) -> Self {
        Self {
            error_logs_root: Some(root.into()),
            state: Mutex::default(),
        }
    }
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        match ev {
            ExecEvent::TaskStarted { id } => {
                if let Ok(mut s) = self.state.lock() {
                    s.started_at.get_or_insert_with(Instant::now);
                }
                println!("RUN: {id}");
            }
            ExecEvent::TaskLog { id, line } => {
                if let Ok(mut s) = self.state.lock() {
                    append_task_log_line(&mut s.task_logs, &id, &line);
                }
                println!("[{id}] {line}");
            }
            ExecEvent::TaskFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                if ok {
                    if let Ok(mut s) = self.state.lock() {
                        s.tasks_ok += 1;
                        s.task_logs.remove(&id);
                    }
                    println!("DONE: {id} ({elapsed_ms}ms)");
                    return;
                }

                let err_text = error.unwrap_or_default();
                println!("FAIL: {id} ({elapsed_ms}ms) {err_text}");
                if let Ok(mut s) = self.state.lock() {
                    s.tasks_failed += 1;
                    s.failed_tasks.push(id.clone());
                    let root = self.error_logs_root.clone();
                    match write_task_error_log(&mut s, root, &id, &err_text, elapsed_ms) {
                        Ok(path) => println!("ERROR_LOG: {id} => {}", path.display()),
                        Err(e) => println!("WARN: failed to write task error log for {id}: {e}"),
                    }
                }
            }
            ExecEvent::ExecutorDone { ok, error } => {
                let Ok(mut s) = self.state.lock() else {
                    return;
                };
                let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                println!("SUMMARY:");
                println!("  status: {}", if ok { "ok" } else { "failed" });
                println!("  tasks: ok={} failed={}", s.tasks_ok, s.tasks_failed);
                println!("  elapsed: {}", format_elapsed_hms(wall.as_secs()));
                if !s.failed_tasks.is_empty() {
                    println!("  failed_tasks: {}", s.failed_tasks.join(", "));
                }
                for p in &s.error_log_paths {
                    println!("  error_log: {}", p.display());
                }
                if let Some(e) = error {
                    println!("  error: {e}");
                }
                *s = StdoutSinkState::default();
            }
        }
    }
}

/// Keeps every event in memory; handy for embedding and for tests.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<ExecEvent>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<ExecEvent> {
        self.events.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|ev| match ev {
                ExecEvent::TaskLog { line, .. } => Some(line),
                _ => None,
            })
            .collect()
    }
}

impl ExecSink for MemorySink {
    fn emit(&self, ev: ExecEvent) {
        if let Ok(mut g) = self.events.lock() {
            g.push(ev);
        }
    }
}

/// Knobs the CLI can set on top of the config file.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    /// Native build parallelism (`--jobs`).
    pub jobs: Option<usize>,
    /// Re-initialize a checkout even if it carries unrecorded edits.
    pub force: bool,
}

#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    pub sink: Arc<dyn ExecSink>,
    pub current_task_id: Option<String>,
    pub overrides: RunOverrides,
    shared: Arc<SharedExecState>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            dry_run,
            sink,
            current_task_id: None,
            overrides: RunOverrides::default(),
            shared: Arc::new(SharedExecState::default()),
        }
    }

    pub fn with_overrides(mut self, overrides: RunOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn set_task(&mut self, id: impl Into<String>) {
        self.current_task_id = Some(id.into());
    }

    pub fn set_workspace_paths(&self, paths: WorkspacePaths) {
        if let Ok(mut g) = self.shared.workspace_paths.lock() {
            *g = Some(paths);
        }
    }

    pub fn workspace_paths(&self) -> Option<WorkspacePaths> {
        self.shared
            .workspace_paths
            .lock()
            .ok()
            .and_then(|g| g.clone())
    }

    // Cleaning is only applied by core.init.
    pub fn workspace_paths_or_init(&self, doc: &ConfigDoc) -> Result<WorkspacePaths> {
        if let Some(p) = self.workspace_paths() {
            return Ok(p);
        }

        let mut ws: WorkspaceConfig = doc.section("workspace")?;
        ws.clean = crate::workspace::CleanMode::None;
        let paths = crate::workspace::init_dirs(&ws, &config_base_dir(doc)?)?;
        self.set_workspace_paths(paths.clone());
        Ok(paths)
    }

    fn task_label(&self) -> String {
        self.current_task_id
            .clone()
            .unwrap_or_else(|| "<none>".into())
    }

    pub fn log(&self, msg: &str) {
        let id = self.task_label();
        tracing::info!(task = %id, "{msg}");
        self.sink.emit(ExecEvent::TaskLog {
            id,
            line: msg.to_string(),
        });
    }

    pub fn warn(&self, msg: &str) {
        let id = self.task_label();
        tracing::warn!(task = %id, "{msg}");
        self.sink.emit(ExecEvent::TaskLog {
            id,
            line: format!("WARN: {msg}"),
        });
    }

    /// Run a command that mutates state, streaming its output line by line.
    /// On failure the error carries the command line and the output tail.
    pub fn run_cmd(&self, mut cmd: Command) -> Result<()> {
        let described = describe_command(&cmd);
        if self.dry_run {
            self.log(&format!("DRY-RUN: {described}"));
            return Ok(());
        }
        tracing::debug!(command = %described, "spawning");

        // Nothing we run is interactive; a tty stdin would only let tools block on prompts.
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::msg(format!("failed to spawn `{described}`: {e}")))?;

        let (tx, rx) = mpsc::channel::<String>();
        for stream in [
            child.stdout.take().map(|s| Box::new(s) as Box<dyn Read + Send>),
            child.stderr.take().map(|s| Box::new(s) as Box<dyn Read + Send>),
        ]
        .into_iter()
        .flatten()
        {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(stream, tx));
        }
        drop(tx);

        let mut tail = OutputTail::new(ERROR_TAIL_LINES);
        for line in rx {
            let line = sanitize_line(&line);
            if line.is_empty() {
                continue;
            }
            self.log(&line);
            tail.push(line);
        }

        let status = child
            .wait()
            .map_err(|e| Error::msg(format!("failed to wait for `{described}`: {e}")))?;
        if !status.success() {
            return Err(command_failure(&described, &status.to_string(), &tail));
        }
        Ok(())
    }

    /// Run a read-only command and return its raw stdout. Stderr is logged.
    /// Runs even in dry-run mode.
    pub fn capture_cmd(&self, mut cmd: Command) -> Result<Vec<u8>> {
        let described = describe_command(&cmd);
        tracing::debug!(command = %described, "capturing");
        let out = cmd
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::msg(format!("failed to spawn `{described}`: {e}")))?;

        let mut tail = OutputTail::new(ERROR_TAIL_LINES);
        for line in String::from_utf8_lossy(&out.stderr).lines() {
            let line = sanitize_line(line);
            if !line.is_empty() {
                tail.push(line);
            }
        }
        if !out.status.success() {
            return Err(command_failure(&described, &out.status.to_string(), &tail));
        }
        if !tail.is_empty() {
            tracing::debug!(command = %described, stderr = %tail.render(), "stderr");
        }
        Ok(out.stdout)
    }

    /// Run a command only for its exit status.
    pub fn probe_cmd(&self, mut cmd: Command) -> Result<bool> {
        let described = describe_command(&cmd);
        let status = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| Error::msg(format!("failed to spawn `{described}`: {e}")))?;
        tracing::debug!(command = %described, success = status.success(), "probed");
        Ok(status.success())
    }
}

/// Directory relative workspace roots are anchored at: the config file's
/// parent, or the process cwd for in-memory documents.
pub fn config_base_dir(doc: &ConfigDoc) -> Result<PathBuf> {
    match doc.path.parent() {
        Some(p) if !p.as_os_str().is_empty() && p.is_dir() => Ok(p.to_path_buf()),
        _ => std::env::current_dir().map_err(|e| Error::msg(format!("cwd error: {e}"))),
    }
}

pub fn describe_command(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    for arg in cmd.get_args() {
        let arg = arg.to_string_lossy();
        if arg.is_empty() || arg.contains(char::is_whitespace) {
            parts.push(format!("'{}'", arg.replace('\'', r"'\''")));
        } else {
            parts.push(arg.into_owned());
        }
    }
    let mut out = parts.join(" ");
    if let Some(dir) = cmd.get_current_dir() {
        out.push_str(&format!(" (in {})", dir.display()));
    }
    out
}

fn command_failure(described: &str, status: &str, tail: &OutputTail) -> Error {
    let mut msg = format!("command failed ({status}): {described}");
    if !tail.is_empty() {
        msg.push_str("\n--- output ---\n");
        msg.push_str(tail.render().trim_end());
    }
    Error::msg(msg)
}

#[derive(Default)]
pub struct TaskRegistry {
    exec: BTreeMap<&'static str, TaskExecFn>,
}

impl TaskRegistry {
    pub fn add(&mut self, id: &'static str, f: TaskExecFn) -> Result<()> {
        if self.exec.contains_key(id) {
            return Err(Error::msg(format!("duplicate task executor for '{id}'")));
        }
        self.exec.insert(id, f);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<TaskExecFn> {
        self.exec.get(id).copied()
    }
}

pub trait ModuleExec {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()>;
}

/// Run every task in plan order. Each task finishes (including its child
/// processes) before the next starts; the first failure stops the run.
pub fn execute_plan(
    doc: &ConfigDoc,
    plan: &Plan,
    reg: &TaskRegistry,
    ctx: &mut ExecCtx,
) -> Result<()> {
    let ordered = plan.ordered()?;
    for task in &ordered {
        if reg.get(&task.id).is_none() {
            return Err(Error::msg(format!(
                "no executor registered for task '{}'",
                task.id
            )));
        }
    }

    for task in ordered {
        let Some(exec) = reg.get(&task.id) else {
            continue;
        };
        ctx.sink.emit(ExecEvent::TaskStarted {
            id: task.id.clone(),
        });
        ctx.set_task(task.id.clone());
        if ctx.dry_run {
            ctx.log(&format!(
                "DRY-RUN: {} ({}/{})",
                task.id, task.module, task.phase
            ));
            ctx.sink.emit(ExecEvent::TaskFinished {
                id: task.id.clone(),
                ok: true,
                error: None,
                elapsed_ms: 0,
            });
            continue;
        }

        let start = Instant::now();
        let res = exec(doc, ctx);
        let elapsed_ms = start.elapsed().as_millis();
        match res {
            Ok(()) => ctx.sink.emit(ExecEvent::TaskFinished {
                id: task.id.clone(),
                ok: true,
                error: None,
                elapsed_ms,
            }),
            Err(e) => {
                ctx.sink.emit(ExecEvent::TaskFinished {
                    id: task.id.clone(),
                    ok: false,
                    error: Some(e.to_string()),
                    elapsed_ms,
                });
                let e = e.context(format!("task '{}' failed", task.id));
                ctx.sink.emit(ExecEvent::ExecutorDone {
                    ok: false,
                    error: Some(e.to_string()),
                });
                return Err(e);
            }
        }
    }
    ctx.sink.emit(ExecEvent::ExecutorDone {
        ok: true,
        error: None,
    });
    Ok(())
}

pub fn builtin_registry() -> Result<TaskRegistry> {
    let mut reg = TaskRegistry::default();
    reg.add(crate::modules::core::INIT_TASK, core_init)?;
    reg.add(crate::planner::SOURCES_BARRIER, core_barrier_sources)?;
    crate::modules::vendor::VendorModule::register_tasks(&mut reg)?;
    crate::modules::stage::StageModule::register_tasks(&mut reg)?;
    crate::modules::native::NativeModule::register_tasks(&mut reg)?;
    Ok(reg)
}

fn core_init(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let ws: WorkspaceConfig = doc.section("workspace")?;
    ctx.set_task(crate::modules::core::INIT_TASK);
    ctx.log(&format!("workspace.root_dir = {}", ws.root_dir));
    ctx.log(&format!("workspace.clean = {}", ws.clean.as_str()));

    let paths = crate::workspace::init_dirs(&ws, &config_base_dir(doc)?)?;
    ctx.set_workspace_paths(paths.clone());
    for (name, path) in &paths.named_dirs {
        ctx.log(&format!("workspace.paths.{} = {}", name, path.display()));
    }
    Ok(())
}

fn core_barrier_sources(_doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    ctx.set_task(crate::planner::SOURCES_BARRIER);
    ctx.log("sources ready");
    Ok(())
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    let flush = |pending: &mut Vec<u8>| {
        if !pending.is_empty() {
            let _ = tx.send(String::from_utf8_lossy(pending).into_owned());
            pending.clear();
        }
    };

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            if b == b'\n' || b == b'\r' {
                flush(&mut pending);
            } else {
                pending.push(b);
                if pending.len() >= MAX_PENDING_BYTES {
                    flush(&mut pending);
                }
            }
        }
    }
    flush(&mut pending);
}

fn append_task_log_line(
    task_logs: &mut BTreeMap<String, VecDeque<String>>,
    task_id: &str,
    line: &str,
) {
    const MAX_LINES: usize = 4000;
    let q = task_logs.entry(task_id.to_string()).or_default();
    while q.len() >= MAX_LINES {
        q.pop_front();
    }
    q.push_back(sanitize_line(line));
}

fn write_task_error_log(
    state: &mut StdoutSinkState,
    root: Option<PathBuf>,
    task_id: &str,
    error: &str,
    elapsed_ms: u128,
) -> Result<PathBuf> {
    let dir = match state.error_logs_dir.clone() {
        Some(d) => d,
        None => {
            let root = match root {
                Some(r) => r,
                None => std::env::current_dir()
                    .unwrap_or_else(|_| PathBuf::from("."))
                    .join("build")
                    .join("error-logs"),
            };
            let dir = root.join(chrono::Local::now().format("%Y%m%d-%H%M%S").to_string());
            fs::create_dir_all(&dir).map_err(|e| {
                Error::msg(format!(
                    "failed to create error logs dir {}: {e}",
                    dir.display()
                ))
            })?;
            state.error_logs_dir = Some(dir.clone());
            dir
        }
    };
    let path = dir.join(format!("{}.log", sanitize_filename_component(task_id)));

    // The error itself is multi-line (command + output tail); keep it as-is.
    let mut body = format!("task: {task_id}\nstatus: failed\nelapsed_ms: {elapsed_ms}\n");
    if !error.trim().is_empty() {
        body.push_str(&format!("error: {error}\n"));
    }
    body.push_str("\nlogs:\n");
    if let Some(lines) = state.task_logs.get(task_id) {
        for line in lines {
            body.push_str(line);
            body.push('\n');
        }
    }

    fs::write(&path, body).map_err(|e| {
        Error::msg(format!(
            "failed to write task error log {}: {e}",
            path.display()
        ))
    })?;
    state.error_log_paths.push(path.clone());
    Ok(path)
}

fn sanitize_filename_component(raw: &str) -> String {
    let out: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() { "task".into() } else { out }
}

fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> (Arc<MemorySink>, ExecCtx) {
        let sink = Arc::new(MemorySink::default());
        let ctx = ExecCtx::new(false, sink.clone());
        (sink, ctx)
    }

    #[test]
    fn describe_command_quotes_whitespace_args() {
        let mut cmd = Command::new("cmake");
        cmd.args(["-DCMAKE_CXX_FLAGS=-O2 -g", "-S", "src"]);
        assert_eq!(
            describe_command(&cmd),
            "cmake '-DCMAKE_CXX_FLAGS=-O2 -g' -S src"
        );
    }

    #[cfg(unix)]
    #[test]
    fn run_cmd_failure_carries_command_and_output() {
        let (sink, ctx) = ctx();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo first; echo 'hunk #1 FAILED' >&2; exit 3"]);
        let err = ctx.run_cmd(cmd).expect_err("non-zero exit");
        let msg = err.to_string();
        assert!(msg.contains("command failed"), "{msg}");
        assert!(msg.contains("sh -c"), "{msg}");
        assert!(msg.contains("hunk #1 FAILED"), "{msg}");
        assert!(sink.log_lines().iter().any(|l| l == "first"));
    }

    #[cfg(unix)]
    #[test]
    fn capture_cmd_returns_raw_stdout() {
        let (_sink, ctx) = ctx();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf 'a\\n\\tb'"]);
        assert_eq!(ctx.capture_cmd(cmd).expect("capture"), b"a\n\tb");
    }

    #[test]
    fn dry_run_logs_instead_of_spawning() {
        let sink = Arc::new(MemorySink::default());
        let ctx = ExecCtx::new(true, sink.clone());
        ctx.run_cmd(Command::new("definitely-not-a-real-program"))
            .expect("dry run");
        assert!(
            sink.log_lines()
                .iter()
                .any(|l| l.starts_with("DRY-RUN: definitely-not-a-real-program"))
        );
    }
}
