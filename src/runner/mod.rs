// src/runner/mod.rs

//! Single choke point for subprocess invocation
//!
//! Every external command the tool runs goes through [`Runner::run`]: host
//! commands, root commands routed through the privilege channel, and
//! commands inside a chroot. Each invocation gets a monotonic sequence
//! number and its start/end events are appended to the work-dir log, so the
//! log is a total order over command executions. Output is drained on a
//! reader thread per stream to avoid pipe deadlock; timeouts deliver
//! SIGTERM, then SIGKILL after a grace window.

use crate::error::{Error, Result};
use crate::sudo;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Grace window between SIGTERM and SIGKILL on timeout or interrupt
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Default command timeout when the caller sets none
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(900);

/// How many trailing output lines are kept for error reports
const TAIL_LINES: usize = 10;

/// Environment variables allowed through into chroot commands
const CHROOT_ENV_ALLOWLIST: &[(&str, &str)] = &[
    ("PATH", "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"),
    ("HOME", "/root"),
    ("TERM", "xterm"),
    ("SHELL", "/bin/sh"),
    ("LANG", "C.UTF-8"),
    ("CHARSET", "UTF-8"),
];

// SIGINT state is kernel-global by nature; this is the one piece of process
// state not carried in the context value.
static INTERRUPTS: AtomicU32 = AtomicU32::new(0);

/// Record one delivery of SIGINT. Called from the signal handler.
pub fn note_interrupt() -> u32 {
    INTERRUPTS.fetch_add(1, Ordering::SeqCst) + 1
}

pub fn interrupted() -> bool {
    INTERRUPTS.load(Ordering::SeqCst) > 0
}

/// Where a command executes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecContext {
    Host,
    /// As root inside a chroot tree. Constructed only by the chroot manager
    /// once the tree's mounts are verified live.
    Chroot { root: PathBuf, suffix: String },
    /// As an unprivileged user inside a chroot tree
    UserInChroot {
        root: PathBuf,
        suffix: String,
        user: String,
    },
}

impl ExecContext {
    fn label(&self) -> String {
        match self {
            ExecContext::Host => "host".to_string(),
            ExecContext::Chroot { suffix, .. } => format!("chroot:{suffix}"),
            ExecContext::UserInChroot { suffix, user, .. } => format!("chroot:{suffix}:{user}"),
        }
    }
}

/// Where the command's stdin comes from
#[derive(Debug, Clone)]
pub enum StdinSource {
    None,
    Bytes(Vec<u8>),
    File(PathBuf),
}

/// What happens to the command's output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Collect stdout and return it to the caller
    Return,
    /// Stream every line to the log only
    StreamToLog,
    /// Stream to the log and echo to the terminal
    TeeToTerminal,
}

/// Specification of one command invocation
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub argv: Vec<OsString>,
    pub context: ExecContext,
    pub env: Vec<(String, String)>,
    pub stdin: StdinSource,
    pub output: OutputMode,
    pub timeout: Duration,
    /// Non-zero exit becomes an error when set
    pub check: bool,
    /// Route through the privilege channel
    pub as_root: bool,
}

impl CommandSpec {
    pub fn new<I, S>(argv: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        CommandSpec {
            argv: argv.into_iter().map(Into::into).collect(),
            context: ExecContext::Host,
            env: Vec::new(),
            stdin: StdinSource::None,
            output: OutputMode::StreamToLog,
            timeout: DEFAULT_TIMEOUT,
            check: true,
            as_root: false,
        }
    }

    pub fn context(mut self, context: ExecContext) -> Self {
        self.context = context;
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn stdin(mut self, stdin: StdinSource) -> Self {
        self.stdin = stdin;
        self
    }

    pub fn output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    pub fn as_root(mut self, as_root: bool) -> Self {
        self.as_root = as_root;
        self
    }
}

/// Result of a completed command
#[derive(Debug)]
pub struct CommandResult {
    pub code: i32,
    /// Collected stdout; empty unless `OutputMode::Return`
    pub stdout: String,
    pub elapsed: Duration,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// The command runner: owns the log stream and the sequence counter
#[derive(Debug)]
pub struct Runner {
    log: Mutex<File>,
    sequence: AtomicU64,
}

impl Runner {
    /// Open (or append to) the log file and create the runner
    pub fn new(log_path: &Path) -> Result<Runner> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = OpenOptions::new().create(true).append(true).open(log_path)?;
        Ok(Runner {
            log: Mutex::new(log),
            sequence: AtomicU64::new(0),
        })
    }

    /// Run one command to completion
    pub fn run(&self, spec: CommandSpec) -> Result<CommandResult> {
        if interrupted() {
            return Err(Error::Interrupted);
        }

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let argv = resolve_argv(&spec)?;
        let cmdline = shell_join(&argv);
        self.log_line(&format!("[#{seq} start] ({}) % {cmdline}", spec.context.label()));
        debug!("#{seq} ({}) % {}", spec.context.label(), cmdline);

        let started = Instant::now();
        let mut child = spawn(&spec, &argv)?;

        if let StdinSource::Bytes(bytes) = &spec.stdin {
            if let Some(mut pipe) = child.stdin.take() {
                // A child that exits without reading gets EPIPE; not an error
                let _ = pipe.write_all(bytes);
            }
        }

        // One reader thread per stream so neither pipe can fill and deadlock
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(TAIL_LINES)));
        let collected = Arc::new(Mutex::new(String::new()));
        let mut drains = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            drains.push(self.drain_stream(stdout, seq, spec.output, true, &tail, &collected));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(self.drain_stream(stderr, seq, spec.output, false, &tail, &collected));
        }

        let status = self.wait(&mut child, &spec, &cmdline, started)?;
        for drain in drains {
            let _ = drain.join();
        }

        let elapsed = started.elapsed();
        let code = status_code(&status);
        self.log_line(&format!(
            "[#{seq} done] code={code} elapsed={:.1}s",
            elapsed.as_secs_f32()
        ));

        if spec.check && code != 0 {
            let tail_lines: Vec<String> = tail.lock().unwrap().iter().cloned().collect();
            return Err(Error::NonZeroExit {
                code,
                argv: cmdline,
                tail: tail_lines.join("\n"),
            });
        }

        let stdout = Arc::try_unwrap(collected)
            .map(|m| m.into_inner().unwrap())
            .unwrap_or_default();
        Ok(CommandResult {
            code,
            stdout,
            elapsed,
        })
    }

    /// Wait for the child, honoring timeout and interrupt in 100 ms slices
    fn wait(
        &self,
        child: &mut Child,
        spec: &CommandSpec,
        cmdline: &str,
        started: Instant,
    ) -> Result<std::process::ExitStatus> {
        let slice = Duration::from_millis(100);
        loop {
            if let Some(status) = child
                .wait_timeout(slice)
                .map_err(|e| Error::SpawnFailed(e.to_string()))?
            {
                return Ok(status);
            }

            if interrupted() {
                warn!("interrupt: terminating running command");
                terminate(child, INTERRUPTS.load(Ordering::SeqCst) > 1);
                return Err(Error::Interrupted);
            }

            if started.elapsed() >= spec.timeout {
                terminate(child, false);
                return Err(Error::Timeout {
                    argv: cmdline.to_string(),
                    elapsed_secs: started.elapsed().as_secs(),
                });
            }
        }
    }

    fn drain_stream<R: std::io::Read + Send + 'static>(
        &self,
        stream: R,
        seq: u64,
        output: OutputMode,
        is_stdout: bool,
        tail: &Arc<Mutex<VecDeque<String>>>,
        collected: &Arc<Mutex<String>>,
    ) -> std::thread::JoinHandle<()> {
        let tail = Arc::clone(tail);
        let collected = Arc::clone(collected);
        let log = self.try_clone_log();
        std::thread::spawn(move || {
            let reader = BufReader::new(stream);
            for line in reader.lines() {
                let Ok(line) = line else { break };

                {
                    let mut tail = tail.lock().unwrap();
                    if tail.len() == TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line.clone());
                }

                match output {
                    OutputMode::Return => {
                        if is_stdout {
                            let mut buf = collected.lock().unwrap();
                            buf.push_str(&line);
                            buf.push('\n');
                        }
                    }
                    OutputMode::StreamToLog | OutputMode::TeeToTerminal => {
                        if let Some(log) = &log {
                            let mut log = log.lock().unwrap();
                            let _ = writeln!(log, "[#{seq}] {line}");
                        }
                        if output == OutputMode::TeeToTerminal {
                            println!("{line}");
                        }
                    }
                }
            }
        })
    }

    fn try_clone_log(&self) -> Option<Arc<Mutex<File>>> {
        self.log
            .lock()
            .ok()
            .and_then(|f| f.try_clone().ok())
            .map(|f| Arc::new(Mutex::new(f)))
    }

    fn log_line(&self, line: &str) {
        let stamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S");
        if let Ok(mut log) = self.log.lock() {
            let _ = writeln!(log, "[{stamp}] {line}");
        }
    }
}

/// Build the final argv: chroot entry, environment sanitizing, privilege
/// escalation. Chroot commands always need root for the chroot(2) call.
fn resolve_argv(spec: &CommandSpec) -> Result<Vec<OsString>> {
    let mut argv: Vec<OsString> = Vec::new();
    let needs_root;

    match &spec.context {
        ExecContext::Host => {
            needs_root = spec.as_root;
            argv.extend(spec.argv.iter().cloned());
        }
        ExecContext::Chroot { root, .. } => {
            needs_root = true;
            sudo::require_absolute(root)?;
            argv.push("/usr/sbin/chroot".into());
            argv.push(root.clone().into_os_string());
            push_sanitized_env(&mut argv, &spec.env);
            argv.extend(spec.argv.iter().cloned());
        }
        ExecContext::UserInChroot { root, user, .. } => {
            needs_root = true;
            sudo::require_absolute(root)?;
            argv.push("/usr/sbin/chroot".into());
            argv.push(root.clone().into_os_string());
            push_sanitized_env(&mut argv, &spec.env);
            argv.push("su".into());
            argv.push(user.clone().into());
            argv.push("-c".into());
            argv.push(shell_join(&spec.argv).into());
        }
    }

    if needs_root && !sudo::running_as_root() {
        return sudo::escalate(&argv);
    }
    Ok(argv)
}

/// Reset the environment to the allow-list, then apply the overlay and the
/// forwarded proxy/reproducibility variables.
fn push_sanitized_env(argv: &mut Vec<OsString>, overlay: &[(String, String)]) {
    argv.push("/usr/bin/env".into());
    argv.push("-i".into());
    for (key, value) in CHROOT_ENV_ALLOWLIST {
        argv.push(format!("{key}={value}").into());
    }
    for key in sudo::PASSTHROUGH_ENV {
        if let Ok(value) = std::env::var(key) {
            argv.push(format!("{key}={value}").into());
        }
    }
    for (key, value) in overlay {
        argv.push(format!("{key}={value}").into());
    }
}

fn spawn(spec: &CommandSpec, argv: &[OsString]) -> Result<Child> {
    let mut command = Command::new(&argv[0]);
    command.args(&argv[1..]);

    match &spec.stdin {
        StdinSource::None => {
            command.stdin(Stdio::null());
        }
        StdinSource::Bytes(_) => {
            command.stdin(Stdio::piped());
        }
        StdinSource::File(path) => {
            let file = File::open(path)?;
            command.stdin(Stdio::from(file));
        }
    }
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    // Host-context env overlay applies to the process directly; chroot
    // contexts already carried it via env -i in the argv.
    if spec.context == ExecContext::Host {
        for (key, value) in &spec.env {
            command.env(key, value);
        }
    }

    command
        .spawn()
        .map_err(|e| Error::SpawnFailed(format!("{}: {e}", argv[0].to_string_lossy())))
}

/// SIGTERM, grace window, then SIGKILL. `hard` skips straight to SIGKILL.
fn terminate(child: &mut Child, hard: bool) {
    let pid = Pid::from_raw(child.id() as i32);
    if !hard {
        let _ = signal::kill(pid, Signal::SIGTERM);
        if let Ok(Some(_)) = child.wait_timeout(KILL_GRACE) {
            return;
        }
    }
    let _ = signal::kill(pid, Signal::SIGKILL);
    let _ = child.wait();
}

fn status_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or_else(|| {
        use std::os::unix::process::ExitStatusExt;
        128 + status.signal().unwrap_or(0)
    })
}

/// Join argv into a single shell-safe string (for `su -c` and log lines)
pub fn shell_join(argv: &[OsString]) -> String {
    argv.iter()
        .map(|arg| shell_quote(&arg.to_string_lossy()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:,+@%".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn runner() -> (tempfile::TempDir, Runner) {
        let dir = tempdir().unwrap();
        let runner = Runner::new(&dir.path().join("log.txt")).unwrap();
        (dir, runner)
    }

    #[test]
    fn test_run_returns_stdout() {
        let (_dir, runner) = runner();
        let spec = CommandSpec::new(["echo", "hello"]).output(OutputMode::Return);
        let result = runner.run(spec).unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, "hello\n");
    }

    #[test]
    fn test_nonzero_exit_with_check() {
        let (_dir, runner) = runner();
        let spec = CommandSpec::new(["sh", "-c", "echo oops >&2; exit 3"]);
        let err = runner.run(spec).unwrap_err();
        match err {
            Error::NonZeroExit { code, tail, .. } => {
                assert_eq!(code, 3);
                assert!(tail.contains("oops"));
            }
            other => panic!("expected NonZeroExit, got {other:?}"),
        }
    }

    #[test]
    fn test_nonzero_exit_without_check() {
        let (_dir, runner) = runner();
        let spec = CommandSpec::new(["sh", "-c", "exit 7"]).check(false);
        let result = runner.run(spec).unwrap();
        assert_eq!(result.code, 7);
    }

    #[test]
    fn test_timeout_kills_command() {
        let (_dir, runner) = runner();
        let spec = CommandSpec::new(["sleep", "30"]).timeout(Duration::from_millis(300));
        let err = runner.run(spec).unwrap_err();
        assert_eq!(err.tag(), "Timeout");
    }

    #[test]
    fn test_stdin_bytes() {
        let (_dir, runner) = runner();
        let spec = CommandSpec::new(["cat"])
            .stdin(StdinSource::Bytes(b"piped".to_vec()))
            .output(OutputMode::Return);
        let result = runner.run(spec).unwrap();
        assert_eq!(result.stdout, "piped\n");
    }

    #[test]
    fn test_spawn_failure() {
        let (_dir, runner) = runner();
        let spec = CommandSpec::new(["/no/such/binary/anywhere"]);
        let err = runner.run(spec).unwrap_err();
        assert_eq!(err.tag(), "SpawnFailed");
    }

    #[test]
    fn test_log_has_sequence_numbers() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("log.txt");
        let runner = Runner::new(&log_path).unwrap();

        runner.run(CommandSpec::new(["true"])).unwrap();
        runner.run(CommandSpec::new(["true"])).unwrap();

        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.contains("[#0 start]"));
        assert!(log.contains("[#0 done]"));
        assert!(log.contains("[#1 start]"));
        // Start/end events are totally ordered in the file
        let first_done = log.find("[#0 done]").unwrap();
        let second_start = log.find("[#1 start]").unwrap();
        assert!(first_done < second_start);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("simple"), "simple");
        assert_eq!(shell_quote("has space"), "'has space'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_chroot_argv_shape() {
        let spec = CommandSpec::new(["apk", "add", "busybox"]).context(ExecContext::Chroot {
            root: PathBuf::from("/work/chroot_native"),
            suffix: "native".to_string(),
        });
        // Escalation depends on the host having doas/sudo; the shape checks
        // hold with or without the wrapper.
        match resolve_argv(&spec) {
            Ok(argv) => {
                let joined = shell_join(&argv);
                assert!(joined.contains("/usr/sbin/chroot /work/chroot_native"));
                assert!(joined.contains("env -i"));
                assert!(joined.ends_with("apk add busybox"));
            }
            Err(Error::PrivilegeEscalationFailed(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
}
