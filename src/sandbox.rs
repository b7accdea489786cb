//! Isolated compile-and-run execution.
//!
//! Each run gets a fresh workspace directory holding `main.<ext>`. One shell
//! script runs the language's commands in order inside bubblewrap, with
//! stdout and stderr merged into a single pipe that is streamed back as it is
//! read. The child leads its own process group so a timeout or kill takes out
//! everything it spawned.

use std::io;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{self, BoxFuture, Shared};
use futures_util::FutureExt;
use nix::fcntl::OFlag;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Buffered output beyond this is truncated.
pub const OUTPUT_CAP: usize = 100 * 1024;
/// What survives a truncation: the trailing bytes of the output.
pub const OUTPUT_KEEP: usize = 10 * 1024;

pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(20);
pub const TIMEOUT_REASON: &str = "Execution timed out";
pub const USER_KILL_REASON: &str = "Execution terminated by user";

const GREEN: &str = "\x1b[32;1m";
const RED: &str = "\x1b[31;1m";
const RESET: &str = "\x1b[0m";

fn green(text: &str) -> String {
    format!("{GREEN}{text}{RESET}")
}

fn red(text: &str) -> String {
    format!("{RED}{text}{RESET}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageProfile {
    pub id: String,
    /// Source file extension, without the dot.
    pub extension: String,
    /// Shell commands run in order; the first failure stops the run.
    pub commands: Vec<String>,
}

impl LanguageProfile {
    pub fn new(id: &str, extension: &str, commands: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            extension: extension.to_string(),
            commands: commands.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// C, C++ and Rust. The first entry is the default language.
pub fn default_languages() -> Vec<LanguageProfile> {
    vec![
        LanguageProfile::new("c", "c", &["clang -o main main.c", "./main"]),
        LanguageProfile::new(
            "cpp",
            "cpp",
            &["clang++ -std=c++17 -o main main.cpp", "./main"],
        ),
        LanguageProfile::new("rust", "rs", &["rustc -o main main.rs", "./main"]),
    ]
}

#[derive(Debug, Clone)]
pub enum Isolation {
    Bubblewrap {
        program: PathBuf,
        /// Optional read-only host paths mounted at the given sandbox path.
        runtime_binds: Vec<(PathBuf, String)>,
    },
    /// Runs the script directly in the workspace. Development and tests only.
    Unconfined,
}

impl Isolation {
    /// Bubblewrap with the invoking user's rustup toolchain mounted, if any.
    pub fn bubblewrap(program: impl Into<PathBuf>) -> Self {
        let runtime_binds = std::env::var_os("HOME")
            .map(|home| {
                vec![(
                    PathBuf::from(home).join(".rustup"),
                    "/home/user/.rustup".to_string(),
                )]
            })
            .unwrap_or_default();
        Isolation::Bubblewrap {
            program: program.into(),
            runtime_binds,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub workspace_root: PathBuf,
    pub timeout: Duration,
    pub isolation: Isolation,
    pub languages: Vec<LanguageProfile>,
}

impl SandboxSettings {
    pub fn profile(&self, id: &str) -> Option<&LanguageProfile> {
        self.languages.iter().find(|profile| profile.id == id)
    }

    pub fn language_ids(&self) -> Vec<String> {
        self.languages.iter().map(|profile| profile.id.clone()).collect()
    }
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir(),
            timeout: DEFAULT_RUN_TIMEOUT,
            isolation: Isolation::bubblewrap("bwrap"),
            languages: default_languages(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("invalid compilation language {id:?}, available options: {available:?}")]
    UnknownLanguage { id: String, available: Vec<String> },
    #[error("workspace {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn sandbox: {0}")]
    Spawn(#[source] io::Error),
    #[error("failed to create output pipe: {0}")]
    Pipe(#[from] nix::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The script ran to completion. `None` if it died from a signal.
    Exited(Option<i32>),
    TimedOut,
    Killed(String),
    /// The run never got going (workspace, spawn or pipe failure).
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxEvent {
    /// A run started and the output buffer was cleared.
    Started,
    Output(String),
}

pub type RunFuture = Shared<BoxFuture<'static, RunOutcome>>;

/// Output kept for late joiners, truncated to its tail once it grows too big.
#[derive(Debug, Default)]
struct OutputBuffer {
    text: String,
}

impl OutputBuffer {
    fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        if self.text.len() > OUTPUT_CAP {
            let mut cut = self.text.len() - OUTPUT_KEEP;
            while !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text.drain(..cut);
        }
    }
}

/// Decodes a byte stream whose chunks may split multi-byte characters.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        // Incomplete sequence at the end: wait for more bytes.
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        let tail = rest.to_vec();
        self.pending = tail;
        out
    }

    fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

/// Per-run directory, removed when the run ends.
struct Workspace {
    path: PathBuf,
    removed: bool,
}

impl Workspace {
    async fn create(root: &Path) -> Result<Self, SandboxError> {
        let path = root.join(format!("codeshare-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|source| SandboxError::Workspace {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            removed: false,
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn remove(mut self) {
        if let Err(err) = tokio::fs::remove_dir_all(&self.path).await {
            warn!(path = %self.path.display(), %err, "failed to remove workspace");
        }
        self.removed = true;
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.removed {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}

/// One script: echo each command in green, run it, stop at the first failure,
/// then report the exit code.
fn prepare_script(commands: &[String]) -> String {
    let mut steps: Vec<String> = commands
        .iter()
        .flat_map(|cmd| {
            [
                format!("echo \"{}\"", green(&format!("> {cmd}"))),
                format!("{cmd} 2>&1"),
            ]
        })
        .collect();
    steps.push(format!("echo \"\n{}\"", green("Exit code: 0")));
    format!(
        "{} || echo \"\n{}\"",
        steps.join(" && "),
        red("Exit code: $?")
    )
}

fn build_command(isolation: &Isolation, workspace: &Path, script: String) -> Command {
    match isolation {
        Isolation::Bubblewrap {
            program,
            runtime_binds,
        } => {
            let mut cmd = Command::new(program);
            cmd.args([
                "--unshare-all",
                "--new-session",
                "--die-with-parent",
                "--cap-drop",
                "ALL",
                "--ro-bind",
                "/usr",
                "/usr",
                "--symlink",
                "usr/bin",
                "/bin",
                "--symlink",
                "usr/lib",
                "/lib",
                "--symlink",
                "/usr/lib64",
                "/lib64",
                "--tmpfs",
                "/tmp",
                "--dev",
                "/dev",
                "--proc",
                "/proc",
            ]);
            for (source, target) in runtime_binds {
                cmd.arg("--ro-bind-try").arg(source).arg(target);
            }
            cmd.args([
                "--clearenv",
                "--setenv",
                "HOME",
                "/home/user",
                "--setenv",
                "PATH",
                "/usr/local/bin:/usr/bin:/usr/local/sbin",
                "--setenv",
                "TERM",
                "xterm-256color",
            ]);
            cmd.arg("--bind")
                .arg(workspace)
                .args(["/src", "--chdir", "/src", "bash", "-c"])
                .arg(script);
            cmd
        }
        Isolation::Unconfined => {
            let mut cmd = Command::new("bash");
            cmd.arg("-c").arg(script).current_dir(workspace);
            cmd
        }
    }
}

fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(err) => warn!(pid, %err, "failed to kill sandbox process group"),
    }
}

struct RunState {
    language: String,
    output: OutputBuffer,
    run: Option<RunFuture>,
    kill: Option<oneshot::Sender<String>>,
    closed: Option<String>,
    generation: u64,
}

struct Inner {
    settings: Arc<SandboxSettings>,
    events: mpsc::UnboundedSender<SandboxEvent>,
    state: Mutex<RunState>,
}

/// Single-flight execution unit owned by one room.
#[derive(Clone)]
pub struct Sandbox {
    inner: Arc<Inner>,
}

impl Sandbox {
    pub fn new(settings: Arc<SandboxSettings>, events: mpsc::UnboundedSender<SandboxEvent>) -> Self {
        let language = settings
            .languages
            .first()
            .map(|profile| profile.id.clone())
            .unwrap_or_default();
        Self {
            inner: Arc::new(Inner {
                settings,
                events,
                state: Mutex::new(RunState {
                    language,
                    output: OutputBuffer::default(),
                    run: None,
                    kill: None,
                    closed: None,
                    generation: 0,
                }),
            }),
        }
    }

    pub fn language(&self) -> String {
        self.inner.state.lock().language.clone()
    }

    pub fn set_language(&self, id: &str) -> Result<(), SandboxError> {
        if self.inner.settings.profile(id).is_none() {
            return Err(SandboxError::UnknownLanguage {
                id: id.to_string(),
                available: self.languages(),
            });
        }
        self.inner.state.lock().language = id.to_string();
        Ok(())
    }

    pub fn languages(&self) -> Vec<String> {
        self.inner.settings.language_ids()
    }

    pub fn output(&self) -> String {
        self.inner.state.lock().output.text.clone()
    }

    /// Replace the buffered output, e.g. with a persisted snapshot.
    pub fn set_output(&self, output: String) {
        let mut state = self.inner.state.lock();
        state.output = OutputBuffer::default();
        state.output.push(&output);
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().run.is_some()
    }

    /// Start a run of `source`, or join the one already in flight.
    ///
    /// Must be called inside a tokio runtime.
    pub fn compile(&self, source: String) -> RunFuture {
        let mut state = self.inner.state.lock();
        if let Some(run) = &state.run {
            debug!("joining in-flight run");
            return run.clone();
        }
        if let Some(reason) = &state.closed {
            debug!(%reason, "refusing run on closed sandbox");
            return future::ready(RunOutcome::Killed(reason.clone()))
                .boxed()
                .shared();
        }

        state.output = OutputBuffer::default();
        let _ = self.inner.events.send(SandboxEvent::Started);

        let (kill_tx, kill_rx) = oneshot::channel();
        state.kill = Some(kill_tx);
        state.generation += 1;
        let generation = state.generation;
        let profile = self.inner.settings.profile(&state.language).cloned();

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let outcome = match profile {
                Some(profile) => inner.execute(profile, source, kill_rx).await,
                None => RunOutcome::Failed("no language selected".to_string()),
            };
            inner.finish(generation);
            outcome
        });
        let run = async move {
            handle
                .await
                .unwrap_or_else(|err| RunOutcome::Failed(format!("run task failed: {err}")))
        }
        .boxed()
        .shared();
        state.run = Some(run.clone());
        run
    }

    /// Kill the in-flight run with a red notice carrying `reason`.
    ///
    /// Returns false when nothing is running.
    pub fn kill(&self, reason: &str) -> bool {
        let Some(kill) = self.inner.state.lock().kill.take() else {
            return false;
        };
        kill.send(reason.to_string()).is_ok()
    }

    /// Kill any run in flight and refuse later ones with `reason`.
    pub fn close(&self, reason: &str) {
        self.inner.state.lock().closed = Some(reason.to_string());
        self.kill(reason);
    }
}

impl Inner {
    fn append(&self, chunk: String) {
        if chunk.is_empty() {
            return;
        }
        self.state.lock().output.push(&chunk);
        let _ = self.events.send(SandboxEvent::Output(chunk));
    }

    /// Append `text` on a line of its own, preceded by a blank line.
    fn append_notice(&self, text: &str) {
        let needs_break = {
            let state = self.state.lock();
            !state.output.text.is_empty() && !state.output.text.ends_with('\n')
        };
        let mut chunk = String::new();
        if needs_break {
            chunk.push('\n');
        }
        chunk.push('\n');
        chunk.push_str(&red(text));
        chunk.push('\n');
        self.append(chunk);
    }

    fn finish(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation {
            state.run = None;
            state.kill = None;
        }
    }

    async fn execute(
        &self,
        profile: LanguageProfile,
        source: String,
        kill: oneshot::Receiver<String>,
    ) -> RunOutcome {
        let workspace = match Workspace::create(&self.settings.workspace_root).await {
            Ok(workspace) => workspace,
            Err(err) => {
                warn!(%err, "cannot create workspace");
                self.append_notice(&err.to_string());
                return RunOutcome::Failed(err.to_string());
            }
        };

        let file = workspace.path().join(format!("main.{}", profile.extension));
        let outcome = match tokio::fs::write(&file, source).await {
            Ok(()) => {
                info!(language = %profile.id, workspace = %workspace.path().display(), "starting run");
                let script = prepare_script(&profile.commands);
                let command = build_command(&self.settings.isolation, workspace.path(), script);
                match self.supervise(command, kill).await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        warn!(%err, "sandbox failed to start");
                        self.append_notice(&err.to_string());
                        RunOutcome::Failed(err.to_string())
                    }
                }
            }
            Err(source) => {
                let err = SandboxError::Workspace { path: file, source };
                warn!(%err, "cannot write source");
                self.append_notice(&err.to_string());
                RunOutcome::Failed(err.to_string())
            }
        };

        let needs_newline = {
            let state = self.state.lock();
            !state.output.text.is_empty() && !state.output.text.ends_with('\n')
        };
        if needs_newline {
            self.append("\n".to_string());
        }

        workspace.remove().await;
        info!(language = %profile.id, ?outcome, "run finished");
        outcome
    }

    async fn supervise(
        &self,
        mut command: Command,
        mut kill: oneshot::Receiver<String>,
    ) -> Result<RunOutcome, SandboxError> {
        let (reader, writer) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
        let stderr_writer: OwnedFd = writer.try_clone().map_err(SandboxError::Spawn)?;
        command
            .stdin(Stdio::null())
            .stdout(Stdio::from(writer))
            .stderr(Stdio::from(stderr_writer))
            .process_group(0)
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(SandboxError::Spawn)?;
        // Our copies of the write end must go for the reader to see EOF.
        drop(command);
        let pid = child.id();

        let mut output = pipe::Receiver::from_owned_fd(reader).map_err(SandboxError::Spawn)?;
        let mut buf = vec![0u8; 8 * 1024];
        let mut decoder = Utf8Carry::default();
        let deadline = tokio::time::sleep(self.settings.timeout);
        tokio::pin!(deadline);

        let mut reading = true;
        let mut kill_open = true;
        let mut status = None;
        let mut verdict = None;

        while reading || status.is_none() {
            let settled = status.is_some() || verdict.is_some();
            tokio::select! {
                read = output.read(&mut buf), if reading => match read {
                    Ok(0) => reading = false,
                    Ok(n) => self.append(decoder.push(&buf[..n])),
                    Err(err) => {
                        warn!(%err, "reading sandbox output failed");
                        reading = false;
                    }
                },
                exit = child.wait(), if status.is_none() => {
                    status = Some(exit);
                    // An open pipe means stragglers keep the group alive. After
                    // EOF the pgid may already belong to someone else.
                    if reading {
                        kill_group(pid);
                    }
                }
                () = &mut deadline, if !settled => {
                    kill_group(pid);
                    self.append_notice(TIMEOUT_REASON);
                    verdict = Some(RunOutcome::TimedOut);
                }
                reason = &mut kill, if kill_open && !settled => {
                    kill_open = false;
                    if let Ok(reason) = reason {
                        kill_group(pid);
                        self.append_notice(&reason);
                        verdict = Some(RunOutcome::Killed(reason));
                    }
                }
            }
        }
        self.append(decoder.finish());

        Ok(match (verdict, status) {
            (Some(verdict), _) => verdict,
            (None, Some(Ok(status))) => RunOutcome::Exited(status.code()),
            (None, Some(Err(err))) => RunOutcome::Failed(err.to_string()),
            (None, None) => RunOutcome::Failed("sandbox exited without status".to_string()),
        })
    }
}
