use crate::config::HostConfig;
use crate::correlator::{Correlator, PendingCall};
use crate::errors::{AppError, AppResult};
use crate::harness::frame_extractor::FrameBuffer;
use crate::models::{HelperLifecycle, HelperStatus};
use crate::process_tree::{isolate_process_tree, platform_killer, ProcessTreeKiller};
use crate::redaction::Redactor;
use crate::router::FrameRouter;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

const READ_CHUNK_BYTES: usize = 4096;
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
const MAX_STDERR_LOG_CHARS: usize = 4000;
const STREAM_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Write side of one live helper plus the table its responses settle.
#[derive(Clone)]
pub struct HelperChannel {
    generation: u64,
    pid: Option<u32>,
    correlator: Correlator,
    stdin: Arc<Mutex<ChildStdin>>,
    alive: Arc<AtomicBool>,
}

impl HelperChannel {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub async fn register(&self, request_id: &str, command: &str) -> AppResult<PendingCall> {
        self.correlator.register(request_id, command).await
    }

    /// Writes one complete line. Lines never interleave.
    pub async fn write_line(&self, line: &str) -> AppResult<()> {
        if !self.is_alive() {
            return Err(AppError::ProcessTerminated(format!(
                "helper generation {} is no longer running",
                self.generation
            )));
        }
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|error| AppError::Io(format!("failed to write to helper stdin: {}", error)))?;
        stdin
            .flush()
            .await
            .map_err(|error| AppError::Io(format!("failed to flush helper stdin: {}", error)))?;
        Ok(())
    }
}

struct LiveHelper {
    channel: HelperChannel,
    kill_tx: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
}

/// Everything the exit watcher owns for one helper generation.
struct ExitWatch {
    child: Child,
    generation: u64,
    pid: Option<u32>,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<bool>,
    stdout_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
    alive: Arc<AtomicBool>,
    correlator: Correlator,
    live: Arc<Mutex<Option<LiveHelper>>>,
    lifecycle: Arc<RwLock<HelperLifecycle>>,
}

/// Owns at most one helper process at a time. Spawns lazily, respawns on
/// demand after a crash and tears the whole process tree down on request.
pub struct Supervisor {
    config: HostConfig,
    killer: Arc<dyn ProcessTreeKiller>,
    redactor: Redactor,
    live: Arc<Mutex<Option<LiveHelper>>>,
    lifecycle: Arc<RwLock<HelperLifecycle>>,
    generation: AtomicU64,
}

impl Supervisor {
    pub fn new(config: HostConfig) -> Self {
        Self::with_killer(config, platform_killer())
    }

    pub fn with_killer(config: HostConfig, killer: Arc<dyn ProcessTreeKiller>) -> Self {
        Self {
            config,
            killer,
            redactor: Redactor::new(true),
            live: Arc::new(Mutex::new(None)),
            lifecycle: Arc::new(RwLock::new(HelperLifecycle::Absent)),
            generation: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Returns the live helper, starting one when none is running.
    pub async fn ensure_running(&self) -> AppResult<HelperChannel> {
        let mut live = self.live.lock().await;
        if let Some(helper) = live.as_ref() {
            if helper.channel.is_alive() {
                return Ok(helper.channel.clone());
            }
        }

        if let Some(stale) = live.take() {
            stale
                .channel
                .correlator
                .reject_all(AppError::ProcessTerminated("helper process exited".to_string()))
                .await;
        }

        let helper = self.spawn_helper()?;
        let channel = helper.channel.clone();
        *live = Some(helper);
        Ok(channel)
    }

    /// Kills the helper and everything it started. Never fails; problems are
    /// logged. Pending requests are rejected.
    pub async fn terminate(&self) {
        let mut live = self.live.lock().await;
        let Some(helper) = live.take() else {
            return;
        };
        set_lifecycle(&self.lifecycle, HelperLifecycle::Terminating);
        self.teardown(helper).await;
        set_lifecycle(&self.lifecycle, HelperLifecycle::Absent);
    }

    pub async fn restart(&self) -> AppResult<HelperStatus> {
        self.terminate().await;
        self.ensure_running().await?;
        Ok(self.status().await)
    }

    pub async fn status(&self) -> HelperStatus {
        let state = read_lifecycle(&self.lifecycle);
        let generation = self.generation.load(Ordering::SeqCst);
        match self.live.try_lock() {
            Ok(live) => match live.as_ref() {
                Some(helper) => HelperStatus {
                    state,
                    pid: helper.channel.pid,
                    generation: helper.channel.generation,
                    pending_requests: helper.channel.correlator.pending_count().await,
                },
                None => HelperStatus {
                    state,
                    pid: None,
                    generation,
                    pending_requests: 0,
                },
            },
            // A spawn or teardown holds the slot.
            Err(_) => HelperStatus {
                state,
                pid: None,
                generation,
                pending_requests: 0,
            },
        }
    }

    fn spawn_helper(&self) -> AppResult<LiveHelper> {
        set_lifecycle(&self.lifecycle, HelperLifecycle::Starting);
        match self.start_process() {
            Ok(helper) => {
                set_lifecycle(&self.lifecycle, HelperLifecycle::Running);
                Ok(helper)
            }
            Err(error) => {
                set_lifecycle(&self.lifecycle, HelperLifecycle::Absent);
                tracing::error!(error = %error, "helper launch failed");
                Err(error)
            }
        }
    }

    fn start_process(&self) -> AppResult<LiveHelper> {
        let candidate = self.config.resolve_launch()?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let mut command = Command::new(&candidate.program);
        command
            .args(&candidate.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONUNBUFFERED", "1")
            .kill_on_drop(true);
        for (key, value) in &self.config.helper.env {
            command.env(key, value);
        }
        if let Some(dir) = &self.config.helper.working_dir {
            command.current_dir(dir);
        }
        isolate_process_tree(&mut command);

        let mut child = command.spawn().map_err(|error| {
            AppError::Launch(format!(
                "cannot start helper {}: {}",
                candidate.program.display(),
                error
            ))
        })?;
        let pid = child.id();

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            return Err(AppError::Launch("helper started without piped stdio".to_string()));
        };

        let correlator = Correlator::new(self.config.request_timeout());
        let alive = Arc::new(AtomicBool::new(true));
        let frames = FrameBuffer::new(
            Some(self.config.max_frame_buffer_bytes),
            self.config.frame_buffer_retain_bytes,
        );

        let stdout_task = tokio::spawn(pump_stdout(
            stdout,
            FrameRouter::with_max_stream_chunks(correlator.clone(), generation, self.config.max_stream_chunks),
            frames,
            generation,
        ));
        let stderr_task = tokio::spawn(log_stderr(stderr, self.redactor.clone(), generation));

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(false);
        tokio::spawn(watch_exit(ExitWatch {
            child,
            generation,
            pid,
            kill_rx,
            exit_tx,
            stdout_task,
            stderr_task,
            alive: alive.clone(),
            correlator: correlator.clone(),
            live: self.live.clone(),
            lifecycle: self.lifecycle.clone(),
        }));

        tracing::info!(
            generation,
            pid = ?pid,
            program = %candidate.program.display(),
            "helper started"
        );

        Ok(LiveHelper {
            channel: HelperChannel {
                generation,
                pid,
                correlator,
                stdin: Arc::new(Mutex::new(stdin)),
                alive,
            },
            kill_tx: Some(kill_tx),
            exited: exit_rx,
        })
    }

    async fn teardown(&self, mut helper: LiveHelper) {
        let generation = helper.channel.generation;
        let pid = helper.channel.pid;
        tracing::info!(generation, pid = ?pid, "terminating helper");

        if let Some(kill_tx) = helper.kill_tx.take() {
            let _ = kill_tx.send(());
        }

        match pid {
            Some(pid) => {
                self.kill_tree(pid).await;
                if !self.wait_for_exit(&mut helper.exited).await || self.tree_alive(pid).await {
                    tracing::warn!(generation, pid, "helper tree still alive after kill; retrying");
                    self.kill_tree(pid).await;
                    if !self.wait_for_exit(&mut helper.exited).await || self.tree_alive(pid).await {
                        tracing::error!(generation, pid, "helper tree survived forced termination");
                    }
                }
            }
            None => {
                if !self.wait_for_exit(&mut helper.exited).await {
                    tracing::warn!(generation, "helper without pid did not report exit");
                }
            }
        }

        let rejected = helper
            .channel
            .correlator
            .reject_all(AppError::ProcessTerminated("helper process was shut down".to_string()))
            .await;
        if rejected > 0 {
            tracing::info!(generation, rejected, "rejected pending requests on shutdown");
        }
    }

    async fn kill_tree(&self, pid: u32) {
        let killer = self.killer.clone();
        match tokio::task::spawn_blocking(move || killer.kill_tree(pid)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => tracing::warn!(pid, error = %error, "helper tree kill failed"),
            Err(error) => tracing::warn!(pid, error = %error, "helper tree kill task failed"),
        }
    }

    async fn tree_alive(&self, pid: u32) -> bool {
        let killer = self.killer.clone();
        tokio::task::spawn_blocking(move || killer.is_alive(pid))
            .await
            .unwrap_or(false)
    }

    async fn wait_for_exit(&self, exited: &mut watch::Receiver<bool>) -> bool {
        matches!(
            timeout(self.config.kill_verify_timeout(), exited.wait_for(|done| *done)).await,
            Ok(Ok(_))
        )
    }
}

/// Last resort when the owner never called `terminate`. Inside a runtime the
/// tree kill goes to the blocking pool; outside one it runs inline.
impl Drop for Supervisor {
    fn drop(&mut self) {
        let Ok(mut live) = self.live.try_lock() else {
            return;
        };
        let Some(pid) = live.take().and_then(|helper| helper.channel.pid) else {
            return;
        };
        let killer = self.killer.clone();
        let kill = move || {
            if let Err(error) = killer.kill_tree(pid) {
                tracing::warn!(pid, error = %error, "helper tree kill on drop failed");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(kill);
            }
            Err(_) => kill(),
        }
    }
}

fn set_lifecycle(lifecycle: &RwLock<HelperLifecycle>, state: HelperLifecycle) {
    match lifecycle.write() {
        Ok(mut guard) => *guard = state,
        Err(poisoned) => *poisoned.into_inner() = state,
    }
}

fn read_lifecycle(lifecycle: &RwLock<HelperLifecycle>) -> HelperLifecycle {
    match lifecycle.read() {
        Ok(guard) => *guard,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

fn describe_exit(status: &std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => match status.code() {
            Some(code) => format!("helper exited with code {}", code),
            None => format!("helper exited abnormally ({})", status),
        },
        Err(error) => format!("helper exit could not be observed: {}", error),
    }
}

async fn pump_stdout(stdout: ChildStdout, mut router: FrameRouter, mut frames: FrameBuffer, generation: u64) {
    let mut reader = BufReader::new(stdout);
    let mut chunk = vec![0_u8; READ_CHUNK_BYTES];
    let mut sweep = tokio::time::interval(STREAM_SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        let read = tokio::select! {
            read = reader.read(&mut chunk) => read,
            _ = sweep.tick() => {
                router.sweep_settled().await;
                continue;
            }
        };
        match read {
            Ok(0) => break,
            Ok(size) => {
                for frame in frames.push(&chunk[..size]) {
                    router.route_raw(&frame).await;
                }
                let skipped = frames.consume_skipped_bytes();
                if skipped > 0 {
                    tracing::debug!(generation, bytes = skipped, "skipped non-frame output from helper");
                }
                let overflowed = frames.consume_overflowed_bytes();
                if overflowed > 0 {
                    tracing::warn!(
                        generation,
                        bytes = overflowed,
                        code = "BUFFER_TRIMMED",
                        "frame buffer exceeded its cap; oldest bytes discarded"
                    );
                }
            }
            Err(error) => {
                tracing::warn!(generation, error = %error, "helper stdout read failed");
                break;
            }
        }
    }

    let leftover = frames.flush();
    if !leftover.trim_ascii().is_empty() {
        tracing::debug!(generation, bytes = leftover.len(), "incomplete frame left at helper exit");
    }
}

async fn log_stderr(stderr: ChildStderr, redactor: Redactor, generation: u64) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                if text.is_empty() {
                    continue;
                }
                let mut redacted = redactor.redact(text).content;
                if let Some((cut, _)) = redacted.char_indices().nth(MAX_STDERR_LOG_CHARS) {
                    redacted.truncate(cut);
                }
                tracing::warn!(generation, line = %redacted, "helper stderr");
            }
            Err(error) => {
                tracing::debug!(generation, error = %error, "helper stderr read failed");
                break;
            }
        }
    }
}

async fn watch_exit(mut watch: ExitWatch) {
    let waited = tokio::select! {
        status = watch.child.wait() => Some(status),
        _ = &mut watch.kill_rx => None,
    };
    let status = match waited {
        Some(status) => status,
        None => {
            if let Err(error) = watch.child.start_kill() {
                tracing::debug!(generation = watch.generation, error = %error, "helper already gone");
            }
            watch.child.wait().await
        }
    };

    watch.alive.store(false, Ordering::SeqCst);
    let _ = watch.exit_tx.send(true);
    let reason = describe_exit(&status);
    tracing::info!(generation = watch.generation, pid = ?watch.pid, reason = %reason, "helper exited");

    // Responses written just before exit may still be in the pipe.
    if timeout(STDOUT_DRAIN_TIMEOUT, &mut watch.stdout_task).await.is_err() {
        tracing::warn!(generation = watch.generation, "helper stdout still open after exit");
        watch.stdout_task.abort();
    }
    if timeout(STDOUT_DRAIN_TIMEOUT, &mut watch.stderr_task).await.is_err() {
        watch.stderr_task.abort();
    }

    let rejected = watch
        .correlator
        .reject_all(AppError::ProcessTerminated(reason))
        .await;
    if rejected > 0 {
        tracing::warn!(generation = watch.generation, rejected, "rejected pending requests after helper exit");
    }

    let mut live = watch.live.lock().await;
    if live.as_ref().map(|helper| helper.channel.generation) == Some(watch.generation) {
        *live = None;
        set_lifecycle(&watch.lifecycle, HelperLifecycle::Absent);
    }
}
