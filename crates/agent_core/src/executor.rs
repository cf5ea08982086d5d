use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::{self, Instant};
use tracing::{debug, instrument, warn};

use agent_events::{AgentEvent, AgentEventKind, EventAggregator, StreamParser};

use crate::agent_trait::{Diagnostics, EventHandler};
use crate::error::AgentError;
use crate::log_tail::LogTailer;
use crate::process::{spawn_with_retry, ProcessGuard};
use crate::result::CommandResult;
use crate::stream_method::{StreamConfig, StreamMethod};

/// Shared sink for stdout/stderr bytes written progressively as a backend
/// runs, so a crash-dump writer can see real content even when the run ends
/// in a timeout or kill rather than a clean exit.
#[derive(Debug, Default)]
pub struct CaptureBuffers {
    stdout: StdMutex<Vec<u8>>,
    stderr: StdMutex<Vec<u8>>,
}

impl CaptureBuffers {
    fn push_stdout(&self, bytes: &[u8]) {
        self.stdout.lock().expect("lock poisoned").extend_from_slice(bytes);
    }

    fn push_stderr(&self, bytes: &[u8]) {
        self.stderr.lock().expect("lock poisoned").extend_from_slice(bytes);
    }

    pub fn snapshot(&self) -> (Vec<u8>, Vec<u8>) {
        (
            self.stdout.lock().expect("lock poisoned").clone(),
            self.stderr.lock().expect("lock poisoned").clone(),
        )
    }
}

/// Everything the base executor needs to spawn one child process, shared by
/// every streaming strategy.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    /// Executable path already split on whitespace (multi-word prefixes like
    /// `"npx claude"` become `["npx", "claude"]`).
    pub executable: Vec<String>,
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub work_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

pub type ParserFactory = Arc<dyn Fn() -> Box<dyn StreamParser + Send> + Send + Sync>;

/// Parameters for one `ExecuteWithStreaming` call.
#[derive(Clone)]
pub struct StreamingRequest {
    pub agent: String,
    pub request: ExecuteRequest,
    pub timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub stream: StreamConfig,
    pub parser_factory: ParserFactory,
    pub aggregator: Arc<AsyncMutex<EventAggregator>>,
    pub handler: Option<EventHandler>,
    /// Set by [`execute_with_diagnostics`] before dispatch; adapters building
    /// a `StreamingRequest` directly can leave this `None`.
    pub capture: Option<Arc<CaptureBuffers>>,
}

const GRACE_PERIOD: Duration = Duration::from_secs(5);
const LOG_POLL_INTERVAL: Duration = Duration::from_millis(200);

fn build_command(request: &ExecuteRequest) -> Command {
    let (binary, rest) = request
        .executable
        .split_first()
        .expect("executable must have at least one part");
    let mut command = Command::new(binary);
    command.args(rest);
    command.args(&request.args);
    if let Some(dir) = &request.work_dir {
        command.current_dir(dir);
    }
    for (key, value) in &request.env {
        command.env(key, value);
    }
    command.stdin(if request.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    command.kill_on_drop(true);
    command
}

async fn write_stdin_and_close(
    stdin: Option<tokio::process::ChildStdin>,
    bytes: Option<&[u8]>,
) -> Result<(), AgentError> {
    let (Some(mut stdin), Some(bytes)) = (stdin, bytes) else {
        return Ok(());
    };
    if let Err(error) = stdin.write_all(bytes).await {
        if error.kind() != std::io::ErrorKind::BrokenPipe {
            return Err(AgentError::Io(error));
        }
    }
    let _ = stdin.shutdown().await;
    Ok(())
}

async fn read_to_buffer<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    capture: Option<(Arc<CaptureBuffers>, bool)>,
) -> Result<Vec<u8>, std::io::Error> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some((captured, is_stdout)) = &capture {
            if *is_stdout {
                captured.push_stdout(&chunk[..n]);
            } else {
                captured.push_stderr(&chunk[..n]);
            }
        }
    }
    Ok(buf)
}

/// Waits for the child to exit, racing the total timeout, the idle timeout
/// (reset on every pulse from `activity_rx`), and killing the process group
/// gracefully if either fires first.
async fn wait_with_timeouts(
    guard: &mut ProcessGuard,
    agent: &str,
    timeout: Duration,
    idle_timeout: Option<Duration>,
    activity_rx: &mut mpsc::Receiver<()>,
) -> Result<ExitStatus, AgentError> {
    let child = guard.child_mut().expect("child present for the lifetime of the wait");
    let wait_fut = child.wait();
    tokio::pin!(wait_fut);

    let total_enabled = !timeout.is_zero();
    let total_sleep = time::sleep(timeout);
    tokio::pin!(total_sleep);

    let mut idle_deadline = idle_timeout.map(|d| Instant::now() + d);

    loop {
        let idle_sleep = async {
            match idle_deadline {
                Some(deadline) => time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(idle_sleep);

        tokio::select! {
            status = &mut wait_fut => {
                return status.map_err(AgentError::Io);
            }
            _ = &mut total_sleep, if total_enabled => {
                guard.graceful_kill(GRACE_PERIOD).await;
                return Err(AgentError::Timeout { agent: agent.to_string(), timeout });
            }
            _ = &mut idle_sleep, if idle_deadline.is_some() => {
                guard.graceful_kill(GRACE_PERIOD).await;
                return Err(AgentError::Timeout {
                    agent: agent.to_string(),
                    timeout: idle_timeout.unwrap_or_default(),
                });
            }
            pulse = activity_rx.recv() => {
                if pulse.is_some() {
                    idle_deadline = idle_timeout.map(|d| Instant::now() + d);
                }
            }
        }
    }
}

fn pulse(tx: &mpsc::Sender<()>) {
    let _ = tx.try_send(());
}

async fn emit(
    aggregator: &Arc<AsyncMutex<EventAggregator>>,
    handler: &Option<EventHandler>,
    event: AgentEvent,
) {
    let should_emit = aggregator.lock().await.should_emit(&event);
    if should_emit {
        if let Some(handler) = handler {
            handler(event);
        }
    }
}

/// The sole place that spawns backend subprocesses.
#[derive(Default)]
pub struct BaseExecutor;

impl BaseExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Runs the backend to completion, buffering stdout/stderr fully.
    /// Idle timeout does not apply here: with no streaming subscriber there
    /// is no notion of per-chunk activity to watch.
    #[instrument(skip_all, fields(agent, timeout = ?timeout))]
    pub async fn execute_command(
        &self,
        agent: &str,
        request: &ExecuteRequest,
        timeout: Duration,
    ) -> Result<CommandResult, AgentError> {
        self.execute_command_captured(agent, request, timeout, None).await
    }

    async fn execute_command_captured(
        &self,
        agent: &str,
        request: &ExecuteRequest,
        timeout: Duration,
        capture: Option<Arc<CaptureBuffers>>,
    ) -> Result<CommandResult, AgentError> {
        let started = Instant::now();
        let mut command = build_command(request);
        let binary_path = PathBuf::from(&request.executable[0]);
        let mut child = spawn_with_retry(&mut command, &binary_path)?;

        write_stdin_and_close(child.stdin.take(), request.stdin.as_deref()).await?;

        let stdout = child.stdout.take().expect("stdout is piped");
        let stderr = child.stderr.take().expect("stderr is piped");
        let stdout_task = tokio::spawn(read_to_buffer(stdout, capture.clone().map(|c| (c, true))));
        let stderr_task = tokio::spawn(read_to_buffer(stderr, capture.map(|c| (c, false))));

        let mut guard = ProcessGuard::new(child);
        let (_activity_tx, mut activity_rx) = mpsc::channel(1);
        let status = match wait_with_timeouts(&mut guard, agent, timeout, None, &mut activity_rx).await {
            Ok(status) => status,
            Err(error) => {
                stdout_task.abort();
                stderr_task.abort();
                return Err(error);
            }
        };

        let stdout_bytes = stdout_task.await.map_err(AgentError::Join)?.map_err(AgentError::Io)?;
        let stderr_bytes = stderr_task.await.map_err(AgentError::Join)?.map_err(AgentError::Io)?;

        debug!(bytes = stdout_bytes.len(), "command completed");
        Ok(CommandResult {
            stdout: stdout_bytes,
            stderr: stderr_bytes,
            exit_status: Some(status),
            duration: started.elapsed(),
        })
    }

    /// Same external contract as [`Self::execute_command`], but picks a
    /// streaming strategy and emits [`AgentEvent`]s as the child runs.
    #[instrument(skip_all, fields(agent = %req.agent))]
    pub async fn execute_with_streaming(&self, req: StreamingRequest) -> Result<CommandResult, AgentError> {
        match req.stream.method.clone() {
            StreamMethod::None => {
                self.execute_command_captured(&req.agent, &req.request, req.timeout, req.capture.clone())
                    .await
            }
            StreamMethod::JsonStdout { .. } => self.execute_json_stdout(req).await,
            StreamMethod::LogFile { dir_flag } => self.execute_log_file(req, &dir_flag).await,
        }
    }

    async fn execute_json_stdout(&self, req: StreamingRequest) -> Result<CommandResult, AgentError> {
        let started = Instant::now();
        let mut request = req.request.clone();
        req.stream.apply_enable_flags(&mut request.args);

        let binary_path = PathBuf::from(&request.executable[0]);
        let mut command = build_command(&request);
        let mut child = spawn_with_retry(&mut command, &binary_path)?;

        write_stdin_and_close(child.stdin.take(), request.stdin.as_deref()).await?;

        let stdout = child.stdout.take().expect("stdout is piped");
        let stderr = child.stderr.take().expect("stderr is piped");

        let (activity_tx, mut activity_rx) = mpsc::channel::<()>(64);

        let stdout_task = {
            let agent = req.agent.clone();
            let handler = req.handler.clone();
            let aggregator = Arc::clone(&req.aggregator);
            let activity_tx = activity_tx.clone();
            let capture = req.capture.clone();
            let mut parser = (req.parser_factory)();
            tokio::spawn(async move {
                let mut reader = stdout;
                let mut projection = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    let n = match reader.read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(_) => break,
                    };
                    pulse(&activity_tx);
                    if let Some(capture) = &capture {
                        capture.push_stdout(&chunk[..n]);
                    }
                    for event in parser.parse_chunk(&chunk[..n]) {
                        if event.kind == AgentEventKind::Chunk {
                            projection.extend_from_slice(event.message.as_bytes());
                        }
                        emit(&aggregator, &handler, event).await;
                    }
                }
                let finish = parser.finish();
                for event in finish.events {
                    if event.kind == AgentEventKind::Chunk {
                        projection.extend_from_slice(event.message.as_bytes());
                    }
                    emit(&aggregator, &handler, event).await;
                }
                let _ = agent;
                projection
            })
        };

        let stderr_task = spawn_stderr_task(
            req.agent.clone(),
            stderr,
            Arc::clone(&req.aggregator),
            req.handler.clone(),
            activity_tx.clone(),
            req.capture.clone(),
        );

        let mut guard = ProcessGuard::new(child);
        let status = match wait_with_timeouts(&mut guard, &req.agent, req.timeout, req.idle_timeout, &mut activity_rx).await {
            Ok(status) => status,
            Err(error) => {
                stdout_task.abort();
                stderr_task.abort();
                return Err(error);
            }
        };

        let stdout_projection = stdout_task.await.map_err(AgentError::Join)?;
        let stderr_bytes = stderr_task.await.map_err(AgentError::Join)?;

        Ok(CommandResult {
            stdout: stdout_projection,
            stderr: stderr_bytes,
            exit_status: Some(status),
            duration: started.elapsed(),
        })
    }

    async fn execute_log_file(&self, req: StreamingRequest, dir_flag: &str) -> Result<CommandResult, AgentError> {
        let started = Instant::now();
        let scratch = tempfile::tempdir().map_err(AgentError::Io)?;

        let mut request = req.request.clone();
        request.args.push(dir_flag.to_string());
        request.args.push(scratch.path().to_string_lossy().into_owned());

        let binary_path = PathBuf::from(&request.executable[0]);
        let mut command = build_command(&request);
        let mut child = spawn_with_retry(&mut command, &binary_path)?;

        write_stdin_and_close(child.stdin.take(), request.stdin.as_deref()).await?;

        let stdout = child.stdout.take().expect("stdout is piped");
        let stderr = child.stderr.take().expect("stderr is piped");

        let (activity_tx, mut activity_rx) = mpsc::channel::<()>(64);

        let stdout_task = tokio::spawn(read_to_buffer(stdout, req.capture.clone().map(|c| (c, true))));
        let stderr_task = spawn_stderr_task(
            req.agent.clone(),
            stderr,
            Arc::clone(&req.aggregator),
            req.handler.clone(),
            activity_tx.clone(),
            req.capture.clone(),
        );

        let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
        let tail_task = {
            let base_dir = scratch.path().to_path_buf();
            let aggregator = Arc::clone(&req.aggregator);
            let handler = req.handler.clone();
            let parser_factory = Arc::clone(&req.parser_factory);
            let activity_tx = activity_tx.clone();
            tokio::spawn(async move {
                let mut tailer = LogTailer::new(base_dir);
                let mut parsers: HashMap<PathBuf, Box<dyn StreamParser + Send>> = HashMap::new();
                let mut interval = time::interval(LOG_POLL_INTERVAL);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {}
                        _ = stop_rx.changed() => {
                            if *stop_rx.borrow() {
                                poll_once(&mut tailer, &mut parsers, &parser_factory, &aggregator, &handler, &activity_tx).await;
                                break;
                            }
                        }
                    }
                    poll_once(&mut tailer, &mut parsers, &parser_factory, &aggregator, &handler, &activity_tx).await;
                }
            })
        };

        let mut guard = ProcessGuard::new(child);
        let status = match wait_with_timeouts(&mut guard, &req.agent, req.timeout, req.idle_timeout, &mut activity_rx).await {
            Ok(status) => status,
            Err(error) => {
                let _ = stop_tx.send(true);
                stdout_task.abort();
                stderr_task.abort();
                tail_task.abort();
                return Err(error);
            }
        };

        let _ = stop_tx.send(true);
        let stdout_bytes = stdout_task.await.map_err(AgentError::Join)?.map_err(AgentError::Io)?;
        let stderr_bytes = stderr_task.await.map_err(AgentError::Join)?;
        tail_task.await.map_err(AgentError::Join)?;

        Ok(CommandResult {
            stdout: stdout_bytes,
            stderr: stderr_bytes,
            exit_status: Some(status),
            duration: started.elapsed(),
        })
    }
}

/// Runs a streaming execution with an adapter's diagnostics hooks applied: a
/// capture buffer is attached so a crash-dump writer sees real output, and a
/// safe executor gets one chance to recover before the error reaches the
/// caller.
pub async fn execute_with_diagnostics(
    executor: &BaseExecutor,
    mut request: StreamingRequest,
    diagnostics: Option<Arc<dyn Diagnostics>>,
) -> Result<CommandResult, AgentError> {
    let capture = Arc::new(CaptureBuffers::default());
    request.capture = Some(Arc::clone(&capture));
    let agent = request.agent.clone();

    let mut outcome = executor.execute_with_streaming(request.clone()).await;
    if let Err(error) = &outcome {
        let recovered = diagnostics
            .as_ref()
            .and_then(|d| d.safe_executor())
            .is_some_and(|safe| safe.try_recover(&agent, error));
        if recovered {
            warn!(agent = %agent, "safe executor reported recovery, retrying once");
            outcome = executor.execute_with_streaming(request).await;
        }
    }

    if let Err(error) = &outcome {
        if let Some(writer) = diagnostics.as_ref().and_then(|d| d.crash_dump_writer()) {
            let (stdout, stderr) = capture.snapshot();
            writer.write_crash_dump(&agent, &stdout, &stderr);
        }
    }

    outcome
}

/// Non-streaming counterpart of [`execute_with_diagnostics`].
pub async fn execute_command_with_diagnostics(
    executor: &BaseExecutor,
    agent: &str,
    request: &ExecuteRequest,
    timeout: Duration,
    diagnostics: Option<Arc<dyn Diagnostics>>,
) -> Result<CommandResult, AgentError> {
    let capture = Arc::new(CaptureBuffers::default());

    let mut outcome = executor
        .execute_command_captured(agent, request, timeout, Some(Arc::clone(&capture)))
        .await;
    if let Err(error) = &outcome {
        let recovered = diagnostics
            .as_ref()
            .and_then(|d| d.safe_executor())
            .is_some_and(|safe| safe.try_recover(agent, error));
        if recovered {
            warn!(agent = %agent, "safe executor reported recovery, retrying once");
            outcome = executor
                .execute_command_captured(agent, request, timeout, Some(Arc::clone(&capture)))
                .await;
        }
    }

    if let Err(error) = &outcome {
        if let Some(writer) = diagnostics.as_ref().and_then(|d| d.crash_dump_writer()) {
            let (stdout, stderr) = capture.snapshot();
            writer.write_crash_dump(agent, &stdout, &stderr);
        }
    }

    outcome
}

async fn poll_once(
    tailer: &mut LogTailer,
    parsers: &mut HashMap<PathBuf, Box<dyn StreamParser + Send>>,
    parser_factory: &ParserFactory,
    aggregator: &Arc<AsyncMutex<EventAggregator>>,
    handler: &Option<EventHandler>,
    activity_tx: &mpsc::Sender<()>,
) {
    for path in tailer.discover_log_files() {
        let Some(new_text) = tailer.read_new_log_content(&path) else {
            continue;
        };
        if new_text.is_empty() {
            continue;
        }
        pulse(activity_tx);
        let parser = parsers.entry(path).or_insert_with(|| parser_factory());
        for event in parser.parse_chunk(new_text.as_bytes()) {
            emit(aggregator, handler, event).await;
        }
    }
}

fn spawn_stderr_task(
    agent: String,
    stderr: tokio::process::ChildStderr,
    aggregator: Arc<AsyncMutex<EventAggregator>>,
    handler: Option<EventHandler>,
    activity_tx: mpsc::Sender<()>,
    capture: Option<Arc<CaptureBuffers>>,
) -> tokio::task::JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        use tokio::io::{AsyncBufReadExt, BufReader};
        let mut lines = BufReader::new(stderr).lines();
        let mut buffer = Vec::new();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    pulse(&activity_tx);
                    buffer.extend_from_slice(line.as_bytes());
                    buffer.push(b'\n');
                    if let Some(capture) = &capture {
                        capture.push_stderr(line.as_bytes());
                        capture.push_stderr(b"\n");
                    }
                    if let Some(event) = crate::classify::classify_stderr_line(&agent, &line) {
                        emit(&aggregator, &handler, event).await;
                    }
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
        buffer
    })
}
