//! The worker pool: N child processes, one per scheduling lane.
//!
//! Workers are re-executions of the embedding binary with a connect-back
//! port in the environment; each handle owns a single-connection listener
//! so accepted streams never need routing. Standard output is inherited
//! (test output interleaves with the runner's), standard error is teed so
//! a crash diagnostic can quote the tail.
//!
//! The pool enforces the per-dispatch deadline by killing the worker, not
//! by asking it to stop, and replaces killed workers before the lane
//! continues.

pub mod protocol;

use crate::error::{TactError, TactResult};
use crate::model::SnapshotStatus;
use protocol::{RunRequest, WorkerEvent, WorkerRequest, PORT_ENV};
use std::collections::HashSet;
use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How long a freshly spawned worker gets to connect back.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Socket read timeout; the dispatch loop re-checks deadlines at this rate.
const READ_TICK: Duration = Duration::from_millis(50);
/// Bytes of worker stderr retained for crash diagnostics.
const STDERR_TAIL: usize = 4096;

/// Outcome classification of one dispatch, before annotation mapping.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DispatchStatus {
    /// Worker reported `done`.
    Success,
    /// Worker reported `error` (assertion or test-body failure).
    Failure,
    /// No terminal event before the deadline; the worker was killed.
    Timeout,
    /// The worker died or closed the stream without a terminal event.
    Crash,
}

/// What one dispatch produced.
#[derive(Clone, Debug)]
pub struct Dispatch {
    pub status: DispatchStatus,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub snapshots: Vec<SnapshotStatus>,
}

/// Fixed-size pool. Lane `i` is locked by scheduling thread `i` for the
/// duration of the run; the shared pid set exists so the global-timeout
/// watchdog can kill every worker without touching the lanes.
pub struct WorkerPool {
    lanes: Vec<Mutex<Lane>>,
    active_pids: Arc<Mutex<HashSet<u32>>>,
}

impl WorkerPool {
    /// Spawn `size` workers running `program` with `extra_env` applied.
    pub fn new(
        size: usize,
        program: PathBuf,
        extra_env: Vec<(String, String)>,
    ) -> TactResult<Self> {
        let active_pids = Arc::new(Mutex::new(HashSet::new()));
        let mut lanes = Vec::with_capacity(size);
        for _ in 0..size {
            let mut lane = Lane {
                program: program.clone(),
                extra_env: extra_env.clone(),
                active_pids: Arc::clone(&active_pids),
                handle: None,
            };
            lane.ensure_worker()?;
            lanes.push(Mutex::new(lane));
        }
        Ok(Self { lanes, active_pids })
    }

    #[must_use]
    pub fn lanes(&self) -> &[Mutex<Lane>] {
        &self.lanes
    }

    /// Force-kill every live worker. Used on global timeout; partial
    /// events of killed workers are discarded by their lanes.
    pub fn kill_all(&self) {
        let pids: Vec<u32> = self
            .active_pids
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .copied()
            .collect();
        for pid in pids {
            kill_pid(pid);
        }
    }

    /// Ask every worker to exit, force-killing stragglers after `grace`.
    pub fn shutdown(&self, grace: Duration) {
        for lane in &self.lanes {
            let mut lane = lane.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            lane.shutdown(grace);
        }
    }
}

/// One scheduling lane and the worker process it owns.
pub struct Lane {
    program: PathBuf,
    extra_env: Vec<(String, String)>,
    active_pids: Arc<Mutex<HashSet<u32>>>,
    handle: Option<WorkerHandle>,
}

impl Lane {
    fn ensure_worker(&mut self) -> TactResult<&mut WorkerHandle> {
        if self.handle.is_none() {
            let handle = WorkerHandle::spawn(
                &self.program,
                &self.extra_env,
                Arc::clone(&self.active_pids),
            )?;
            self.handle = Some(handle);
        }
        Ok(self.handle.as_mut().expect("just ensured"))
    }

    fn replace_worker(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.kill();
        }
        // Replacement failures surface on the next dispatch.
        let _ = self.ensure_worker();
    }

    /// Run one test to a terminal event, the deadline, or a crash.
    pub fn run_test(&mut self, request: &RunRequest) -> TactResult<Dispatch> {
        let started = Instant::now();
        let deadline = (request.timeout_ms > 0)
            .then(|| started + Duration::from_millis(request.timeout_ms));
        let timeout_ms = request.timeout_ms;

        let handle = self.ensure_worker()?;
        if protocol::write_message(&mut handle.stream, &WorkerRequest::Run(request.clone()))
            .is_err()
        {
            return Ok(self.crashed(started));
        }

        let mut snapshots = Vec::new();
        loop {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                self.replace_worker();
                return Ok(Dispatch {
                    status: DispatchStatus::Timeout,
                    error: Some(format!("Test timeout of {timeout_ms} ms exceeded.")),
                    duration_ms: elapsed_ms(started),
                    snapshots,
                });
            }
            let handle = self.handle.as_mut().expect("handle present while dispatching");
            match handle.poll_event() {
                Ok(Some(WorkerEvent::Started { .. })) => {}
                Ok(Some(WorkerEvent::Snapshot { status })) => snapshots.push(status),
                Ok(Some(WorkerEvent::Error {
                    message,
                    duration_ms,
                })) => {
                    return Ok(Dispatch {
                        status: DispatchStatus::Failure,
                        error: Some(message),
                        duration_ms,
                        snapshots,
                    });
                }
                Ok(Some(WorkerEvent::Done { duration_ms })) => {
                    return Ok(Dispatch {
                        status: DispatchStatus::Success,
                        error: None,
                        duration_ms,
                        snapshots,
                    });
                }
                Ok(None) => {
                    // No frame yet; a dead child without a terminal event
                    // is a crash.
                    if handle.child_exited() {
                        return Ok(self.crashed(started));
                    }
                }
                Err(_) => return Ok(self.crashed(started)),
            }
        }
    }

    fn crashed(&mut self, started: Instant) -> Dispatch {
        let tail = self
            .handle
            .as_ref()
            .map(WorkerHandle::stderr_tail)
            .unwrap_or_default();
        self.replace_worker();
        let mut message = "worker exited unexpectedly".to_string();
        if !tail.is_empty() {
            message.push_str(":\n");
            message.push_str(&tail);
        }
        Dispatch {
            status: DispatchStatus::Crash,
            error: Some(message),
            duration_ms: elapsed_ms(started),
            snapshots: Vec::new(),
        }
    }

    fn shutdown(&mut self, grace: Duration) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        let _ = protocol::write_message(&mut handle.stream, &WorkerRequest::Shutdown);
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if handle.child_exited() {
                handle.deregister();
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        handle.kill();
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    // Durations in practice are far below u64::MAX milliseconds.
    #[allow(clippy::cast_possible_truncation)]
    let ms = started.elapsed().as_millis() as u64;
    ms
}

struct WorkerHandle {
    child: Child,
    stream: TcpStream,
    line_buffer: Vec<u8>,
    stderr_tail: Arc<Mutex<Vec<u8>>>,
    active_pids: Arc<Mutex<HashSet<u32>>>,
    pid: u32,
}

impl WorkerHandle {
    fn spawn(
        program: &Path,
        extra_env: &[(String, String)],
        active_pids: Arc<Mutex<HashSet<u32>>>,
    ) -> TactResult<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .map_err(|err| TactError::io("failed to bind worker listener", err))?;
        let port = listener
            .local_addr()
            .map_err(|err| TactError::io("failed to read listener address", err))?
            .port();
        listener
            .set_nonblocking(true)
            .map_err(|err| TactError::io("failed to configure listener", err))?;

        let mut command = Command::new(program);
        command
            .env(PORT_ENV, port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped());
        for (key, value) in extra_env {
            command.env(key, value);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = command
            .spawn()
            .map_err(|err| TactError::io("failed to spawn worker process", err))?;
        let pid = child.id();

        let stderr_tail = Arc::new(Mutex::new(Vec::new()));
        if let Some(stderr) = child.stderr.take() {
            let tail = Arc::clone(&stderr_tail);
            std::thread::spawn(move || tee_stderr(stderr, &tail));
        }

        let stream = accept_worker(&listener, &mut child)?;
        stream
            .set_read_timeout(Some(READ_TICK))
            .map_err(|err| TactError::io("failed to configure worker stream", err))?;
        stream.set_nodelay(true).ok();

        active_pids
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(pid);

        Ok(Self {
            child,
            stream,
            line_buffer: Vec::new(),
            stderr_tail,
            active_pids,
            pid,
        })
    }

    /// Read one event if a full frame is buffered or arrives within the
    /// read tick; `Ok(None)` means no frame yet.
    fn poll_event(&mut self) -> TactResult<Option<WorkerEvent>> {
        loop {
            if let Some(pos) = self.line_buffer.iter().position(|&byte| byte == b'\n') {
                let line: Vec<u8> = self.line_buffer.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line[..line.len() - 1]);
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let event = serde_json::from_str(trimmed).map_err(|err| {
                    TactError::protocol(format!("invalid worker event: {err}"))
                })?;
                return Ok(Some(event));
            }
            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(TactError::protocol("worker stream closed")),
                Ok(count) => self.line_buffer.extend_from_slice(&chunk[..count]),
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return Ok(None);
                }
                Err(err) => return Err(TactError::io("failed to read worker stream", err)),
            }
        }
    }

    fn child_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    fn stderr_tail(&self) -> String {
        let tail = self
            .stderr_tail
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        String::from_utf8_lossy(&tail).trim().to_string()
    }

    fn kill(&mut self) {
        kill_pid(self.pid);
        let _ = self.child.wait();
        self.deregister();
    }

    fn deregister(&mut self) {
        self.active_pids
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&self.pid);
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if !self.child_exited() {
            kill_pid(self.pid);
            let _ = self.child.wait();
        }
        self.deregister();
    }
}

fn accept_worker(listener: &TcpListener, child: &mut Child) -> TactResult<TcpStream> {
    let deadline = Instant::now() + CONNECT_TIMEOUT;
    loop {
        match listener.accept() {
            Ok((stream, _)) => return Ok(stream),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(TactError::internal(format!(
                        "worker exited before connecting ({status})"
                    )));
                }
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    return Err(TactError::internal("worker did not connect in time"));
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(err) => return Err(TactError::io("failed to accept worker", err)),
        }
    }
}

/// Forward worker stderr to ours while retaining the tail for diagnostics.
fn tee_stderr(mut stderr: impl Read, tail: &Arc<Mutex<Vec<u8>>>) {
    use std::io::Write;
    let mut chunk = [0u8; 1024];
    loop {
        match stderr.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(count) => {
                let mut err = std::io::stderr();
                let _ = err.write_all(&chunk[..count]);
                let mut tail = tail.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                tail.extend_from_slice(&chunk[..count]);
                if tail.len() > STDERR_TAIL {
                    let excess = tail.len() - STDERR_TAIL;
                    tail.drain(..excess);
                }
            }
        }
    }
}

fn kill_pid(pid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        // Worker pids fit in i32.
        #[allow(clippy::cast_possible_wrap)]
        let pgid = Pid::from_raw(pid as i32);
        let _ = killpg(pgid, Signal::SIGKILL);
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}
