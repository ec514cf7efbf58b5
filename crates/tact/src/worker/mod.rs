//! Worker-side test runtime.
//!
//! A worker process connects back to the orchestrator, then serves `run`
//! requests one at a time: import the test file (once per path for the
//! worker's lifetime), look the test up by id, spawn a fresh terminal,
//! execute the body and stream events back. Nothing leaks between
//! attempts except the additive import cache.

pub mod handle;
pub mod steps;

pub use handle::TestHandle;

use crate::error::{TactError, TactResult};
use crate::expect::snapshot::{SnapshotSession, SnapshotStore};
use crate::expect::TestFailure;
use crate::loader;
use crate::pool::protocol::{
    self, RunRequest, WorkerEvent, WorkerRequest, PORT_ENV,
};
use crate::suite::{Suite, SuiteKind, TestBody, TestCase};
use crate::term::{SpawnSpec, Terminal};
use std::collections::{HashMap, HashSet};
use std::io::BufReader;
use std::net::TcpStream;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Serve requests until the orchestrator shuts us down or goes away.
///
/// Expects [`PORT_ENV`] in the environment; the embedding binary calls
/// this through `tact::bootstrap_worker()` before doing anything else.
pub fn worker_main() -> TactResult<()> {
    let port: u16 = std::env::var(PORT_ENV)
        .map_err(|_| TactError::internal(format!("{PORT_ENV} is not set")))?
        .parse()
        .map_err(|_| TactError::internal(format!("{PORT_ENV} is not a port")))?;
    let stream = TcpStream::connect(("127.0.0.1", port))
        .map_err(|err| TactError::io("failed to connect to orchestrator", err))?;
    let mut reader = BufReader::new(
        stream
            .try_clone()
            .map_err(|err| TactError::io("failed to clone worker stream", err))?,
    );
    let mut writer = stream;

    let mut state = WorkerState::default();
    loop {
        match protocol::read_message::<_, WorkerRequest>(&mut reader)? {
            None | Some(WorkerRequest::Shutdown) => return Ok(()),
            Some(WorkerRequest::Run(request)) => run_one(&request, &mut state, &mut writer)?,
        }
    }
}

/// Per-worker registry: imported paths and the tests they declared.
#[derive(Default)]
struct WorkerState {
    imported: HashSet<PathBuf>,
    tests: HashMap<String, Arc<TestCase>>,
}

impl WorkerState {
    /// Import the request's file under its summary chain, at most once.
    fn import(&mut self, request: &RunRequest) -> TactResult<()> {
        if self.imported.contains(&request.source) {
            return Ok(());
        }
        let file_title = request
            .summary
            .iter()
            .find(|node| node.kind == SuiteKind::File)
            .map(|node| node.title.clone())
            .ok_or_else(|| TactError::protocol("summary chain has no file node"))?;
        let file_suite = loader::load_file(&file_title, &request.source)?;

        let mut root = Suite::root();
        let mut cursor = &mut root;
        for node in &request.summary {
            if node.kind != SuiteKind::Project {
                continue;
            }
            let project = Suite::project(node.title.clone(), node.options.clone());
            cursor.suites.push(project);
            cursor = cursor.suites.last_mut().expect("just pushed");
        }
        cursor.suites.push(file_suite);
        root.freeze();

        for test in root.all_tests() {
            self.tests.insert(test.id.to_string(), test);
        }
        self.imported.insert(request.source.clone());
        Ok(())
    }
}

fn run_one(
    request: &RunRequest,
    state: &mut WorkerState,
    writer: &mut TcpStream,
) -> TactResult<()> {
    let attempt_started = Instant::now();

    if let Err(err) = state.import(request) {
        return emit_error(writer, err.to_string(), 0);
    }
    let Some(test) = state.tests.get(&request.test_id).map(Arc::clone) else {
        return emit_error(
            writer,
            format!("test not found in worker registry: {}", request.test_id),
            0,
        );
    };

    let options = &test.options;
    let spec = SpawnSpec {
        shell: options.shell_or_default(),
        rows: options.rows_or_default(),
        cols: options.columns_or_default(),
        env: options.env.clone(),
        cwd: options.cwd.clone(),
    };
    let terminal = match Terminal::spawn(&spec) {
        Ok(terminal) => terminal,
        Err(err) => {
            return emit_error(writer, err.to_string(), elapsed_ms(attempt_started));
        }
    };

    protocol::write_message(writer, &WorkerEvent::Started { epoch_ms: epoch_ms() })?;

    let snapshots = SnapshotSession::new(
        SnapshotStore::path_for(Path::new(&test.file)),
        test.id.to_string(),
        request.update_snapshots,
    );
    let mut handle = TestHandle::new(
        terminal,
        Duration::from_millis(request.expect_timeout_ms),
        snapshots,
    );

    let outcome = run_body(&test.body, &mut handle);

    for status in handle.snapshot_statuses().to_vec() {
        protocol::write_message(writer, &WorkerEvent::Snapshot { status })?;
    }
    handle.teardown();

    let duration_ms = elapsed_ms(attempt_started);
    match outcome {
        Ok(()) => protocol::write_message(writer, &WorkerEvent::Done { duration_ms }),
        Err(failure) => emit_error(writer, failure.message, duration_ms),
    }
}

fn run_body(body: &TestBody, handle: &mut TestHandle) -> Result<(), TestFailure> {
    match body {
        TestBody::Steps(step_list) => steps::run_steps(step_list, handle),
        TestBody::Native(function) => {
            match std::panic::catch_unwind(AssertUnwindSafe(|| function(handle))) {
                Ok(result) => result,
                Err(payload) => Err(TestFailure::new(panic_message(&payload))),
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        format!("test body panicked: {text}")
    } else if let Some(text) = payload.downcast_ref::<String>() {
        format!("test body panicked: {text}")
    } else {
        "test body panicked".to_string()
    }
}

fn emit_error(writer: &mut TcpStream, message: String, duration_ms: u64) -> TactResult<()> {
    protocol::write_message(
        writer,
        &WorkerEvent::Error {
            message,
            duration_ms,
        },
    )
}

fn elapsed_ms(started: Instant) -> u64 {
    // Durations in practice are far below u64::MAX milliseconds.
    #[allow(clippy::cast_possible_truncation)]
    let ms = started.elapsed().as_millis() as u64;
    ms
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |elapsed| {
            // Epoch milliseconds fit in u64 for eons.
            #[allow(clippy::cast_possible_truncation)]
            let ms = elapsed.as_millis() as u64;
            ms
        })
}
