//! The orchestrator: selection, scheduling, retries and run-level
//! deadlines.
//!
//! Tests are enqueued in breadth-first suite order onto a shared queue;
//! one thread per pool lane drains it, running all attempts for a test on
//! the lane's worker before picking the next. The reporter sits behind a
//! mutex so `end_test` calls are serialized.

use crate::cache;
use crate::config::Config;
use crate::error::{TactError, TactResult};
use crate::loader::{self, discover};
use crate::model::{RunId, TestOptions, TestResult, TestStatus};
use crate::pool::protocol::RunRequest;
use crate::pool::{Dispatch, DispatchStatus, Lane, WorkerPool};
use crate::reporter::Reporter;
use crate::shell::{self, Shell};
use crate::suite::{Annotation, Suite, SuiteKind, SummaryNode, TestCase, TestId};
use regex::Regex;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How long workers get to exit after a shutdown request.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Per-invocation options from the CLI.
#[derive(Clone, Debug, Default)]
pub struct ExecutionOptions {
    /// Rewrite snapshots instead of comparing.
    pub update_snapshots: bool,
    /// Regexes over resolved file paths; empty selects everything.
    pub test_filter: Vec<String>,
}

/// Load, select and execute all tests under `cwd`.
///
/// Returns the failure count (the process exit code). Configuration
/// errors — malformed config, invalid filter regexes, unloadable test
/// files — come back as `Err` and should exit 1.
pub fn run(
    cwd: &Path,
    config: &Config,
    options: &ExecutionOptions,
    reporter: &Mutex<dyn Reporter>,
) -> TactResult<usize> {
    let root = build_tree(cwd, config)?;
    let selected = select(&root, options)?;

    let run_id = RunId::new();
    let shells: BTreeSet<Shell> = selected
        .iter()
        .map(|test| test.options.shell_or_default())
        .collect();
    let setup = shell::prepare(&shells, run_id)?;
    lock_reporter(reporter).start(selected.len(), &shells);

    if selected.is_empty() {
        lock_reporter(reporter).end(&root);
        return Ok(0);
    }

    let summaries = summary_chains(&root);
    let selected_ids: HashSet<TestId> = selected.iter().map(|test| test.id.clone()).collect();
    let queue: VecDeque<Arc<TestCase>> = root
        .tests_breadth_first()
        .into_iter()
        .filter(|test| selected_ids.contains(&test.id))
        .collect();

    let program = std::env::current_exe()
        .map_err(|err| TactError::io("failed to locate the runner executable", err))?;
    let pool_size = config.workers.min(queue.len()).max(1);
    let pool = Arc::new(WorkerPool::new(pool_size, program, setup.worker_env())?);

    let finished = Arc::new(AtomicBool::new(false));
    if config.global_timeout > 0 {
        spawn_watchdog(config.global_timeout, Arc::clone(&pool), Arc::clone(&finished));
    }

    let queue = Mutex::new(queue);
    let fatal: Mutex<Option<TactError>> = Mutex::new(None);
    std::thread::scope(|scope| {
        let summaries = &summaries;
        let queue = &queue;
        let fatal = &fatal;
        for lane in pool.lanes() {
            scope.spawn(move || {
                let mut lane = lane.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                loop {
                    if lock_mutex(fatal).is_some() {
                        break;
                    }
                    let Some(test) = lock_mutex(queue).pop_front() else {
                        break;
                    };
                    let summary = summaries.get(&test.id).cloned().unwrap_or_default();
                    if let Err(err) =
                        execute_test(&mut lane, &test, &summary, config, options, reporter)
                    {
                        lock_mutex(fatal).get_or_insert(err);
                        break;
                    }
                }
            });
        }
    });

    finished.store(true, Ordering::SeqCst);
    pool.shutdown(SHUTDOWN_GRACE);

    if let Some(err) = lock_mutex(&fatal).take() {
        return Err(err);
    }

    let failures = selected
        .iter()
        .filter(|test| counts_as_failure(test.outcome(), config.fail_on_flaky))
        .count();
    lock_reporter(reporter).end(&root);
    Ok(failures)
}

/// Does an outcome contribute to the exit code?
#[must_use]
pub fn counts_as_failure(outcome: TestStatus, fail_on_flaky: bool) -> bool {
    match outcome {
        TestStatus::Unexpected | TestStatus::Pending => true,
        TestStatus::Flaky => fail_on_flaky,
        TestStatus::Expected | TestStatus::Skipped => false,
    }
}

fn build_tree(cwd: &Path, config: &Config) -> TactResult<Suite> {
    let mut root = Suite::root();
    for project_config in &config.projects {
        let mut project = Suite::project(
            project_config.name.clone(),
            project_config.use_options.clone(),
        );
        for file in discover::discover(cwd, &project_config.test_match)? {
            let title = file.to_string_lossy().replace('\\', "/");
            let resolved = cache::resolve(cwd, &file)?;
            project.suites.push(loader::load_file(&title, &resolved)?);
        }
        root.suites.push(project);
    }
    root.freeze();
    Ok(root)
}

/// The selection pipeline: pre-order collection, the global `only` gate,
/// then path filters. `skip`-annotated tests stay selected; they are
/// recorded as skipped without dispatch.
fn select(root: &Suite, options: &ExecutionOptions) -> TactResult<Vec<Arc<TestCase>>> {
    let mut selected = root.all_tests();
    if selected
        .iter()
        .any(|test| test.has_annotation(Annotation::Only))
    {
        selected.retain(|test| test.has_annotation(Annotation::Only));
    }
    if !options.test_filter.is_empty() {
        let mut patterns = Vec::with_capacity(options.test_filter.len());
        for filter in &options.test_filter {
            patterns.push(Regex::new(filter).map_err(|err| {
                TactError::config(format!("invalid test filter {filter:?}: {err}"))
            })?);
        }
        selected.retain(|test| {
            let path = test.source.to_string_lossy().replace('\\', "/");
            patterns.iter().any(|pattern| pattern.is_match(&path))
        });
    }
    Ok(selected)
}

/// Ancestor chain per test: the project node (with its options) and the
/// file node (identity only; the worker recovers file options on import).
fn summary_chains(root: &Suite) -> HashMap<TestId, Arc<Vec<SummaryNode>>> {
    let mut chains = HashMap::new();
    for project in &root.suites {
        for file in &project.suites {
            let chain = Arc::new(vec![
                SummaryNode {
                    title: project.title.clone(),
                    kind: SuiteKind::Project,
                    options: project.options.clone(),
                    source: None,
                },
                SummaryNode {
                    title: file.title.clone(),
                    kind: SuiteKind::File,
                    options: TestOptions::default(),
                    source: file.source.clone(),
                },
            ]);
            for test in file.all_tests() {
                chains.insert(test.id.clone(), Arc::clone(&chain));
            }
        }
    }
    chains
}

/// One scheduling task: all attempts for one test, strictly sequential.
fn execute_test(
    lane: &mut Lane,
    test: &Arc<TestCase>,
    summary: &Arc<Vec<SummaryNode>>,
    config: &Config,
    options: &ExecutionOptions,
    reporter: &Mutex<dyn Reporter>,
) -> TactResult<()> {
    if test.has_annotation(Annotation::Skip) {
        let result = TestResult::skipped();
        test.push_result(result.clone());
        lock_reporter(reporter).end_test(test, &result);
        return Ok(());
    }

    let expects_failure = test.has_annotation(Annotation::Fail);
    let attempts = u64::from(config.retries) + 1;
    let mut last: Option<TestResult> = None;
    for _ in 0..attempts {
        let request = RunRequest {
            test_id: test.id.to_string(),
            summary: summary.as_ref().clone(),
            source: test.source.clone(),
            timeout_ms: config.timeout,
            expect_timeout_ms: config.expect.timeout,
            update_snapshots: options.update_snapshots,
        };
        let dispatch = lane.run_test(&request)?;
        let result = into_result(dispatch, expects_failure);
        test.push_result(result.clone());
        let done = matches!(result.status, TestStatus::Expected | TestStatus::Skipped);
        last = Some(result);
        if done {
            break;
        }
    }
    let result = last.unwrap_or_else(TestResult::skipped);
    lock_reporter(reporter).end_test(test, &result);
    Ok(())
}

/// Map a dispatch outcome through the annotation table.
fn into_result(dispatch: Dispatch, expects_failure: bool) -> TestResult {
    let status = match dispatch.status {
        DispatchStatus::Success => {
            if expects_failure {
                TestStatus::Unexpected
            } else {
                TestStatus::Expected
            }
        }
        DispatchStatus::Failure => {
            if expects_failure {
                TestStatus::Expected
            } else {
                TestStatus::Unexpected
            }
        }
        DispatchStatus::Timeout | DispatchStatus::Crash => TestStatus::Unexpected,
    };
    let error = match (status, dispatch.status) {
        (TestStatus::Unexpected, DispatchStatus::Success) => {
            Some("expected the test to fail, but it passed".to_string())
        }
        (TestStatus::Expected, _) => None,
        _ => dispatch.error,
    };
    TestResult {
        status,
        error,
        duration_ms: dispatch.duration_ms,
        snapshots: dispatch.snapshots,
    }
}

fn spawn_watchdog(timeout_ms: u64, pool: Arc<WorkerPool>, finished: Arc<AtomicBool>) {
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(timeout_ms));
        if finished.load(Ordering::SeqCst) {
            return;
        }
        eprintln!("global timeout ({timeout_ms} ms) exceeded");
        pool.kill_all();
        std::process::exit(1);
    });
}

fn lock_reporter<'a>(
    reporter: &'a Mutex<dyn Reporter + 'a>,
) -> std::sync::MutexGuard<'a, dyn Reporter + 'a> {
    reporter
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn lock_mutex<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
