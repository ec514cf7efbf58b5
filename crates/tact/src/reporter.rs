//! Reporter interface and the default console reporter.
//!
//! The orchestrator serializes all calls: `end_test` arrives one test at
//! a time, once per test, with the final result after retries.

use crate::model::{TestResult, TestStatus};
use crate::shell::Shell;
use crate::suite::{Suite, TestCase};
use std::collections::BTreeSet;
use std::time::Instant;

pub trait Reporter: Send {
    /// Called once before the first dispatch.
    fn start(&mut self, total_tests: usize, shells: &BTreeSet<Shell>);
    /// Called once per test with its final result.
    fn end_test(&mut self, test: &TestCase, result: &TestResult);
    /// Called once after the pool has drained. Returns the failure count.
    fn end(&mut self, root: &Suite) -> usize;
}

/// Discards everything. Useful for embedders that only want exit codes.
pub struct NoopReporter;

impl Reporter for NoopReporter {
    fn start(&mut self, _total_tests: usize, _shells: &BTreeSet<Shell>) {}
    fn end_test(&mut self, _test: &TestCase, _result: &TestResult) {}
    fn end(&mut self, _root: &Suite) -> usize {
        0
    }
}

/// One line per test plus a closing summary, written to stdout.
pub struct ListReporter {
    fail_on_flaky: bool,
    started: Option<Instant>,
    passed: usize,
    failed: usize,
    skipped: usize,
    flaky: usize,
    failures: Vec<(String, String)>,
}

impl ListReporter {
    #[must_use]
    pub fn new(fail_on_flaky: bool) -> Self {
        Self {
            fail_on_flaky,
            started: None,
            passed: 0,
            failed: 0,
            skipped: 0,
            flaky: 0,
            failures: Vec::new(),
        }
    }

    fn count_failure(&self, outcome: TestStatus) -> bool {
        match outcome {
            TestStatus::Unexpected | TestStatus::Pending => true,
            TestStatus::Flaky => self.fail_on_flaky,
            TestStatus::Expected | TestStatus::Skipped => false,
        }
    }
}

impl Reporter for ListReporter {
    fn start(&mut self, total_tests: usize, shells: &BTreeSet<Shell>) {
        self.started = Some(Instant::now());
        let shell_list = shells
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        println!("running {total_tests} tests [{shell_list}]");
    }

    fn end_test(&mut self, test: &TestCase, result: &TestResult) {
        let outcome = test.outcome();
        let attempts = test.results().len();
        let (mark, note) = match outcome {
            TestStatus::Expected => {
                self.passed += 1;
                ("ok", String::new())
            }
            TestStatus::Skipped => {
                self.skipped += 1;
                ("skip", String::new())
            }
            TestStatus::Flaky => {
                self.flaky += 1;
                ("flaky", format!(" ({attempts} attempts)"))
            }
            TestStatus::Unexpected | TestStatus::Pending => {
                self.failed += 1;
                ("FAIL", String::new())
            }
        };
        println!("{mark:>5}  {}{note} [{} ms]", test.id, result.duration_ms);
        if self.count_failure(outcome) {
            if let Some(error) = &result.error {
                self.failures.push((test.id.to_string(), error.clone()));
            } else {
                self.failures
                    .push((test.id.to_string(), "test failed".to_string()));
            }
        }
    }

    fn end(&mut self, _root: &Suite) -> usize {
        for (id, error) in &self.failures {
            println!("\nFAIL {id}");
            for line in error.lines() {
                println!("    {line}");
            }
        }
        let elapsed = self
            .started
            .map_or(0, |started| started.elapsed().as_millis());
        println!(
            "\n{} passed, {} failed, {} skipped, {} flaky ({elapsed} ms)",
            self.passed, self.failed, self.skipped, self.flaky
        );
        let flaky_failures = if self.fail_on_flaky { self.flaky } else { 0 };
        self.failed + flaky_failures
    }
}
