use serde::{Deserialize, Serialize};

/// Status of one attempt, or of a test's overall outcome.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    /// The attempt matched its expectation (success, or failure of a
    /// `fail`-annotated test).
    Expected,
    /// The attempt did not match its expectation.
    Unexpected,
    /// The attempt never produced a terminal event (global-timeout abort).
    Pending,
    /// The test was not dispatched.
    Skipped,
    /// Derived outcome only: attempts disagreed across retries.
    Flaky,
}

/// Result of one test attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestResult {
    pub status: TestStatus,
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub snapshots: Vec<SnapshotStatus>,
}

impl TestResult {
    #[must_use]
    pub fn skipped() -> Self {
        Self {
            status: TestStatus::Skipped,
            error: None,
            duration_ms: 0,
            snapshots: Vec::new(),
        }
    }
}

/// Resolution of one snapshot assertion.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SnapshotStatus {
    pub name: String,
    pub outcome: SnapshotOutcome,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotOutcome {
    Matched,
    Mismatched,
    Written,
    Updated,
    /// Reserved for reporters that distinguish absent snapshots when
    /// writing is disabled; never produced by the core resolution flow.
    Missing,
}

/// Fold attempt statuses into the test's overall outcome.
///
/// No attempts means the test was never dispatched. A transition from
/// `Unexpected` to `Expected`, or away from `Expected`, marks the test
/// flaky; otherwise the final attempt's status stands.
#[must_use]
pub fn outcome(results: &[TestResult]) -> TestStatus {
    let mut statuses = results.iter().map(|result| result.status);
    let Some(first) = statuses.next() else {
        return TestStatus::Skipped;
    };
    let mut previous = first;
    let mut flaky = false;
    for status in statuses {
        if previous == TestStatus::Unexpected && status == TestStatus::Expected {
            flaky = true;
        }
        if previous == TestStatus::Expected && status != TestStatus::Expected {
            flaky = true;
        }
        previous = status;
    }
    if flaky {
        TestStatus::Flaky
    } else {
        previous
    }
}
