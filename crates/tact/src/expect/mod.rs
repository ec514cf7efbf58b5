//! Polling assertions against the terminal buffer.
//!
//! One primitive drives both directions: [`poll`] samples a predicate
//! until it agrees with the expected truthiness or the deadline passes.
//! The matcher picks the truthiness from how it was invoked, so a negated
//! expectation succeeds on the first sample where the value is absent.

pub mod snapshot;

use crate::term::{render, Terminal};
use regex::Regex;
use std::fmt;
use std::time::{Duration, Instant};

/// Interval between buffer samples.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// An assertion failure. Fails the surrounding test attempt; never
/// propagated beyond it.
#[derive(Clone, Debug)]
pub struct TestFailure {
    pub message: String,
}

impl TestFailure {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for TestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for TestFailure {}

/// What `to_have_value` looks for: a literal substring or a regex.
#[derive(Clone, Debug)]
pub enum Expected {
    Text(String),
    Pattern(Regex),
}

impl Expected {
    #[must_use]
    pub fn matches(&self, haystack: &str) -> bool {
        match self {
            Expected::Text(text) => haystack.contains(text.as_str()),
            Expected::Pattern(pattern) => pattern.is_match(haystack),
        }
    }

    fn mode(&self) -> &'static str {
        match self {
            Expected::Text(_) => "substring",
            Expected::Pattern(_) => "regex",
        }
    }

    fn source(&self) -> String {
        match self {
            Expected::Text(text) => format!("{text:?}"),
            Expected::Pattern(pattern) => format!("/{}/", pattern.as_str()),
        }
    }
}

/// Options for `to_have_value`.
#[derive(Clone, Copy, Debug, Default)]
pub struct HaveValueOptions {
    /// Deadline override; the config expect timeout applies when unset.
    pub timeout: Option<Duration>,
    /// Match against the full buffer (scrollback included) instead of the
    /// viewable screen.
    pub full: bool,
}

/// Sample `predicate` until it equals `expect_truthy` or `deadline` passes.
/// The first sample happens before any sleep. Returns whether the resolved
/// condition held at some sample.
pub fn poll(
    interval: Duration,
    deadline: Instant,
    expect_truthy: bool,
    mut predicate: impl FnMut() -> bool,
) -> bool {
    loop {
        if predicate() == expect_truthy {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep(interval.min(deadline - now));
    }
}

/// Entry point of the matcher chain: `expect(terminal, default).to_have_value(..)`.
#[must_use]
pub fn expect(terminal: &mut Terminal, default_timeout: Duration) -> Expect<'_> {
    Expect {
        terminal,
        default_timeout,
        negated: false,
    }
}

/// A pending expectation on one terminal.
pub struct Expect<'t> {
    terminal: &'t mut Terminal,
    default_timeout: Duration,
    negated: bool,
}

impl Expect<'_> {
    /// Invert the expectation: require the value to be absent.
    #[must_use]
    pub fn not(mut self) -> Self {
        self.negated = !self.negated;
        self
    }

    /// Poll the selected buffer for `expected` every 50 ms until the
    /// deadline. Positive: succeed once present. Negated: succeed on the
    /// first sample where it is absent.
    pub fn to_have_value(
        self,
        expected: &Expected,
        options: HaveValueOptions,
    ) -> Result<(), TestFailure> {
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let deadline = Instant::now() + timeout;
        let terminal = self.terminal;
        let succeeded = poll(POLL_INTERVAL, deadline, !self.negated, || {
            let buffer = if options.full {
                terminal.buffer()
            } else {
                terminal.viewable_buffer()
            };
            expected.matches(&render(&buffer))
        });
        if succeeded {
            return Ok(());
        }
        let direction = if self.negated {
            "not to have value"
        } else {
            "to have value"
        };
        Err(TestFailure::new(format!(
            "expected terminal {direction} {} ({} match) within {} ms",
            expected.source(),
            expected.mode(),
            timeout.as_millis(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(120)
    }

    #[test]
    fn poll_succeeds_on_the_first_sample_without_sleeping() {
        let started = Instant::now();
        assert!(poll(Duration::from_millis(50), soon(), true, || true));
        assert!(started.elapsed() < Duration::from_millis(40));
    }

    #[test]
    fn poll_fails_at_deadline_when_condition_never_holds() {
        let deadline = Instant::now() + Duration::from_millis(80);
        assert!(!poll(Duration::from_millis(20), deadline, true, || false));
        assert!(Instant::now() >= deadline);
    }

    #[test]
    fn poll_inverted_succeeds_when_predicate_is_false() {
        assert!(poll(Duration::from_millis(20), soon(), false, || false));
        assert!(!poll(
            Duration::from_millis(20),
            Instant::now() + Duration::from_millis(60),
            false,
            || true
        ));
    }

    #[test]
    fn poll_sees_a_late_transition() {
        let flip_at = Instant::now() + Duration::from_millis(60);
        let deadline = Instant::now() + Duration::from_millis(500);
        assert!(poll(Duration::from_millis(10), deadline, true, || {
            Instant::now() >= flip_at
        }));
    }

    #[test]
    fn inversion_duality_on_a_stable_value() {
        // For a fixed predicate, the positive and negated polls cannot
        // both succeed.
        for value in [true, false] {
            let positive = poll(Duration::from_millis(10), soon(), true, || value);
            let negated = poll(Duration::from_millis(10), soon(), false, || value);
            assert!(positive != negated);
        }
    }

    #[test]
    fn expected_matches_substring_and_regex() {
        let text = Expected::Text("$ ".into());
        assert!(text.matches("prompt$ here"));
        assert!(!text.matches("prompt"));
        let pattern = Expected::Pattern(Regex::new(r"v\d+\.\d+").unwrap());
        assert!(pattern.matches("tact v1.2"));
        assert!(!pattern.matches("tact vNext"));
    }

    #[test]
    fn failure_messages_name_value_mode_and_direction() {
        let expected = Expected::Pattern(Regex::new("ready").unwrap());
        assert_eq!(expected.source(), "/ready/");
        assert_eq!(expected.mode(), "regex");
        let literal = Expected::Text("done".into());
        assert_eq!(literal.source(), "\"done\"");
        assert_eq!(literal.mode(), "substring");
    }
}
