//! Interpreter for compiled test-script bodies.

use crate::expect::{HaveValueOptions, TestFailure};
use crate::loader::script::TestStep;
use crate::worker::TestHandle;
use std::time::Duration;

/// Run a step program to completion or its first failure.
pub fn run_steps(steps: &[TestStep], handle: &mut TestHandle) -> Result<(), TestFailure> {
    for step in steps {
        match step {
            TestStep::Write(bytes) => handle.write(bytes)?,
            TestStep::Expect {
                expected,
                timeout_ms,
                full,
                negated,
            } => {
                let options = HaveValueOptions {
                    timeout: timeout_ms.map(Duration::from_millis),
                    full: *full,
                };
                handle.expect_value(expected, options, *negated)?;
            }
            TestStep::Snapshot => {
                handle.match_snapshot()?;
            }
            TestStep::Resize { rows, columns } => handle.resize(*rows, *columns)?,
            TestStep::Sleep(ms) => std::thread::sleep(Duration::from_millis(*ms)),
        }
    }
    Ok(())
}
