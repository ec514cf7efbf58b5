// PTY-backed tests; they need a real shell and so run on Unix only.
#![cfg(unix)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::time::Duration;
use tact::expect::{expect, Expected};
use tact::shell::Shell;
use tact::term::{render, SpawnSpec, Terminal};

fn bash_spec() -> SpawnSpec {
    let mut env = BTreeMap::new();
    env.insert("PS1".to_string(), "tact> ".to_string());
    SpawnSpec {
        shell: Shell::Bash,
        rows: 24,
        cols: 80,
        env,
        cwd: None,
    }
}

#[test]
fn a_shell_prompt_appears_on_the_screen() {
    let mut terminal = Terminal::spawn(&bash_spec()).unwrap();
    let result = expect(&mut terminal, Duration::from_secs(10)).to_have_value(
        &Expected::Text("tact> ".into()),
        tact::expect::HaveValueOptions::default(),
    );
    terminal.kill().unwrap();
    result.unwrap();
}

#[test]
fn written_input_is_echoed_and_executed() {
    let mut terminal = Terminal::spawn(&bash_spec()).unwrap();
    expect(&mut terminal, Duration::from_secs(10))
        .to_have_value(
            &Expected::Text("tact> ".into()),
            tact::expect::HaveValueOptions::default(),
        )
        .unwrap();
    terminal.write(b"echo tact-$((20+3))\r").unwrap();
    let result = expect(&mut terminal, Duration::from_secs(10)).to_have_value(
        &Expected::Text("tact-23".into()),
        tact::expect::HaveValueOptions::default(),
    );
    terminal.kill().unwrap();
    result.unwrap();
}

#[test]
fn negated_expectation_succeeds_when_text_is_absent() {
    let mut terminal = Terminal::spawn(&bash_spec()).unwrap();
    let result = expect(&mut terminal, Duration::from_secs(2))
        .not()
        .to_have_value(
            &Expected::Text("never printed".into()),
            tact::expect::HaveValueOptions {
                timeout: Some(Duration::from_millis(500)),
                full: false,
            },
        );
    terminal.kill().unwrap();
    result.unwrap();
}

#[test]
fn missing_value_fails_with_a_descriptive_message() {
    let mut terminal = Terminal::spawn(&bash_spec()).unwrap();
    let result = expect(&mut terminal, Duration::from_secs(2)).to_have_value(
        &Expected::Text("no such output".into()),
        tact::expect::HaveValueOptions {
            timeout: Some(Duration::from_millis(300)),
            full: false,
        },
    );
    terminal.kill().unwrap();
    let failure = result.unwrap_err();
    assert!(failure.message.contains("\"no such output\""));
    assert!(failure.message.contains("substring"));
    assert!(failure.message.contains("300 ms"));
}

#[test]
fn scrolled_output_is_only_in_the_full_buffer() {
    let mut terminal = Terminal::spawn(&SpawnSpec {
        rows: 5,
        ..bash_spec()
    })
    .unwrap();
    expect(&mut terminal, Duration::from_secs(10))
        .to_have_value(
            &Expected::Text("tact> ".into()),
            tact::expect::HaveValueOptions::default(),
        )
        .unwrap();
    terminal.write(b"for i in 1 2 3 4 5 6 7 8; do echo line-$i; done\r").unwrap();
    expect(&mut terminal, Duration::from_secs(10))
        .to_have_value(
            &Expected::Text("line-8".into()),
            tact::expect::HaveValueOptions::default(),
        )
        .unwrap();
    let viewable = render(&terminal.viewable_buffer());
    let full = render(&terminal.buffer());
    terminal.kill().unwrap();
    assert!(!viewable.contains("line-1"));
    assert!(full.contains("line-1"));
    assert!(full.contains("line-8"));
}

#[test]
fn resize_propagates_to_the_emulated_screen() {
    let mut terminal = Terminal::spawn(&bash_spec()).unwrap();
    terminal.resize(10, 40).unwrap();
    let viewable = terminal.viewable_buffer();
    terminal.kill().unwrap();
    assert_eq!(viewable.len(), 10);
    assert!(viewable.iter().all(|row| row.len() == 40));
}
