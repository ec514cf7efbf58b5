//! The tact test-script language.
//!
//! Transformed test files are small declarative scripts: suite-level
//! declarations (`use`, `test`, `test.describe`) wrapping step programs
//! that drive the terminal. Evaluating a script mutates the ambient suite
//! through the loader context, mirroring how the declaration API behaves
//! for native registrations.
//!
//! ```text
//! //# hash=9f2c…                      (cache header, an ordinary comment)
//! use shell=bash rows=40
//! test.describe "login" {
//!   use columns=120
//!   test "shows a prompt" {
//!     expect "$ " timeout=2000
//!     write "whoami\r"
//!     expect r"\w+" full
//!     snapshot
//!   }
//! }
//! ```

use crate::error::{TactError, TactResult};
use crate::expect::Expected;
use crate::loader::LoaderCtx;
use crate::model::TestOptions;
use crate::shell::Shell;
use crate::suite::{Annotation, Location, TestBody};
use regex::Regex;
use std::collections::BTreeSet;

/// One instruction of a compiled test body.
#[derive(Clone, Debug)]
pub enum TestStep {
    /// Bytes written to the PTY master.
    Write(Vec<u8>),
    /// A `to_have_value` assertion.
    Expect {
        expected: Expected,
        timeout_ms: Option<u64>,
        full: bool,
        negated: bool,
    },
    /// A `to_match_snapshot` assertion.
    Snapshot,
    Resize {
        rows: u16,
        columns: u16,
    },
    /// Suspend the test body for the given milliseconds.
    Sleep(u64),
}

#[derive(Clone, Debug, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    RawStr(String),
    Int(u64),
    LBrace,
    RBrace,
    Eq,
}

#[derive(Clone, Debug)]
struct Token {
    tok: Tok,
    row: u32,
    col: u32,
}

fn err_at(row: u32, message: impl std::fmt::Display) -> TactError {
    TactError::load(format!("line {row}: {message}"))
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

struct Scanner {
    chars: Vec<char>,
    pos: usize,
    row: u32,
    col: u32,
}

impl Scanner {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            row: 1,
            col: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += 1;
        if ch == '\n' {
            self.row += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(ch)
    }

    fn scan(mut self) -> TactResult<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia();
            let (row, col) = (self.row, self.col);
            let Some(ch) = self.peek() else { break };
            let tok = match ch {
                '{' => {
                    self.bump();
                    Tok::LBrace
                }
                '}' => {
                    self.bump();
                    Tok::RBrace
                }
                '=' => {
                    self.bump();
                    Tok::Eq
                }
                '"' => Tok::Str(self.string(row)?),
                'r' if self.peek_at(1) == Some('"') => {
                    self.bump();
                    Tok::RawStr(self.raw_string(row)?)
                }
                '0'..='9' => Tok::Int(self.integer(row)?),
                ch if ch.is_alphabetic() || ch == '_' => Tok::Ident(self.ident()),
                other => return Err(err_at(row, format!("unexpected character '{other}'"))),
            };
            tokens.push(Token { tok, row, col });
        }
        Ok(tokens)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(ch) if ch.is_whitespace() => {
                    self.bump();
                }
                Some('/') if self.peek_at(1) == Some('/') => {
                    while let Some(ch) = self.peek() {
                        if ch == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }
    }

    fn string(&mut self, row: u32) -> TactResult<String> {
        self.bump(); // opening quote
        let mut value = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => return Err(err_at(row, "unterminated string")),
                Some('"') => return Ok(value),
                Some('\\') => match self.bump() {
                    Some('r') => value.push('\r'),
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some('e') => value.push('\u{1b}'),
                    Some('\\') => value.push('\\'),
                    Some('"') => value.push('"'),
                    Some('x') => {
                        let hi = self.bump();
                        let lo = self.bump();
                        let (Some(hi), Some(lo)) = (hi, lo) else {
                            return Err(err_at(row, "truncated \\x escape"));
                        };
                        let byte = u8::from_str_radix(&format!("{hi}{lo}"), 16)
                            .map_err(|_| err_at(row, "invalid \\x escape"))?;
                        value.push(byte as char);
                    }
                    Some(other) => {
                        return Err(err_at(row, format!("unknown escape '\\{other}'")))
                    }
                    None => return Err(err_at(row, "unterminated string")),
                },
                Some(ch) => value.push(ch),
            }
        }
    }

    fn raw_string(&mut self, row: u32) -> TactResult<String> {
        self.bump(); // opening quote
        let mut value = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => return Err(err_at(row, "unterminated raw string")),
                Some('"') => return Ok(value),
                Some(ch) => value.push(ch),
            }
        }
    }

    fn integer(&mut self, row: u32) -> TactResult<u64> {
        let mut value: u64 = 0;
        while let Some(ch) = self.peek() {
            let Some(digit) = ch.to_digit(10) else { break };
            self.bump();
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add(u64::from(digit)))
                .ok_or_else(|| err_at(row, "integer literal out of range"))?;
        }
        Ok(value)
    }

    fn ident(&mut self) -> String {
        let mut value = String::new();
        while let Some(ch) = self.peek() {
            if ch.is_alphanumeric() || ch == '_' || ch == '.' {
                value.push(ch);
                self.bump();
            } else {
                break;
            }
        }
        value
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Evaluate a script, registering its declarations into `ctx`.
pub fn evaluate(source: &str, ctx: &mut LoaderCtx) -> TactResult<()> {
    let tokens = Scanner::new(source).scan()?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.suite_body(ctx, 0)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned()?;
        self.pos += 1;
        Some(token)
    }

    fn last_row(&self) -> u32 {
        self.tokens.last().map_or(1, |token| token.row)
    }

    fn expect_str(&mut self, what: &str) -> TactResult<(String, u32)> {
        match self.bump() {
            Some(Token {
                tok: Tok::Str(value),
                row,
                ..
            }) => Ok((value, row)),
            Some(token) => Err(err_at(token.row, format!("expected {what}"))),
            None => Err(err_at(self.last_row(), format!("expected {what}"))),
        }
    }

    fn expect_lbrace(&mut self) -> TactResult<()> {
        match self.bump() {
            Some(Token {
                tok: Tok::LBrace, ..
            }) => Ok(()),
            Some(token) => Err(err_at(token.row, "expected '{'")),
            None => Err(err_at(self.last_row(), "expected '{'")),
        }
    }

    fn expect_int(&mut self, what: &str) -> TactResult<(u64, u32)> {
        match self.bump() {
            Some(Token {
                tok: Tok::Int(value),
                row,
                ..
            }) => Ok((value, row)),
            Some(token) => Err(err_at(token.row, format!("expected {what}"))),
            None => Err(err_at(self.last_row(), format!("expected {what}"))),
        }
    }

    /// `depth` 0 is the file scope (ends at EOF); nested scopes end at `}`.
    fn suite_body(&mut self, ctx: &mut LoaderCtx, depth: usize) -> TactResult<()> {
        loop {
            let Some(token) = self.peek().cloned() else {
                if depth > 0 {
                    return Err(err_at(self.last_row(), "expected '}'"));
                }
                return Ok(());
            };
            match &token.tok {
                Tok::RBrace if depth > 0 => {
                    self.pos += 1;
                    return Ok(());
                }
                Tok::Ident(word) => match word.as_str() {
                    "use" => {
                        self.pos += 1;
                        let options = self.options(token.row)?;
                        ctx.use_options(options);
                    }
                    "test" | "test.skip" | "test.fail" | "test.only" => {
                        let annotation = match word.as_str() {
                            "test.skip" => Some(Annotation::Skip),
                            "test.fail" => Some(Annotation::Fail),
                            "test.only" => Some(Annotation::Only),
                            _ => None,
                        };
                        self.pos += 1;
                        let (title, _) = self.expect_str("a test title string")?;
                        self.expect_lbrace()?;
                        let steps = self.steps()?;
                        let mut annotations = BTreeSet::new();
                        if let Some(annotation) = annotation {
                            annotations.insert(annotation);
                        }
                        ctx.register_test(
                            title,
                            Location {
                                row: token.row,
                                column: token.col,
                            },
                            TestBody::Steps(steps),
                            annotations,
                        );
                    }
                    "test.describe" => {
                        self.pos += 1;
                        let (title, _) = self.expect_str("a describe title string")?;
                        self.expect_lbrace()?;
                        ctx.describe_enter(title);
                        self.suite_body(ctx, depth + 1)?;
                        ctx.describe_exit();
                    }
                    other => {
                        return Err(err_at(
                            token.row,
                            format!("unexpected declaration '{other}'"),
                        ))
                    }
                },
                _ => return Err(err_at(token.row, "expected a declaration")),
            }
        }
    }

    /// `key=value` pairs after `use`.
    fn options(&mut self, row: u32) -> TactResult<TestOptions> {
        let mut options = TestOptions::default();
        let mut any = false;
        while let Some(token) = self.peek() {
            let Tok::Ident(key) = &token.tok else { break };
            if !matches!(
                self.tokens.get(self.pos + 1).map(|t| &t.tok),
                Some(Tok::Eq)
            ) {
                break;
            }
            let key = key.clone();
            let key_row = token.row;
            self.pos += 2; // key and '='
            any = true;
            match key.as_str() {
                "shell" => {
                    let value = self.value_string("a shell name")?;
                    options.shell = Some(value.parse::<Shell>().map_err(|err| {
                        err_at(key_row, err.message)
                    })?);
                }
                "rows" => options.rows = Some(self.value_u16("rows")?),
                "columns" => options.columns = Some(self.value_u16("columns")?),
                "cwd" => options.cwd = Some(self.value_string("a directory string")?),
                key if key.starts_with("env.") => {
                    let name = key["env.".len()..].to_string();
                    if name.is_empty() {
                        return Err(err_at(key_row, "empty env variable name"));
                    }
                    let value = self.value_string("an env value")?;
                    options.env.insert(name, value);
                }
                other => {
                    return Err(err_at(key_row, format!("unknown option '{other}'")));
                }
            }
        }
        if !any {
            return Err(err_at(row, "'use' needs at least one key=value pair"));
        }
        Ok(options)
    }

    fn value_string(&mut self, what: &str) -> TactResult<String> {
        match self.bump() {
            Some(Token {
                tok: Tok::Str(value) | Tok::Ident(value),
                ..
            }) => Ok(value),
            Some(Token {
                tok: Tok::Int(value),
                ..
            }) => Ok(value.to_string()),
            Some(token) => Err(err_at(token.row, format!("expected {what}"))),
            None => Err(err_at(self.last_row(), format!("expected {what}"))),
        }
    }

    fn value_u16(&mut self, what: &str) -> TactResult<u16> {
        let (value, row) = self.expect_int(what)?;
        if value == 0 {
            return Err(err_at(row, format!("{what} must be positive")));
        }
        u16::try_from(value).map_err(|_| err_at(row, format!("{what} out of range")))
    }

    fn steps(&mut self) -> TactResult<Vec<TestStep>> {
        let mut steps = Vec::new();
        loop {
            let Some(token) = self.bump() else {
                return Err(err_at(self.last_row(), "expected '}'"));
            };
            match &token.tok {
                Tok::RBrace => return Ok(steps),
                Tok::Ident(word) => match word.as_str() {
                    "write" => {
                        let (text, _) = self.expect_str("a string to write")?;
                        steps.push(TestStep::Write(text.into_bytes()));
                    }
                    "expect" => steps.push(self.expect_step(token.row)?),
                    "snapshot" => steps.push(TestStep::Snapshot),
                    "resize" => steps.push(self.resize_step(token.row)?),
                    "sleep" => {
                        let (ms, _) = self.expect_int("a duration in ms")?;
                        steps.push(TestStep::Sleep(ms));
                    }
                    // `use` is suite-scope only; inside a body the
                    // evaluation already runs under a hook, where option
                    // mutation is an error.
                    "use" => {
                        return Err(err_at(
                            token.row,
                            "'use' is not allowed inside a test body",
                        ))
                    }
                    other => {
                        return Err(err_at(token.row, format!("unknown step '{other}'")))
                    }
                },
                _ => return Err(err_at(token.row, "expected a step")),
            }
        }
    }

    fn expect_step(&mut self, row: u32) -> TactResult<TestStep> {
        let expected = match self.bump() {
            Some(Token {
                tok: Tok::Str(text),
                ..
            }) => Expected::Text(text),
            Some(Token {
                tok: Tok::RawStr(pattern),
                row,
                ..
            }) => Expected::Pattern(
                Regex::new(&pattern)
                    .map_err(|err| err_at(row, format!("invalid regex: {err}")))?,
            ),
            Some(token) => return Err(err_at(token.row, "expected a string or r\"regex\"")),
            None => return Err(err_at(row, "expected a string or r\"regex\"")),
        };
        let mut timeout_ms = None;
        let mut full = false;
        let mut negated = false;
        loop {
            let Some((flag, flag_row)) = self.peek().and_then(|token| match &token.tok {
                Tok::Ident(flag) => Some((flag.clone(), token.row)),
                _ => None,
            }) else {
                break;
            };
            match flag.as_str() {
                "full" => {
                    full = true;
                    self.pos += 1;
                }
                "not" => {
                    negated = true;
                    self.pos += 1;
                }
                "timeout" => {
                    self.pos += 1;
                    match self.bump() {
                        Some(Token { tok: Tok::Eq, .. }) => {}
                        _ => return Err(err_at(flag_row, "expected '=' after timeout")),
                    }
                    let (ms, _) = self.expect_int("a timeout in ms")?;
                    timeout_ms = Some(ms);
                }
                _ => break,
            }
        }
        Ok(TestStep::Expect {
            expected,
            timeout_ms,
            full,
            negated,
        })
    }

    fn resize_step(&mut self, row: u32) -> TactResult<TestStep> {
        let mut rows = None;
        let mut columns = None;
        while let Some(token) = self.peek() {
            let Tok::Ident(key) = &token.tok else { break };
            if !matches!(
                self.tokens.get(self.pos + 1).map(|t| &t.tok),
                Some(Tok::Eq)
            ) {
                break;
            }
            let key = key.clone();
            let key_row = token.row;
            self.pos += 2;
            match key.as_str() {
                "rows" => rows = Some(self.value_u16("rows")?),
                "columns" => columns = Some(self.value_u16("columns")?),
                other => return Err(err_at(key_row, format!("unknown resize key '{other}'"))),
            }
        }
        match (rows, columns) {
            (Some(rows), Some(columns)) => Ok(TestStep::Resize { rows, columns }),
            _ => Err(err_at(row, "resize needs rows= and columns=")),
        }
    }
}
