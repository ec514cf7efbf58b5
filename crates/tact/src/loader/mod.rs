//! Loading test files into the suite tree.
//!
//! Each test file is evaluated under an ambient suite held by a
//! [`LoaderCtx`]: declarations append tests and child suites to whatever
//! suite is currently ambient. Script files are parsed from disk; native
//! files are entry functions registered against a path before the run
//! starts (workers rebuild the same registry, so both forms re-import
//! identically on the other side of the process boundary).

pub mod discover;
pub mod script;

use crate::error::{TactError, TactResult};
use crate::expect::TestFailure;
use crate::model::TestOptions;
use crate::suite::{Annotation, Location, Suite, SuiteKind, TestBody, TestCase};
use crate::worker::TestHandle;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};

/// Entry function of a natively registered test file.
pub type FileEntry = fn(&mut LoaderCtx);

static REGISTRY: OnceLock<RwLock<HashMap<PathBuf, FileEntry>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<PathBuf, FileEntry>> {
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a native test file. Must happen before the run (and before
/// `worker_main` in worker processes — re-executing the embedding binary
/// takes care of that when registration precedes the bootstrap call).
pub fn register_native(path: impl Into<PathBuf>, entry: FileEntry) {
    registry()
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .insert(path.into(), entry);
}

fn native_entry(path: &Path) -> Option<FileEntry> {
    registry()
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .get(path)
        .copied()
}

/// Evaluate one test file into a `File` suite.
///
/// `title` is the path the user wrote (relative to the working directory);
/// `resolved` is the loadable path the cache resolver produced.
pub fn load_file(title: &str, resolved: &Path) -> TactResult<Suite> {
    let mut ctx = LoaderCtx::new(Suite::file(title, resolved.to_path_buf()));
    if let Some(entry) = native_entry(resolved) {
        entry(&mut ctx);
    } else {
        let text = std::fs::read_to_string(resolved)
            .map_err(|err| TactError::io(format!("failed to read test file {title}"), err))?;
        script::evaluate(&text, &mut ctx)
            .map_err(|err| TactError::load(format!("{title}: {}", err.message)))?;
    }
    ctx.seal()
        .map_err(|err| TactError::load(format!("{title}: {}", err.message)))
}

/// The ambient-suite holder during evaluation of one file.
///
/// The stack bottom is the file suite; `describe` pushes a child suite and
/// pops it when its block ends. Errors are collected rather than thrown so
/// the native API stays ergonomic; `seal` surfaces the first one.
///
/// Option mutation from inside a running test body cannot happen by
/// construction: bodies only ever see a `TestHandle`, and the context is
/// consumed by [`LoaderCtx::seal`] before the first dispatch. The script
/// grammar enforces the same rule for `.tact` files.
pub struct LoaderCtx {
    stack: Vec<Suite>,
    errors: Vec<TactError>,
}

impl LoaderCtx {
    #[must_use]
    pub fn new(file_suite: Suite) -> Self {
        debug_assert!(file_suite.kind == SuiteKind::File);
        Self {
            stack: vec![file_suite],
            errors: Vec::new(),
        }
    }

    /// Declare a test in the ambient suite.
    #[track_caller]
    pub fn test<F>(&mut self, title: impl Into<String>, body: F)
    where
        F: Fn(&mut TestHandle) -> Result<(), TestFailure> + Send + Sync + 'static,
    {
        self.register_test(
            title.into(),
            Location::caller(),
            TestBody::Native(Arc::new(body)),
            BTreeSet::new(),
        );
    }

    /// Declare a test that is selected but never dispatched.
    #[track_caller]
    pub fn test_skip<F>(&mut self, title: impl Into<String>, body: F)
    where
        F: Fn(&mut TestHandle) -> Result<(), TestFailure> + Send + Sync + 'static,
    {
        self.register_test(
            title.into(),
            Location::caller(),
            TestBody::Native(Arc::new(body)),
            BTreeSet::from([Annotation::Skip]),
        );
    }

    /// Declare a test expected to fail.
    #[track_caller]
    pub fn test_fail<F>(&mut self, title: impl Into<String>, body: F)
    where
        F: Fn(&mut TestHandle) -> Result<(), TestFailure> + Send + Sync + 'static,
    {
        self.register_test(
            title.into(),
            Location::caller(),
            TestBody::Native(Arc::new(body)),
            BTreeSet::from([Annotation::Fail]),
        );
    }

    /// Declare a test that gates the whole selection when present.
    #[track_caller]
    pub fn test_only<F>(&mut self, title: impl Into<String>, body: F)
    where
        F: Fn(&mut TestHandle) -> Result<(), TestFailure> + Send + Sync + 'static,
    {
        self.register_test(
            title.into(),
            Location::caller(),
            TestBody::Native(Arc::new(body)),
            BTreeSet::from([Annotation::Only]),
        );
    }

    /// Declare a describe group: `body` runs with the group ambient.
    pub fn describe(&mut self, title: impl Into<String>, body: impl FnOnce(&mut Self)) {
        self.describe_enter(title.into());
        body(self);
        self.describe_exit();
    }

    /// Merge options into the ambient suite.
    pub fn use_options(&mut self, options: TestOptions) {
        if let Some(ambient) = self.stack.last_mut() {
            ambient.options.overlay(&options);
        }
    }

    pub(crate) fn register_test(
        &mut self,
        title: String,
        location: Location,
        body: TestBody,
        annotations: BTreeSet<Annotation>,
    ) {
        if let Some(ambient) = self.stack.last_mut() {
            ambient
                .tests
                .push(Arc::new(TestCase::new(title, location, body, annotations)));
        }
    }

    pub(crate) fn describe_enter(&mut self, title: String) {
        self.stack.push(Suite::describe(title));
    }

    pub(crate) fn describe_exit(&mut self) {
        if self.stack.len() < 2 {
            self.errors
                .push(TactError::internal("describe_exit without a matching enter"));
            return;
        }
        let finished = self.stack.pop().expect("stack underflow checked above");
        if let Some(parent) = self.stack.last_mut() {
            parent.suites.push(finished);
        }
    }

    /// Finish evaluation and hand back the file suite.
    pub fn seal(mut self) -> TactResult<Suite> {
        if let Some(error) = self.errors.into_iter().next() {
            return Err(error);
        }
        if self.stack.len() != 1 {
            return Err(TactError::internal("unbalanced describe blocks at seal"));
        }
        Ok(self.stack.remove(0))
    }
}
