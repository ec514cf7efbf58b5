//! The suite tree: projects, files, describe groups and test cases.
//!
//! The tree is built by the loader and frozen before orchestration. The
//! freeze pass derives each test's stable id and effective options so the
//! scheduler and the workers read them without walking ancestors.

use crate::expect::TestFailure;
use crate::loader::script::TestStep;
use crate::model::{outcome, TestOptions, TestResult, TestStatus};
use crate::worker::TestHandle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// A native test body registered through the in-process declaration API.
pub type NativeBody = Arc<dyn Fn(&mut TestHandle) -> Result<(), TestFailure> + Send + Sync>;

/// The opaque callable a test runs against the terminal.
///
/// Script files compile to step programs; in-process registration supplies
/// closures. Both consume the terminal through [`TestHandle`].
#[derive(Clone)]
pub enum TestBody {
    Steps(Vec<TestStep>),
    Native(NativeBody),
}

impl fmt::Debug for TestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestBody::Steps(steps) => f.debug_tuple("Steps").field(&steps.len()).finish(),
            TestBody::Native(_) => f.write_str("Native(..)"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuiteKind {
    Root,
    Project,
    File,
    Describe,
}

/// Row/column of a declaration in its source file, 1-based.
/// `{0, 0}` means the position could not be determined.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub row: u32,
    pub column: u32,
}

impl Location {
    /// Capture the caller's position. Used by the native declaration API.
    #[must_use]
    #[track_caller]
    pub fn caller() -> Self {
        let caller = std::panic::Location::caller();
        Self {
            row: caller.line(),
            column: caller.column(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Annotation {
    Only,
    Skip,
    Fail,
}

/// Stable test identifier derived from the title path.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestId(String);

impl TestId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single registered test.
///
/// `id`, `options` and `source` are derived by [`Suite::freeze`]; `results`
/// accumulates one entry per attempt and is the only part of the tree that
/// mutates after load.
pub struct TestCase {
    pub title: String,
    pub location: Location,
    pub body: TestBody,
    pub annotations: BTreeSet<Annotation>,
    pub id: TestId,
    /// Effective options, ancestors merged nearest-wins.
    pub options: TestOptions,
    /// Resolved loadable path of the owning file.
    pub source: PathBuf,
    /// Title of the owning file node (the path the user wrote).
    pub file: String,
    pub results: Mutex<Vec<TestResult>>,
}

impl TestCase {
    #[must_use]
    pub fn new(
        title: impl Into<String>,
        location: Location,
        body: TestBody,
        annotations: BTreeSet<Annotation>,
    ) -> Self {
        Self {
            title: title.into(),
            location,
            body,
            annotations,
            id: TestId(String::new()),
            options: TestOptions::default(),
            source: PathBuf::new(),
            file: String::new(),
            results: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn has_annotation(&self, annotation: Annotation) -> bool {
        self.annotations.contains(&annotation)
    }

    pub fn push_result(&self, result: TestResult) {
        self.results
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(result);
    }

    #[must_use]
    pub fn results(&self) -> Vec<TestResult> {
        self.results
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Overall classification after all attempts.
    #[must_use]
    pub fn outcome(&self) -> TestStatus {
        outcome(&self.results())
    }
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("annotations", &self.annotations)
            .finish_non_exhaustive()
    }
}

/// Minimal ancestor information shipped to a worker so it can rebuild
/// identity and project-level options; describe nodes are omitted, the
/// worker re-imports the file and recovers them from the source.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SummaryNode {
    pub title: String,
    pub kind: SuiteKind,
    pub options: TestOptions,
    pub source: Option<PathBuf>,
}

/// A node of the suite tree.
#[derive(Debug)]
pub struct Suite {
    pub title: String,
    pub kind: SuiteKind,
    pub options: TestOptions,
    /// Resolved loadable path; `File` nodes only.
    pub source: Option<PathBuf>,
    pub suites: Vec<Suite>,
    pub tests: Vec<Arc<TestCase>>,
}

impl Suite {
    #[must_use]
    pub fn new(title: impl Into<String>, kind: SuiteKind) -> Self {
        Self {
            title: title.into(),
            kind,
            options: TestOptions::default(),
            source: None,
            suites: Vec::new(),
            tests: Vec::new(),
        }
    }

    #[must_use]
    pub fn root() -> Self {
        Self::new("", SuiteKind::Root)
    }

    #[must_use]
    pub fn project(title: impl Into<String>, options: TestOptions) -> Self {
        let mut suite = Self::new(title, SuiteKind::Project);
        suite.options = options;
        suite
    }

    #[must_use]
    pub fn file(title: impl Into<String>, source: PathBuf) -> Self {
        let mut suite = Self::new(title, SuiteKind::File);
        suite.source = Some(source);
        suite
    }

    #[must_use]
    pub fn describe(title: impl Into<String>) -> Self {
        Self::new(title, SuiteKind::Describe)
    }

    /// All tests in depth-first pre-order: a suite's own tests before its
    /// child suites, declaration order throughout.
    #[must_use]
    pub fn all_tests(&self) -> Vec<Arc<TestCase>> {
        let mut collected = Vec::new();
        self.collect_tests(&mut collected);
        collected
    }

    fn collect_tests(&self, into: &mut Vec<Arc<TestCase>>) {
        into.extend(self.tests.iter().cloned());
        for child in &self.suites {
            child.collect_tests(into);
        }
    }

    /// All tests in breadth-first suite order, the order tasks are enqueued.
    #[must_use]
    pub fn tests_breadth_first(&self) -> Vec<Arc<TestCase>> {
        let mut collected = Vec::new();
        let mut frontier: Vec<&Suite> = vec![self];
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for suite in frontier {
                collected.extend(suite.tests.iter().cloned());
                next.extend(suite.suites.iter());
            }
            frontier = next;
        }
        collected
    }

    /// Shallow merge of this node's options over `inherited`.
    #[must_use]
    pub fn effective_options(&self, inherited: &TestOptions) -> TestOptions {
        let mut merged = inherited.clone();
        merged.overlay(&self.options);
        merged
    }

    /// Derive ids, effective options and file attribution for every test.
    /// Call once on the root after loading; the tree is read-only afterward.
    pub fn freeze(&mut self) {
        let inherited = TestOptions::default();
        let mut prefix = Vec::new();
        self.freeze_node(&inherited, &mut prefix, None);
    }

    fn freeze_node(
        &mut self,
        inherited: &TestOptions,
        prefix: &mut Vec<IdSegment>,
        file: Option<&FileContext>,
    ) {
        let merged = self.effective_options(inherited);
        let pushed = match self.kind {
            SuiteKind::Root => None,
            SuiteKind::Project => {
                if self.title.is_empty() {
                    None
                } else {
                    Some(IdSegment::Literal(format!("[{}]", self.title)))
                }
            }
            SuiteKind::File => Some(IdSegment::File(self.title.clone())),
            SuiteKind::Describe => Some(IdSegment::Literal(self.title.clone())),
        };
        if let Some(segment) = pushed.clone() {
            prefix.push(segment);
        }

        let owned_file;
        let file = if self.kind == SuiteKind::File {
            owned_file = FileContext {
                title: self.title.clone(),
                source: self.source.clone().unwrap_or_default(),
            };
            Some(&owned_file)
        } else {
            file
        };

        for test in &mut self.tests {
            // Not yet shared outside the loader at freeze time.
            let case = Arc::get_mut(test).expect("suite frozen after tests were shared");
            case.id = TestId(render_id(prefix, case.location.row, &case.title));
            case.options = merged.clone();
            if let Some(context) = file {
                case.source = context.source.clone();
                case.file = context.title.clone();
            }
        }
        for child in &mut self.suites {
            child.freeze_node(&merged, prefix, file);
        }

        if pushed.is_some() {
            prefix.pop();
        }
    }
}

struct FileContext {
    title: String,
    source: PathBuf,
}

#[derive(Clone)]
enum IdSegment {
    Literal(String),
    /// File segment; the test's declaration row is spliced in as
    /// `title:row:row`. The row is intentionally doubled — existing
    /// snapshot stores key off this exact shape.
    File(String),
}

fn render_id(prefix: &[IdSegment], row: u32, title: &str) -> String {
    let mut parts: Vec<String> = prefix
        .iter()
        .map(|segment| match segment {
            IdSegment::Literal(text) => text.clone(),
            IdSegment::File(file) => format!("{file}:{row}:{row}"),
        })
        .collect();
    parts.push(title.to_string());
    parts.join(" > ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_case(title: &str, row: u32) -> Arc<TestCase> {
        Arc::new(TestCase::new(
            title,
            Location { row, column: 1 },
            TestBody::Steps(Vec::new()),
            BTreeSet::new(),
        ))
    }

    fn sample_tree() -> Suite {
        let mut root = Suite::root();
        let mut project = Suite::project("ubuntu", TestOptions::default());
        let mut file = Suite::file("tests/login.tact", PathBuf::from(".tact/cache/tests/login.tact"));
        file.tests.push(test_case("shows prompt", 3));
        let mut group = Suite::describe("banner");
        group.tests.push(test_case("shows version", 7));
        file.suites.push(group);
        project.suites.push(file);
        root.suites.push(project);
        root
    }

    #[test]
    fn ids_follow_the_title_path_with_doubled_row() {
        let mut root = sample_tree();
        root.freeze();
        let tests = root.all_tests();
        assert_eq!(
            tests[0].id.as_str(),
            "[ubuntu] > tests/login.tact:3:3 > shows prompt"
        );
        assert_eq!(
            tests[1].id.as_str(),
            "[ubuntu] > tests/login.tact:7:7 > banner > shows version"
        );
    }

    #[test]
    fn empty_project_title_is_omitted_from_ids() {
        let mut root = Suite::root();
        let mut project = Suite::project("", TestOptions::default());
        let mut file = Suite::file("a.tact", PathBuf::from("a.tact"));
        file.tests.push(test_case("t", 1));
        project.suites.push(file);
        root.suites.push(project);
        root.freeze();
        assert_eq!(root.all_tests()[0].id.as_str(), "a.tact:1:1 > t");
    }

    #[test]
    fn ids_are_unique_across_same_titles_on_different_rows() {
        let mut root = Suite::root();
        let mut project = Suite::project("", TestOptions::default());
        let mut file = Suite::file("a.tact", PathBuf::from("a.tact"));
        file.tests.push(test_case("dup", 1));
        file.tests.push(test_case("dup", 9));
        project.suites.push(file);
        root.suites.push(project);
        root.freeze();
        let tests = root.all_tests();
        assert_ne!(tests[0].id, tests[1].id);
    }

    #[test]
    fn freeze_resolves_effective_options_nearest_wins() {
        let mut root = Suite::root();
        let mut project_options = TestOptions::default();
        project_options.rows = Some(40);
        project_options.columns = Some(120);
        let mut project = Suite::project("p", project_options);
        let mut file = Suite::file("a.tact", PathBuf::from("a.tact"));
        file.options.columns = Some(90);
        file.tests.push(test_case("t", 1));
        project.suites.push(file);
        root.suites.push(project);
        root.freeze();
        let test = &root.all_tests()[0];
        assert_eq!(test.options.rows, Some(40));
        assert_eq!(test.options.columns, Some(90));
    }

    #[test]
    fn pre_order_lists_own_tests_before_nested_groups() {
        let mut root = sample_tree();
        root.freeze();
        let titles: Vec<_> = root
            .all_tests()
            .iter()
            .map(|test| test.title.clone())
            .collect();
        assert_eq!(titles, vec!["shows prompt", "shows version"]);
    }
}
