use crate::shell::Shell;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Rows used when no ancestor configures `rows`.
pub const DEFAULT_ROWS: u16 = 30;
/// Columns used when no ancestor configures `columns`.
pub const DEFAULT_COLUMNS: u16 = 80;

/// Per-suite terminal options, inherited down the suite tree.
///
/// Every field is optional; resolution is a shallow merge where the nearest
/// ancestor wins. `env` merges key-wise with the same rule.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TestOptions {
    pub shell: Option<Shell>,
    pub rows: Option<u16>,
    pub columns: Option<u16>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<String>,
}

impl TestOptions {
    /// Merge `over` on top of `self`: values present in `over` win,
    /// env entries merge key-wise.
    pub fn overlay(&mut self, over: &TestOptions) {
        if over.shell.is_some() {
            self.shell = over.shell;
        }
        if over.rows.is_some() {
            self.rows = over.rows;
        }
        if over.columns.is_some() {
            self.columns = over.columns;
        }
        for (key, value) in &over.env {
            self.env.insert(key.clone(), value.clone());
        }
        if over.cwd.is_some() {
            self.cwd = over.cwd.clone();
        }
    }

    #[must_use]
    pub fn rows_or_default(&self) -> u16 {
        self.rows.unwrap_or(DEFAULT_ROWS)
    }

    #[must_use]
    pub fn columns_or_default(&self) -> u16 {
        self.columns.unwrap_or(DEFAULT_COLUMNS)
    }

    #[must_use]
    pub fn shell_or_default(&self) -> Shell {
        self.shell.unwrap_or_else(Shell::platform_default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_nearest_wins() {
        let mut base = TestOptions {
            shell: Some(Shell::Bash),
            rows: Some(24),
            ..TestOptions::default()
        };
        base.env.insert("A".into(), "1".into());
        base.env.insert("B".into(), "1".into());

        let mut over = TestOptions {
            rows: Some(50),
            ..TestOptions::default()
        };
        over.env.insert("B".into(), "2".into());

        base.overlay(&over);
        assert_eq!(base.shell, Some(Shell::Bash));
        assert_eq!(base.rows, Some(50));
        assert_eq!(base.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(base.env.get("B").map(String::as_str), Some("2"));
    }

    #[test]
    fn defaults_apply_when_unset() {
        let options = TestOptions::default();
        assert_eq!(options.rows_or_default(), 30);
        assert_eq!(options.columns_or_default(), 80);
    }
}
