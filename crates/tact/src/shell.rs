//! Supported shells and per-shell launch configuration.
//!
//! Every test runs inside a real shell on the PTY slave. Most shells can be
//! launched with flags that suppress user configuration; `zsh` has no such
//! flag for all its dotfiles, so it gets a one-time throwaway `ZDOTDIR`
//! prepared before any test spawns.

use crate::error::{TactError, TactResult};
use crate::model::RunId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Environment variable carrying the prepared zsh dotfile directory into
/// worker processes.
pub const ZDOTDIR_ENV: &str = "TACT_ZDOTDIR";

/// Shells the runner knows how to launch.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    Cmd,
    Powershell,
    Pwsh,
}

impl Shell {
    /// The platform default used when no `shell` option is configured.
    #[must_use]
    pub fn platform_default() -> Self {
        if cfg!(windows) {
            Shell::Powershell
        } else {
            Shell::Bash
        }
    }

    /// Executable name looked up on `PATH`.
    #[must_use]
    pub fn program(self) -> &'static str {
        match self {
            Shell::Bash => "bash",
            Shell::Zsh => "zsh",
            Shell::Fish => "fish",
            Shell::Cmd => "cmd.exe",
            Shell::Powershell => "powershell.exe",
            Shell::Pwsh => "pwsh",
        }
    }

    /// Arguments that suppress user dotfiles where the shell supports it.
    #[must_use]
    pub fn launch_args(self) -> &'static [&'static str] {
        match self {
            Shell::Bash => &["--noprofile", "--norc"],
            Shell::Zsh => &[],
            Shell::Fish => &["--no-config"],
            Shell::Cmd => &[],
            Shell::Powershell | Shell::Pwsh => &["-NoProfile", "-NoLogo"],
        }
    }
}

impl fmt::Display for Shell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Shell::Bash => "bash",
            Shell::Zsh => "zsh",
            Shell::Fish => "fish",
            Shell::Cmd => "cmd",
            Shell::Powershell => "powershell",
            Shell::Pwsh => "pwsh",
        };
        f.write_str(name)
    }
}

impl FromStr for Shell {
    type Err = TactError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "bash" => Ok(Shell::Bash),
            "zsh" => Ok(Shell::Zsh),
            "fish" => Ok(Shell::Fish),
            "cmd" => Ok(Shell::Cmd),
            "powershell" => Ok(Shell::Powershell),
            "pwsh" => Ok(Shell::Pwsh),
            other => Err(TactError::config(format!("unsupported shell '{other}'"))),
        }
    }
}

/// One-time resources prepared before the first test spawns.
#[derive(Clone, Debug, Default)]
pub struct ShellSetup {
    /// Throwaway `ZDOTDIR` for zsh runs, if zsh is in play.
    pub zdotdir: Option<PathBuf>,
}

impl ShellSetup {
    /// Environment entries that must reach worker processes.
    #[must_use]
    pub fn worker_env(&self) -> Vec<(String, String)> {
        match &self.zdotdir {
            Some(dir) => vec![(ZDOTDIR_ENV.to_string(), dir.display().to_string())],
            None => Vec::new(),
        }
    }
}

/// Prepare the shells used by the selected tests.
///
/// Currently only zsh needs work: a fresh `ZDOTDIR` whose `.zshrc` disables
/// global rc loading and pins a plain prompt. The directory is keyed by
/// `run_id` so concurrent runs do not trample each other.
pub fn prepare(shells: &BTreeSet<Shell>, run_id: RunId) -> TactResult<ShellSetup> {
    if !shells.contains(&Shell::Zsh) {
        return Ok(ShellSetup::default());
    }
    let dir = std::env::temp_dir().join(format!("tact-zdotdir-{run_id}"));
    std::fs::create_dir_all(&dir)
        .map_err(|err| TactError::io("failed to create zsh dotfile directory", err))?;
    let zshrc = "unsetopt GLOBAL_RCS\nunsetopt PROMPT_CR PROMPT_SP\nPROMPT='%% '\n";
    std::fs::write(dir.join(".zshrc"), zshrc)
        .map_err(|err| TactError::io("failed to write .zshrc", err))?;
    Ok(ShellSetup { zdotdir: Some(dir) })
}

/// Environment overrides applied when spawning a PTY for `shell`.
#[must_use]
pub fn spawn_env(shell: Shell) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("TERM".to_string(), "xterm-256color".to_string());
    if shell == Shell::Zsh {
        if let Ok(dir) = std::env::var(ZDOTDIR_ENV) {
            env.insert("ZDOTDIR".to_string(), dir);
        }
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_round_trips_through_str() {
        for shell in [
            Shell::Bash,
            Shell::Zsh,
            Shell::Fish,
            Shell::Cmd,
            Shell::Powershell,
            Shell::Pwsh,
        ] {
            assert_eq!(shell.to_string().parse::<Shell>().unwrap(), shell);
        }
    }

    #[test]
    fn unknown_shell_is_a_config_error() {
        let err = "ksh".parse::<Shell>().unwrap_err();
        assert_eq!(err.code, "E_CONFIG");
    }

    #[test]
    fn prepare_without_zsh_is_a_noop() {
        let setup = prepare(&BTreeSet::from([Shell::Bash]), RunId::new()).unwrap();
        assert!(setup.zdotdir.is_none());
        assert!(setup.worker_env().is_empty());
    }

    #[test]
    fn prepare_with_zsh_writes_a_zshrc() {
        let setup = prepare(&BTreeSet::from([Shell::Zsh]), RunId::new()).unwrap();
        let dir = setup.zdotdir.expect("zdotdir");
        let contents = std::fs::read_to_string(dir.join(".zshrc")).unwrap();
        assert!(contents.contains("GLOBAL_RCS"));
        std::fs::remove_dir_all(dir).ok();
    }
}
