use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier for one invocation of the runner.
///
/// Used to key run-scoped resources on disk (e.g. the zsh dotfile
/// directory) so concurrent runs do not collide.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
