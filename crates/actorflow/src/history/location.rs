//! Structural position of entries inside a workflow body.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const SEPARATOR: char = '/';
const ITERATION_MARK: char = '#';

/// Path from the workflow root to the scope an entry was created in.
///
/// Segments are the names of enclosing loops (suffixed with `#iteration`)
/// and of join/race entries followed by the branch name. The root location
/// has no segments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Location(Vec<String>);

impl Location {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Scope of one loop iteration.
    pub(crate) fn iteration(&self, loop_name: &str, iteration: u64) -> Self {
        self.child(format!("{loop_name}{ITERATION_MARK}{iteration}"))
    }

    /// Scope of one join or race branch.
    pub(crate) fn branch(&self, entry_name: &str, branch: &str) -> Self {
        self.child(entry_name.to_owned()).child(branch.to_owned())
    }

    fn child(&self, segment: String) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment);
        Self(segments)
    }

    /// Storage key of the entry `name` in this location.
    pub fn key_for(&self, name: &str) -> String {
        if self.0.is_empty() {
            return name.to_owned();
        }
        let mut key = self.0.join("/");
        key.push(SEPARATOR);
        key.push_str(name);
        key
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<root>");
        }
        f.write_str(&self.0.join("/"))
    }
}

/// Key prefix shared by every iteration scope of a loop entry.
pub(crate) fn iterations_prefix(loop_key: &str) -> String {
    format!("{loop_key}{ITERATION_MARK}")
}

/// Parse the iteration number from a key nested under a loop entry.
pub(crate) fn iteration_of(loop_key: &str, key: &str) -> Option<u64> {
    let rest = key.strip_prefix(&iterations_prefix(loop_key))?;
    let (number, _) = rest.split_once(SEPARATOR)?;
    number.parse().ok()
}

/// Entry and branch names become key segments, so they cannot be empty or
/// contain the characters used to build keys.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "name is empty"
    } else if name.contains(SEPARATOR) {
        "name contains `/`"
    } else if name.contains(ITERATION_MARK) {
        "name contains `#`"
    } else {
        return Ok(());
    };
    Err(Error::InvalidName {
        name: name.to_owned(),
        reason,
    })
}
