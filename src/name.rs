//! Transaction-name state.
//!
//! Every request carries one path stack. The chain driver appends one
//! component per middleware entered; application code appends more through
//! [`Exchange::append_path`](crate::Exchange::append_path). Appending is
//! never refused. What fixes the final name is the *claim watermark*: each
//! response body or status assignment records the current stack depth, and
//! the name read at finalization is the stack up to the most recent claim.
//! Components appended after the last claim belong to work that ran after
//! the response was determined; they stay off the name.

use std::fmt;

/// Which response mutation fired a name claim.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MutationKind {
    /// The response body was assigned.
    Body,
    /// The response status was assigned.
    Status,
}

impl MutationKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Body => "body",
            Self::Status => "status",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Path stack plus claim watermark for one request.
pub(crate) struct NameState {
    components: Vec<String>,
    /// Stack depth at the most recent claim. Every claim overwrites the
    /// previous one; the last claim before finalization wins.
    claimed: Option<usize>,
}

impl NameState {
    pub(crate) fn new() -> Self {
        Self { components: Vec::new(), claimed: None }
    }

    /// Pushes a component. Always succeeds; the watermark, not a lock,
    /// decides what ends up in the name.
    pub(crate) fn append(&mut self, component: &str) {
        self.components.push(component.to_owned());
    }

    /// Records the current stack depth as the claimed name length. Fired on
    /// every response body/status assignment, not just the first.
    pub(crate) fn claim(&mut self) {
        self.claimed = Some(self.components.len());
    }

    /// The name as of the last claim, or the whole stack if nothing ever
    /// claimed. `None` when that prefix is empty; callers fall back to the
    /// root segment's name.
    pub(crate) fn resolve(&self) -> Option<String> {
        let depth = self.claimed.unwrap_or(self.components.len());
        if depth == 0 {
            return None;
        }
        Some(self.components[..depth].join("/"))
    }
}
