//! Subscription patterns
//!
//! A [`Pattern`] selects which variables a subscription or a waiter reacts
//! to. Matching and the transport channel a pattern needs are both resolved
//! here, so the rest of the registry never looks inside the variant.

use crate::transport::{any_channel, group_channel, key_channel, variable_channel};
use crate::types::VarRef;
use std::fmt;

/// Which variables a subscription or waiter reacts to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Pattern {
    /// Exactly one variable
    Variable(VarRef),
    /// Every variable in a group, including nested groups
    Group(String),
    /// A key in any table
    Key(String),
    /// Every variable
    Any,
}

impl Pattern {
    /// Whether an update of `var` is selected by this pattern
    pub fn matches(&self, var: &VarRef) -> bool {
        match self {
            Pattern::Variable(v) => v == var,
            Pattern::Group(group) => var.is_in_group(group),
            Pattern::Key(key) => var.key() == key,
            Pattern::Any => true,
        }
    }

    /// Transport channel (or glob pattern) carrying the selected updates
    pub fn channel(&self) -> String {
        match self {
            Pattern::Variable(v) => variable_channel(v),
            Pattern::Group(group) => group_channel(group),
            Pattern::Key(key) => key_channel(key),
            Pattern::Any => any_channel(),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Variable(v) => write!(f, "{}", v),
            Pattern::Group(group) => write!(f, "{}:*", group),
            Pattern::Key(key) => write!(f, "*:{}", key),
            Pattern::Any => write!(f, "*"),
        }
    }
}

impl From<VarRef> for Pattern {
    fn from(var: VarRef) -> Self {
        Pattern::Variable(var)
    }
}
