//! Reference patterns and garbage-collection vocabulary shared by the storages.
//!
//! A reference is an arbitrary string a cached result is tagged with, e.g. `user:42`. Invalidation accepts either a
//! literal reference or a prefix wildcard such as `user:*`.

use std::fmt::Display;

use serde::Serialize;

pub const DEFAULT_GC_CHUNK: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReferencePattern {
    Exact(String),
    /// Everything starting with the prefix. Parsed from `"<prefix>*"`.
    Prefix(String),
}

impl ReferencePattern {
    pub fn parse(reference: &str) -> Self {
        match reference.strip_suffix('*') {
            Some(prefix) => Self::Prefix(prefix.to_string()),
            None => Self::Exact(reference.to_string()),
        }
    }

    pub fn matches(&self, reference: &str) -> bool {
        match self {
            Self::Exact(r) => r == reference,
            Self::Prefix(p) => reference.starts_with(p.as_str()),
        }
    }
}

impl Display for ReferencePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact(r) => write!(f, "{r}"),
            Self::Prefix(p) => write!(f, "{p}*"),
        }
    }
}

impl From<&str> for ReferencePattern {
    fn from(reference: &str) -> Self {
        Self::parse(reference)
    }
}

impl From<String> for ReferencePattern {
    fn from(reference: String) -> Self {
        Self::parse(&reference)
    }
}

/// Anything that can name one or more references: a string, a list of strings, or ready patterns.
pub trait IntoReferences {
    fn into_references(self) -> Vec<ReferencePattern>;
}

impl IntoReferences for &str {
    fn into_references(self) -> Vec<ReferencePattern> {
        vec![self.into()]
    }
}

impl IntoReferences for String {
    fn into_references(self) -> Vec<ReferencePattern> {
        vec![self.into()]
    }
}

impl<T: Into<ReferencePattern>> IntoReferences for Vec<T> {
    fn into_references(self) -> Vec<ReferencePattern> {
        self.into_iter().map(Into::into).collect()
    }
}

impl<T: Into<ReferencePattern> + Clone> IntoReferences for &[T] {
    fn into_references(self) -> Vec<ReferencePattern> {
        self.iter().cloned().map(Into::into).collect()
    }
}

impl<T: Into<ReferencePattern>, const N: usize> IntoReferences for [T; N] {
    fn into_references(self) -> Vec<ReferencePattern> {
        self.into_iter().map(Into::into).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcMode {
    /// A single full pass over all reference sets.
    Strict { chunk: usize },
    /// One chunk per invocation. Resumes from `cursor` if given, otherwise from the cursor the storage kept after the
    /// previous lazy run.
    Lazy { chunk: usize, cursor: Option<u64> },
}

impl GcMode {
    pub fn strict() -> Self {
        Self::Strict { chunk: DEFAULT_GC_CHUNK }
    }

    pub fn lazy() -> Self {
        Self::Lazy {
            chunk:  DEFAULT_GC_CHUNK,
            cursor: None,
        }
    }

    pub fn chunk(&self) -> usize {
        match self {
            Self::Strict { chunk } | Self::Lazy { chunk, .. } => (*chunk).max(1),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub references_scanned: usize,
    pub references_removed: usize,
    pub keys_scanned:       usize,
    pub keys_removed:       usize,
    pub loops:              usize,
    /// Where the next lazy run starts. Zero means a full pass has been completed.
    pub cursor:             u64,
}
