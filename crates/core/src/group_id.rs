use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AdmissionError, Result};

/// Dot-delimited path of a resource group, e.g. `root.adhoc.etl`.
///
/// Built from the root down: a child id is always its parent's segments
/// plus one local name, so ids never change once a group exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ResourceGroupId {
    segments: Vec<String>,
}

impl ResourceGroupId {
    pub fn root(name: &str) -> Self {
        Self {
            segments: vec![name.to_string()],
        }
    }

    pub fn child(&self, name: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Self { segments }
    }

    /// Last path segment.
    pub fn name(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    pub fn parent(&self) -> Option<Self> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// True when `self` is `other` or one of its ancestors.
    pub fn is_ancestor_of(&self, other: &ResourceGroupId) -> bool {
        other.segments.len() >= self.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }

    /// Group names are path segments, so they must be non-empty and dot-free.
    pub fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() || name.contains('.') {
            return Err(AdmissionError::InvalidGroupName(name.to_string()));
        }
        Ok(())
    }
}

impl fmt::Display for ResourceGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

impl From<ResourceGroupId> for String {
    fn from(id: ResourceGroupId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for ResourceGroupId {
    type Error = AdmissionError;

    fn try_from(value: String) -> Result<Self> {
        let segments: Vec<String> = value.split('.').map(str::to_string).collect();
        for segment in &segments {
            Self::validate_name(segment)?;
        }
        Ok(Self { segments })
    }
}
