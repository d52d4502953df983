//! Identifier types for the annotation store.
//!
//! A graph is addressed by the triple (project, source document, data owner).
//! Project and document identifiers are numeric and assigned by the
//! surrounding platform; the data owner is a user name (or a pseudo-user such
//! as the initial or curation placeholder) and ends up as a file name, so it is
//! validated on construction.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use serde::{Serialize, Deserialize};
use crate::types::error::{Error, Result};

/// Project identifier
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProjectId(u64);

/// Source document identifier, unique within the platform
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceDocumentId(u64);

/// Owner of an annotation graph (a user or a pseudo-user)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DataOwner(Arc<str>);

/// Identifies one annotation graph: its persisted file and its cache slot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
    project: ProjectId,
    document: SourceDocumentId,
    owner: DataOwner,
}

impl ProjectId {
    /// Create a project identifier
    pub const fn new(id: u64) -> Self {
        ProjectId(id)
    }

    /// Numeric value
    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl SourceDocumentId {
    /// Create a document identifier
    pub const fn new(id: u64) -> Self {
        SourceDocumentId(id)
    }

    /// Numeric value
    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl DataOwner {
    /// Maximum length of an owner name in bytes
    pub const MAX_LEN: usize = 200;

    /// Create a data owner, rejecting names that cannot be used as a file name.
    pub fn new(name: impl AsRef<str>) -> Result<Self> {
        let name = name.as_ref();
        if name.is_empty() {
            return Err(Error::invalid_input("data owner must not be empty"));
        }
        if name.len() > Self::MAX_LEN {
            return Err(Error::invalid_input(format!(
                "data owner longer than {} bytes", Self::MAX_LEN
            )));
        }
        if name.starts_with('.') {
            return Err(Error::invalid_input(format!("data owner '{}' starts with '.'", name)));
        }
        if name.chars().any(|c| matches!(c, '/' | '\\' | '\0') || c.is_control()) {
            return Err(Error::invalid_input(format!(
                "data owner '{}' contains a path separator or control character", name
            )));
        }
        Ok(DataOwner(Arc::from(name)))
    }

    /// Owner name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl DocumentKey {
    /// Create a document key
    pub fn new(project: ProjectId, document: SourceDocumentId, owner: DataOwner) -> Self {
        Self { project, document, owner }
    }

    /// Convenience constructor from raw parts; validates the owner name.
    pub fn from_parts(project: u64, document: u64, owner: impl AsRef<str>) -> Result<Self> {
        Ok(Self::new(
            ProjectId::new(project),
            SourceDocumentId::new(document),
            DataOwner::new(owner)?,
        ))
    }

    /// Project this graph belongs to
    pub fn project(&self) -> ProjectId {
        self.project
    }

    /// Source document
    pub fn document(&self) -> SourceDocumentId {
        self.document
    }

    /// Data owner
    pub fn owner(&self) -> &DataOwner {
        &self.owner
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SourceDocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DataOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.document, self.owner)
    }
}

impl FromStr for DataOwner {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        DataOwner::new(s)
    }
}

impl TryFrom<String> for DataOwner {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        DataOwner::new(value)
    }
}

impl From<DataOwner> for String {
    fn from(owner: DataOwner) -> Self {
        owner.0.to_string()
    }
}

/// Parses `project/document/owner`
impl FromStr for DocumentKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, '/');
        let (Some(project), Some(document), Some(owner)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(Error::invalid_input(format!(
                "document key '{}' is not of the form project/document/owner", s
            )));
        };
        let project = project.parse::<u64>()
            .map_err(|e| Error::invalid_input(format!("invalid project id '{}': {}", project, e)))?;
        let document = document.parse::<u64>()
            .map_err(|e| Error::invalid_input(format!("invalid document id '{}': {}", document, e)))?;
        DocumentKey::from_parts(project, document, owner)
    }
}
