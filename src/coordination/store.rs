//! Coordination store abstraction
//!
//! A hierarchical, versioned node tree with ephemeral and sequential node
//! support. The store is an external collaborator; this trait is the whole
//! surface the lock and dirty-flag code relies on.

use async_trait::async_trait;
use thiserror::Error;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

/// Version wildcard accepted by `set` and `delete`
pub const ANY_VERSION: i32 = -1;

/// Width of the zero-padded counter the store appends to sequential nodes
pub const SEQUENCE_WIDTH: usize = 10;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Node already exists: {path}")]
    NodeExists { path: String },
    #[error("Node does not exist: {path}")]
    NoNode { path: String },
    #[error("Version mismatch on {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: i32,
        actual: i32,
    },
    #[error("Node has children: {path}")]
    NotEmpty { path: String },
    #[error("Coordination session expired")]
    SessionExpired,
    #[error("Coordination store connection error: {message}")]
    Connection { message: String },
}

impl StoreError {
    pub fn is_node_exists(&self) -> bool {
        matches!(self, StoreError::NodeExists { .. })
    }

    pub fn is_no_node(&self) -> bool {
        matches!(self, StoreError::NoNode { .. })
    }

    pub fn is_bad_version(&self) -> bool {
        matches!(self, StoreError::BadVersion { .. })
    }
}

/// How a node is created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateMode {
    /// Removed automatically when the creating session ends
    pub ephemeral: bool,
    /// Store appends a monotonically increasing counter to the name
    pub sequence: bool,
    /// Missing parents are created
    pub makepath: bool,
}

impl CreateMode {
    pub fn persistent() -> Self {
        Self::default()
    }

    pub fn ephemeral_sequential() -> Self {
        Self {
            ephemeral: true,
            sequence: true,
            makepath: false,
        }
    }

    pub fn with_makepath(mut self) -> Self {
        self.makepath = true;
        self
    }
}

/// Operations consumed from the coordination store
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Create a node, returning its actual path (which carries the generated
    /// suffix for sequential nodes)
    async fn create(&self, path: &str, value: &[u8], mode: CreateMode) -> Result<String, StoreError>;

    /// Read content and version
    async fn get(&self, path: &str) -> Result<(Vec<u8>, i32), StoreError>;

    /// Replace content if `version` matches (or is `ANY_VERSION`), returning the new version
    async fn set(&self, path: &str, value: &[u8], version: i32) -> Result<i32, StoreError>;

    /// Delete a node if `version` matches (or is `ANY_VERSION`)
    async fn delete(&self, path: &str, version: i32) -> Result<(), StoreError>;

    /// Current version, or `None` when the node is missing
    async fn exists(&self, path: &str) -> Result<Option<i32>, StoreError>;

    /// Names (not paths) of the node's children
    async fn get_children(&self, path: &str) -> Result<Vec<String>, StoreError>;
}

/// Join a parent path and a child name
pub fn join_path(parent: &str, child: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Last path component
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Trailing sequence counter of a sequential node name
pub fn sequence_suffix(name: &str) -> &str {
    let split = name.len().saturating_sub(SEQUENCE_WIDTH);
    name.get(split..).unwrap_or(name)
}
