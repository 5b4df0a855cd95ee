// Create-or-set: idempotent upsert of a node's content

use thiserror::Error;
use tracing::debug;

use super::store::{CoordinationStore, CreateMode, StoreError};

/// Default bound on create/set restarts
pub const DEFAULT_CREATE_OR_SET_LIMIT: u32 = 50;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CreateOrSetError {
    /// Concurrent creates and deletes kept racing this upsert past its bound
    #[error("{path}")]
    LoopLimitReached { path: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Create `path` with `content`, or overwrite it if it already exists.
///
/// When the node exists, its version is read and a version-checked `set` is
/// issued. Losing that race to a concurrent delete or write restarts from the
/// create; each restart counts against `limit`.
pub async fn create_or_set(
    store: &dyn CoordinationStore,
    path: &str,
    content: &[u8],
    limit: u32,
) -> Result<String, CreateOrSetError> {
    let mode = CreateMode::persistent().with_makepath();

    for attempt in 0..limit {
        match store.create(path, content, mode).await {
            Ok(created) => return Ok(created),
            Err(StoreError::NodeExists { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        let version = match store.get(path).await {
            Ok((_, version)) => version,
            Err(e) if e.is_no_node() => {
                debug!(path, attempt, "Node vanished before read, retrying create");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        match store.set(path, content, version).await {
            Ok(_) => return Ok(path.to_string()),
            Err(e) if e.is_no_node() || e.is_bad_version() => {
                debug!(path, attempt, error = %e, "Lost update race, retrying create");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(CreateOrSetError::LoopLimitReached {
        path: path.to_string(),
    })
}
