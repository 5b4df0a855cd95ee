//! Per-group "needs convergence" flags
//!
//! A group is dirty while a node named `{tenant_id}_{group_id}` exists under
//! the dirty root. Marking is an upsert, so every mark bumps the node's
//! version. Cleaning deletes the node only at the version observed when the
//! convergence run began; a mark that lands mid-run therefore survives and
//! triggers another run.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::create_or_set::{create_or_set, CreateOrSetError, DEFAULT_CREATE_OR_SET_LIMIT};
use super::store::{join_path, CoordinationStore, StoreError};
use crate::events::{Event, EventSink};
use crate::observability::convergence_metrics;

/// Default parent of the dirty-flag nodes
pub const DEFAULT_DIRTY_ROOT: &str = "/groups/divergent";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid group key '{0}': expected tenant_group")]
pub struct InvalidGroupKey(String);

/// Identity of a scaling group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    pub tenant_id: String,
    pub group_id: String,
}

impl GroupKey {
    pub fn new(tenant_id: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            group_id: group_id.into(),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.tenant_id, self.group_id)
    }
}

impl FromStr for GroupKey {
    type Err = InvalidGroupKey;

    /// Splits on the first underscore; group ids may contain underscores.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('_') {
            Some((tenant, group)) if !tenant.is_empty() && !group.is_empty() => {
                Ok(GroupKey::new(tenant, group))
            }
            _ => Err(InvalidGroupKey(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkCleanOutcome {
    Cleaned,
    /// Flag was already gone
    NotFound,
    /// Flag was re-marked since the run started and was left in place
    Skipped,
}

/// A dirty group and the flag version observed when it was listed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyGroup {
    pub group: GroupKey,
    pub version: i32,
}

pub struct DirtyFlags {
    store: Arc<dyn CoordinationStore>,
    root: String,
    sink: Arc<dyn EventSink>,
    retry_limit: u32,
}

impl DirtyFlags {
    pub fn new(store: Arc<dyn CoordinationStore>, root: impl Into<String>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            store,
            root: root.into(),
            sink,
            retry_limit: DEFAULT_CREATE_OR_SET_LIMIT,
        }
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn flag_path(&self, group: &GroupKey) -> String {
        join_path(&self.root, &group.to_string())
    }

    fn event(&self, event_type: &str, group: &GroupKey) -> Event {
        Event::new(event_type)
            .with("tenant_id", &group.tenant_id)
            .with("scaling_group_id", &group.group_id)
    }

    /// Flag `group` as needing convergence. Both outcomes are reported as
    /// events; the error is returned so the caller can decide whether it
    /// matters.
    pub async fn mark_dirty(&self, group: &GroupKey) -> Result<(), CreateOrSetError> {
        let path = self.flag_path(group);
        match create_or_set(self.store.as_ref(), &path, b"dirty", self.retry_limit).await {
            Ok(_) => {
                convergence_metrics().record_dirty_mark(true);
                self.sink.emit(self.event("mark-dirty-success", group));
                Ok(())
            }
            Err(e) => {
                convergence_metrics().record_dirty_mark(false);
                self.sink
                    .emit(self.event("mark-dirty-failure", group).with_error(&e));
                Err(e)
            }
        }
    }

    /// Clear the flag if it is still at `expected_version`
    pub async fn mark_clean(
        &self,
        group: &GroupKey,
        expected_version: i32,
    ) -> Result<MarkCleanOutcome, StoreError> {
        let path = self.flag_path(group);
        let outcome = match self.store.delete(&path, expected_version).await {
            Ok(()) => Ok(MarkCleanOutcome::Cleaned),
            Err(e) if e.is_no_node() => Ok(MarkCleanOutcome::NotFound),
            Err(e) if e.is_bad_version() => Ok(MarkCleanOutcome::Skipped),
            Err(e) => Err(e),
        };

        let event = match &outcome {
            Ok(MarkCleanOutcome::Cleaned) => self.event("mark-clean-success", group),
            Ok(MarkCleanOutcome::NotFound) => self.event("mark-clean-not-found", group),
            Ok(MarkCleanOutcome::Skipped) => self
                .event("mark-clean-skipped", group)
                .with("expected_version", expected_version),
            Err(e) => self.event("mark-clean-failure", group).with_error(e),
        };
        self.sink.emit(event);
        outcome
    }

    /// Current flag version, or `None` when the group is clean
    pub async fn dirty_version(&self, group: &GroupKey) -> Result<Option<i32>, StoreError> {
        self.store.exists(&self.flag_path(group)).await
    }

    /// Every dirty group with its flag version. Flags that disappear while
    /// being listed, and children that are not group keys, are dropped.
    pub async fn list_dirty(&self) -> Result<Vec<DirtyGroup>, StoreError> {
        let children = match self.store.get_children(&self.root).await {
            Ok(children) => children,
            Err(e) if e.is_no_node() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut dirty = Vec::with_capacity(children.len());
        for child in children {
            let Ok(group) = child.parse::<GroupKey>() else {
                debug!(child = %child, "Ignoring malformed dirty flag");
                continue;
            };
            let path = join_path(&self.root, &child);
            match self.store.exists(&path).await? {
                Some(version) => dirty.push(DirtyGroup { group, version }),
                None => self.sink.emit(
                    Event::new("converge-divergent-flag-disappeared").with("path", &path),
                ),
            }
        }
        dirty.sort_by(|a, b| a.group.cmp(&b.group));
        Ok(dirty)
    }
}
