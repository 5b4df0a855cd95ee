// In-memory coordination store
//
// A versioned node tree shared between any number of sessions. Each session
// owns its ephemeral nodes; expiring a session removes them and fails every
// later call made through it, the way a real store behaves after a session
// timeout. Backs the integration tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::store::{CoordinationStore, CreateMode, StoreError, ANY_VERSION, SEQUENCE_WIDTH};

#[derive(Debug)]
struct Node {
    value: Vec<u8>,
    version: i32,
    owner: Option<u64>,
    next_sequence: u64,
}

impl Node {
    fn new(value: Vec<u8>, owner: Option<u64>) -> Self {
        Self {
            value,
            version: 0,
            owner,
            next_sequence: 0,
        }
    }
}

#[derive(Debug)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    next_session: u64,
    expired: HashSet<u64>,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::new(Vec::new(), None));
        Self {
            nodes,
            next_session: 1,
            expired: HashSet::new(),
        }
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        self.nodes
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect()
    }

    fn check_version(&self, path: &str, version: i32) -> Result<(), StoreError> {
        let node = self.nodes.get(path).ok_or_else(|| StoreError::NoNode {
            path: path.to_string(),
        })?;
        if version != ANY_VERSION && node.version != version {
            return Err(StoreError::BadVersion {
                path: path.to_string(),
                expected: version,
                actual: node.version,
            });
        }
        Ok(())
    }
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rsplit_once('/') {
        Some(("", _)) => Some("/"),
        Some((parent, _)) => Some(parent),
        None => None,
    }
}

/// Session handle onto a shared in-memory node tree
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    tree: Arc<Mutex<Tree>>,
    session: u64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tree: Arc::new(Mutex::new(Tree::new())),
            session: 0,
        }
    }

    /// Open another session on the same tree
    pub async fn new_session(&self) -> InMemoryStore {
        let mut tree = self.tree.lock().await;
        let session = tree.next_session;
        tree.next_session += 1;
        InMemoryStore {
            tree: Arc::clone(&self.tree),
            session,
        }
    }

    /// End this session: its ephemeral nodes vanish and later calls fail
    pub async fn expire(&self) {
        let mut tree = self.tree.lock().await;
        let owned: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(self.session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &owned {
            tree.nodes.remove(path);
        }
        tree.expired.insert(self.session);
        debug!(session = self.session, removed = owned.len(), "Expired coordination session");
    }

    /// Every node path currently in the tree
    pub async fn paths(&self) -> Vec<String> {
        self.tree.lock().await.nodes.keys().cloned().collect()
    }

    fn ensure_live(&self, tree: &Tree) -> Result<(), StoreError> {
        if tree.expired.contains(&self.session) {
            Err(StoreError::SessionExpired)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    async fn create(&self, path: &str, value: &[u8], mode: CreateMode) -> Result<String, StoreError> {
        let mut tree = self.tree.lock().await;
        self.ensure_live(&tree)?;

        let parent = parent_of(path)
            .ok_or_else(|| StoreError::NodeExists {
                path: path.to_string(),
            })?
            .to_string();

        if !tree.nodes.contains_key(&parent) {
            if !mode.makepath {
                return Err(StoreError::NoNode { path: parent });
            }
            let mut missing = Vec::new();
            let mut cursor = Some(parent.as_str());
            while let Some(p) = cursor {
                if tree.nodes.contains_key(p) {
                    break;
                }
                missing.push(p.to_string());
                cursor = parent_of(p);
            }
            for p in missing.into_iter().rev() {
                tree.nodes.insert(p, Node::new(Vec::new(), None));
            }
        }

        let actual = if mode.sequence {
            let parent_node = tree.nodes.get_mut(&parent).ok_or_else(|| StoreError::NoNode {
                path: parent.clone(),
            })?;
            let counter = parent_node.next_sequence;
            parent_node.next_sequence += 1;
            format!("{path}{counter:0width$}", width = SEQUENCE_WIDTH)
        } else {
            path.to_string()
        };

        if tree.nodes.contains_key(&actual) {
            return Err(StoreError::NodeExists { path: actual });
        }

        let owner = mode.ephemeral.then_some(self.session);
        tree.nodes.insert(actual.clone(), Node::new(value.to_vec(), owner));
        Ok(actual)
    }

    async fn get(&self, path: &str) -> Result<(Vec<u8>, i32), StoreError> {
        let tree = self.tree.lock().await;
        self.ensure_live(&tree)?;
        tree.nodes
            .get(path)
            .map(|node| (node.value.clone(), node.version))
            .ok_or_else(|| StoreError::NoNode {
                path: path.to_string(),
            })
    }

    async fn set(&self, path: &str, value: &[u8], version: i32) -> Result<i32, StoreError> {
        let mut tree = self.tree.lock().await;
        self.ensure_live(&tree)?;
        tree.check_version(path, version)?;
        let node = tree.nodes.get_mut(path).ok_or_else(|| StoreError::NoNode {
            path: path.to_string(),
        })?;
        node.value = value.to_vec();
        node.version += 1;
        Ok(node.version)
    }

    async fn delete(&self, path: &str, version: i32) -> Result<(), StoreError> {
        let mut tree = self.tree.lock().await;
        self.ensure_live(&tree)?;
        tree.check_version(path, version)?;
        if !tree.children(path).is_empty() {
            return Err(StoreError::NotEmpty {
                path: path.to_string(),
            });
        }
        tree.nodes.remove(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<Option<i32>, StoreError> {
        let tree = self.tree.lock().await;
        self.ensure_live(&tree)?;
        Ok(tree.nodes.get(path).map(|node| node.version))
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let tree = self.tree.lock().await;
        self.ensure_live(&tree)?;
        if !tree.nodes.contains_key(path) {
            return Err(StoreError::NoNode {
                path: path.to_string(),
            });
        }
        Ok(tree.children(path))
    }
}
