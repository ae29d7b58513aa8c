//! Last-run snapshot persistence.
//!
//! Every discover run dumps `{args, tree}` as JSON so `sextant export` can
//! re-render without re-discovering. Children are re-nested through
//! `NodeDump`; a visited set keyed on handle identity breaks the sharing
//! (and occasional cycles) the child cache introduces, so a dump always
//! terminates. Round-trip is lossless for the node fields.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use types::{Node, NodeHandle, Tree};

use crate::settings::DiscoverySettings;

pub const LASTRUN_FILE: &str = ".lastrun.json";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("unable to access snapshot {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("malformed snapshot {path}: {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },
}

/// A `Node` with its children re-nested for serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDump {
    #[serde(flatten)]
    pub node: Node,
    #[serde(default)]
    pub children: BTreeMap<String, NodeDump>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub args: DiscoverySettings,
    pub tree: BTreeMap<String, NodeDump>,
}

impl Snapshot {
    pub fn capture(settings: &DiscoverySettings, tree: &Tree) -> Self {
        let mut seen = HashSet::new();
        Self {
            args: settings.clone(),
            tree: dump_tree(tree, &mut seen),
        }
    }

    /// Rebuild the live tree of shared handles.
    pub fn restore(&self) -> (DiscoverySettings, Tree) {
        (self.args.clone(), restore_tree(&self.tree))
    }

    pub fn dump(&self, path: impl AsRef<Path>) -> Result<(), SnapshotError> {
        let path = path.as_ref();
        let json = serde_json::to_string(self).map_err(|e| SnapshotError::Json {
            path: path.display().to_string(),
            source: e,
        })?;
        std::fs::write(path, json).map_err(|e| SnapshotError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        debug!(path = %path.display(), "dumped discovery snapshot");
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| SnapshotError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        serde_json::from_str(&text).map_err(|e| SnapshotError::Json {
            path: path.display().to_string(),
            source: e,
        })
    }
}

fn dump_tree(tree: &Tree, seen: &mut HashSet<usize>) -> BTreeMap<String, NodeDump> {
    let mut dumped = BTreeMap::new();
    for (ref_, handle) in tree {
        dumped.insert(ref_.clone(), dump_node(handle, seen));
    }
    dumped
}

fn dump_node(handle: &NodeHandle, seen: &mut HashSet<usize>) -> NodeDump {
    let key = Arc::as_ptr(handle) as usize;
    let node = handle.read().clone();
    let children = if seen.insert(key) {
        dump_tree(&node.children, seen)
    } else {
        // Already dumped elsewhere in the walk; cut the branch here.
        BTreeMap::new()
    };
    NodeDump { node, children }
}

fn restore_tree(dumps: &BTreeMap<String, NodeDump>) -> Tree {
    let mut tree = Tree::new();
    for (ref_, dump) in dumps {
        let mut node = dump.node.clone();
        node.children = restore_tree(&dump.children);
        tree.insert(ref_.clone(), node.into_handle());
    }
    tree
}
