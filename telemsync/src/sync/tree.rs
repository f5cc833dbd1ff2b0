use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::paths::{PathError, segments};

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("folder listing has no root folder")]
    MissingRoot,
    #[error("folder listing has more than one root folder: {first} and {second}")]
    MultipleRoots { first: String, second: String },
    #[error("{parent} already has a child named {name}")]
    DuplicateChild { parent: String, name: String },
    #[error("path error: {0}")]
    Path(#[from] PathError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderRecord {
    pub name: String,
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone)]
pub struct FolderNode {
    pub name: String,
    pub remote_id: String,
    pub parent_id: String,
    parent: Option<NodeId>,
    children: HashMap<String, NodeId>,
    path: PathBuf,
}

impl FolderNode {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn child(&self, name: &str) -> Option<NodeId> {
        self.children.get(name).copied()
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.children.iter().map(|(name, id)| (name.as_str(), *id))
    }
}

#[derive(Debug, Clone)]
pub struct FolderTree {
    nodes: Vec<FolderNode>,
    root: NodeId,
}

impl FolderTree {
    pub fn build(records: impl IntoIterator<Item = FolderRecord>) -> Result<Self, TreeError> {
        let mut root: Option<FolderRecord> = None;
        let mut by_parent: HashMap<String, Vec<FolderRecord>> = HashMap::new();
        let mut total = 0usize;

        for record in records {
            total += 1;
            match record.parent_id.clone() {
                None => {
                    if let Some(existing) = &root {
                        return Err(TreeError::MultipleRoots {
                            first: existing.name.clone(),
                            second: record.name,
                        });
                    }
                    root = Some(record);
                }
                Some(parent) => by_parent.entry(parent).or_default().push(record),
            }
        }

        let root = root.ok_or(TreeError::MissingRoot)?;
        let mut tree = Self {
            nodes: vec![FolderNode {
                path: PathBuf::from(&root.name),
                name: root.name,
                remote_id: root.id,
                parent_id: String::new(),
                parent: None,
                children: HashMap::new(),
            }],
            root: NodeId(0),
        };

        let mut to_visit = vec![tree.root];
        while let Some(current) = to_visit.pop() {
            let Some(children) = by_parent.remove(&tree.node(current).remote_id) else {
                continue;
            };
            for child in children {
                match tree.attach(current, child.name, child.id) {
                    Ok(id) => to_visit.push(id),
                    Err(err) => warn!(%err, "skipping duplicate folder"),
                }
            }
        }

        let unreachable: usize = by_parent.values().map(Vec::len).sum();
        if unreachable > 0 {
            warn!(
                unreachable,
                "ignoring folders that are not reachable from the root"
            );
        }
        debug!(
            total,
            attached = tree.nodes.len(),
            root = %tree.node(tree.root).name,
            "folder tree built"
        );
        Ok(tree)
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &FolderNode {
        &self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn lookup(&self, path: &Path) -> Option<&FolderNode> {
        self.lookup_id(path).map(|id| self.node(id))
    }

    pub fn lookup_id(&self, path: &Path) -> Option<NodeId> {
        let parts = match segments(path) {
            Ok(parts) => parts,
            Err(err) => {
                warn!(%err, "cannot resolve folder path");
                return None;
            }
        };
        let mut current = self.root;
        for part in parts {
            match self.node(current).child(part) {
                Some(next) => current = next,
                None => {
                    debug!(
                        folder = %self.node(current).path.display(),
                        missing = part,
                        "folder does not exist"
                    );
                    return None;
                }
            }
        }
        Some(current)
    }

    pub fn longest_existing_prefix(&self, path: &Path) -> Result<PathBuf, PathError> {
        let mut current = self.root;
        let mut existing = PathBuf::new();
        for part in segments(path)? {
            let Some(next) = self.node(current).child(part) else {
                break;
            };
            existing.push(part);
            current = next;
        }
        Ok(existing)
    }

    pub(crate) fn attach(
        &mut self,
        parent: NodeId,
        name: String,
        remote_id: String,
    ) -> Result<NodeId, TreeError> {
        let parent_node = &self.nodes[parent.0];
        if parent_node.children.contains_key(&name) {
            return Err(TreeError::DuplicateChild {
                parent: parent_node.path.display().to_string(),
                name,
            });
        }
        let id = NodeId(self.nodes.len());
        let node = FolderNode {
            path: parent_node.path.join(&name),
            parent_id: parent_node.remote_id.clone(),
            name: name.clone(),
            remote_id,
            parent: Some(parent),
            children: HashMap::new(),
        };
        self.nodes.push(node);
        self.nodes[parent.0].children.insert(name, id);
        Ok(id)
    }

    pub fn records(&self) -> Vec<FolderRecord> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut to_visit = vec![self.root];
        while let Some(current) = to_visit.pop() {
            let node = self.node(current);
            out.push(FolderRecord {
                name: node.name.clone(),
                id: node.remote_id.clone(),
                parent_id: node.parent.map(|_| node.parent_id.clone()),
            });
            to_visit.extend(node.children.values().copied());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, id: &str, parent: Option<&str>) -> FolderRecord {
        FolderRecord {
            name: name.to_string(),
            id: id.to_string(),
            parent_id: parent.map(str::to_string),
        }
    }

    fn sample() -> FolderTree {
        FolderTree::build(vec![
            record("csv", "c1", Some("t1")),
            record("shared", "root", None),
            record("ibt", "i1", Some("t1")),
            record("telemetry", "t1", Some("root")),
            record("setups", "s1", Some("root")),
        ])
        .unwrap()
    }

    fn ancestor_path(tree: &FolderTree, mut id: NodeId) -> PathBuf {
        let mut names = Vec::new();
        loop {
            let node = tree.node(id);
            names.push(node.name.clone());
            match node.parent() {
                Some(parent) => id = parent,
                None => break,
            }
        }
        names.iter().rev().collect()
    }

    #[test]
    fn build_sets_materialized_paths_from_ancestors() {
        let tree = sample();
        assert_eq!(tree.len(), 5);
        for (_, id) in tree.node(tree.root()).children() {
            assert_eq!(tree.node(id).path(), ancestor_path(&tree, id));
        }
        let ibt = tree.lookup(Path::new("telemetry/ibt")).unwrap();
        assert_eq!(ibt.path(), Path::new("shared/telemetry/ibt"));
        assert_eq!(ibt.parent_id, "t1");
        assert_eq!(tree.node(tree.root()).path(), Path::new("shared"));
    }

    #[test]
    fn every_node_path_matches_ancestor_chain_in_deep_tree() {
        let mut records = vec![record("root", "r", None)];
        for depth in 0..50 {
            let parent = if depth == 0 {
                "r".to_string()
            } else {
                format!("n{}", depth - 1)
            };
            records.push(record(&format!("d{depth}"), &format!("n{depth}"), Some(&parent)));
            records.push(record("leaf", &format!("l{depth}"), Some(&parent)));
        }
        let tree = FolderTree::build(records).unwrap();
        assert_eq!(tree.len(), 101);
        let mut to_visit = vec![tree.root()];
        while let Some(id) = to_visit.pop() {
            assert_eq!(tree.node(id).path(), ancestor_path(&tree, id));
            to_visit.extend(tree.node(id).children().map(|(_, child)| child));
        }
    }

    #[test]
    fn lookup_misses_are_not_errors() {
        let tree = sample();
        assert!(tree.lookup(Path::new("telemetry/ibt/driverA")).is_none());
        assert!(tree.lookup(Path::new("nope")).is_none());
        assert_eq!(tree.lookup(Path::new("")).unwrap().remote_id, "root");
    }

    #[test]
    fn longest_existing_prefix_stops_at_first_missing_segment() {
        let tree = sample();
        assert_eq!(
            tree.longest_existing_prefix(Path::new("telemetry/ibt/driverA/x"))
                .unwrap(),
            PathBuf::from("telemetry/ibt")
        );
        assert_eq!(
            tree.longest_existing_prefix(Path::new("missing/ibt")).unwrap(),
            PathBuf::new()
        );
    }

    #[test]
    fn build_requires_exactly_one_root() {
        assert!(matches!(
            FolderTree::build(vec![record("a", "a", Some("x"))]),
            Err(TreeError::MissingRoot)
        ));
        assert!(matches!(
            FolderTree::build(vec![record("a", "a", None), record("b", "b", None)]),
            Err(TreeError::MultipleRoots { .. })
        ));
    }

    #[test]
    fn unreachable_folders_are_dropped() {
        let tree = FolderTree::build(vec![
            record("root", "r", None),
            record("orphan", "o", Some("elsewhere")),
            record("child-of-orphan", "co", Some("o")),
        ])
        .unwrap();
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn duplicate_sibling_names_keep_the_first() {
        let tree = FolderTree::build(vec![
            record("root", "r", None),
            record("csv", "c1", Some("r")),
            record("csv", "c2", Some("r")),
        ])
        .unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.lookup(Path::new("csv")).unwrap().remote_id, "c1");
    }

    #[test]
    fn records_list_parents_before_children() {
        let tree = sample();
        let records = tree.records();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].parent_id, None);
        for (index, record) in records.iter().enumerate().skip(1) {
            let parent = record.parent_id.as_deref().unwrap();
            assert!(records[..index].iter().any(|r| r.id == parent));
        }
        let rebuilt = FolderTree::build(records).unwrap();
        assert_eq!(rebuilt.len(), tree.len());
    }
}
