//! In-memory tree of watch nodes mirroring the watched directory structure.
//!
//! Nodes live in an arena keyed by a stable integer id that is never reused
//! for the lifetime of the process, so a stale id can never resolve to an
//! unrelated node after the kernel recycles a handle. Parents are ids, not
//! references; children are an ordered id list spliced on removal.

use std::{
	collections::HashMap,
	path::{Path, PathBuf},
};

use tracing::trace;

use crate::pump::WatchHandle;

pub type NodeId = u64;

#[derive(Debug)]
pub struct WatchNode {
	pub handle: WatchHandle,
	pub parent: Option<NodeId>,
	pub path: PathBuf,
	children: Vec<NodeId>,
}

impl WatchNode {
	pub fn children(&self) -> &[NodeId] {
		&self.children
	}
}

/// What happened when a freshly registered handle was offered to the tree.
#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
	Inserted(NodeId),
	/// Another live node already owns this kernel identity and both paths
	/// resolve to the same real location: an intentional alias, the new
	/// watch is redundant.
	Alias { existing: NodeId },
	/// Another live node owns this kernel identity under a conflicting
	/// path. The bookkeeping no longer matches the kernel; the caller must
	/// treat the tree as corrupt.
	Corrupt { existing: NodeId },
}

#[derive(Debug, Default)]
pub struct WatchTree {
	nodes: HashMap<NodeId, WatchNode>,
	// Kernel identity (canonical watched path) -> owning node. One entry
	// per live handle, removed before the node is freed.
	by_handle: HashMap<PathBuf, NodeId>,
	by_path: HashMap<PathBuf, NodeId>,
	next_id: NodeId,
}

impl WatchTree {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.nodes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.nodes.is_empty()
	}

	pub fn node(&self, id: NodeId) -> Option<&WatchNode> {
		self.nodes.get(&id)
	}

	pub fn node_at(&self, path: &Path) -> Option<NodeId> {
		self.by_path.get(path).copied()
	}

	pub fn insert(
		&mut self,
		parent: Option<NodeId>,
		path: PathBuf,
		handle: WatchHandle,
	) -> InsertOutcome {
		if let Some(&existing) = self.by_handle.get(handle.canonical()) {
			let existing_path = &self.nodes[&existing].path;
			return if *existing_path == path {
				InsertOutcome::Corrupt { existing }
			} else {
				trace!(
					path = %path.display(),
					existing = %existing_path.display(),
					"Watch handle aliases an already-watched path;"
				);
				InsertOutcome::Alias { existing }
			};
		}

		let id = self.next_id;
		self.next_id += 1;

		self.by_handle.insert(handle.canonical().to_path_buf(), id);
		self.by_path.insert(path.clone(), id);

		if let Some(parent_id) = parent {
			if let Some(parent_node) = self.nodes.get_mut(&parent_id) {
				parent_node.children.push(id);
			}
		}

		self.nodes.insert(id, WatchNode {
			handle,
			parent,
			path,
			children: Vec::new(),
		});

		InsertOutcome::Inserted(id)
	}

	/// Removes a node and every descendant, splicing the subtree out of its
	/// parent. Handles leave the lookup tables before their nodes are
	/// dropped and are returned for the caller to release with the pump.
	pub fn remove_subtree(&mut self, id: NodeId) -> Vec<WatchHandle> {
		let Some(root) = self.nodes.get(&id) else {
			return Vec::new();
		};

		if let Some(parent_id) = root.parent {
			if let Some(parent) = self.nodes.get_mut(&parent_id) {
				parent.children.retain(|&child| child != id);
			}
		}

		let mut handles = Vec::new();
		let mut stack = vec![id];
		while let Some(current) = stack.pop() {
			if let Some(node) = self.nodes.remove(&current) {
				stack.extend(&node.children);
				self.by_handle.remove(node.handle.canonical());
				self.by_path.remove(&node.path);
				handles.push(node.handle);
			}
		}

		handles
	}

	/// Ids of every live node, root-set teardown helper.
	pub fn node_ids(&self) -> Vec<NodeId> {
		self.nodes.keys().copied().collect()
	}

	#[cfg(test)]
	fn assert_invariants(&self) {
		assert_eq!(self.by_handle.len(), self.nodes.len());
		assert_eq!(self.by_path.len(), self.nodes.len());

		for (id, node) in &self.nodes {
			match node.parent {
				Some(parent_id) => {
					let parent = self
						.nodes
						.get(&parent_id)
						.expect("parent of a live node must be live");
					assert!(
						parent.children.contains(id),
						"node missing from its parent's children"
					);
				}
				None => {}
			}

			for child in &node.children {
				assert_eq!(self.nodes[child].parent, Some(*id));
			}
		}
	}
}
