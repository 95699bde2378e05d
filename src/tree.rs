/*
 * Created on Thu Jan 02 2025
 *
 * This file is a part of cfgtreed
 * cfgtreed is a persistent, hierarchical configuration store for
 * multi-process devices written to let clients publish, read and update
 * typed settings in a tree of named nodes, transactionally, with
 * change-notification for watchers of any path.
 *
 * Copyright (c) 2025, Config Tree Daemon Contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! The in-memory tree store (spec §4.1, C1) and its concurrency bookkeeping
//! (spec §3's Tree lifecycle, consumed by the registry and scheduler).

use crate::arena::Arena;
use crate::error::{CfgError, CfgResult};
use crate::ids::IteratorId;
use crate::node::{validate_name, Node, NodeId, NodeType};

/// One of the three rotating on-disk snapshots a tree persists to (spec §4.1).
/// `Unknown` means nothing has been loaded or written yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revision {
    Unknown,
    Paper,
    Rock,
    Scissors,
}

impl Revision {
    pub fn file_suffix(self) -> Option<&'static str> {
        match self {
            Self::Unknown => None,
            Self::Paper => Some("paper"),
            Self::Rock => Some("rock"),
            Self::Scissors => Some("scissors"),
        }
    }

    /// "paper -> rock -> scissors -> paper" (spec §4.1). `Unknown` rotates to
    /// `Paper`, giving a fresh tree its first revision.
    pub fn next(self) -> Self {
        match self {
            Self::Unknown => Self::Paper,
            Self::Paper => Self::Rock,
            Self::Rock => Self::Scissors,
            Self::Scissors => Self::Paper,
        }
    }
}

pub const MAX_TREE_NAME_LEN: usize = 57;

/// The tree's exclusive write slot (spec §3 Tree: "a current write-iterator
/// reference (at most one)"). `closed` distinguishes an iterator still being
/// actively written to from one whose owner has already called commit and is
/// now only parked waiting for readers to drain (spec §4.3's `Closed` state);
/// a parked commit no longer blocks new `CreateWriteTxn` admission the way an
/// `Open` writer does, but it still holds the slot until it actually merges.
#[derive(Debug, Clone, Copy)]
pub struct WriterSlot {
    pub iter: IteratorId,
    pub closed: bool,
}

/// A named, persistent, in-memory hierarchical configuration store.
pub struct Tree {
    pub name: String,
    pub(crate) arena: Arena<Node>,
    pub(crate) root: NodeId,
    pub revision: Revision,
    pub(crate) reader_count: u32,
    /// The single write iterator currently open on this tree, if any.
    pub(crate) writer: Option<WriterSlot>,
    pub delete_pending: bool,
    pub(crate) max_name_len: usize,
}

impl Tree {
    pub fn new_empty(name: String, max_name_len: usize) -> Self {
        let mut arena = Arena::new();
        let root = arena.insert(Node::new_root());
        Tree {
            name,
            arena,
            root,
            revision: Revision::Unknown,
            reader_count: 0,
            writer: None,
            delete_pending: false,
            max_name_len,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.arena.get(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.arena.get_mut(id)
    }

    /// Active (non-tombstoned) children of `parent`, in order. Plain trees
    /// never contain `Deleted` nodes, but the check is kept so the same logic
    /// can be shared with shadow trees if needed.
    pub fn active_children(&self, parent: NodeId) -> Vec<NodeId> {
        self.node(parent)
            .map(|n| {
                n.children
                    .iter()
                    .copied()
                    .filter(|c| {
                        self.node(*c)
                            .map(|c| !matches!(c.kind, NodeType::Deleted))
                            .unwrap_or(false)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn find_child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.node(parent)?.children.iter().copied().find(|c| {
            self.node(*c)
                .map(|c| c.name == name && !matches!(c.kind, NodeType::Deleted))
                .unwrap_or(false)
        })
    }

    pub fn create_child(&mut self, parent: NodeId, name: &str) -> CfgResult<NodeId> {
        validate_name(name, self.max_name_len)?;
        if self.find_child(parent, name).is_some() {
            return Err(CfgError::Duplicate);
        }
        let id = self.arena.insert(Node::new_child(name.to_owned(), parent));
        if let Some(p) = self.node_mut(parent) {
            p.children.push(id);
        }
        Ok(id)
    }

    /// Renames a node, validating the new name and sibling uniqueness (spec
    /// §4.1). The root may never be renamed.
    pub fn rename_node(&mut self, id: NodeId, new_name: &str) -> CfgResult<()> {
        if id == self.root {
            return Err(CfgError::BadName("the root node cannot be renamed".into()));
        }
        validate_name(new_name, self.max_name_len)?;
        let parent = self.node(id).and_then(|n| n.parent).ok_or(CfgError::NotFound)?;
        if self.find_child(parent, new_name).is_some() {
            return Err(CfgError::Duplicate);
        }
        let node = self.node_mut(id).ok_or(CfgError::NotFound)?;
        node.rename(new_name.to_owned());
        Ok(())
    }

    /// Recursively frees a node and its descendants immediately (no tombstone
    /// phase outside of shadow trees). The root is only ever emptied.
    pub fn delete_node(&mut self, id: NodeId) {
        if id == self.root {
            if let Some(root) = self.node_mut(self.root) {
                root.set_empty_in_place();
            }
            return;
        }
        let children = self.node(id).map(|n| n.children.clone()).unwrap_or_default();
        for child in children {
            self.delete_node(child);
        }
        let parent = self.node(id).and_then(|n| n.parent);
        if let Some(p) = parent {
            if let Some(p) = self.node_mut(p) {
                p.children.retain(|c| *c != id);
            }
        }
        self.arena.remove(id);
    }

    pub fn set_empty(&mut self, id: NodeId) -> CfgResult<()> {
        let children = self.node(id).map(|n| n.children.clone()).unwrap_or_default();
        for child in children {
            self.delete_node(child);
        }
        self.node_mut(id).ok_or(CfgError::NotFound)?.set_empty_in_place();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_find_and_rename_children() {
        let mut t = Tree::new_empty("t".into(), 64);
        let root = t.root();
        let a = t.create_child(root, "a").unwrap();
        assert_eq!(t.find_child(root, "a"), Some(a));
        assert!(t.create_child(root, "a").is_err());
        t.rename_node(a, "b").unwrap();
        assert_eq!(t.find_child(root, "b"), Some(a));
        assert_eq!(t.find_child(root, "a"), None);
    }

    #[test]
    fn root_cannot_be_renamed_but_can_be_emptied() {
        let mut t = Tree::new_empty("t".into(), 64);
        let root = t.root();
        assert!(t.rename_node(root, "x").is_err());
        t.create_child(root, "a").unwrap();
        t.set_empty(root).unwrap();
        assert_eq!(t.active_children(root), Vec::new());
    }

    #[test]
    fn delete_is_recursive_and_frees_immediately() {
        let mut t = Tree::new_empty("t".into(), 64);
        let root = t.root();
        let a = t.create_child(root, "a").unwrap();
        let b = t.create_child(a, "b").unwrap();
        t.delete_node(a);
        assert_eq!(t.find_child(root, "a"), None);
        assert!(t.node(b).is_none());
    }
}
