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

//! The shadow tree a write transaction collects its changes into (spec §3,
//! §4.1). Shadow nodes lazily mirror the original tree: a stem's children are
//! only materialised in the shadow the first time something walks into it,
//! and a mirrored node's scalar value is only copied over on first write so
//! an uncommitted change never leaks into a read through the shadow.

use crate::arena::Arena;
use crate::error::{CfgError, CfgResult};
use crate::node::{validate_name, Node, NodeId, NodeType, ScalarValue};
use crate::tree::Tree;

pub struct ShadowTree {
    pub(crate) arena: Arena<Node>,
    pub(crate) root: NodeId,
    pub tree_name: String,
}

impl ShadowTree {
    /// Begins shadowing `original`. Only the root is materialised; everything
    /// else mirrors lazily as the transaction walks into it.
    pub fn new(original: &Tree) -> Self {
        let mut arena = Arena::new();
        let orig_root = original.node(original.root());
        let mut root_node = Node::new_root();
        root_node.shadow_of = Some(original.root());
        root_node.populated = false;
        root_node.value_written = false;
        if let Some(orig_root) = orig_root {
            root_node.kind = orig_root.kind;
        }
        let root = arena.insert(root_node);
        ShadowTree { arena, root, tree_name: original.name.clone() }
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

    /// Materialises `parent`'s children the first time something walks into
    /// it: one shadow child per original child, inheriting the original's
    /// type but not its value.
    fn populate(&mut self, original: &Tree, parent: NodeId) {
        let (populated, shadow_of, kind) = match self.node(parent) {
            Some(n) => (n.populated, n.shadow_of, n.kind),
            None => return,
        };
        if populated {
            return;
        }
        if matches!(kind, NodeType::Stem) {
            if let Some(orig_id) = shadow_of {
                let orig_children: Vec<(NodeId, String, NodeType)> = original
                    .node(orig_id)
                    .map(|n| {
                        n.children
                            .iter()
                            .filter_map(|c| original.node(*c).map(|cn| (*c, cn.name.clone(), cn.kind)))
                            .collect()
                    })
                    .unwrap_or_default();
                for (orig_child_id, name, child_kind) in orig_children {
                    let mut child = Node::new_child(name, parent);
                    child.kind = child_kind;
                    child.shadow_of = Some(orig_child_id);
                    child.populated = false;
                    child.value_written = false;
                    let id = self.arena.insert(child);
                    if let Some(p) = self.node_mut(parent) {
                        p.children.push(id);
                    }
                }
            }
        }
        if let Some(n) = self.node_mut(parent) {
            n.populated = true;
        }
    }

    /// Re-links a shadow node to its original by name under `parent`, used
    /// when merge discovers the back-reference was lost (spec §4.1 step 1).
    fn relink(&mut self, original: &Tree, parent_original: NodeId, shadow_id: NodeId) {
        let name = self.node(shadow_id).map(|n| n.name.clone());
        if let Some(name) = name {
            if let Some(orig_id) = original.find_child(parent_original, &name) {
                if let Some(n) = self.node_mut(shadow_id) {
                    n.shadow_of = Some(orig_id);
                }
            }
        }
    }

    pub fn active_children(&mut self, original: &Tree, parent: NodeId) -> Vec<NodeId> {
        self.populate(original, parent);
        self.node(parent)
            .map(|n| n.children.iter().copied().filter(|c| !self.is_deleted(*c)).collect())
            .unwrap_or_default()
    }

    /// All children including tombstones, for the raw (non-active) navigation
    /// variants (spec §4.3).
    pub fn all_children(&mut self, original: &Tree, parent: NodeId) -> Vec<NodeId> {
        self.populate(original, parent);
        self.node(parent).map(|n| n.children.clone()).unwrap_or_default()
    }

    fn is_deleted(&self, id: NodeId) -> bool {
        self.node(id).map(|n| n.deleted).unwrap_or(true)
    }

    pub fn find_child(&mut self, original: &Tree, parent: NodeId, name: &str) -> Option<NodeId> {
        self.populate(original, parent);
        self.node(parent)?
            .children
            .iter()
            .copied()
            .find(|c| self.node(*c).map(|c| c.name == name && !c.deleted).unwrap_or(false))
    }

    /// Finds or lazily creates `name` under `parent`. A brand new child (one
    /// with no original counterpart) starts tombstoned so an aborted
    /// transaction leaves no trace (spec §3).
    pub fn get_or_create_child(
        &mut self,
        original: &Tree,
        parent: NodeId,
        name: &str,
        max_name_len: usize,
    ) -> CfgResult<NodeId> {
        validate_name(name, max_name_len)?;
        self.populate(original, parent);
        let existing = self
            .node(parent)
            .ok_or(CfgError::NotFound)?
            .children
            .iter()
            .copied()
            .find(|c| self.node(*c).map(|c| c.name == name).unwrap_or(false));
        if let Some(id) = existing {
            return Ok(id);
        }
        let mut child = Node::new_child(name.to_owned(), parent);
        child.deleted = true;
        child.populated = true;
        child.value_written = true;
        let id = self.arena.insert(child);
        if let Some(p) = self.node_mut(parent) {
            p.children.push(id);
        }
        Ok(id)
    }

    pub fn get_value_as<T: ScalarValue>(&self, original: &Tree, id: NodeId, default: T) -> T {
        let node = match self.node(id) {
            Some(n) => n,
            None => return default,
        };
        if node.deleted {
            return default;
        }
        if node.value_written {
            T::from_node(node.kind, &node.value, default)
        } else if let Some(orig_id) = node.shadow_of {
            match original.node(orig_id) {
                Some(orig) => T::from_node(node.kind, &orig.value, default),
                None => default,
            }
        } else {
            T::from_node(node.kind, &node.value, default)
        }
    }

    /// Writes a scalar value, un-tombstoning this node (ancestors are
    /// un-tombstoned separately by the caller, which owns the parent chain
    /// walk — see `Iterator::write_as`).
    pub fn set_value_as<T: crate::node::ScalarValue + crate::node::ScalarValueKind>(
        &mut self,
        id: NodeId,
        v: T,
    ) -> CfgResult<()> {
        let node = self.node_mut(id).ok_or(CfgError::NotFound)?;
        node.set_value_as(v);
        node.value_written = true;
        node.deleted = false;
        Ok(())
    }

    pub fn set_empty(&mut self, id: NodeId) -> CfgResult<()> {
        let node = self.node_mut(id).ok_or(CfgError::NotFound)?;
        node.set_empty_in_place();
        node.value_written = true;
        node.deleted = false;
        Ok(())
    }

    /// Tombstones `id` (and, transitively, merge ignores its children once
    /// the parent is marked). The root is never tombstoned, only emptied.
    pub fn delete(&mut self, id: NodeId) -> CfgResult<()> {
        if id == self.root {
            return self.set_empty(id);
        }
        let node = self.node_mut(id).ok_or(CfgError::NotFound)?;
        node.deleted = true;
        node.modified = true;
        Ok(())
    }

    pub fn rename(&mut self, original: &Tree, id: NodeId, new_name: &str, max_name_len: usize) -> CfgResult<()> {
        if id == self.root {
            return Err(CfgError::BadName("the root node cannot be renamed".into()));
        }
        validate_name(new_name, max_name_len)?;
        let parent = self.node(id).and_then(|n| n.parent).ok_or(CfgError::NotFound)?;
        if self.find_child(original, parent, new_name).is_some() {
            return Err(CfgError::Duplicate);
        }
        let node = self.node_mut(id).ok_or(CfgError::NotFound)?;
        node.rename(new_name.to_owned());
        node.deleted = false;
        Ok(())
    }

    /// Un-tombstones `id` and every ancestor up to the root, used after a
    /// successful write to make the freshly auto-created path durable
    /// (spec §4.3's lazy node creation).
    pub fn untombstone_ancestors(&mut self, mut id: NodeId) {
        loop {
            let parent = match self.node_mut(id) {
                Some(n) => {
                    n.deleted = false;
                    n.parent
                }
                None => return,
            };
            match parent {
                Some(p) => id = p,
                None => return,
            }
        }
    }

    /// Allows `relink` to be exercised by the merge pass without exposing the
    /// whole module privately.
    pub(crate) fn relink_if_needed(&mut self, original: &Tree, parent_original: NodeId, shadow_id: NodeId) {
        let lost = self.node(shadow_id).map(|n| n.shadow_of.is_none()).unwrap_or(false);
        if lost {
            self.relink(original, parent_original, shadow_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeType;

    #[test]
    fn read_before_write_falls_through_to_original() {
        let mut t = Tree::new_empty("app1".into(), 64);
        let root = t.root();
        let svc = t.create_child(root, "svc").unwrap();
        t.node_mut(svc).unwrap().set_value_as(80i64);

        let mut shadow = ShadowTree::new(&t);
        let sroot = shadow.root();
        let s_svc = shadow.find_child(&t, sroot, "svc").unwrap();
        assert_eq!(shadow.get_value_as::<i64>(&t, s_svc, -1), 80);
    }

    #[test]
    fn write_then_cancel_leaves_original_untouched() {
        let mut t = Tree::new_empty("app1".into(), 64);
        let root = t.root();
        let svc = t.create_child(root, "svc").unwrap();
        t.node_mut(svc).unwrap().set_value_as(80i64);

        let mut shadow = ShadowTree::new(&t);
        let sroot = shadow.root();
        let s_svc = shadow.find_child(&t, sroot, "svc").unwrap();
        shadow.set_value_as(s_svc, 443i64).unwrap();
        assert_eq!(shadow.get_value_as::<i64>(&t, s_svc, -1), 443);
        // original is unaffected until merge
        assert_eq!(t.node(svc).unwrap().get_value_as::<i64>(-1), 80);
    }

    #[test]
    fn new_child_starts_tombstoned() {
        let t = Tree::new_empty("app1".into(), 64);
        let mut shadow = ShadowTree::new(&t);
        let sroot = shadow.root();
        let child = shadow.get_or_create_child(&t, sroot, "new", 64).unwrap();
        assert!(shadow.node(child).unwrap().deleted);
        assert_eq!(shadow.active_children(&t, sroot), Vec::<NodeId>::new());
        shadow.set_value_as(child, 1i64).unwrap();
        assert!(!shadow.node(child).unwrap().deleted);
        assert_eq!(shadow.active_children(&t, sroot), vec![child]);
    }

    #[test]
    fn delete_tombstones_but_does_not_affect_original() {
        let mut t = Tree::new_empty("app1".into(), 64);
        let root = t.root();
        let svc = t.create_child(root, "svc").unwrap();
        t.node_mut(svc).unwrap().set_value_as(80i64);

        let mut shadow = ShadowTree::new(&t);
        let sroot = shadow.root();
        let s_svc = shadow.find_child(&t, sroot, "svc").unwrap();
        shadow.delete(s_svc).unwrap();
        assert_eq!(shadow.active_children(&t, sroot), Vec::<NodeId>::new());
        assert!(t.find_child(root, "svc").is_some());
    }

    #[test]
    fn kind_is_mirrored_without_copying_value() {
        let mut t = Tree::new_empty("app1".into(), 64);
        let root = t.root();
        let svc = t.create_child(root, "svc").unwrap();
        t.node_mut(svc).unwrap().set_value_as(80i64);
        let mut shadow = ShadowTree::new(&t);
        let sroot = shadow.root();
        let s_svc = shadow.find_child(&t, sroot, "svc").unwrap();
        assert_eq!(shadow.node(s_svc).unwrap().kind, NodeType::Int);
        assert_eq!(shadow.node(s_svc).unwrap().value, "");
    }
}
