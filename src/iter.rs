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

//! Positioned cursor over a (possibly shadow) tree (spec §4.3, C3).
//!
//! A read iterator walks the original tree directly. A write iterator owns a
//! [`ShadowTree`] for the lifetime of the transaction; `commit` hands that
//! shadow to `merge::merge`, `cancel` just drops it.

use crate::collab::{split_tree_qualifier, PathSplitter};
use crate::error::{CfgError, CfgResult};
use crate::ids::{IteratorId, SessionId};
use crate::node::{EffectiveType, NodeId, ScalarValue, ScalarValueKind};
use crate::shadow::ShadowTree;
use crate::tree::Tree;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterMode {
    Read,
    Write,
}

/// `Open -> Closed -> Released` per spec §4.3. `Terminated` (the `terminated`
/// flag) is orthogonal: a fatal fault killed the owning session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterState {
    Open,
    Closed,
    Released,
}

pub type CursorHandle = IteratorId;

enum Backing {
    Read,
    Write(ShadowTree),
}

pub struct CursorIterator {
    pub session: SessionId,
    pub tree_name: String,
    pub mode: IterMode,
    pub state: IterState,
    pub terminated: bool,
    pub max_name_len: usize,
    pub max_path_len: usize,
    path: Vec<String>,
    current: Option<NodeId>,
    backing: Backing,
    deadline: Option<Instant>,
}

impl CursorIterator {
    pub fn new_read(
        session: SessionId,
        original: &Tree,
        max_name_len: usize,
        max_path_len: usize,
        timeout_secs: u64,
    ) -> Self {
        CursorIterator {
            session,
            tree_name: original.name.clone(),
            mode: IterMode::Read,
            state: IterState::Open,
            terminated: false,
            max_name_len,
            max_path_len,
            path: Vec::new(),
            current: Some(original.root()),
            backing: Backing::Read,
            deadline: deadline_from(timeout_secs),
        }
    }

    pub fn new_write(
        session: SessionId,
        original: &Tree,
        max_name_len: usize,
        max_path_len: usize,
        timeout_secs: u64,
    ) -> Self {
        let shadow = ShadowTree::new(original);
        let root = shadow.root();
        CursorIterator {
            session,
            tree_name: original.name.clone(),
            mode: IterMode::Write,
            state: IterState::Open,
            terminated: false,
            max_name_len,
            max_path_len,
            path: Vec::new(),
            current: Some(root),
            backing: Backing::Write(shadow),
            deadline: deadline_from(timeout_secs),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    pub fn terminate(&mut self) {
        self.terminated = true;
    }

    pub fn close(&mut self) {
        self.state = IterState::Closed;
    }

    pub fn release(&mut self) {
        self.state = IterState::Released;
    }

    /// Hands off the accumulated shadow tree to the caller (commit). Only
    /// meaningful for write iterators; `None` for read iterators.
    pub fn into_shadow(self) -> Option<ShadowTree> {
        match self.backing {
            Backing::Write(s) => Some(s),
            Backing::Read => None,
        }
    }

    fn require_not_terminated(&self) -> CfgResult<()> {
        if self.terminated {
            Err(CfgError::Fault("operation attempted on a terminated session".into()))
        } else {
            Ok(())
        }
    }

    /// Navigates to `path`, which may be absolute or relative to the
    /// iterator's current position. A tree-qualified path (`other:/x`) is a
    /// fatal protocol violation once the iterator already belongs to a tree
    /// (spec §4.3, scenario S3).
    pub fn go_to(&mut self, original: &Tree, path: &str, splitter: &dyn PathSplitter) -> CfgResult<()> {
        self.require_not_terminated()?;
        if split_tree_qualifier(path).0.is_some() {
            return Err(CfgError::Fault(
                "Can not change trees in the middle of a transaction".into(),
            ));
        }
        let (absolute, parts) = splitter.split(path);
        let mut new_path = if absolute { Vec::new() } else { self.path.clone() };
        for part in parts {
            if part == ".." {
                if new_path.is_empty() {
                    return Err(CfgError::Underflow);
                }
                new_path.pop();
            } else {
                new_path.push(part);
            }
        }
        let buffer_len: usize = 1 + new_path.iter().map(|p| p.len() + 1).sum::<usize>();
        if buffer_len > self.max_path_len {
            return Err(CfgError::Overflow);
        }
        let node = self.resolve_path(original, &new_path);
        self.path = new_path;
        self.current = node;
        Ok(())
    }

    pub fn go_to_parent(&mut self, original: &Tree) -> CfgResult<()> {
        self.require_not_terminated()?;
        if self.path.is_empty() {
            return Err(CfgError::NotFound);
        }
        self.path.pop();
        self.current = self.resolve_path(original, &self.path.clone());
        Ok(())
    }

    pub fn go_to_first_child(&mut self, original: &Tree, active_only: bool) -> CfgResult<()> {
        self.require_not_terminated()?;
        let cur = self.current.ok_or(CfgError::NotFound)?;
        let children = self.children_of(original, cur, active_only);
        let first = *children.first().ok_or(CfgError::NotFound)?;
        let name = self.name_of(original, first).unwrap_or_default();
        self.path.push(name);
        self.current = Some(first);
        Ok(())
    }

    pub fn go_to_next_sibling(&mut self, original: &Tree, active_only: bool) -> CfgResult<()> {
        self.require_not_terminated()?;
        let cur = self.current.ok_or(CfgError::NotFound)?;
        if self.path.is_empty() {
            return Err(CfgError::NotFound);
        }
        let parent = self.parent_of(original, cur).ok_or(CfgError::NotFound)?;
        let siblings = self.children_of(original, parent, active_only);
        let idx = siblings.iter().position(|&id| id == cur).ok_or(CfgError::NotFound)?;
        let next = *siblings.get(idx + 1).ok_or(CfgError::NotFound)?;
        let name = self.name_of(original, next).unwrap_or_default();
        self.path.pop();
        self.path.push(name);
        self.current = Some(next);
        Ok(())
    }

    pub fn effective_type(&mut self, original: &Tree) -> EffectiveType {
        let cur = match self.current {
            Some(c) => c,
            None => return EffectiveType::DoesNotExist,
        };
        match &mut self.backing {
            Backing::Read => {
                let has_children = !original.active_children(cur).is_empty();
                original
                    .node(cur)
                    .map(|n| n.effective_type(has_children))
                    .unwrap_or(EffectiveType::DoesNotExist)
            }
            Backing::Write(shadow) => {
                let has_children = !shadow.active_children(original, cur).is_empty();
                shadow
                    .node(cur)
                    .map(|n| n.effective_type(has_children))
                    .unwrap_or(EffectiveType::DoesNotExist)
            }
        }
    }

    /// `true` when the current position is an empty stem or a valueless
    /// scalar (spec §3, §4.1) — one of the three required node inspections
    /// alongside `effective_type`/position-name.
    pub fn is_empty(&mut self, original: &Tree) -> bool {
        matches!(self.effective_type(original), EffectiveType::Empty)
    }

    pub fn read_as<T: ScalarValue>(&self, original: &Tree, default: T) -> T {
        let cur = match self.current {
            Some(c) => c,
            None => return default,
        };
        match &self.backing {
            Backing::Read => original
                .node(cur)
                .map(|n| n.get_value_as(default.clone()))
                .unwrap_or(default),
            Backing::Write(shadow) => shadow.get_value_as(original, cur, default),
        }
    }

    /// Writes a scalar at the current position, auto-creating any missing
    /// ancestors along `self.path` (spec §4.3, "lazy node creation").
    pub fn write_as<T: ScalarValue + ScalarValueKind>(&mut self, original: &Tree, v: T) -> CfgResult<()> {
        self.require_not_terminated()?;
        let max_name_len = self.max_name_len;
        let id = self.ensure_current(original, max_name_len)?;
        let shadow = self.shadow_mut()?;
        shadow.set_value_as(id, v)?;
        shadow.untombstone_ancestors(id);
        Ok(())
    }

    pub fn set_empty(&mut self, original: &Tree) -> CfgResult<()> {
        self.require_not_terminated()?;
        let max_name_len = self.max_name_len;
        let id = self.ensure_current(original, max_name_len)?;
        let shadow = self.shadow_mut()?;
        shadow.set_empty(id)?;
        shadow.untombstone_ancestors(id);
        Ok(())
    }

    /// Tombstones the current node. Deleting an absent node is a no-op, not
    /// an error (spec §8, property 5).
    pub fn delete(&mut self) -> CfgResult<()> {
        self.require_not_terminated()?;
        let id = match self.current {
            Some(id) => id,
            None => return Ok(()),
        };
        self.shadow_mut()?.delete(id)
    }

    pub fn rename(&mut self, original: &Tree, new_name: &str) -> CfgResult<()> {
        self.require_not_terminated()?;
        let id = self.current.ok_or(CfgError::NotFound)?;
        let max_name_len = self.max_name_len;
        self.shadow_mut()?.rename(original, id, new_name, max_name_len)?;
        if let Some(last) = self.path.last_mut() {
            *last = new_name.to_owned();
        }
        Ok(())
    }

    fn shadow_mut(&mut self) -> CfgResult<&mut ShadowTree> {
        match &mut self.backing {
            Backing::Write(s) => Ok(s),
            Backing::Read => Err(CfgError::Fault("write attempted on a read iterator".into())),
        }
    }

    fn ensure_current(&mut self, original: &Tree, max_name_len: usize) -> CfgResult<NodeId> {
        if let Some(id) = self.current {
            return Ok(id);
        }
        let path = self.path.clone();
        let shadow = self.shadow_mut()?;
        let mut cur = shadow.root();
        for part in &path {
            cur = shadow.get_or_create_child(original, cur, part, max_name_len)?;
        }
        self.current = Some(cur);
        Ok(cur)
    }

    fn resolve_path(&mut self, original: &Tree, path: &[String]) -> Option<NodeId> {
        match &mut self.backing {
            Backing::Read => {
                let mut cur = original.root();
                for part in path {
                    cur = original.find_child(cur, part)?;
                }
                Some(cur)
            }
            Backing::Write(shadow) => {
                let mut cur = shadow.root();
                for part in path {
                    cur = shadow.find_child(original, cur, part)?;
                }
                Some(cur)
            }
        }
    }

    fn children_of(&mut self, original: &Tree, id: NodeId, active_only: bool) -> Vec<NodeId> {
        match &mut self.backing {
            Backing::Read => {
                if active_only {
                    original.active_children(id)
                } else {
                    original.node(id).map(|n| n.children.clone()).unwrap_or_default()
                }
            }
            Backing::Write(shadow) => {
                if active_only {
                    shadow.active_children(original, id)
                } else {
                    shadow.all_children(original, id)
                }
            }
        }
    }

    fn parent_of(&self, original: &Tree, id: NodeId) -> Option<NodeId> {
        match &self.backing {
            Backing::Read => original.node(id)?.parent(),
            Backing::Write(shadow) => shadow.node(id)?.parent(),
        }
    }

    fn name_of(&self, original: &Tree, id: NodeId) -> Option<String> {
        match &self.backing {
            Backing::Read => original.node(id).map(|n| n.name().to_owned()),
            Backing::Write(shadow) => shadow.node(id).map(|n| n.name().to_owned()),
        }
    }
}

fn deadline_from(timeout_secs: u64) -> Option<Instant> {
    if timeout_secs == 0 {
        None
    } else {
        Some(Instant::now() + Duration::from_secs(timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::SlashPathSplitter;

    fn session() -> SessionId {
        uuid::Uuid::new_v4()
    }

    fn sample() -> Tree {
        let mut t = Tree::new_empty("app1".into(), 64);
        let root = t.root();
        let svc = t.create_child(root, "svc").unwrap();
        t.node_mut(svc).unwrap().set_value_as(80i64);
        t
    }

    #[test]
    fn read_iterator_navigates_and_reads() {
        let t = sample();
        let mut it = CursorIterator::new_read(session(), &t, 64, 512, 0);
        let splitter = SlashPathSplitter;
        it.go_to(&t, "/svc", &splitter).unwrap();
        assert_eq!(it.read_as::<i64>(&t, -1), 80);
    }

    #[test]
    fn freshly_opened_read_iterator_is_positioned_at_root() {
        let t = sample();
        let mut it = CursorIterator::new_read(session(), &t, 64, 512, 0);
        assert_eq!(it.effective_type(&t), EffectiveType::Stem);
        it.go_to_first_child(&t, true).unwrap();
        assert_eq!(it.read_as::<i64>(&t, -1), 80);
    }

    #[test]
    fn go_to_parent_underflows_at_root() {
        let t = sample();
        let mut it = CursorIterator::new_read(session(), &t, 64, 512, 0);
        assert!(matches!(it.go_to_parent(&t), Err(CfgError::NotFound)));
    }

    #[test]
    fn write_iterator_autocreates_missing_path() {
        let t = sample();
        let mut it = CursorIterator::new_write(session(), &t, 64, 512, 0);
        let splitter = SlashPathSplitter;
        it.go_to(&t, "/svc/timeout", &splitter).unwrap();
        it.write_as(&t, 30i64).unwrap();
        assert_eq!(it.read_as::<i64>(&t, -1), 30);
    }

    #[test]
    fn tree_crossing_path_is_fatal() {
        let t = sample();
        let mut it = CursorIterator::new_read(session(), &t, 64, 512, 0);
        let splitter = SlashPathSplitter;
        let err = it.go_to(&t, "system:/foo", &splitter).unwrap_err();
        assert!(err.is_session_fatal());
    }

    #[test]
    fn deleting_absent_node_is_a_no_op() {
        let t = sample();
        let mut it = CursorIterator::new_write(session(), &t, 64, 512, 0);
        let splitter = SlashPathSplitter;
        it.go_to(&t, "/does/not/exist", &splitter).unwrap();
        assert!(it.delete().is_ok());
    }
}
