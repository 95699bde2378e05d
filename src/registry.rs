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

//! Named-tree registry (spec §4.4, C4): the root of trust for per-tree
//! concurrency state — reader count, writer slot, and (via `scheduler`) the
//! blocked-request queue all key off the tree name this module owns.

use crate::error::{CfgError, CfgResult};
use crate::node::validate_name;
use crate::persist;
use crate::tree::{Tree, MAX_TREE_NAME_LEN};
use std::collections::HashMap;
use std::path::PathBuf;

pub struct TreeRegistry {
    trees: HashMap<String, Tree>,
    data_dir: PathBuf,
    max_name_len: usize,
    max_string_len: usize,
}

impl TreeRegistry {
    pub fn new(data_dir: PathBuf, max_name_len: usize, max_string_len: usize) -> Self {
        TreeRegistry { trees: HashMap::new(), data_dir, max_name_len, max_string_len }
    }

    /// Returns the tree named `name`, loading it from disk (or creating it
    /// empty) the first time it's asked for (spec §4.4). If loading truncated
    /// an oversized stored string to `max_string_len`, the tree is still
    /// inserted (so later accesses see the truncated-but-usable value) but
    /// this call reports `CfgError::Overflow` (spec §4.1, spec.md:74/186).
    pub fn get_tree(&mut self, name: &str) -> CfgResult<&mut Tree> {
        validate_name(name, MAX_TREE_NAME_LEN)?;
        let mut just_loaded_overflow = false;
        if !self.trees.contains_key(name) {
            let (tree, overflow) =
                persist::load_or_create(&self.data_dir, name, self.max_name_len, self.max_string_len)?;
            just_loaded_overflow = overflow;
            self.trees.insert(name.to_owned(), tree);
        }
        let tree = self.trees.get_mut(name).expect("just inserted");
        if just_loaded_overflow {
            return Err(CfgError::Overflow);
        }
        Ok(tree)
    }

    pub fn peek_tree(&self, name: &str) -> Option<&Tree> {
        self.trees.get(name)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.trees.contains_key(name)
    }

    /// Frees a tree immediately if it has no open iterators or queued
    /// requests, otherwise marks it delete-pending for release on last close
    /// (spec §4.4). The caller (scheduler) is responsible for knowing whether
    /// iterators/queue are empty; this just applies the decision.
    pub fn delete_tree(&mut self, name: &str, busy: bool) -> CfgResult<()> {
        if let Some(tree) = self.trees.get_mut(name) {
            if busy {
                tree.delete_pending = true;
                return Ok(());
            }
            self.trees.remove(name);
        }
        persist::unlink_all_revisions(&self.data_dir, name);
        Ok(())
    }

    /// Re-evaluated whenever an iterator releases (spec §4.4): if `name` is
    /// delete-pending and now idle, finish removing it.
    pub fn reap_if_delete_pending(&mut self, name: &str, busy: bool) {
        let pending = self.trees.get(name).map(|t| t.delete_pending).unwrap_or(false);
        if pending && !busy {
            self.trees.remove(name);
            persist::unlink_all_revisions(&self.data_dir, name);
        }
    }

    pub fn loaded_names(&self) -> Vec<String> {
        self.trees.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tmp_dir(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("cfgtreed-registry-test-{tag}-{:p}", &tag));
        let _ = fs::create_dir_all(&p);
        p
    }

    #[test]
    fn get_tree_creates_on_first_access() {
        let dir = tmp_dir("create");
        let mut reg = TreeRegistry::new(dir, 64, 4096);
        assert!(!reg.is_loaded("app1"));
        reg.get_tree("app1").unwrap();
        assert!(reg.is_loaded("app1"));
    }

    #[test]
    fn get_tree_rejects_bad_names() {
        let dir = tmp_dir("badname");
        let mut reg = TreeRegistry::new(dir, 64, 4096);
        assert!(reg.get_tree("has/slash").is_err());
    }

    #[test]
    fn delete_tree_marks_pending_when_busy() {
        let dir = tmp_dir("pending");
        let mut reg = TreeRegistry::new(dir, 64, 4096);
        reg.get_tree("app1").unwrap();
        reg.delete_tree("app1", true).unwrap();
        assert!(reg.peek_tree("app1").unwrap().delete_pending);
        reg.reap_if_delete_pending("app1", false);
        assert!(reg.peek_tree("app1").is_none());
    }

    #[test]
    fn get_tree_reports_overflow_once_on_first_load_of_an_oversized_value() {
        let dir = tmp_dir("overflow");
        let mut reg = TreeRegistry::new(dir.clone(), 64, 5);
        {
            let mut setup = TreeRegistry::new(dir, 64, 4096);
            let tree = setup.get_tree("app1").unwrap();
            let root = tree.root();
            let k = tree.create_child(root, "k").unwrap();
            tree.node_mut(k).unwrap().set_value_as("hello world".to_owned());
            crate::persist::save(&setup.data_dir, tree).unwrap();
        }

        assert!(matches!(reg.get_tree("app1"), Err(CfgError::Overflow)));
        // the truncated tree is still loaded and usable on the next access.
        let tree = reg.get_tree("app1").unwrap();
        let k = tree.find_child(tree.root(), "k").unwrap();
        assert_eq!(tree.node(k).unwrap().get_value_as::<String>("".into()), "hello");
    }
}
