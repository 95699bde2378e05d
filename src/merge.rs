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

//! Shadow-tree merge (spec §4.1) and the change-notification firing rules it
//! drives (spec §4.2). Keeping both in one module matches the spec's framing:
//! "merge also drives change-notifications" — there is no separate pass.

use crate::node::{name_hash, NodeId, NodeType};
use crate::notify::{canonical_key, NotifyEngine};
use crate::shadow::ShadowTree;
use crate::tree::Tree;
use std::collections::HashSet;

fn path_to_str(path: &[String]) -> String {
    if path.is_empty() {
        "/".to_owned()
    } else {
        format!("/{}", path.join("/"))
    }
}

/// Merges `shadow` into `original`, firing the registrations it touches along
/// the way. Consumes the shadow tree — once merged, it has nothing left to
/// contribute (cancel would instead just drop it unmerged).
pub fn merge(original: &mut Tree, mut shadow: ShadowTree, notify: &mut NotifyEngine) {
    let tree_name = shadow.tree_name.clone();
    let sroot = shadow.root();
    let oroot = original.root();
    let mut path: Vec<String> = Vec::new();

    let root_modified = shadow.node(sroot).map(|n| n.modified).unwrap_or(false);
    if root_modified {
        fire_lost_children(&tree_name, &mut path, original, &mut shadow, sroot, oroot, notify);
        if shadow.active_children(original, sroot).is_empty() {
            let _ = original.set_empty(oroot);
        } else if let Some(o) = original.node_mut(oroot) {
            o.modified = false;
        }
    }

    let mut child_modified = false;
    let children: Vec<NodeId> = shadow.node(sroot).map(|n| n.children.clone()).unwrap_or_default();
    for c in children {
        child_modified =
            merge_child(&tree_name, &mut path, original, &mut shadow, c, oroot, false, notify)
                || child_modified;
    }
    if root_modified || child_modified {
        notify.mark_triggered(&canonical_key(&tree_name, "/"));
    }
}

/// Merges one shadow node (`shadow_id`, a child of `original_parent` once
/// merged) into `original`. Returns whether this node or any descendant was
/// modified, for the caller's own firing decision.
fn merge_child(
    tree_name: &str,
    path: &mut Vec<String>,
    original: &mut Tree,
    shadow: &mut ShadowTree,
    shadow_id: NodeId,
    original_parent: NodeId,
    force_fire: bool,
    notify: &mut NotifyEngine,
) -> bool {
    // Step 1: rediscover a lost original back-reference by name.
    shadow.relink_if_needed(original, original_parent, shadow_id);

    let (name, is_deleted, shadow_of, is_modified, new_kind, new_value, is_stem) = {
        let n = shadow
            .node(shadow_id)
            .expect("shadow node referenced by its own parent must exist");
        (
            n.name.clone(),
            n.deleted,
            n.shadow_of,
            n.modified,
            n.kind,
            n.value.clone(),
            matches!(n.kind, NodeType::Stem),
        )
    };

    let renamed = shadow_of
        .and_then(|o| original.node(o))
        .map(|on| on.name != name)
        .unwrap_or(false);
    let force_fire = force_fire || renamed;

    // Step 2: tombstoned shadow node -> release the original subtree, firing
    // for everything about to disappear, and stop recursing.
    if is_deleted {
        if let Some(orig_id) = shadow_of {
            path.push(name.clone());
            fire_all_descendants(tree_name, path, original, orig_id, notify);
            path.pop();
            original.delete_node(orig_id);
        }
        if is_modified || force_fire {
            path.push(name);
            notify.mark_triggered(&canonical_key(tree_name, &path_to_str(path)));
            path.pop();
        }
        return true;
    }

    // Step 3: find or create the corresponding original node.
    let original_id = match shadow_of.filter(|id| original.node(*id).is_some()) {
        Some(id) => id,
        None => original
            .create_child(original_parent, &name)
            .expect("name was already validated when the shadow node was created"),
    };

    path.push(name.clone());

    // A modified stem whose live child set shrank loses some descendants;
    // fire those before the value/type copy below changes anything.
    if is_modified && is_stem {
        fire_lost_children(tree_name, path, original, shadow, shadow_id, original_id, notify);
    }

    if is_modified {
        let becomes_empty = matches!(new_kind, NodeType::Empty)
            || (is_stem && shadow.active_children(original, shadow_id).is_empty());
        let type_changed = original
            .node(original_id)
            .map(|o| o.kind != new_kind)
            .unwrap_or(true);
        if let Some(o) = original.node_mut(original_id) {
            o.modified = false;
            o.name = name.clone();
            o.name_hash = name_hash(&name);
            if is_stem {
                o.kind = new_kind;
                o.value.clear();
            } else if becomes_empty || type_changed {
                o.kind = new_kind;
                o.value = if becomes_empty { String::new() } else { new_value.clone() };
            } else {
                o.value = new_value.clone();
            }
        }
    }

    // Step 5: recurse into shadow children.
    let mut child_modified = false;
    if is_stem {
        let children: Vec<NodeId> = shadow.node(shadow_id).map(|n| n.children.clone()).unwrap_or_default();
        for c in children {
            child_modified = merge_child(
                tree_name,
                path,
                original,
                shadow,
                c,
                original_id,
                force_fire,
                notify,
            ) || child_modified;
        }
    }

    if is_modified || force_fire || child_modified {
        notify.mark_triggered(&canonical_key(tree_name, &path_to_str(path)));
    }

    path.pop();
    is_modified || child_modified
}

/// Fires the registration for `id` and every descendant (spec §4.2's
/// "FireAllChildren" case: a whole original subtree is about to be
/// overwritten or dropped).
fn fire_all_descendants(
    tree_name: &str,
    path: &mut Vec<String>,
    original: &Tree,
    id: NodeId,
    notify: &mut NotifyEngine,
) {
    notify.mark_triggered(&canonical_key(tree_name, &path_to_str(path)));
    let children = original.node(id).map(|n| n.children.clone()).unwrap_or_default();
    for c in children {
        let name = original.node(c).map(|n| n.name.clone()).unwrap_or_default();
        path.push(name);
        fire_all_descendants(tree_name, path, original, c, notify);
        path.pop();
    }
}

/// Fires for any original child of `original_id` whose name no longer
/// appears among `shadow_id`'s live (non-tombstoned) children — those
/// descendants are about to be lost when the stem's new child set replaces
/// the old one (spec §4.2).
fn fire_lost_children(
    tree_name: &str,
    path: &mut Vec<String>,
    original: &mut Tree,
    shadow: &mut ShadowTree,
    shadow_id: NodeId,
    original_id: NodeId,
    notify: &mut NotifyEngine,
) {
    let live_names: HashSet<String> = shadow
        .active_children(original, shadow_id)
        .into_iter()
        .filter_map(|c| shadow.node(c).map(|n| n.name.clone()))
        .collect();
    let original_children: Vec<NodeId> =
        original.node(original_id).map(|n| n.children.clone()).unwrap_or_default();
    for oc in original_children {
        let (name, lost) = match original.node(oc) {
            Some(n) => (n.name.clone(), !live_names.contains(&n.name)),
            None => continue,
        };
        if lost {
            path.push(name);
            fire_all_descendants(tree_name, path, original, oc, notify);
            path.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SessionId;

    fn sid() -> SessionId {
        uuid::Uuid::new_v4()
    }

    fn build_app1() -> Tree {
        let mut t = Tree::new_empty("app1".into(), 64);
        let root = t.root();
        let svc = t.create_child(root, "svc").unwrap();
        t.node_mut(svc).unwrap().set_value_as(80i64);
        t
    }

    #[test]
    fn commit_updates_original_and_fires_exactly_once() {
        let mut original = build_app1();
        let mut notify = NotifyEngine::new();
        use std::cell::RefCell;
        use std::rc::Rc;
        let calls = Rc::new(RefCell::new(0));
        let calls2 = calls.clone();
        notify.add_handler("app1", "app1:/svc", sid(), Box::new(move || *calls2.borrow_mut() += 1));

        let mut shadow = ShadowTree::new(&original);
        let sroot = shadow.root();
        let s_svc = shadow.find_child(&original, sroot, "svc").unwrap();
        shadow.set_value_as(s_svc, 443i64).unwrap();

        merge(&mut original, shadow, &mut notify);
        notify.fire_triggered();

        let root = original.root();
        let svc = original.find_child(root, "svc").unwrap();
        assert_eq!(original.node(svc).unwrap().get_value_as::<i64>(-1), 443);
        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn handler_does_not_fire_on_untouched_path() {
        let mut original = build_app1();
        let mut notify = NotifyEngine::new();
        notify.add_handler("app1", "app1:/other", sid(), Box::new(|| panic!("should not fire")));

        let mut shadow = ShadowTree::new(&original);
        let sroot = shadow.root();
        let s_svc = shadow.find_child(&original, sroot, "svc").unwrap();
        shadow.set_value_as(s_svc, 1i64).unwrap();

        merge(&mut original, shadow, &mut notify);
        notify.fire_triggered();
    }

    #[test]
    fn deleting_a_node_fires_its_former_registration() {
        let mut original = build_app1();
        let mut notify = NotifyEngine::new();
        use std::cell::RefCell;
        use std::rc::Rc;
        let fired = Rc::new(RefCell::new(false));
        let fired2 = fired.clone();
        notify.add_handler("app1", "app1:/svc", sid(), Box::new(move || *fired2.borrow_mut() = true));

        let mut shadow = ShadowTree::new(&original);
        let sroot = shadow.root();
        let s_svc = shadow.find_child(&original, sroot, "svc").unwrap();
        shadow.delete(s_svc).unwrap();

        merge(&mut original, shadow, &mut notify);
        notify.fire_triggered();

        assert!(*fired.borrow());
        let root = original.root();
        assert_eq!(original.find_child(root, "svc"), None);
    }

    #[test]
    fn new_node_is_created_on_merge() {
        let mut original = Tree::new_empty("app1".into(), 64);
        let mut notify = NotifyEngine::new();
        let mut shadow = ShadowTree::new(&original);
        let sroot = shadow.root();
        let child = shadow.get_or_create_child(&original, sroot, "fresh", 64).unwrap();
        shadow.set_value_as(child, "hi".to_owned()).unwrap();

        merge(&mut original, shadow, &mut notify);

        let root = original.root();
        let fresh = original.find_child(root, "fresh").unwrap();
        assert_eq!(original.node(fresh).unwrap().get_value_as::<String>("".into()), "hi");
    }
}
