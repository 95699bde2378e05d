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

//! Triple-revision atomic on-disk persistence (spec §4.1 "Revision rotation",
//! §6 on-disk layout, §8 properties 2 and 4).

use crate::error::{CfgError, CfgResult};
use crate::persist::format;
use crate::tree::{Revision, Tree};
use std::fs;
use std::path::{Path, PathBuf};

const REVISIONS: [Revision; 3] = [Revision::Paper, Revision::Rock, Revision::Scissors];

fn path_for(data_dir: &Path, name: &str, rev: Revision) -> PathBuf {
    data_dir.join(format!("{name}.{}", rev.file_suffix().expect("non-Unknown revision")))
}

/// Of two present (necessarily consecutive) revisions, the older one is
/// whichever one's `.next()` is the other — the survivor of a crash between
/// writing the new file and unlinking the old one.
fn older_in_cycle(a: Revision, b: Revision) -> Revision {
    if a.next() == b {
        a
    } else {
        b
    }
}

/// Loads `name` from whichever revision file(s) are present, or creates a
/// fresh empty tree if none are (spec §4.4's "loading it from disk on first
/// access"). Zero-byte files are treated as nonexistent and unlinked.
/// `max_string_len` bounds the size of a parsed string value (spec §4.1); the
/// returned `bool` is `true` if any value had to be truncated to fit, so the
/// caller can surface `CfgError::Overflow`.
pub fn load_or_create(
    data_dir: &Path,
    name: &str,
    max_name_len: usize,
    max_string_len: usize,
) -> CfgResult<(Tree, bool)> {
    fs::create_dir_all(data_dir)?;
    let mut present = Vec::new();
    for rev in REVISIONS {
        let path = path_for(data_dir, name, rev);
        match fs::metadata(&path) {
            Ok(meta) if meta.len() == 0 => {
                let _ = fs::remove_file(&path);
            }
            Ok(_) => present.push(rev),
            Err(_) => {}
        }
    }
    let chosen = match present.len() {
        0 => {
            return Ok((Tree::new_empty(name.to_owned(), max_name_len), false));
        }
        1 => present[0],
        _ => older_in_cycle(present[0], present[1]),
    };
    let path = path_for(data_dir, name, chosen);
    let text = fs::read_to_string(&path)?;
    let (mut tree, overflow) = format::parse_tree(name.to_owned(), max_name_len, &text, max_string_len)?;
    tree.revision = chosen;
    Ok((tree, overflow))
}

/// Writes the next revision in the cycle and, on success, unlinks the
/// previous one. On I/O failure the partially-written new file is removed
/// and the previous revision is kept — the in-memory merge still stands, it
/// just hasn't made it to disk yet (spec §7).
pub fn save(data_dir: &Path, tree: &mut Tree) -> CfgResult<()> {
    fs::create_dir_all(data_dir)?;
    let previous = tree.revision;
    let next = previous.next();
    let path = path_for(data_dir, &tree.name, next);
    let text = format::serialize_tree(tree);
    match fs::write(&path, text) {
        Ok(()) => {
            if let Some(suffix) = previous.file_suffix() {
                let _ = fs::remove_file(data_dir.join(format!("{}.{suffix}", tree.name)));
            }
            tree.revision = next;
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&path);
            Err(CfgError::from(e))
        }
    }
}

pub fn unlink_all_revisions(data_dir: &Path, name: &str) {
    for rev in REVISIONS {
        let _ = fs::remove_file(path_for(data_dir, name, rev));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tmp_dir(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("cfgtreed-revision-test-{tag}"));
        let _ = fs::remove_dir_all(&p);
        fs::create_dir_all(&p).unwrap();
        p
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tmp_dir("roundtrip");
        let mut t = Tree::new_empty("app1".into(), 64);
        let root = t.root();
        let k = t.create_child(root, "k").unwrap();
        t.node_mut(k).unwrap().set_value_as(1i64);
        save(&dir, &mut t).unwrap();
        assert_eq!(t.revision, Revision::Paper);

        let (loaded, overflow) = load_or_create(&dir, "app1", 64, 4096).unwrap();
        assert!(!overflow);
        let lk = loaded.find_child(loaded.root(), "k").unwrap();
        assert_eq!(loaded.node(lk).unwrap().get_value_as::<i64>(-1), 1);
    }

    #[test]
    fn crash_between_write_and_unlink_recovers_previous_revision() {
        let dir = tmp_dir("crash");
        let mut t = Tree::new_empty("app1".into(), 64);
        let root = t.root();
        let k = t.create_child(root, "k").unwrap();
        t.node_mut(k).unwrap().set_value_as(1i64);
        save(&dir, &mut t).unwrap(); // app1.paper now holds {k: 1}

        // Simulate a second commit writing app1.rock but crashing before
        // unlinking app1.paper: write the rock file by hand, leave paper.
        t.node_mut(k).unwrap().set_value_as(2i64);
        let text = format::serialize_tree(&t);
        fs::write(dir.join("app1.rock"), text).unwrap();

        let (loaded, overflow) = load_or_create(&dir, "app1", 64, 4096).unwrap();
        assert!(!overflow);
        let lk = loaded.find_child(loaded.root(), "k").unwrap();
        assert_eq!(loaded.node(lk).unwrap().get_value_as::<i64>(-1), 1);
    }

    #[test]
    fn zero_byte_file_is_treated_as_nonexistent() {
        let dir = tmp_dir("zerobyte");
        fs::write(dir.join("app1.paper"), "").unwrap();
        let (loaded, overflow) = load_or_create(&dir, "app1", 64, 4096).unwrap();
        assert!(!overflow);
        assert_eq!(loaded.revision, Revision::Unknown);
        assert!(!dir.join("app1.paper").exists());
    }

    #[test]
    fn oversized_stored_value_is_flagged_using_the_configured_limit() {
        let dir = tmp_dir("oversized");
        let mut t = Tree::new_empty("app1".into(), 64);
        let root = t.root();
        let k = t.create_child(root, "k").unwrap();
        t.node_mut(k).unwrap().set_value_as("hello world".to_owned());
        save(&dir, &mut t).unwrap();

        let (loaded, overflow) = load_or_create(&dir, "app1", 64, 5).unwrap();
        assert!(overflow);
        let lk = loaded.find_child(loaded.root(), "k").unwrap();
        assert_eq!(loaded.node(lk).unwrap().get_value_as::<String>("".into()), "hello");
    }
}
