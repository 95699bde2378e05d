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

//! Snapshot of the set of known trees, for admin enumeration (spec §4.7, C7).
//! Taken once at creation — loaded trees unioned with file-backed ones found
//! on disk — and never refreshed afterward.

use crate::error::{CfgError, CfgResult};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

pub struct TreeIterator {
    names: Vec<String>,
    pos: Option<usize>,
}

impl TreeIterator {
    /// `loaded_names` comes from the registry (`TreeRegistry::loaded_names`);
    /// `data_dir` is scanned for `*.paper|*.rock|*.scissors` files whose stem
    /// isn't already in that set. Any other file extension is ignored and
    /// logged at debug (spec §4.7 supplement).
    pub fn new(data_dir: &Path, loaded_names: impl IntoIterator<Item = String>) -> Self {
        let mut names: BTreeSet<String> = loaded_names.into_iter().collect();
        if let Ok(entries) = fs::read_dir(data_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                match (path.file_stem(), path.extension()) {
                    (Some(stem), Some(ext)) if matches!(ext.to_str(), Some("paper" | "rock" | "scissors")) => {
                        names.insert(stem.to_string_lossy().into_owned());
                    }
                    _ => {
                        log::debug!("ignoring non-revision file in tree directory: {}", path.display());
                    }
                }
            }
        }
        let names: Vec<String> = names.into_iter().collect();
        let pos = if names.is_empty() { None } else { Some(0) };
        TreeIterator { names, pos }
    }

    pub fn current(&self) -> CfgResult<&str> {
        self.pos
            .and_then(|i| self.names.get(i))
            .map(String::as_str)
            .ok_or(CfgError::NotFound)
    }

    pub fn next(&mut self) -> CfgResult<()> {
        match self.pos {
            Some(i) if i + 1 < self.names.len() => {
                self.pos = Some(i + 1);
                Ok(())
            }
            _ => {
                self.pos = None;
                Err(CfgError::NotFound)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tmp_dir(tag: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("cfgtreed-treelist-test-{tag}"));
        let _ = fs::remove_dir_all(&p);
        fs::create_dir_all(&p).unwrap();
        p
    }

    #[test]
    fn unions_loaded_and_file_backed_names_sorted_and_deduped() {
        let dir = tmp_dir("union");
        fs::write(dir.join("app1.paper"), "~").unwrap();
        fs::write(dir.join("app2.rock"), "~").unwrap();
        fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let it = TreeIterator::new(&dir, vec!["app1".to_owned(), "zeta".to_owned()]);
        assert_eq!(it.current().unwrap(), "app1");
        let mut it = it;
        assert!(it.next().is_ok());
        assert_eq!(it.current().unwrap(), "app2");
        assert!(it.next().is_ok());
        assert_eq!(it.current().unwrap(), "zeta");
        assert!(it.next().is_err());
        assert!(it.current().is_err());
    }

    #[test]
    fn empty_snapshot_is_immediately_exhausted() {
        let dir = tmp_dir("empty");
        let it = TreeIterator::new(&dir, Vec::<String>::new());
        assert!(it.current().is_err());
    }
}
