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

//! Seams for the collaborators spec.md §1 names as deliberately out of scope:
//! the RPC dispatch glue, the user/permission lookup subsystem, and the
//! path-iterator string utility. The core only ever talks to these through the
//! traits below; a real daemon wires in whatever implementation fronts the
//! wire protocol and the on-device ACL database.

use crate::error::CfgResult;

/// A capability identifying the user on whose behalf a request runs. Opaque to
/// the core beyond its name, which is used both for own-tree access and as the
/// ACL lookup key (spec §6).
pub trait User: Clone + std::fmt::Debug {
    fn name(&self) -> &str;
}

/// The permission a caller is attempting to exercise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Read,
    Write,
}

/// Supplied by the external user/permissions subsystem (spec §1, §6): answers
/// `(user, tree, permission) -> bool`.
pub trait PermissionChecker<U: User> {
    fn is_permitted(&self, user: &U, tree: &str, permission: Permission) -> bool;
}

/// A permission checker with no ACL database behind it: grants a user access
/// only to their own-named tree for reads, consistent with the implicit grant
/// spec §6 always honors regardless of ACL configuration. Useful for tests and
/// as the default when no richer collaborator is wired in.
#[derive(Debug, Default)]
pub struct OwnTreeOnly;

impl<U: User> PermissionChecker<U> for OwnTreeOnly {
    fn is_permitted(&self, user: &U, tree: &str, permission: Permission) -> bool {
        permission == Permission::Read && user.name() == tree
    }
}

/// Splits and joins absolute/relative configTree paths. Spec §1 calls this a
/// standalone utility the core consumes rather than owns; `SlashPathSplitter`
/// is the default, dependency-free implementation.
pub trait PathSplitter {
    /// Splits `path` into its `/`-delimited components. A leading `/` marks an
    /// absolute path. `.` components are dropped; `..` components are passed
    /// through for the caller to interpret as "go to parent".
    fn split(&self, path: &str) -> (bool, Vec<String>);
}

#[derive(Debug, Default)]
pub struct SlashPathSplitter;

impl PathSplitter for SlashPathSplitter {
    fn split(&self, path: &str) -> (bool, Vec<String>) {
        let absolute = path.starts_with('/');
        let parts = path
            .split('/')
            .filter(|p| !p.is_empty() && *p != ".")
            .map(str::to_owned)
            .collect();
        (absolute, parts)
    }
}

/// Splits a client-supplied path that may be qualified with a leading tree
/// name (`tree:/abs/path`), per spec §4.3 / §4.2's canonical registration key.
pub fn split_tree_qualifier(path: &str) -> (Option<&str>, &str) {
    match path.split_once(':') {
        Some((tree, rest)) => (Some(tree), rest),
        None => (None, path),
    }
}

/// A reply handle abstracts over "however the RPC dispatch glue delivers a
/// response back to the client" (spec §1, §6). The core only ever calls
/// `respond` once per request.
pub trait ReplyHandle<T> {
    fn respond(self, result: CfgResult<T>);
}

/// A reply handle that simply stores the outcome; used by tests and by the
/// in-process daemon API that doesn't cross an IPC boundary at all.
#[derive(Debug, Default)]
pub struct LocalReply<T> {
    pub result: Option<CfgResult<T>>,
}

impl<T> ReplyHandle<T> for &mut LocalReply<T> {
    fn respond(self, result: CfgResult<T>) {
        self.result = Some(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_absolute_and_relative_paths() {
        let splitter = SlashPathSplitter;
        assert_eq!(
            splitter.split("/a/b/c"),
            (true, vec!["a".to_owned(), "b".to_owned(), "c".to_owned()])
        );
        assert_eq!(
            splitter.split("a/./b"),
            (false, vec!["a".to_owned(), "b".to_owned()])
        );
    }

    #[test]
    fn tree_qualifier_splits_on_first_colon() {
        assert_eq!(split_tree_qualifier("app1:/svc/port"), (Some("app1"), "/svc/port"));
        assert_eq!(split_tree_qualifier("/svc/port"), (None, "/svc/port"));
    }
}
