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

//! Client session tracking (spec §4.6, C6).
//!
//! This module only owns the session map itself — which sessions exist and
//! which `User` capability each was opened with. The actual teardown fan-out
//! on close (cancel the session's iterators, skip its queued requests, drop
//! its change-handlers) touches state this module has no business depending
//! on, so that orchestration lives in `core::Core::close_session`.

use crate::collab::User;
use crate::ids::SessionId;
use std::collections::HashMap;

#[derive(Default)]
pub struct SessionManager<U: User> {
    sessions: HashMap<SessionId, U>,
}

impl<U: User> SessionManager<U> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a session for `user`, supplied by the external session/user
    /// lookup collaborator (spec §4.6: "on session open, ensure a User
    /// record is populated" — the core never constructs one itself).
    pub fn open(&mut self, id: SessionId, user: U) {
        self.sessions.insert(id, user);
    }

    pub fn is_open(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn user(&self, id: SessionId) -> Option<&U> {
        self.sessions.get(&id)
    }

    /// Drops the session's own bookkeeping. Returns whether it was actually
    /// open, so the caller can skip the rest of close-teardown for an
    /// already-closed or unknown session id.
    pub fn close(&mut self, id: SessionId) -> bool {
        self.sessions.remove(&id).is_some()
    }

    pub fn open_session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct TestUser(String);
    impl User for TestUser {
        fn name(&self) -> &str {
            &self.0
        }
    }

    #[test]
    fn open_close_tracks_membership() {
        let mut mgr: SessionManager<TestUser> = SessionManager::new();
        let id = uuid::Uuid::new_v4();
        assert!(!mgr.is_open(id));
        mgr.open(id, TestUser("alice".into()));
        assert!(mgr.is_open(id));
        assert_eq!(mgr.user(id).unwrap().name(), "alice");
        assert!(mgr.close(id));
        assert!(!mgr.is_open(id));
        assert!(!mgr.close(id));
    }
}
