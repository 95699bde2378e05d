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

//! The change-notification engine (spec §4.2, C2): a single mapping from
//! canonical path (`tree:/abs/path`) to the set of handlers registered on it,
//! with a `triggered` flag merge flips on and the post-merge sweep clears.

use crate::collab::split_tree_qualifier;
use crate::ids::{HandlerId, SessionId};
use crate::error::{CfgError, CfgResult};
use std::collections::HashMap;

type Callback = Box<dyn FnMut() + 'static>;

struct HandlerEntry {
    id: HandlerId,
    session: SessionId,
    callback: Callback,
}

#[derive(Default)]
struct Registration {
    handlers: Vec<HandlerEntry>,
    triggered: bool,
}

#[derive(Default)]
pub struct NotifyEngine {
    registrations: HashMap<String, Registration>,
    locations: HashMap<HandlerId, String>,
    next_id: u64,
}

/// Builds the canonical `tree:/abs/path` registration key, prepending
/// `default_tree` when `path` doesn't carry its own tree qualifier (spec
/// §4.2).
pub fn canonical_key(default_tree: &str, path: &str) -> String {
    match split_tree_qualifier(path) {
        (Some(tree), rest) => format!("{tree}:{rest}"),
        (None, rest) => format!("{default_tree}:{rest}"),
    }
}

impl NotifyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(
        &mut self,
        default_tree: &str,
        path: &str,
        session: SessionId,
        callback: Callback,
    ) -> HandlerId {
        let key = canonical_key(default_tree, path);
        let id = self.next_id;
        self.next_id += 1;
        let reg = self.registrations.entry(key.clone()).or_default();
        reg.handlers.push(HandlerEntry { id, session, callback });
        self.locations.insert(id, key);
        id
    }

    /// Removes a handler. The id must belong to `session` (spec §4.2); the
    /// owning `Registration` is disposed once its last handler is gone.
    pub fn remove_handler(&mut self, id: HandlerId, session: SessionId) -> CfgResult<()> {
        let key = self.locations.get(&id).cloned().ok_or(CfgError::NotFound)?;
        let reg = self.registrations.get_mut(&key).ok_or(CfgError::NotFound)?;
        let idx = reg
            .handlers
            .iter()
            .position(|h| h.id == id && h.session == session)
            .ok_or(CfgError::NotFound)?;
        reg.handlers.remove(idx);
        self.locations.remove(&id);
        if reg.handlers.is_empty() {
            self.registrations.remove(&key);
        }
        Ok(())
    }

    /// Drops every handler owned by `session` (spec §4.6, session close).
    pub fn remove_handlers_for_session(&mut self, session: SessionId) {
        let mut emptied = Vec::new();
        for (key, reg) in self.registrations.iter_mut() {
            reg.handlers.retain(|h| h.session != session);
            if reg.handlers.is_empty() {
                emptied.push(key.clone());
            }
        }
        for key in emptied {
            self.registrations.remove(&key);
        }
        self.locations.retain(|_, key| self.registrations.contains_key(key));
    }

    /// Marks the registration at exactly `key` (if any) as triggered.
    pub fn mark_triggered(&mut self, key: &str) {
        if let Some(reg) = self.registrations.get_mut(key) {
            reg.triggered = true;
        }
    }

    pub fn has_registration(&self, key: &str) -> bool {
        self.registrations.contains_key(key)
    }

    /// Invokes every handler of every still-triggered registration, in
    /// insertion order, then clears the flags. Called once, after a merge
    /// completes (spec §4.2, §5: "after the merge is visible and before the
    /// commit's reply is sent").
    pub fn fire_triggered(&mut self) {
        for reg in self.registrations.values_mut() {
            if reg.triggered {
                for entry in reg.handlers.iter_mut() {
                    (entry.callback)();
                }
                reg.triggered = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn sid() -> SessionId {
        uuid::Uuid::new_v4()
    }

    #[test]
    fn handler_fires_once_when_marked_then_clears() {
        let mut engine = NotifyEngine::new();
        let calls = Rc::new(RefCell::new(0));
        let calls2 = calls.clone();
        let session = sid();
        engine.add_handler("app1", "/svc", session, Box::new(move || *calls2.borrow_mut() += 1));
        let key = canonical_key("app1", "/svc");
        engine.mark_triggered(&key);
        engine.fire_triggered();
        assert_eq!(*calls.borrow(), 1);
        // firing again without re-marking must not re-invoke
        engine.fire_triggered();
        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn remove_handler_requires_owning_session() {
        let mut engine = NotifyEngine::new();
        let session = sid();
        let other = sid();
        let id = engine.add_handler("app1", "/svc", session, Box::new(|| {}));
        assert!(engine.remove_handler(id, other).is_err());
        assert!(engine.remove_handler(id, session).is_ok());
    }

    #[test]
    fn session_close_drops_only_that_sessions_handlers() {
        let mut engine = NotifyEngine::new();
        let a = sid();
        let b = sid();
        engine.add_handler("app1", "/svc", a, Box::new(|| {}));
        engine.add_handler("app1", "/svc", b, Box::new(|| {}));
        engine.remove_handlers_for_session(a);
        let key = canonical_key("app1", "/svc");
        assert!(engine.has_registration(&key));
        engine.remove_handlers_for_session(b);
        assert!(!engine.has_registration(&key));
    }
}
