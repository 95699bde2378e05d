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

//! The single value the event loop owns (spec §9 Design Notes: "a single
//! `Core` value owned by the event loop... no process-level singleton").
//! `Core` wires together the tree registry (C4), the shadow/merge engine
//! (C1), the notification engine (C2), the iterator arena (C3), the request
//! scheduler (C5) and the session manager (C6) behind the one API a daemon
//! binary (or a test) drives directly. There is no internal locking: every
//! method here takes `&mut self`, matching the "single-threaded cooperative
//! event loop" of spec §5.
//!
//! Admission is decided here, not in `scheduler`, because only `Core` can see
//! the registry's per-tree reader/writer state, the iterator arena and the
//! notification engine all at once (spec §4.5's drain loop needs all three).

use crate::collab::{PathSplitter, Permission, PermissionChecker, SlashPathSplitter, User};
use crate::config::DaemonConfig;
use crate::error::{CfgError, CfgResult};
use crate::ids::{HandlerId, IteratorId, SessionId};
use crate::iter::{CursorIterator, IterMode};
use crate::merge;
use crate::node::{EffectiveType, NodeType, ScalarValue, ScalarValueKind};
use crate::notify::NotifyEngine;
use crate::persist;
use crate::registry::TreeRegistry;
use crate::scheduler::{PendingRequest, QueuedRequest, Scheduler};
use crate::session::SessionManager;
use crate::tree::Tree;
use crate::treelist::TreeIterator;
use std::collections::{BTreeSet, VecDeque};

/// Reserved tree name that always exists conceptually and whose
/// `/configTree/...` keys configure the core itself (spec §6).
pub const SYSTEM_TREE: &str = "system";

const DEFAULT_TRANSACTION_TIMEOUT_SECS: u64 = 30;

pub struct Core<U: User> {
    registry: TreeRegistry,
    notify: NotifyEngine,
    scheduler: Scheduler,
    sessions: SessionManager<U>,
    iterators: crate::arena::Arena<CursorIterator>,
    permissions: Box<dyn PermissionChecker<U>>,
    config: DaemonConfig,
}

impl<U: User> Core<U> {
    pub fn new(config: DaemonConfig, permissions: impl PermissionChecker<U> + 'static) -> Self {
        Core {
            registry: TreeRegistry::new(config.data_dir.clone(), config.max_name_len, config.max_string_len),
            notify: NotifyEngine::new(),
            scheduler: Scheduler::new(),
            sessions: SessionManager::new(),
            iterators: crate::arena::Arena::new(),
            permissions: Box::new(permissions),
            config,
        }
    }

    // ---- session lifecycle (spec §4.6, C6) -----------------------------

    pub fn open_session(&mut self, id: SessionId, user: U) {
        self.sessions.open(id, user);
        log::info!("session {id} opened");
    }

    /// Full teardown fan-out for a disconnected session (spec §4.6, §5
    /// Cancellation): release its iterators, drop its queued requests, and
    /// remove its change-handlers. A no-op if `id` was already closed or
    /// never opened.
    pub fn close_session(&mut self, id: SessionId) {
        if !self.sessions.close(id) {
            return;
        }
        let owned: Vec<IteratorId> =
            self.iterators.iter().filter(|(_, it)| it.session == id).map(|(iid, _)| iid).collect();
        let mut released = 0usize;
        let mut touched: BTreeSet<String> = BTreeSet::new();
        for iid in owned {
            if let Some(name) = self.release_one(iid) {
                touched.insert(name);
                released += 1;
            }
        }
        self.notify.remove_handlers_for_session(id);
        for name in self.registry.loaded_names() {
            touched.insert(name);
        }
        let mut dropped = 0usize;
        for name in &touched {
            dropped += self.drop_session_entries(name, id);
        }
        for name in &touched {
            let busy = self.tree_is_busy(name);
            self.registry.reap_if_delete_pending(name, busy);
            self.drain_tree_queue(name);
        }
        log::info!(
            "session {id} closed: released {released} iterators, dropped {dropped} queued requests, deregistered its change-handlers"
        );
    }

    fn drop_session_entries(&mut self, tree_name: &str, session: SessionId) -> usize {
        let queue = self.scheduler.take_queue(tree_name);
        let mut kept = VecDeque::new();
        let mut dropped = 0;
        for qr in queue {
            if qr.session == session {
                dropped += 1;
            } else {
                kept.push_back(qr);
            }
        }
        self.scheduler.put_back_front(tree_name, kept);
        dropped
    }

    // ---- permissions (spec §6, §1's external collaborator) -------------

    /// A user's own-named tree is always implicitly readable (spec §6);
    /// everything else goes through the injected `PermissionChecker`.
    fn check_permission(&self, user: &U, tree_name: &str, perm: Permission) -> bool {
        if perm == Permission::Read && user.name() == tree_name {
            return true;
        }
        self.permissions.is_permitted(user, tree_name, perm)
    }

    // ---- transactions (spec §4.5, C5) -----------------------------------

    pub fn create_read_txn(
        &mut self,
        session: SessionId,
        user: &U,
        tree_name: &str,
        reply: impl FnOnce(CfgResult<IteratorId>) + 'static,
    ) {
        if !self.check_permission(user, tree_name, Permission::Read) {
            reply(Err(CfgError::Fault("read access denied".into())));
            return;
        }
        if let Err(e) = self.registry.get_tree(tree_name) {
            reply(Err(e));
            return;
        }
        let blocked = self
            .registry
            .peek_tree(tree_name)
            .map(|t| matches!(t.writer, Some(w) if !w.closed))
            .unwrap_or(false);
        if blocked {
            let seq = self.scheduler.next_seq();
            self.scheduler.enqueue(
                tree_name,
                session,
                seq,
                PendingRequest::CreateReadTxn { reply: Box::new(reply) },
            );
        } else {
            let id = self.admit_read(session, tree_name);
            reply(Ok(id));
        }
    }

    pub fn create_write_txn(
        &mut self,
        session: SessionId,
        user: &U,
        tree_name: &str,
        reply: impl FnOnce(CfgResult<IteratorId>) + 'static,
    ) {
        if !self.check_permission(user, tree_name, Permission::Write) {
            reply(Err(CfgError::Fault("write access denied".into())));
            return;
        }
        if let Err(e) = self.registry.get_tree(tree_name) {
            reply(Err(e));
            return;
        }
        let blocked = self.registry.peek_tree(tree_name).map(|t| t.writer.is_some()).unwrap_or(false);
        if blocked {
            let seq = self.scheduler.next_seq();
            self.scheduler.enqueue(
                tree_name,
                session,
                seq,
                PendingRequest::CreateWriteTxn { reply: Box::new(reply) },
            );
        } else {
            let id = self.admit_write(session, tree_name);
            reply(Ok(id));
        }
    }

    fn admit_read(&mut self, session: SessionId, tree_name: &str) -> IteratorId {
        let timeout = self.transaction_timeout_secs();
        let max_name_len = self.config.max_name_len;
        let max_path_len = self.config.max_path_len;
        let tree = self.registry.get_tree(tree_name).expect("caller already validated the tree exists");
        let cursor = CursorIterator::new_read(session, tree, max_name_len, max_path_len, timeout);
        tree.reader_count += 1;
        self.iterators.insert(cursor)
    }

    fn admit_write(&mut self, session: SessionId, tree_name: &str) -> IteratorId {
        let timeout = self.transaction_timeout_secs();
        let max_name_len = self.config.max_name_len;
        let max_path_len = self.config.max_path_len;
        let tree = self.registry.get_tree(tree_name).expect("caller already validated the tree exists");
        let cursor = CursorIterator::new_write(session, tree, max_name_len, max_path_len, timeout);
        let id = self.iterators.insert(cursor);
        if let Ok(tree) = self.registry.get_tree(tree_name) {
            tree.writer = Some(crate::tree::WriterSlot { iter: id, closed: false });
        }
        id
    }

    /// Requests commit of the write iterator `iter_id` (spec §4.3, §4.5).
    /// Closes the iterator's external handle immediately; if readers are
    /// still active the actual merge is parked on the tree's request queue
    /// until they drain (spec §8 property 3).
    pub fn commit_write_txn(&mut self, iter_id: IteratorId, reply: impl FnOnce(CfgResult<()>) + 'static) {
        let (tree_name, session) = match self.iterators.get(iter_id) {
            Some(it) if it.mode == IterMode::Write && !it.terminated => (it.tree_name.clone(), it.session),
            Some(_) => {
                reply(Err(CfgError::Fault("commit target was not an open write iterator".into())));
                return;
            }
            None => {
                reply(Err(CfgError::Fault("invalid iterator reference".into())));
                return;
            }
        };
        if let Some(it) = self.iterators.get_mut(iter_id) {
            it.close();
        }
        if let Ok(tree) = self.registry.get_tree(&tree_name) {
            if let Some(w) = &mut tree.writer {
                w.closed = true;
            }
        }
        let ready = self.registry.peek_tree(&tree_name).map(|t| t.reader_count == 0).unwrap_or(true);
        if ready {
            self.do_commit(iter_id, &tree_name, Box::new(reply));
        } else {
            let seq = self.scheduler.next_seq();
            self.scheduler.enqueue(
                &tree_name,
                session,
                seq,
                PendingRequest::CommitWriteTxn { iter: iter_id, reply: Box::new(reply) },
            );
        }
        self.drain_tree_queue(&tree_name);
    }

    fn do_commit(&mut self, iter_id: IteratorId, tree_name: &str, reply: Box<dyn FnOnce(CfgResult<()>)>) {
        let cursor = match self.iterators.remove(iter_id) {
            Some(c) => c,
            None => {
                reply(Err(CfgError::Fault("iterator vanished before commit".into())));
                return;
            }
        };
        let shadow = match cursor.into_shadow() {
            Some(s) => s,
            None => {
                reply(Err(CfgError::Fault("commit target was not a write iterator".into())));
                return;
            }
        };
        let tree = match self.registry.get_tree(tree_name) {
            Ok(t) => t,
            Err(e) => {
                reply(Err(e));
                return;
            }
        };
        tree.writer = None;
        merge::merge(tree, shadow, &mut self.notify);
        if let Err(e) = persist::save(&self.config.data_dir, tree) {
            log::warn!("commit to '{tree_name}' merged in memory but failed to persist a new revision: {e}");
        }
        self.notify.fire_triggered();
        reply(Ok(()));
        let busy = self.tree_is_busy(tree_name);
        self.registry.reap_if_delete_pending(tree_name, busy);
    }

    /// Cancels `iter_id`: a write iterator's shadow is simply dropped
    /// (spec §8 property 4, "rollback is invisible"); a read iterator just
    /// releases its slot. Always immediate (spec §4.5).
    pub fn cancel_txn(&mut self, iter_id: IteratorId) -> CfgResult<()> {
        let tree_name = self.release_one(iter_id).ok_or(CfgError::NotFound)?;
        let busy = self.tree_is_busy(&tree_name);
        self.registry.reap_if_delete_pending(&tree_name, busy);
        self.drain_tree_queue(&tree_name);
        Ok(())
    }

    /// Removes `iter_id` from the arena and undoes its tree-level
    /// bookkeeping (reader count or writer slot). Returns the tree name it
    /// belonged to, for the caller to re-drain and re-evaluate delete-pending.
    fn release_one(&mut self, iter_id: IteratorId) -> Option<String> {
        let cursor = self.iterators.remove(iter_id)?;
        let tree_name = cursor.tree_name.clone();
        match cursor.mode {
            IterMode::Write => {
                if let Ok(tree) = self.registry.get_tree(&tree_name) {
                    tree.writer = None;
                }
            }
            IterMode::Read => {
                if let Ok(tree) = self.registry.get_tree(&tree_name) {
                    if tree.reader_count > 0 {
                        tree.reader_count -= 1;
                    }
                }
            }
        }
        Some(tree_name)
    }

    fn tree_is_busy(&self, tree_name: &str) -> bool {
        let busy_in_registry = self
            .registry
            .peek_tree(tree_name)
            .map(|t| t.reader_count > 0 || t.writer.is_some())
            .unwrap_or(false);
        busy_in_registry || self.scheduler.queue_len(tree_name) > 0
    }

    /// Walks `tree_name`'s queue in FIFO order, admitting everything that can
    /// be admitted under the current state and stopping at the first entry
    /// that still can't (spec §4.5: "walk the tree's queue in arrival order
    /// and re-attempt each request").
    fn drain_tree_queue(&mut self, tree_name: &str) {
        let mut queue = self.scheduler.take_queue(tree_name);
        let mut remaining = VecDeque::new();
        while let Some(qr) = queue.pop_front() {
            if !self.sessions.is_open(qr.session) {
                continue;
            }
            match qr.request {
                PendingRequest::CreateReadTxn { reply } => {
                    let blocked = self
                        .registry
                        .peek_tree(tree_name)
                        .map(|t| matches!(t.writer, Some(w) if !w.closed))
                        .unwrap_or(false);
                    if blocked {
                        remaining.push_back(QueuedRequest {
                            session: qr.session,
                            seq: qr.seq,
                            request: PendingRequest::CreateReadTxn { reply },
                        });
                        remaining.extend(queue);
                        break;
                    }
                    let id = self.admit_read(qr.session, tree_name);
                    reply(Ok(id));
                }
                PendingRequest::CreateWriteTxn { reply } => {
                    let blocked = self.registry.peek_tree(tree_name).map(|t| t.writer.is_some()).unwrap_or(false);
                    if blocked {
                        remaining.push_back(QueuedRequest {
                            session: qr.session,
                            seq: qr.seq,
                            request: PendingRequest::CreateWriteTxn { reply },
                        });
                        remaining.extend(queue);
                        break;
                    }
                    let id = self.admit_write(qr.session, tree_name);
                    reply(Ok(id));
                }
                PendingRequest::CommitWriteTxn { iter, reply } => {
                    let ready = self.registry.peek_tree(tree_name).map(|t| t.reader_count == 0).unwrap_or(true);
                    if !ready {
                        remaining.push_back(QueuedRequest {
                            session: qr.session,
                            seq: qr.seq,
                            request: PendingRequest::CommitWriteTxn { iter, reply },
                        });
                        remaining.extend(queue);
                        break;
                    }
                    self.do_commit(iter, tree_name, reply);
                }
                PendingRequest::QuickWrite { apply, reply } => {
                    let ready = self
                        .registry
                        .peek_tree(tree_name)
                        .map(|t| t.reader_count == 0 && t.writer.is_none())
                        .unwrap_or(true);
                    if !ready {
                        remaining.push_back(QueuedRequest {
                            session: qr.session,
                            seq: qr.seq,
                            request: PendingRequest::QuickWrite { apply, reply },
                        });
                        remaining.extend(queue);
                        break;
                    }
                    self.run_quick_write_now(tree_name, apply, reply);
                }
            }
        }
        self.scheduler.put_back_front(tree_name, remaining);
    }

    // ---- iterator navigation & reads/writes (spec §4.3, C3) -------------

    fn iterator_tree_name(&self, iter_id: IteratorId) -> CfgResult<String> {
        self.iterators.get(iter_id).map(|it| it.tree_name.clone()).ok_or(CfgError::Fault(
            "invalid iterator reference".into(),
        ))
    }

    /// Propagates a session-fatal error (spec §7): marks the iterator
    /// terminated, logs an emergency entry, and tears down the whole owning
    /// session through the normal close path.
    fn handle_iter_result<T>(&mut self, iter_id: IteratorId, result: CfgResult<T>) -> CfgResult<T> {
        if let Err(e) = &result {
            if e.is_session_fatal() {
                let session = self.iterators.get(iter_id).map(|it| it.session);
                if let Some(it) = self.iterators.get_mut(iter_id) {
                    it.terminate();
                }
                log::error!("fatal protocol violation on iterator, terminating session: {e}");
                if let Some(session) = session {
                    self.close_session(session);
                }
            }
        }
        result
    }

    pub fn go_to(&mut self, iter_id: IteratorId, path: &str) -> CfgResult<()> {
        let tree_name = self.iterator_tree_name(iter_id)?;
        let tree = self.registry.get_tree(&tree_name)?;
        let splitter = SlashPathSplitter;
        let result = match self.iterators.get_mut(iter_id) {
            Some(cursor) => cursor.go_to(tree, path, &splitter),
            None => Err(CfgError::Fault("invalid iterator reference".into())),
        };
        self.handle_iter_result(iter_id, result)
    }

    pub fn go_to_parent(&mut self, iter_id: IteratorId) -> CfgResult<()> {
        let tree_name = self.iterator_tree_name(iter_id)?;
        let tree = self.registry.get_tree(&tree_name)?;
        let result = match self.iterators.get_mut(iter_id) {
            Some(cursor) => cursor.go_to_parent(tree),
            None => Err(CfgError::Fault("invalid iterator reference".into())),
        };
        self.handle_iter_result(iter_id, result)
    }

    pub fn go_to_first_child(&mut self, iter_id: IteratorId, active_only: bool) -> CfgResult<()> {
        let tree_name = self.iterator_tree_name(iter_id)?;
        let tree = self.registry.get_tree(&tree_name)?;
        let result = match self.iterators.get_mut(iter_id) {
            Some(cursor) => cursor.go_to_first_child(tree, active_only),
            None => Err(CfgError::Fault("invalid iterator reference".into())),
        };
        self.handle_iter_result(iter_id, result)
    }

    pub fn go_to_next_sibling(&mut self, iter_id: IteratorId, active_only: bool) -> CfgResult<()> {
        let tree_name = self.iterator_tree_name(iter_id)?;
        let tree = self.registry.get_tree(&tree_name)?;
        let result = match self.iterators.get_mut(iter_id) {
            Some(cursor) => cursor.go_to_next_sibling(tree, active_only),
            None => Err(CfgError::Fault("invalid iterator reference".into())),
        };
        self.handle_iter_result(iter_id, result)
    }

    pub fn read_as<T: ScalarValue>(&mut self, iter_id: IteratorId, default: T) -> T {
        let tree_name = match self.iterator_tree_name(iter_id) {
            Ok(n) => n,
            Err(_) => return default,
        };
        let tree = match self.registry.get_tree(&tree_name) {
            Ok(t) => t,
            Err(_) => return default,
        };
        match self.iterators.get(iter_id) {
            Some(cursor) => cursor.read_as(tree, default.clone()),
            None => default,
        }
    }

    pub fn write_as<T: ScalarValue + ScalarValueKind>(&mut self, iter_id: IteratorId, v: T) -> CfgResult<()> {
        if T::KIND == NodeType::String && v.to_canonical().len() > self.config.max_string_len {
            return Err(CfgError::Overflow);
        }
        let tree_name = self.iterator_tree_name(iter_id)?;
        let tree = self.registry.get_tree(&tree_name)?;
        let result = match self.iterators.get_mut(iter_id) {
            Some(cursor) => cursor.write_as(tree, v),
            None => Err(CfgError::Fault("invalid iterator reference".into())),
        };
        self.handle_iter_result(iter_id, result)
    }

    pub fn set_empty(&mut self, iter_id: IteratorId) -> CfgResult<()> {
        let tree_name = self.iterator_tree_name(iter_id)?;
        let tree = self.registry.get_tree(&tree_name)?;
        let result = match self.iterators.get_mut(iter_id) {
            Some(cursor) => cursor.set_empty(tree),
            None => Err(CfgError::Fault("invalid iterator reference".into())),
        };
        self.handle_iter_result(iter_id, result)
    }

    pub fn delete(&mut self, iter_id: IteratorId) -> CfgResult<()> {
        let result = match self.iterators.get_mut(iter_id) {
            Some(cursor) => cursor.delete(),
            None => Err(CfgError::Fault("invalid iterator reference".into())),
        };
        self.handle_iter_result(iter_id, result)
    }

    pub fn rename(&mut self, iter_id: IteratorId, new_name: &str) -> CfgResult<()> {
        let tree_name = self.iterator_tree_name(iter_id)?;
        let tree = self.registry.get_tree(&tree_name)?;
        let result = match self.iterators.get_mut(iter_id) {
            Some(cursor) => cursor.rename(tree, new_name),
            None => Err(CfgError::Fault("invalid iterator reference".into())),
        };
        self.handle_iter_result(iter_id, result)
    }

    pub fn effective_type(&mut self, iter_id: IteratorId) -> EffectiveType {
        let tree_name = match self.iterator_tree_name(iter_id) {
            Ok(n) => n,
            Err(_) => return EffectiveType::DoesNotExist,
        };
        let tree = match self.registry.get_tree(&tree_name) {
            Ok(t) => t,
            Err(_) => return EffectiveType::DoesNotExist,
        };
        match self.iterators.get_mut(iter_id) {
            Some(cursor) => cursor.effective_type(tree),
            None => EffectiveType::DoesNotExist,
        }
    }

    /// `true` when the iterator's current position is an empty stem or a
    /// valueless scalar (spec §3's third required node inspection op).
    pub fn is_empty(&mut self, iter_id: IteratorId) -> bool {
        matches!(self.effective_type(iter_id), EffectiveType::Empty)
    }

    /// Periodic housekeeping tick the daemon's event loop calls between
    /// requests (spec §4.3 Timeout): terminates the owning session of any
    /// iterator whose watchdog has expired.
    pub fn poll_timeouts(&mut self) {
        let expired: Vec<SessionId> = self
            .iterators
            .iter()
            .filter(|(_, it)| !it.terminated && it.is_expired())
            .map(|(_, it)| it.session)
            .collect();
        let mut seen = BTreeSet::new();
        for session in expired {
            if seen.insert(session) {
                log::warn!("transaction timeout expired, terminating session {session}");
                self.close_session(session);
            }
        }
    }

    fn transaction_timeout_secs(&mut self) -> u64 {
        let tree = match self.registry.get_tree(SYSTEM_TREE) {
            Ok(t) => t,
            Err(_) => return DEFAULT_TRANSACTION_TIMEOUT_SECS,
        };
        let root = tree.root();
        let value = tree
            .find_child(root, "configTree")
            .and_then(|ct| tree.find_child(ct, "transactionTimeout"))
            .and_then(|id| tree.node(id))
            .map(|n| n.get_value_as::<i64>(DEFAULT_TRANSACTION_TIMEOUT_SECS as i64))
            .unwrap_or(DEFAULT_TRANSACTION_TIMEOUT_SECS as i64);
        value.max(0) as u64
    }

    // ---- change notification (spec §4.2, C2) ----------------------------

    pub fn add_handler(
        &mut self,
        default_tree: &str,
        path: &str,
        session: SessionId,
        callback: Box<dyn FnMut()>,
    ) -> HandlerId {
        self.notify.add_handler(default_tree, path, session, callback)
    }

    pub fn remove_handler(&mut self, id: HandlerId, session: SessionId) -> CfgResult<()> {
        self.notify.remove_handler(id, session)
    }

    // ---- quick ops (spec §4.5 supplement) -------------------------------

    fn navigate_readonly(&mut self, tree_name: &str, path: &str) -> CfgResult<Option<crate::node::NodeId>> {
        let tree = self.registry.get_tree(tree_name)?;
        let splitter = SlashPathSplitter;
        let (_, parts) = splitter.split(path);
        let mut cur = tree.root();
        for part in &parts {
            match tree.find_child(cur, part) {
                Some(id) => cur = id,
                None => return Ok(None),
            }
        }
        Ok(Some(cur))
    }

    pub fn quick_get<T: ScalarValue>(&mut self, user: &U, tree_name: &str, path: &str, default: T) -> CfgResult<T> {
        if !self.check_permission(user, tree_name, Permission::Read) {
            return Err(CfgError::Fault("read access denied".into()));
        }
        match self.navigate_readonly(tree_name, path)? {
            Some(id) => {
                let tree = self.registry.get_tree(tree_name)?;
                Ok(tree.node(id).map(|n| n.get_value_as(default.clone())).unwrap_or(default))
            }
            None => Ok(default),
        }
    }

    pub fn quick_set<T>(
        &mut self,
        session: SessionId,
        user: &U,
        tree_name: &str,
        path: &str,
        value: T,
        reply: impl FnOnce(CfgResult<()>) + 'static,
    ) where
        T: ScalarValue + ScalarValueKind + 'static,
    {
        if !self.check_permission(user, tree_name, Permission::Write) {
            reply(Err(CfgError::Fault("write access denied".into())));
            return;
        }
        if T::KIND == NodeType::String && value.to_canonical().len() > self.config.max_string_len {
            reply(Err(CfgError::Overflow));
            return;
        }
        if let Err(e) = self.registry.get_tree(tree_name) {
            reply(Err(e));
            return;
        }
        let path_owned = path.to_owned();
        let apply: Box<dyn FnOnce(&mut CursorIterator, &Tree) -> CfgResult<()>> = Box::new(move |iter, original| {
            let splitter = SlashPathSplitter;
            iter.go_to(original, &path_owned, &splitter)?;
            iter.write_as(original, value)
        });
        self.submit_quick_write(session, tree_name, apply, Box::new(reply));
    }

    pub fn quick_delete(
        &mut self,
        session: SessionId,
        user: &U,
        tree_name: &str,
        path: &str,
        reply: impl FnOnce(CfgResult<()>) + 'static,
    ) {
        if !self.check_permission(user, tree_name, Permission::Write) {
            reply(Err(CfgError::Fault("write access denied".into())));
            return;
        }
        if let Err(e) = self.registry.get_tree(tree_name) {
            reply(Err(e));
            return;
        }
        let path_owned = path.to_owned();
        let apply: Box<dyn FnOnce(&mut CursorIterator, &Tree) -> CfgResult<()>> = Box::new(move |iter, original| {
            let splitter = SlashPathSplitter;
            iter.go_to(original, &path_owned, &splitter)?;
            iter.delete()
        });
        self.submit_quick_write(session, tree_name, apply, Box::new(reply));
    }

    pub fn quick_set_empty(
        &mut self,
        session: SessionId,
        user: &U,
        tree_name: &str,
        path: &str,
        reply: impl FnOnce(CfgResult<()>) + 'static,
    ) {
        if !self.check_permission(user, tree_name, Permission::Write) {
            reply(Err(CfgError::Fault("write access denied".into())));
            return;
        }
        if let Err(e) = self.registry.get_tree(tree_name) {
            reply(Err(e));
            return;
        }
        let path_owned = path.to_owned();
        let apply: Box<dyn FnOnce(&mut CursorIterator, &Tree) -> CfgResult<()>> = Box::new(move |iter, original| {
            let splitter = SlashPathSplitter;
            iter.go_to(original, &path_owned, &splitter)?;
            iter.set_empty(original)
        });
        self.submit_quick_write(session, tree_name, apply, Box::new(reply));
    }

    /// Binary values have no dedicated node type (spec §6): they're stored
    /// as base64-encoded strings, and rejected outright on the `system`
    /// tree (spec §6, scenario S6) by replying success without writing.
    pub fn quick_set_binary(
        &mut self,
        session: SessionId,
        user: &U,
        tree_name: &str,
        path: &str,
        bytes: &[u8],
        reply: impl FnOnce(CfgResult<()>) + 'static,
    ) {
        if tree_name == SYSTEM_TREE {
            log::warn!("rejected a binary write to the system tree at '{path}'");
            reply(Ok(()));
            return;
        }
        if bytes.len() > self.config.max_binary_len {
            reply(Err(CfgError::Overflow));
            return;
        }
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        self.quick_set(session, user, tree_name, path, encoded, reply);
    }

    pub fn quick_get_binary(&mut self, user: &U, tree_name: &str, path: &str, default: Vec<u8>) -> CfgResult<Vec<u8>> {
        if !self.check_permission(user, tree_name, Permission::Read) {
            return Err(CfgError::Fault("read access denied".into()));
        }
        match self.navigate_readonly(tree_name, path)? {
            Some(id) => {
                let tree = self.registry.get_tree(tree_name)?;
                let kind = tree.node(id).map(|n| n.kind());
                if kind != Some(NodeType::String) {
                    return Ok(default);
                }
                let encoded = tree.node(id).map(|n| n.get_value_as::<String>(String::new())).unwrap_or_default();
                use base64::Engine;
                Ok(base64::engine::general_purpose::STANDARD.decode(encoded.as_bytes()).unwrap_or(default))
            }
            None => Ok(default),
        }
    }

    fn submit_quick_write(
        &mut self,
        session: SessionId,
        tree_name: &str,
        apply: Box<dyn FnOnce(&mut CursorIterator, &Tree) -> CfgResult<()>>,
        reply: Box<dyn FnOnce(CfgResult<()>)>,
    ) {
        let can_now = self
            .registry
            .peek_tree(tree_name)
            .map(|t| t.reader_count == 0 && t.writer.is_none())
            .unwrap_or(true);
        if can_now {
            self.run_quick_write_now(tree_name, apply, reply);
        } else {
            let seq = self.scheduler.next_seq();
            self.scheduler.enqueue(tree_name, session, seq, PendingRequest::QuickWrite { apply, reply });
        }
        self.drain_tree_queue(tree_name);
    }

    fn run_quick_write_now(
        &mut self,
        tree_name: &str,
        apply: Box<dyn FnOnce(&mut CursorIterator, &Tree) -> CfgResult<()>>,
        reply: Box<dyn FnOnce(CfgResult<()>)>,
    ) {
        let tree = match self.registry.get_tree(tree_name) {
            Ok(t) => t,
            Err(e) => {
                reply(Err(e));
                return;
            }
        };
        let mut cursor =
            CursorIterator::new_write(uuid::Uuid::nil(), tree, self.config.max_name_len, self.config.max_path_len, 0);
        let applied = apply(&mut cursor, tree);
        let outcome = match applied {
            Ok(()) => {
                let shadow = cursor.into_shadow().expect("write iterator always carries a shadow");
                merge::merge(tree, shadow, &mut self.notify);
                if let Err(e) = persist::save(&self.config.data_dir, tree) {
                    log::warn!("quick write to '{tree_name}' committed in memory but failed to persist: {e}");
                }
                Ok(())
            }
            Err(e) => Err(e),
        };
        self.notify.fire_triggered();
        reply(outcome);
    }

    // ---- tree registry admin (spec §4.4, §4.7, C4/C7) -------------------

    pub fn delete_tree(&mut self, user: &U, tree_name: &str) -> CfgResult<()> {
        if !self.check_permission(user, tree_name, Permission::Write) {
            return Err(CfgError::Fault("write access denied".into()));
        }
        let busy = self.tree_is_busy(tree_name);
        self.registry.delete_tree(tree_name, busy)
    }

    pub fn tree_iterator(&self) -> TreeIterator {
        TreeIterator::new(&self.config.data_dir, self.registry.loaded_names())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::OwnTreeOnly;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Clone)]
    struct TestUser(String);
    impl User for TestUser {
        fn name(&self) -> &str {
            &self.0
        }
    }

    /// Grants every permission to everyone; used by tests that aren't
    /// exercising ACL enforcement itself.
    struct AllowAll;
    impl PermissionChecker<TestUser> for AllowAll {
        fn is_permitted(&self, _user: &TestUser, _tree: &str, _perm: Permission) -> bool {
            true
        }
    }

    fn test_config() -> DaemonConfig {
        let mut cfg = DaemonConfig::default();
        cfg.data_dir = std::env::temp_dir().join(format!("cfgtreed-core-test-{}", uuid::Uuid::new_v4()));
        cfg
    }

    fn core_with_allow_all() -> Core<TestUser> {
        Core::new(test_config(), AllowAll)
    }

    fn sid() -> SessionId {
        uuid::Uuid::new_v4()
    }

    #[test]
    fn quick_set_then_quick_get_round_trips() {
        let mut core = core_with_allow_all();
        let user = TestUser("alice".into());
        let session = sid();
        core.open_session(session, user.clone());
        let done = Rc::new(RefCell::new(None));
        let done2 = done.clone();
        core.quick_set(session, &user, "app1", "/svc/port", 443i64, move |r| *done2.borrow_mut() = Some(r));
        assert!(matches!(*done.borrow(), Some(Ok(()))));
        assert_eq!(core.quick_get::<i64>(&user, "app1", "/svc/port", -1).unwrap(), 443);
    }

    #[test]
    fn quick_write_queues_behind_an_open_write_iterator_and_runs_after_commit() {
        let mut core = core_with_allow_all();
        let user = TestUser("alice".into());
        let session = sid();
        core.open_session(session, user.clone());

        let w = Rc::new(RefCell::new(None));
        let w2 = w.clone();
        core.create_write_txn(session, &user, "app1", move |r| *w2.borrow_mut() = Some(r.unwrap()));
        let w_iter = w.borrow().unwrap();

        let done = Rc::new(RefCell::new(None));
        let done2 = done.clone();
        core.quick_set(session, &user, "app1", "/x", 7i64, move |r| *done2.borrow_mut() = Some(r));
        // blocked behind the open write iterator; hasn't run yet
        assert!(done.borrow().is_none());

        let commit_done = Rc::new(RefCell::new(None));
        let commit_done2 = commit_done.clone();
        core.commit_write_txn(w_iter, move |r| *commit_done2.borrow_mut() = Some(r));
        assert!(matches!(*commit_done.borrow(), Some(Ok(()))));
        assert!(matches!(*done.borrow(), Some(Ok(()))));
        assert_eq!(core.quick_get::<i64>(&user, "app1", "/x", -1).unwrap(), 7);
    }

    #[test]
    fn commit_is_parked_until_every_active_reader_releases() {
        // Adapted from spec.md scenario S1; reader_count here covers every
        // currently open reader, including ones opened after the commit was
        // parked (DESIGN.md's resolution of that scenario's ambiguity).
        let mut core = core_with_allow_all();
        let user = TestUser("alice".into());
        let session = sid();
        core.open_session(session, user.clone());
        core.quick_set(session, &user, "app1", "/svc/port", 80i64, |_| {});

        let r1 = Rc::new(RefCell::new(None));
        let r12 = r1.clone();
        core.create_read_txn(session, &user, "app1", move |r| *r12.borrow_mut() = Some(r.unwrap()));
        let r1_iter = r1.borrow().unwrap();

        let w = Rc::new(RefCell::new(None));
        let w2 = w.clone();
        core.create_write_txn(session, &user, "app1", move |r| *w2.borrow_mut() = Some(r.unwrap()));
        let w_iter = w.borrow().unwrap();
        core.go_to(w_iter, "/svc/port").unwrap();
        core.write_as(w_iter, 443i64).unwrap();

        let commit_done = Rc::new(RefCell::new(None));
        let commit_done2 = commit_done.clone();
        core.commit_write_txn(w_iter, move |r| *commit_done2.borrow_mut() = Some(r));
        assert!(commit_done.borrow().is_none(), "commit must park while R1 is active");

        let r2 = Rc::new(RefCell::new(None));
        let r22 = r2.clone();
        core.create_read_txn(session, &user, "app1", move |r| *r22.borrow_mut() = Some(r.unwrap()));
        let r2_iter = r2.borrow().unwrap();
        core.go_to(r2_iter, "/svc/port").unwrap();
        assert_eq!(core.read_as::<i64>(r2_iter, -1), 80);

        core.cancel_txn(r1_iter).unwrap();
        assert!(commit_done.borrow().is_none(), "commit still waits on R2");

        core.cancel_txn(r2_iter).unwrap();
        assert!(matches!(*commit_done.borrow(), Some(Ok(()))));
        assert_eq!(core.quick_get::<i64>(&user, "app1", "/svc/port", -1).unwrap(), 443);
    }

    #[test]
    fn handler_fires_exactly_once_after_commit() {
        let mut core = core_with_allow_all();
        let user = TestUser("alice".into());
        let session = sid();
        core.open_session(session, user.clone());
        core.quick_set(session, &user, "app1", "/svc/port", 80i64, |_| {});

        let fired = Rc::new(RefCell::new(0));
        let fired2 = fired.clone();
        core.add_handler("app1", "app1:/svc", session, Box::new(move || *fired2.borrow_mut() += 1));

        let w = Rc::new(RefCell::new(None));
        let w2 = w.clone();
        core.create_write_txn(session, &user, "app1", move |r| *w2.borrow_mut() = Some(r.unwrap()));
        let w_iter = w.borrow().unwrap();
        core.go_to(w_iter, "/svc/port").unwrap();
        core.write_as(w_iter, 443i64).unwrap();
        core.commit_write_txn(w_iter, |_| {});

        assert_eq!(*fired.borrow(), 1);
    }

    #[test]
    fn crossing_trees_mid_transaction_terminates_the_session() {
        let mut core = core_with_allow_all();
        let user = TestUser("alice".into());
        let session = sid();
        core.open_session(session, user.clone());

        let r = Rc::new(RefCell::new(None));
        let r2 = r.clone();
        core.create_read_txn(session, &user, "app1", move |res| *r2.borrow_mut() = Some(res.unwrap()));
        let iter = r.borrow().unwrap();

        let err = core.go_to(iter, "system:/foo").unwrap_err();
        assert!(err.is_session_fatal());
        // the session was torn down as a side effect
        assert!(core.go_to(iter, "/anything").is_err());
    }

    #[test]
    fn binary_write_to_system_tree_is_rejected_without_writing() {
        let mut core = core_with_allow_all();
        let user = TestUser("system".into());
        let session = sid();
        core.open_session(session, user.clone());

        let done = Rc::new(RefCell::new(None));
        let done2 = done.clone();
        core.quick_set_binary(session, &user, "system", "/k", b"hello", move |r| *done2.borrow_mut() = Some(r));
        assert!(matches!(*done.borrow(), Some(Ok(()))));
        assert_eq!(core.quick_get_binary(&user, "system", "/k", b"default".to_vec()).unwrap(), b"default");
    }

    #[test]
    fn own_tree_read_is_always_implicitly_granted() {
        let mut core = Core::new(test_config(), OwnTreeOnly);
        let user = TestUser("alice".into());
        let session = sid();
        core.open_session(session, user.clone());
        assert_eq!(core.quick_get::<i64>(&user, "alice", "/x", -1).unwrap(), -1);
        let done = Rc::new(RefCell::new(None));
        let done2 = done.clone();
        core.quick_set(session, &user, "alice", "/x", 1i64, move |r| *done2.borrow_mut() = Some(r));
        assert!(matches!(*done.borrow(), Some(Err(CfgError::Fault(_)))));
    }

    /// Grants exactly one permission per tree, for exercising partial ACL
    /// grants (spec §8 property 8) rather than the all-or-nothing checkers
    /// above.
    struct ReadOnly;
    impl PermissionChecker<TestUser> for ReadOnly {
        fn is_permitted(&self, _user: &TestUser, _tree: &str, perm: Permission) -> bool {
            perm == Permission::Read
        }
    }

    #[test]
    fn read_only_acl_grant_denies_opening_a_write_iterator() {
        // spec §8 property 8: a user with only `read` on a tree must be
        // refused when opening a write iterator on it.
        let mut core = Core::new(test_config(), ReadOnly);
        let user = TestUser("alice".into());
        let session = sid();
        core.open_session(session, user.clone());

        let r = Rc::new(RefCell::new(None));
        let r2 = r.clone();
        core.create_read_txn(session, &user, "app1", move |res| *r2.borrow_mut() = Some(res));
        assert!(matches!(*r.borrow(), Some(Ok(_))));

        let w = Rc::new(RefCell::new(None));
        let w2 = w.clone();
        core.create_write_txn(session, &user, "app1", move |res| *w2.borrow_mut() = Some(res));
        assert!(matches!(*w.borrow(), Some(Err(CfgError::Fault(_)))));
    }

    #[test]
    fn write_as_string_over_the_configured_limit_is_rejected() {
        let mut core = core_with_allow_all();
        let user = TestUser("alice".into());
        let session = sid();
        core.open_session(session, user.clone());
        assert_eq!(core.config.max_string_len, 4096);

        let w = Rc::new(RefCell::new(None));
        let w2 = w.clone();
        core.create_write_txn(session, &user, "app1", move |r| *w2.borrow_mut() = Some(r.unwrap()));
        let w_iter = w.borrow().unwrap();
        core.go_to(w_iter, "/label").unwrap();

        let too_long = "x".repeat(core.config.max_string_len + 1);
        assert!(matches!(core.write_as(w_iter, too_long), Err(CfgError::Overflow)));
        // the iterator itself is still usable after a rejected write.
        assert!(core.write_as(w_iter, "short".to_owned()).is_ok());
    }

    #[test]
    fn quick_set_binary_over_the_configured_limit_is_rejected() {
        let mut core = core_with_allow_all();
        let user = TestUser("alice".into());
        let session = sid();
        core.open_session(session, user.clone());
        assert_eq!(core.config.max_binary_len, 8192);

        let too_big = vec![0u8; core.config.max_binary_len + 1];
        let done = Rc::new(RefCell::new(None));
        let done2 = done.clone();
        core.quick_set_binary(session, &user, "app1", "/blob", &too_big, move |r| *done2.borrow_mut() = Some(r));
        assert!(matches!(*done.borrow(), Some(Err(CfgError::Overflow))));
    }

    #[test]
    fn session_close_releases_iterators_and_handlers() {
        let mut core = core_with_allow_all();
        let user = TestUser("alice".into());
        let session = sid();
        core.open_session(session, user.clone());

        let r = Rc::new(RefCell::new(None));
        let r2 = r.clone();
        core.create_read_txn(session, &user, "app1", move |res| *r2.borrow_mut() = Some(res.unwrap()));
        core.add_handler("app1", "app1:/x", session, Box::new(|| {}));

        core.close_session(session);

        // a write txn on app1 must now be admitted immediately - nothing is
        // holding the tree open anymore.
        let w = Rc::new(RefCell::new(None));
        let w2 = w.clone();
        let other_session = sid();
        let other_user = TestUser("bob".into());
        core.open_session(other_session, other_user.clone());
        core.create_write_txn(other_session, &other_user, "app1", move |res| *w2.borrow_mut() = Some(res.unwrap()));
        assert!(w.borrow().is_some());
    }
}
