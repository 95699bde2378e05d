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

//! Per-tree request queue and admission ordering (spec §4.5, C5).
//!
//! The scheduler holds data, not behavior: each queued request is a plain
//! variant naming what it wants plus a boxed reply callback. It has no
//! method that re-attempts admission — that logic lives in `core::Core`,
//! which is the only place that can see the registry, the iterator arena and
//! the notification engine all at once. `take_queue`/`put_back_front` let
//! `Core` pull a tree's queue out, drive it with `&mut self` freely (no
//! aliasing against `self.scheduler`), and hand back whatever is still
//! blocked, merging in anything newly enqueued during the drain.

use crate::error::CfgResult;
use crate::ids::{IteratorId, SessionId};
use crate::iter::CursorIterator;
use crate::tree::Tree;
use std::collections::{HashMap, VecDeque};

/// One inbound request, past its permission check, waiting on admission.
pub enum PendingRequest {
    CreateReadTxn {
        reply: Box<dyn FnOnce(CfgResult<IteratorId>)>,
    },
    CreateWriteTxn {
        reply: Box<dyn FnOnce(CfgResult<IteratorId>)>,
    },
    CommitWriteTxn {
        iter: IteratorId,
        reply: Box<dyn FnOnce(CfgResult<()>)>,
    },
    /// A Quick op, represented as the one-shot mutation it will apply once
    /// admitted onto an ephemeral write iterator (spec §4.5 supplement).
    QuickWrite {
        apply: Box<dyn FnOnce(&mut CursorIterator, &Tree) -> CfgResult<()>>,
        reply: Box<dyn FnOnce(CfgResult<()>)>,
    },
}

pub struct QueuedRequest {
    pub session: SessionId,
    pub seq: u64,
    pub request: PendingRequest,
}

#[derive(Default)]
pub struct Scheduler {
    queues: HashMap<String, VecDeque<QueuedRequest>>,
    next_seq: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns the next monotonic sequence number (spec §4.5 supplement: used
    /// only for deterministic FIFO assertions in tests, no wire meaning).
    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub fn enqueue(&mut self, tree: &str, session: SessionId, seq: u64, request: PendingRequest) {
        self.queues
            .entry(tree.to_owned())
            .or_default()
            .push_back(QueuedRequest { session, seq, request });
    }

    pub fn queue_len(&self, tree: &str) -> usize {
        self.queues.get(tree).map(VecDeque::len).unwrap_or(0)
    }

    pub fn take_queue(&mut self, tree: &str) -> VecDeque<QueuedRequest> {
        self.queues.remove(tree).unwrap_or_default()
    }

    /// Restores whatever `Core`'s drain loop didn't finish, in front of
    /// anything that was enqueued (by handler callbacks, most likely) while
    /// the drain was running.
    pub fn put_back_front(&mut self, tree: &str, mut remaining: VecDeque<QueuedRequest>) {
        if let Some(added_during_drain) = self.queues.remove(tree) {
            remaining.extend(added_during_drain);
        }
        if !remaining.is_empty() {
            self.queues.insert(tree.to_owned(), remaining);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid() -> SessionId {
        uuid::Uuid::new_v4()
    }

    #[test]
    fn take_and_put_back_preserves_fifo_order() {
        let mut sched = Scheduler::new();
        for _ in 0..3 {
            let seq = sched.next_seq();
            sched.enqueue(
                "app1",
                sid(),
                seq,
                PendingRequest::CommitWriteTxn {
                    iter: crate::arena::Arena::<()>::new().insert(()),
                    reply: Box::new(|_| {}),
                },
            );
        }
        assert_eq!(sched.queue_len("app1"), 3);
        let mut taken = sched.take_queue("app1");
        assert_eq!(sched.queue_len("app1"), 0);
        let first = taken.pop_front().unwrap();
        sched.put_back_front("app1", taken);
        assert_eq!(sched.queue_len("app1"), 2);
        assert_eq!(first.seq, 0);
    }

    #[test]
    fn newly_enqueued_requests_land_behind_restored_ones() {
        let mut sched = Scheduler::new();
        let seq0 = sched.next_seq();
        sched.enqueue("app1", sid(), seq0, PendingRequest::CreateReadTxn { reply: Box::new(|_| {}) });
        let mut taken = sched.take_queue("app1");
        let still_blocked = taken.pop_front().unwrap();
        let mut remaining = VecDeque::new();
        remaining.push_back(still_blocked);
        let seq1 = sched.next_seq();
        sched.enqueue("app1", sid(), seq1, PendingRequest::CreateReadTxn { reply: Box::new(|_| {}) });
        sched.put_back_front("app1", remaining);
        let ordered = sched.take_queue("app1");
        let seqs: Vec<u64> = ordered.iter().map(|q| q.seq).collect();
        assert_eq!(seqs, vec![0, 1]);
    }
}
