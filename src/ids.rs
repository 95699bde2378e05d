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

//! Opaque identifiers shared across components, kept in one place so C2, C5
//! and C6 can all refer to "a session" or "a handler" without creating
//! import cycles between their modules.

use crate::arena::Id;

/// Identifies a client session (spec §3 Lifecycles, C6). Backed by a `Uuid`
/// the way the teacher's server tags connections.
pub type SessionId = uuid::Uuid;

/// Opaque token for a change-notification registration entry (spec §4.2).
pub type HandlerId = u64;

/// Opaque token for an open iterator (spec §3, C3). A generational arena
/// index per spec §9's "safe references" design note.
pub type IteratorId = Id;
