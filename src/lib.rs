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

//! A persistent, hierarchical configuration store with transactional writes
//! and change notification (spec.md's OVERVIEW). The engine itself
//! (`Core`) owns every piece of mutable state as a single plain value and is
//! driven entirely from a single-threaded event loop — there is no internal
//! locking anywhere in this crate; see `core` module docs.

pub mod arena;
pub mod collab;
pub mod config;
pub mod core;
pub mod error;
pub mod ids;
pub mod merge;
pub mod node;
pub mod notify;
pub mod persist;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod shadow;
pub mod tree;
pub mod treelist;
mod iter;

pub use core::Core;
pub use error::{CfgError, CfgResult};
pub use iter::{CursorHandle, IterMode};
