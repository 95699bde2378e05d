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

//! Error kinds surfaced to clients and propagated internally through the core.
//!
//! Mirrors the house style used by the teacher's snapshot/storage engine: a plain
//! enum with hand written `Display`/`Error` impls rather than a derive macro, so
//! every arm can carry its own human readable message.

use core::fmt;

/// The result type used pervasively through the core.
pub type CfgResult<T> = Result<T, CfgError>;

/// Every error kind a client-facing call can surface (spec §7).
#[derive(Debug)]
pub enum CfgError {
    /// A value or path did not fit the caller-supplied buffer. The operation may
    /// still have partially succeeded (e.g. a truncated string read).
    Overflow,
    /// Navigation would have gone above the tree root.
    Underflow,
    /// The navigation target, or handler, or tree does not exist.
    NotFound,
    /// On-disk data, base64 payload, or a node/tree name failed to parse.
    FormatError(String),
    /// A node name or tree name broke the naming rules (reserved, malformed).
    BadName(String),
    /// Renaming would collide with an existing sibling.
    Duplicate,
    /// A filesystem read/write failed.
    IoError(String),
    /// An internal invariant was violated by a misbehaving or malicious client;
    /// the session that triggered this has been (or is about to be) torn down.
    Fault(String),
}

impl fmt::Display for CfgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overflow => f.write_str("value or path overflowed its buffer"),
            Self::Underflow => f.write_str("navigation underflowed past the tree root"),
            Self::NotFound => f.write_str("not found"),
            Self::FormatError(msg) => write!(f, "format error: {msg}"),
            Self::BadName(msg) => write!(f, "bad name: {msg}"),
            Self::Duplicate => f.write_str("a sibling with that name already exists"),
            Self::IoError(msg) => write!(f, "io error: {msg}"),
            Self::Fault(msg) => write!(f, "internal fault: {msg}"),
        }
    }
}

impl std::error::Error for CfgError {}

impl From<std::io::Error> for CfgError {
    fn from(e: std::io::Error) -> Self {
        Self::IoError(e.to_string())
    }
}

impl CfgError {
    /// True for the subset of errors that §7 says must terminate the owning
    /// session rather than simply fail the one call.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::Fault(_))
    }
}
