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

//! Node representation shared by ordinary trees and shadow trees (spec §3, §4.1).
//!
//! A node's scalar payload is always stored as its canonical string form; typed
//! reads/writes coerce to and from that string on the fly. This matches the
//! original configTree's `Node_t`, which keeps a single dynamic-string value
//! behind a type tag rather than a tagged union of native types.

use crate::arena::Id;
use crate::error::{CfgError, CfgResult};
use std::hash::{Hash, Hasher};

pub type NodeId = Id;

/// A node's stored type. `Deleted` is a tombstone used only inside shadow
/// trees; it never appears in a non-shadow tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Empty,
    String,
    Int,
    Float,
    Bool,
    Stem,
    Deleted,
}

/// The type a client observes when asking "what is this, really" (spec §3):
/// an empty stem or valueless scalar reads as `Empty`, a tombstoned node reads
/// as `DoesNotExist`, never as the raw `Deleted` marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveType {
    Empty,
    String,
    Int,
    Float,
    Bool,
    Stem,
    DoesNotExist,
}

pub(crate) fn name_hash(name: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    name.hash(&mut hasher);
    hasher.finish()
}

/// Validates a node (or tree) name per spec §3: non-empty, not `.`/`..`, no
/// `/` or `:`, and within `max_len` bytes.
pub fn validate_name(name: &str, max_len: usize) -> CfgResult<()> {
    if name.is_empty() {
        return Err(CfgError::BadName("name must not be empty".into()));
    }
    if name == "." || name == ".." {
        return Err(CfgError::BadName(format!("'{name}' is a reserved name")));
    }
    if name.contains('/') || name.contains(':') {
        return Err(CfgError::BadName(format!(
            "'{name}' may not contain '/' or ':'"
        )));
    }
    if name.len() > max_len {
        return Err(CfgError::BadName(format!(
            "name '{name}' exceeds the maximum length of {max_len}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) name: String,
    pub(crate) name_hash: u64,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) kind: NodeType,
    /// Canonical string form of the scalar value. Unused (empty) for `Stem`.
    pub(crate) value: String,
    pub(crate) modified: bool,
    /// Tombstone flag, meaningful only inside a shadow tree (spec §3/§9).
    pub(crate) deleted: bool,
    /// Non-owning back-reference to the node this one shadows, if any.
    pub(crate) shadow_of: Option<NodeId>,
    /// Shadow-tree only: whether this stem's children have already been
    /// lazily mirrored from the original (spec §3, Shadow tree).
    pub(crate) populated: bool,
    /// Shadow-tree only: false for a lazily mirrored node whose scalar value
    /// has not yet been written in this transaction, meaning reads must fall
    /// through to the original via `shadow_of` (spec §3: "values are copied
    /// on first write").
    pub(crate) value_written: bool,
}

impl Node {
    pub(crate) fn new_root() -> Self {
        Node {
            name: String::new(),
            name_hash: 0,
            parent: None,
            children: Vec::new(),
            kind: NodeType::Stem,
            value: String::new(),
            modified: false,
            deleted: false,
            shadow_of: None,
            populated: true,
            value_written: true,
        }
    }

    pub(crate) fn new_child(name: String, parent: NodeId) -> Self {
        let name_hash = name_hash(&name);
        Node {
            name,
            name_hash,
            parent: Some(parent),
            children: Vec::new(),
            kind: NodeType::Empty,
            value: String::new(),
            modified: false,
            deleted: false,
            shadow_of: None,
            populated: true,
            value_written: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeType {
        self.kind
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn is_stem(&self) -> bool {
        matches!(self.kind, NodeType::Stem)
    }

    pub fn effective_type(&self, has_active_children: bool) -> EffectiveType {
        match self.kind {
            NodeType::Deleted => EffectiveType::DoesNotExist,
            NodeType::Empty => EffectiveType::Empty,
            NodeType::Stem => {
                if has_active_children {
                    EffectiveType::Stem
                } else {
                    EffectiveType::Empty
                }
            }
            NodeType::String => EffectiveType::String,
            NodeType::Int => EffectiveType::Int,
            NodeType::Float => EffectiveType::Float,
            NodeType::Bool => EffectiveType::Bool,
        }
    }

    /// A node reports itself empty when it's a Stem with no active children
    /// or a scalar with no value (spec §3, §4.1's third required inspection
    /// operation alongside `kind()`/`name()`).
    pub fn is_empty(&self, has_active_children: bool) -> bool {
        matches!(self.effective_type(has_active_children), EffectiveType::Empty)
    }

    /// Discards any value/children, becoming an empty node. Does not touch
    /// `deleted` or ancestry; callers un-tombstone separately (spec §4.1).
    pub(crate) fn set_empty_in_place(&mut self) {
        self.kind = NodeType::Empty;
        self.value.clear();
        self.children.clear();
        self.modified = true;
    }

    pub(crate) fn rename(&mut self, new_name: String) {
        self.name_hash = name_hash(&new_name);
        self.name = new_name;
        self.modified = true;
    }
}

/// Rounds a float to the nearest integer the way the spec's coercion law
/// requires: `⌊f + 0.5⌋` for `f >= 0`, `⌈f - 0.5⌉` for `f < 0`.
fn round_float_to_int(f: f64) -> i64 {
    if f >= 0.0 {
        (f + 0.5).floor() as i64
    } else {
        (f - 0.5).ceil() as i64
    }
}

/// Canonical string encode/decode plus the cross-type coercion laws of spec
/// §4.1 and property 6. Implemented per concrete Rust type rather than one
/// generic trait method, since each pairing has its own coercion rule.
pub trait ScalarValue: Sized + Clone {
    fn to_canonical(&self) -> String;
    fn from_node(kind: NodeType, value: &str, default: Self) -> Self;
}

impl ScalarValue for String {
    fn to_canonical(&self) -> String {
        self.clone()
    }
    fn from_node(kind: NodeType, value: &str, default: Self) -> Self {
        // Reading any scalar as a string is lossless; the canonical form is
        // already a string for every scalar kind.
        match kind {
            NodeType::String | NodeType::Int | NodeType::Float | NodeType::Bool => {
                value.to_owned()
            }
            _ => default,
        }
    }
}

impl ScalarValue for i64 {
    fn to_canonical(&self) -> String {
        self.to_string()
    }
    fn from_node(kind: NodeType, value: &str, default: Self) -> Self {
        match kind {
            NodeType::Int => value.parse().unwrap_or(default),
            NodeType::Float => value
                .parse::<f64>()
                .map(round_float_to_int)
                .unwrap_or(default),
            _ => default,
        }
    }
}

impl ScalarValue for f64 {
    fn to_canonical(&self) -> String {
        format!("{:.6}", self)
    }
    fn from_node(kind: NodeType, value: &str, default: Self) -> Self {
        match kind {
            NodeType::Float => value.parse().unwrap_or(default),
            NodeType::Int => value.parse::<i64>().map(|n| n as f64).unwrap_or(default),
            _ => default,
        }
    }
}

impl ScalarValue for bool {
    fn to_canonical(&self) -> String {
        if *self { "t".to_owned() } else { "f".to_owned() }
    }
    fn from_node(kind: NodeType, value: &str, default: Self) -> Self {
        match kind {
            NodeType::Bool => match value {
                "t" => true,
                "f" => false,
                _ => default,
            },
            _ => default,
        }
    }
}

fn kind_of<T>() -> NodeType
where
    T: ScalarValueKind,
{
    T::KIND
}

/// Maps a Rust scalar type to the `NodeType` it is stored as on write.
pub trait ScalarValueKind {
    const KIND: NodeType;
}
impl ScalarValueKind for String {
    const KIND: NodeType = NodeType::String;
}
impl ScalarValueKind for i64 {
    const KIND: NodeType = NodeType::Int;
}
impl ScalarValueKind for f64 {
    const KIND: NodeType = NodeType::Float;
}
impl ScalarValueKind for bool {
    const KIND: NodeType = NodeType::Bool;
}

impl Node {
    pub fn get_value_as<T: ScalarValue>(&self, default: T) -> T {
        if self.deleted {
            return default;
        }
        T::from_node(self.kind, &self.value, default)
    }

    pub fn set_value_as<T: ScalarValue + ScalarValueKind>(&mut self, v: T) {
        self.value = v.to_canonical();
        self.kind = kind_of::<T>();
        self.children.clear();
        self.modified = true;
    }
}
