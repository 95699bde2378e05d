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

//! The self-describing textual on-disk grammar (spec §4.1): `~` empty,
//! `!t`/`!f` bool, `[...]` int, `(...)` float, `"..."` string (`\` escapes `\`
//! and `"`), `{ ... }` a stem rendered as its children's name/value pairs.
//! Grounded in the shape of
//! `original_source/framework/daemons/configTree/treeDb.c`'s serializer —
//! reimplemented as a small recursive-descent parser/printer, not ported.

use crate::error::{CfgError, CfgResult};
use crate::node::{NodeId, NodeType};
use crate::tree::Tree;

pub fn serialize_tree(tree: &Tree) -> String {
    let mut out = String::new();
    serialize_node(tree, tree.root(), &mut out);
    out
}

fn serialize_node(tree: &Tree, id: NodeId, out: &mut String) {
    let node = match tree.node(id) {
        Some(n) => n,
        None => {
            out.push('~');
            return;
        }
    };
    match node.kind() {
        NodeType::Empty | NodeType::Deleted => out.push('~'),
        NodeType::Bool => out.push_str(if node.get_value_as(false) { "!t" } else { "!f" }),
        NodeType::Int => {
            out.push('[');
            out.push_str(&node.get_value_as::<i64>(0).to_string());
            out.push(']');
        }
        NodeType::Float => {
            out.push('(');
            out.push_str(&format!("{:.6}", node.get_value_as::<f64>(0.0)));
            out.push(')');
        }
        NodeType::String => {
            out.push('"');
            escape_into(&node.get_value_as::<String>(String::new()), out);
            out.push('"');
        }
        NodeType::Stem => {
            out.push('{');
            for child in tree.active_children(id) {
                if let Some(c) = tree.node(child) {
                    out.push(' ');
                    out.push('"');
                    escape_into(c.name(), out);
                    out.push('"');
                    out.push(' ');
                    serialize_node(tree, child, out);
                }
            }
            out.push_str(" }");
        }
    }
}

fn escape_into(s: &str, out: &mut String) {
    for ch in s.chars() {
        if ch == '\\' || ch == '"' {
            out.push('\\');
        }
        out.push(ch);
    }
}

struct Cursor<'a> {
    s: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(s: &'a str) -> Self {
        Cursor { s, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.s[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn expect(&mut self, want: char) -> CfgResult<()> {
        match self.bump() {
            Some(c) if c == want => Ok(()),
            _ => Err(fmt_err(self.pos, &format!("expected '{want}'"))),
        }
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }
}

fn fmt_err(pos: usize, msg: &str) -> CfgError {
    log::warn!("malformed config tree data at byte {pos}: {msg}");
    CfgError::FormatError(format!("at byte {pos}: {msg}"))
}

/// Parses a whole tree file's contents into a fresh `Tree` named `name`.
/// `max_string_len` truncates oversized string values; the returned `bool` is
/// `true` if any value or name had to be truncated to fit, so the caller can
/// surface `CfgError::Overflow` (spec §4.1, spec.md:74/186) even though the
/// truncated tree is otherwise usable. Any other malformed token fails the
/// whole parse.
pub fn parse_tree(name: String, max_name_len: usize, text: &str, max_string_len: usize) -> CfgResult<(Tree, bool)> {
    let mut tree = Tree::new_empty(name, max_name_len);
    let root = tree.root();
    let mut cur = Cursor::new(text);
    let overflow = parse_value_into(&mut tree, root, &mut cur, max_string_len)?;
    Ok((tree, overflow))
}

/// Returns whether this value (or any descendant, for a stem) had a string
/// truncated while parsing.
fn parse_value_into(tree: &mut Tree, id: NodeId, cur: &mut Cursor, max_string_len: usize) -> CfgResult<bool> {
    cur.skip_ws();
    match cur.peek() {
        Some('~') => {
            cur.bump();
            tree.set_empty(id)?;
            Ok(false)
        }
        Some('!') => {
            cur.bump();
            match cur.bump() {
                Some('t') => {
                    tree.node_mut(id).ok_or(CfgError::Fault("node vanished during parse".into()))?.set_value_as(true);
                    Ok(false)
                }
                Some('f') => {
                    tree.node_mut(id).ok_or(CfgError::Fault("node vanished during parse".into()))?.set_value_as(false);
                    Ok(false)
                }
                _ => Err(fmt_err(cur.pos, "expected 't' or 'f' after '!'")),
            }
        }
        Some('[') => {
            cur.bump();
            let raw = read_until(cur, ']')?;
            let n: i64 = raw.trim().parse().map_err(|_| fmt_err(cur.pos, "invalid integer literal"))?;
            tree.node_mut(id).ok_or(CfgError::Fault("node vanished during parse".into()))?.set_value_as(n);
            Ok(false)
        }
        Some('(') => {
            cur.bump();
            let raw = read_until(cur, ')')?;
            let f: f64 = raw.trim().parse().map_err(|_| fmt_err(cur.pos, "invalid float literal"))?;
            tree.node_mut(id).ok_or(CfgError::Fault("node vanished during parse".into()))?.set_value_as(f);
            Ok(false)
        }
        Some('"') => {
            let (s, overflowed) = read_quoted(cur, max_string_len)?;
            tree.node_mut(id).ok_or(CfgError::Fault("node vanished during parse".into()))?.set_value_as(s);
            Ok(overflowed)
        }
        Some('{') => {
            cur.bump();
            let mut overflow = false;
            loop {
                cur.skip_ws();
                match cur.peek() {
                    Some('}') => {
                        cur.bump();
                        return Ok(overflow);
                    }
                    None => return Err(fmt_err(cur.pos, "unterminated group")),
                    _ => {}
                }
                let (name, name_overflowed) = read_quoted(cur, max_string_len)?;
                overflow |= name_overflowed;
                cur.skip_ws();
                let child = tree
                    .create_child(id, &name)
                    .map_err(|_| fmt_err(cur.pos, "duplicate or invalid child name"))?;
                overflow |= parse_value_into(tree, child, cur, max_string_len)?;
            }
        }
        Some(c) => Err(fmt_err(cur.pos, &format!("unexpected token start '{c}'"))),
        None => Err(fmt_err(cur.pos, "unexpected end of input")),
    }
}

fn read_until(cur: &mut Cursor, end: char) -> CfgResult<String> {
    let mut s = String::new();
    loop {
        match cur.bump() {
            Some(c) if c == end => return Ok(s),
            Some(c) => s.push(c),
            None => return Err(fmt_err(cur.pos, "unterminated token")),
        }
    }
}

/// Reads a quoted string, truncating at `max_len` bytes rather than failing
/// the parse. Returns the (possibly truncated) string plus whether
/// truncation happened, so the caller can surface `CfgError::Overflow`.
fn read_quoted(cur: &mut Cursor, max_len: usize) -> CfgResult<(String, bool)> {
    cur.skip_ws();
    cur.expect('"')?;
    let mut s = String::new();
    let mut overflowed = false;
    loop {
        match cur.bump() {
            Some('\\') => match cur.bump() {
                Some(c @ ('\\' | '"')) => {
                    if s.len() < max_len {
                        s.push(c);
                    } else {
                        overflowed = true;
                    }
                }
                _ => return Err(fmt_err(cur.pos, "invalid escape sequence")),
            },
            Some('"') => {
                if overflowed {
                    log::warn!("string value truncated to {max_len} bytes while parsing");
                }
                return Ok((s, overflowed));
            }
            Some(c) => {
                if s.len() < max_len {
                    s.push(c);
                } else {
                    overflowed = true;
                }
            }
            None => return Err(fmt_err(cur.pos, "unterminated string")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_small_tree() {
        let mut t = Tree::new_empty("app1".into(), 64);
        let root = t.root();
        let svc = t.create_child(root, "svc").unwrap();
        t.node_mut(svc).unwrap().set_value_as(80i64);
        let label = t.create_child(root, "label").unwrap();
        t.node_mut(label).unwrap().set_value_as("hello \"world\"".to_owned());
        let flag = t.create_child(root, "flag").unwrap();
        t.node_mut(flag).unwrap().set_value_as(true);

        let text = serialize_tree(&t);
        let (parsed, overflow) = parse_tree("app1".into(), 64, &text, 4096).unwrap();
        assert!(!overflow);

        let proot = parsed.root();
        let psvc = parsed.find_child(proot, "svc").unwrap();
        assert_eq!(parsed.node(psvc).unwrap().get_value_as::<i64>(-1), 80);
        let plabel = parsed.find_child(proot, "label").unwrap();
        assert_eq!(parsed.node(plabel).unwrap().get_value_as::<String>("".into()), "hello \"world\"");
        let pflag = parsed.find_child(proot, "flag").unwrap();
        assert_eq!(parsed.node(pflag).unwrap().get_value_as::<bool>(false), true);
    }

    #[test]
    fn malformed_token_fails_the_whole_parse() {
        assert!(parse_tree("app1".into(), 64, "{ \"x\" [not-a-number] }", 4096).is_err());
    }

    #[test]
    fn empty_root_round_trips() {
        let t = Tree::new_empty("app1".into(), 64);
        let text = serialize_tree(&t);
        let (parsed, overflow) = parse_tree("app1".into(), 64, &text, 4096).unwrap();
        assert!(!overflow);
        assert_eq!(parsed.active_children(parsed.root()), Vec::new());
    }

    #[test]
    fn oversized_string_is_truncated_and_flagged_as_overflow() {
        let mut t = Tree::new_empty("app1".into(), 64);
        let root = t.root();
        let label = t.create_child(root, "label").unwrap();
        t.node_mut(label).unwrap().set_value_as("hello world".to_owned());
        let text = serialize_tree(&t);

        let (parsed, overflow) = parse_tree("app1".into(), 64, &text, 5).unwrap();
        assert!(overflow);
        let plabel = parsed.find_child(parsed.root(), "label").unwrap();
        assert_eq!(parsed.node(plabel).unwrap().get_value_as::<String>("".into()), "hello");
    }
}
