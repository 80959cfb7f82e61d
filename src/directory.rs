//! Directory blob decoding and name resolution.
//!
//! A directory is a compact trie mapping object names to either a variable
//! (type + buffer offset + length) or a function (type + id + length). Two
//! forms exist: a *short* directory with literals truncated to the
//! unambiguous minimum (used by [`find`]), and a *long* directory carrying
//! full names (used by [`list`]).
//!
//! Blob layout, all varints LEB128:
//!
//! ```text
//! node  := skip:varint literal[skip] child_count:varint body
//! body  := tag:u8 a:varint b:varint            child_count == 0 (leaf)
//!        | child_count * (byte:u8 off:varint)  child_count >= 1
//! ```
//!
//! A child's `byte` is consumed as a name character; `off` is the absolute
//! blob offset of the child node. A leaf carries `a` = buffer offset
//! (variable) or id (function) and `b` = length.

use anyhow::{anyhow, ensure, Result};

use crate::store::Variant;
use crate::types::TypeTag;

pub(crate) fn read_varint(blob: &[u8], pos: &mut usize) -> Option<u32> {
    let mut value: u32 = 0;
    let mut shift = 0u32;
    loop {
        let b = *blob.get(*pos)?;
        *pos += 1;
        if shift >= 32 {
            return None;
        }
        value |= u32::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
    }
}

pub(crate) fn write_varint(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let b = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(b);
            return;
        }
        out.push(b | 0x80);
    }
}

// Child offsets are backpatched, so they are emitted in a padded fixed-width
// encoding that any LEB128 reader accepts.
fn write_varint_padded4(out: &mut Vec<u8>, value: u32) {
    debug_assert!(value < 1 << 28);
    out.push((value & 0x7f) as u8 | 0x80);
    out.push(((value >> 7) & 0x7f) as u8 | 0x80);
    out.push(((value >> 14) & 0x7f) as u8 | 0x80);
    out.push(((value >> 21) & 0x7f) as u8);
}

/// Resolve `name` in a directory blob.
///
/// Partial names are accepted as long as they stay unambiguous; once a leaf
/// is unambiguously reached, surplus name characters are skipped over.
/// Returns [`Variant::invalid`] when the name does not resolve, is
/// ambiguous, or the leaf fails validation against `buffer_size`.
pub fn find(buffer_size: usize, dir: &[u8], name: &[u8], max_name_len: usize) -> Variant {
    let name = &name[..name.len().min(max_name_len)];
    match walk(buffer_size, dir, name) {
        Some(v) => v,
        None => Variant::invalid(),
    }
}

fn walk(buffer_size: usize, dir: &[u8], name: &[u8]) -> Option<Variant> {
    let mut pos = 0usize;
    let mut i = 0usize;

    loop {
        let skip = read_varint(dir, &mut pos)? as usize;
        let literal = dir.get(pos..pos + skip)?;
        pos += skip;
        for &lit in literal {
            if i < name.len() {
                if name[i] != lit {
                    return None;
                }
                i += 1;
            }
            // Name exhausted: a literal never branches, keep following.
        }

        let child_count = read_varint(dir, &mut pos)? as usize;
        if child_count == 0 {
            let tag = TypeTag(*dir.get(pos)?);
            pos += 1;
            let a = read_varint(dir, &mut pos)?;
            let b = read_varint(dir, &mut pos)?;
            return leaf_variant(buffer_size, tag, a, b);
        }

        if i >= name.len() {
            // Out of name characters at a branch: only a single outgoing
            // edge keeps the lookup unambiguous.
            if child_count != 1 {
                return None;
            }
            pos += 1; // the edge byte, not matched against anything
            let off = read_varint(dir, &mut pos)? as usize;
            pos = off;
            continue;
        }

        let mut next = None;
        for _ in 0..child_count {
            let edge = *dir.get(pos)?;
            pos += 1;
            let off = read_varint(dir, &mut pos)? as usize;
            if edge == name[i] {
                next = Some(off);
            }
        }
        pos = next?;
        i += 1;
    }
}

fn leaf_variant(buffer_size: usize, tag: TypeTag, a: u32, b: u32) -> Option<Variant> {
    if !tag.is_known() {
        return None;
    }
    if tag.is_function() {
        return Some(Variant::function(tag, a, b));
    }
    let size = if tag.is_fixed() { tag.size() as u32 } else { b };
    let end = a.checked_add(size)?;
    if end as usize > buffer_size {
        return None;
    }
    if tag.is_fixed() && a % tag.size() as u32 != 0 {
        // Misaligned fixed-size object; the blob is corrupt.
        return None;
    }
    Some(Variant::variable(tag, a, b))
}

/// Enumerate every object of a long directory, in blob order.
pub fn list(buffer_size: usize, long_dir: &[u8], f: &mut dyn FnMut(&str, Variant)) -> Result<()> {
    let mut name = Vec::new();
    list_node(buffer_size, long_dir, 0, &mut name, f)
}

fn list_node(
    buffer_size: usize,
    dir: &[u8],
    mut pos: usize,
    name: &mut Vec<u8>,
    f: &mut dyn FnMut(&str, Variant),
) -> Result<()> {
    let eof = || anyhow!("Truncated directory node");

    let skip = read_varint(dir, &mut pos).ok_or_else(eof)? as usize;
    let literal = dir.get(pos..pos + skip).ok_or_else(eof)?;
    pos += skip;
    let depth = name.len();
    name.extend_from_slice(literal);

    let child_count = read_varint(dir, &mut pos).ok_or_else(eof)? as usize;
    if child_count == 0 {
        let tag = TypeTag(*dir.get(pos).ok_or_else(eof)?);
        pos += 1;
        let a = read_varint(dir, &mut pos).ok_or_else(eof)?;
        let b = read_varint(dir, &mut pos).ok_or_else(eof)?;
        let v = leaf_variant(buffer_size, tag, a, b)
            .ok_or_else(|| anyhow!("Invalid directory leaf for {:?}", String::from_utf8_lossy(name)))?;
        let s = std::str::from_utf8(name).map_err(|_| anyhow!("Non-UTF-8 object name"))?;
        f(s, v);
    } else {
        for _ in 0..child_count {
            let edge = *dir.get(pos).ok_or_else(eof)?;
            pos += 1;
            let off = read_varint(dir, &mut pos).ok_or_else(eof)? as usize;
            name.push(edge);
            list_node(buffer_size, dir, off, name, f)?;
            name.pop();
        }
    }

    name.truncate(depth);
    Ok(())
}

/// An object definition fed to the [`DirectoryBuilder`].
#[derive(Debug, Clone, Copy)]
pub enum Object {
    Variable { tag: TypeTag, offset: u32, len: u32 },
    Function { tag: TypeTag, id: u32, len: u32 },
}

impl Object {
    fn leaf(self) -> (TypeTag, u32, u32) {
        match self {
            Object::Variable { tag, offset, len } => (tag, offset, len),
            Object::Function { tag, id, len } => {
                (TypeTag(tag.0 | TypeTag::FLAG_FUNCTION), id, len)
            }
        }
    }
}

/// Assembles short and long directory blobs from a name → object map.
///
/// The schema compiler normally produces these; the builder exists so that
/// tests, the tools binary and embedders without generated code can set up
/// stores.
#[derive(Debug, Default)]
pub struct DirectoryBuilder {
    entries: Vec<(Vec<u8>, Object)>,
}

impl DirectoryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, name: &str, obj: Object) -> Self {
        self.entries.push((name.as_bytes().to_vec(), obj));
        self
    }

    /// Build `(short, long)` directory blobs.
    pub fn build(mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        ensure!(!self.entries.is_empty(), "Directory without objects");
        self.entries.sort_by(|a, b| a.0.cmp(&b.0));
        for w in self.entries.windows(2) {
            ensure!(w[0].0 != w[1].0, "Duplicate object name");
            ensure!(
                !w[1].0.starts_with(&w[0].0),
                "Object name is a prefix of another"
            );
        }
        for (name, _) in &self.entries {
            ensure!(!name.is_empty(), "Empty object name");
        }

        let refs: Vec<(&[u8], Object)> =
            self.entries.iter().map(|(n, o)| (n.as_slice(), *o)).collect();
        let mut short = Vec::new();
        emit_node(&mut short, &refs, 0, true);
        let mut long = Vec::new();
        emit_node(&mut long, &refs, 0, false);
        Ok((short, long))
    }
}

// Emits the subtrie of `entries` (all sharing `depth` name bytes) at the
// current end of `out`, returning its offset.
fn emit_node(out: &mut Vec<u8>, entries: &[(&[u8], Object)], depth: usize, short: bool) -> u32 {
    let start = out.len() as u32;

    // Longest common literal run from `depth`.
    let first = entries[0].0;
    let mut skip = 0usize;
    'literal: loop {
        let d = depth + skip;
        if d >= first.len() {
            break;
        }
        let byte = first[d];
        for (name, _) in entries.iter().skip(1) {
            if d >= name.len() || name[d] != byte {
                break 'literal;
            }
        }
        skip += 1;
    }

    if entries.len() == 1 && !short {
        // Long form: carry the full remaining name.
        let name = entries[0].0;
        write_varint(out, (name.len() - depth) as u32);
        out.extend_from_slice(&name[depth..]);
        emit_leaf(out, entries[0].1);
        return start;
    }

    if entries.len() == 1 {
        // Short form: the name is already unambiguous, no literal needed.
        write_varint(out, 0);
        emit_leaf(out, entries[0].1);
        return start;
    }

    write_varint(out, skip as u32);
    out.extend_from_slice(&first[depth..depth + skip]);

    // Group by the branching byte.
    let d = depth + skip;
    let mut groups: Vec<(u8, usize, usize)> = Vec::new();
    let mut i = 0;
    while i < entries.len() {
        let byte = entries[i].0[d];
        let begin = i;
        while i < entries.len() && entries[i].0[d] == byte {
            i += 1;
        }
        groups.push((byte, begin, i));
    }

    write_varint(out, groups.len() as u32);
    let mut patches = Vec::with_capacity(groups.len());
    for (byte, _, _) in &groups {
        out.push(*byte);
        patches.push(out.len());
        write_varint_padded4(out, 0);
    }
    for ((_, begin, end), patch) in groups.iter().zip(patches) {
        let off = emit_node(out, &entries[*begin..*end], d + 1, short);
        let mut fixed = Vec::with_capacity(4);
        write_varint_padded4(&mut fixed, off);
        out[patch..patch + 4].copy_from_slice(&fixed);
    }

    start
}

fn emit_leaf(out: &mut Vec<u8>, obj: Object) {
    let (tag, a, b) = obj.leaf();
    write_varint(out, 0); // child_count
    out.push(tag.0);
    write_varint(out, a);
    write_varint(out, b);
}
