//! Encoder and decoder for the cache document.
//!
//! The document is a single JSON array: major version, minor version, a
//! header object, then one record per cached directory. Each record is
//! itself an array whose first element describes the directory (keyed by its
//! absolute path) and whose remaining elements are its immediate children;
//! a child directory appears as a one-object array of its own. Zero-valued
//! fields are omitted on write and default on read.
//!
//! The writer streams the records itself because of two wire quirks the
//! generic serializer does not produce: zero-default omission and `\u00NN`
//! escapes for every byte below 32 and for DEL. The reader goes through
//! `serde_json::Value`, which keeps the tolerant semantics (unknown keys
//! skipped, fractional numbers truncated) cheap.

use std::io::Write;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use indu_core::item::{
    FF_DIR, FF_ERR, FF_EXL, FF_FILE, FF_FRMLNK, FF_HLNKC, FF_KERNFS, FF_OTHFS,
};

use crate::cache::{CacheChild, CacheEntry};

pub const FORMAT_MAJOR: i64 = 1;
pub const FORMAT_MINOR: i64 = 2;

const PROGNAME: &str = "indu";

#[derive(Debug, Serialize, Deserialize)]
pub struct Header {
    pub progname: String,
    pub progver: String,
    pub timestamp: i64,
}

impl Header {
    fn current() -> Self {
        Header {
            progname: PROGNAME.to_string(),
            progver: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now().timestamp(),
        }
    }
}

// ============================================================================
// Writing
// ============================================================================

pub fn write_document<'a, W: Write>(
    w: &mut W,
    entries: impl Iterator<Item = &'a CacheEntry>,
) -> Result<()> {
    write!(w, "[{},{},", FORMAT_MAJOR, FORMAT_MINOR)?;
    serde_json::to_writer(&mut *w, &Header::current())?;
    for entry in entries {
        w.write_all(b",\n")?;
        write_entry(w, entry)?;
    }
    w.write_all(b"]\n")?;
    Ok(())
}

fn write_entry<W: Write>(w: &mut W, entry: &CacheEntry) -> Result<()> {
    w.write_all(b"[{\"name\":\"")?;
    write_escaped(w, &entry.path)?;
    w.write_all(b"\"")?;
    write_signed(w, "asize", entry.asize)?;
    write_signed(w, "dsize", entry.size)?;
    write_unsigned(w, "dev", entry.dev)?;
    write_unsigned(w, "ino", entry.ino)?;
    write_unsigned(w, "mtime", entry.mtime)?;
    w.write_all(b"}")?;
    for child in &entry.children {
        w.write_all(b",\n")?;
        write_child(w, child)?;
    }
    w.write_all(b"]")?;
    Ok(())
}

fn write_child<W: Write>(w: &mut W, child: &CacheChild) -> Result<()> {
    let is_dir = child.flags & FF_DIR != 0;
    if is_dir {
        w.write_all(b"[")?;
    }

    w.write_all(b"{\"name\":\"")?;
    write_escaped(w, &child.name)?;
    w.write_all(b"\"")?;
    write_signed(w, "asize", child.asize)?;
    write_signed(w, "dsize", child.size)?;
    write_unsigned(w, "dev", child.dev)?;
    write_unsigned(w, "ino", child.ino)?;
    write_unsigned(w, "mtime", child.mtime)?;
    write_unsigned(w, "uid", u64::from(child.uid))?;
    write_unsigned(w, "gid", u64::from(child.gid))?;
    write_unsigned(w, "mode", u64::from(child.mode))?;
    if child.nlink > 1 {
        write!(w, ",\"hlnkc\":true,\"nlink\":{}", child.nlink)?;
    }
    if child.flags & FF_ERR != 0 {
        w.write_all(b",\"read_error\":true")?;
    }
    if child.flags & (FF_DIR | FF_FILE | FF_ERR | FF_EXL | FF_OTHFS | FF_KERNFS | FF_FRMLNK) == 0 {
        w.write_all(b",\"notreg\":true")?;
    }
    if child.flags & FF_EXL != 0 {
        w.write_all(b",\"excluded\":\"pattern\"")?;
    } else if child.flags & FF_OTHFS != 0 {
        w.write_all(b",\"excluded\":\"otherfs\"")?;
    } else if child.flags & FF_KERNFS != 0 {
        w.write_all(b",\"excluded\":\"kernfs\"")?;
    } else if child.flags & FF_FRMLNK != 0 {
        w.write_all(b",\"excluded\":\"frmlnk\"")?;
    }
    w.write_all(b"}")?;

    for nested in &child.children {
        w.write_all(b",\n")?;
        write_child(w, nested)?;
    }

    if is_dir {
        w.write_all(b"]")?;
    }
    Ok(())
}

fn write_signed<W: Write>(w: &mut W, key: &str, value: i64) -> Result<()> {
    if value != 0 {
        write!(w, ",\"{}\":{}", key, value)?;
    }
    Ok(())
}

fn write_unsigned<W: Write>(w: &mut W, key: &str, value: u64) -> Result<()> {
    if value != 0 {
        write!(w, ",\"{}\":{}", key, value)?;
    }
    Ok(())
}

/// JSON string escaping with `\u00NN` for every control byte and DEL.
/// Bytes above 127 pass through untouched, keeping multi-byte UTF-8 intact.
fn write_escaped<W: Write>(w: &mut W, s: &str) -> Result<()> {
    for &b in s.as_bytes() {
        match b {
            b'\n' => w.write_all(b"\\n")?,
            b'\r' => w.write_all(b"\\r")?,
            0x08 => w.write_all(b"\\b")?,
            b'\t' => w.write_all(b"\\t")?,
            0x0c => w.write_all(b"\\f")?,
            b'\\' => w.write_all(b"\\\\")?,
            b'"' => w.write_all(b"\\\"")?,
            b if b <= 31 || b == 127 => write!(w, "\\u00{:02x}", b)?,
            b => w.write_all(&[b])?,
        }
    }
    Ok(())
}

// ============================================================================
// Reading
// ============================================================================

/// Parse a cache document into one `CacheChild` per top-level record, the
/// record's absolute path in `name`. Structural damage fails the whole
/// document; a record whose numbers do not fit their types is dropped and
/// reported through the second element of the return value.
pub fn read_document(text: &str) -> Result<(Vec<CacheChild>, usize)> {
    let doc: Value = serde_json::from_str(text).context("cache file is not valid JSON")?;
    let root = doc
        .as_array()
        .ok_or_else(|| anyhow!("cache document is not an array"))?;
    if root.len() < 3 {
        bail!("cache document is truncated");
    }

    let major = root[0]
        .as_i64()
        .ok_or_else(|| anyhow!("missing format version"))?;
    if major != FORMAT_MAJOR {
        bail!("unsupported cache format version {}", major);
    }
    if !root[1].is_number() {
        bail!("missing format minor version");
    }
    if !root[2].is_object() {
        bail!("missing cache header");
    }
    if let Ok(header) = serde_json::from_value::<Header>(root[2].clone()) {
        log::debug!(
            "cache written by {} {} at {}",
            header.progname,
            header.progver,
            header.timestamp
        );
    }

    let mut records = Vec::new();
    let mut skipped = 0;
    for value in &root[3..] {
        match child_from_value(value, 0)? {
            Some(record) => records.push(record),
            None => skipped += 1,
        }
    }
    Ok((records, skipped))
}

/// Decode one item. `Ok(None)` means a numeric field overflowed somewhere in
/// the record, which invalidates just this record. A child without an
/// explicit `dev` inherits `parent_dev`.
fn child_from_value(value: &Value, parent_dev: u64) -> Result<Option<CacheChild>> {
    let (info, nested) = match value {
        Value::Array(parts) => {
            let info = parts
                .first()
                .and_then(Value::as_object)
                .ok_or_else(|| anyhow!("directory record without an info object"))?;
            (info, &parts[1..])
        }
        Value::Object(info) => (info, &[] as &[Value]),
        _ => bail!("cache item is neither an object nor an array"),
    };
    let is_dir = value.is_array();

    let mut child = CacheChild {
        flags: if is_dir { FF_DIR } else { FF_FILE },
        dev: parent_dev,
        ..CacheChild::default()
    };
    let mut have_name = false;

    for (key, val) in info {
        match key.as_str() {
            "name" => {
                child.name = val
                    .as_str()
                    .ok_or_else(|| anyhow!("item name is not a string"))?
                    .to_string();
                have_name = true;
            }
            "asize" => match num_i64(val) {
                Some(n) => child.asize = n,
                None => return Ok(None),
            },
            "dsize" => match num_i64(val) {
                Some(n) => child.size = n,
                None => return Ok(None),
            },
            "dev" => match num_u64(val) {
                Some(n) => child.dev = n,
                None => return Ok(None),
            },
            "ino" => match num_u64(val) {
                Some(n) => child.ino = n,
                None => return Ok(None),
            },
            "mtime" => match num_u64(val) {
                Some(n) => child.mtime = n,
                None => return Ok(None),
            },
            "uid" => match num_u64(val) {
                Some(n) => child.uid = n as u32,
                None => return Ok(None),
            },
            "gid" => match num_u64(val) {
                Some(n) => child.gid = n as u32,
                None => return Ok(None),
            },
            "mode" => match num_u64(val) {
                Some(n) => child.mode = n as u16,
                None => return Ok(None),
            },
            "nlink" => match num_u64(val) {
                Some(n) => {
                    child.nlink = n as u32;
                    if n > 1 {
                        child.flags |= FF_HLNKC;
                    }
                }
                None => return Ok(None),
            },
            "hlnkc" => {
                if val.as_bool() == Some(true) {
                    child.flags |= FF_HLNKC;
                }
            }
            "read_error" => {
                if val.as_bool() == Some(true) {
                    child.flags |= FF_ERR;
                }
            }
            "excluded" => {
                let kind = val
                    .as_str()
                    .ok_or_else(|| anyhow!("excluded marker is not a string"))?;
                child.flags |= match kind {
                    "otherfs" | "othfs" => FF_OTHFS,
                    "kernfs" => FF_KERNFS,
                    "frmlnk" => FF_FRMLNK,
                    _ => FF_EXL,
                };
            }
            "notreg" => {
                if val.as_bool() == Some(true) {
                    child.flags &= !FF_FILE;
                }
            }
            // Unknown keys are skipped for forward compatibility.
            _ => {}
        }
    }

    if !have_name {
        bail!("cache item without a name");
    }

    for nested_value in nested {
        match child_from_value(nested_value, child.dev)? {
            Some(nested_child) => child.children.push(nested_child),
            None => return Ok(None),
        }
    }

    Ok(Some(child))
}

fn num_u64(value: &Value) -> Option<u64> {
    if let Some(n) = value.as_u64() {
        return Some(n);
    }
    // Fractional values are accepted and truncated.
    let f = value.as_f64()?;
    if f >= 0.0 && f < u64::MAX as f64 {
        Some(f as u64)
    } else {
        None
    }
}

fn num_i64(value: &Value) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    let f = value.as_f64()?;
    if f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}
