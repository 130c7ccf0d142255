//! git packfile decoding and encoding
//!
//! a pack is `"PACK" | version | count` followed by `count` entries and a
//! trailing digest over everything before it. entries are zlib streams
//! preceded by a type/size varint; delta entries reference their base by
//! offset (`ofs-delta`) or by id (`ref-delta`).

pub mod delta;
pub mod writer;

use std::collections::HashMap;
use std::io::{self, BufRead, Read};

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::hash::{Hasher, ObjectId};
use crate::object::{ObjectKind, ObjectStore};
use crate::progress::{CancellationToken, Phase, Progress};

pub use writer::write_pack;

const OBJ_COMMIT: u8 = 1;
const OBJ_TREE: u8 = 2;
const OBJ_BLOB: u8 = 3;
const OBJ_TAG: u8 = 4;
const OBJ_OFS_DELTA: u8 = 6;
const OBJ_REF_DELTA: u8 = 7;

/// upper bound for a single inflated object
const MAX_OBJECT_SIZE: usize = 1 << 31;

fn corrupt(msg: impl Into<String>) -> Error {
    Error::CorruptPack(msg.into())
}

fn kind_from_type(t: u8) -> Option<ObjectKind> {
    match t {
        OBJ_COMMIT => Some(ObjectKind::Commit),
        OBJ_TREE => Some(ObjectKind::Tree),
        OBJ_BLOB => Some(ObjectKind::Blob),
        OBJ_TAG => Some(ObjectKind::Tag),
        _ => None,
    }
}

pub(crate) fn type_of_kind(kind: ObjectKind) -> u8 {
    match kind {
        ObjectKind::Commit => OBJ_COMMIT,
        ObjectKind::Tree => OBJ_TREE,
        ObjectKind::Blob => OBJ_BLOB,
        ObjectKind::Tag => OBJ_TAG,
    }
}

/// what a decoded pack contributed to the store
#[derive(Debug, Default)]
pub struct Unpacked {
    /// every object the pack contained, in pack order after delta resolution
    pub ids: Vec<ObjectId>,
    pub deltas: u64,
    pub bytes: u64,
}

/// BufRead adapter that digests and counts consumed bytes
struct HashingReader<R: BufRead> {
    inner: R,
    hasher: Option<Hasher>,
    offset: u64,
}

impl<R: BufRead> HashingReader<R> {
    fn byte(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b).map_err(read_error)?;
        Ok(b[0])
    }
}

impl<R: BufRead> Read for HashingReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl<R: BufRead> BufRead for HashingReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        if amt == 0 {
            return;
        }
        // the bytes being consumed are still buffered, so this does no io
        if let (Some(hasher), Ok(buf)) = (self.hasher.as_mut(), self.inner.fill_buf()) {
            hasher.update(&buf[..amt.min(buf.len())]);
        }
        self.offset += amt as u64;
        self.inner.consume(amt);
    }
}

fn read_error(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        corrupt("pack truncated")
    } else {
        Error::Network(e.to_string())
    }
}

/// delta waiting for its base
struct PendingDelta {
    offset: u64,
    base: Base,
    data: Vec<u8>,
}

enum Base {
    Offset(u64),
    Id(ObjectId),
}

/// decode a pack stream into `store`
///
/// objects are written as they are decoded; the caller is expected to pass
/// a quarantine store and discard it when this returns an error.
pub fn unpack<R: BufRead>(
    reader: R,
    store: &ObjectStore,
    progress: &mut Progress<'_, '_>,
    cancel: &CancellationToken,
) -> Result<Unpacked> {
    let algo = store.algorithm();
    let mut r = HashingReader {
        inner: reader,
        hasher: Some(algo.hasher()),
        offset: 0,
    };

    let mut header = [0u8; 12];
    r.read_exact(&mut header).map_err(read_error)?;
    if &header[..4] != b"PACK" {
        return Err(corrupt("missing PACK signature"));
    }
    let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if version != 2 && version != 3 {
        return Err(Error::Unsupported(format!("pack version {}", version)));
    }
    let count = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as u64;
    debug!(version, count, "receiving pack");
    progress.phase(Phase::Receiving, Some(count));

    let mut by_offset: HashMap<u64, (ObjectKind, ObjectId)> = HashMap::new();
    let mut pending: Vec<PendingDelta> = Vec::new();
    let mut out = Unpacked::default();

    for i in 0..count {
        cancel.check()?;
        let offset = r.offset;
        let (t, size) = read_entry_header(&mut r)?;

        match t {
            OBJ_COMMIT | OBJ_TREE | OBJ_BLOB | OBJ_TAG => {
                let kind = kind_from_type(t).ok_or_else(|| corrupt("bad type"))?;
                let data = inflate(&mut r, size)?;
                let id = store.put(kind, &data)?;
                trace!(offset, %kind, %id, "pack entry");
                by_offset.insert(offset, (kind, id));
                out.ids.push(id);
            }
            OBJ_OFS_DELTA => {
                let distance = read_ofs_distance(&mut r)?;
                let base = offset
                    .checked_sub(distance)
                    .filter(|_| distance > 0)
                    .ok_or_else(|| corrupt("ofs-delta before start of pack"))?;
                let data = inflate(&mut r, size)?;
                out.deltas += 1;
                pending.push(PendingDelta {
                    offset,
                    base: Base::Offset(base),
                    data,
                });
            }
            OBJ_REF_DELTA => {
                let mut raw = vec![0u8; algo.digest_len()];
                r.read_exact(&mut raw).map_err(read_error)?;
                let base = algo.id_from_bytes(&raw)?;
                let data = inflate(&mut r, size)?;
                out.deltas += 1;
                pending.push(PendingDelta {
                    offset,
                    base: Base::Id(base),
                    data,
                });
            }
            other => return Err(corrupt(format!("unknown entry type {}", other))),
        }

        // resolve eagerly while the base is likely still hot
        resolve_pending(store, &mut pending, &mut by_offset, &mut out.ids)?;
        progress.set(i + 1);
    }

    // trailer: digest of everything read so far
    let expected = r
        .hasher
        .take()
        .map(|h| h.finalize())
        .ok_or_else(|| corrupt("pack digest unavailable"))?;
    let mut trailer = vec![0u8; algo.digest_len()];
    r.read_exact(&mut trailer).map_err(read_error)?;
    if expected.as_bytes() != trailer.as_slice() {
        return Err(corrupt(format!(
            "checksum mismatch: computed {}, trailer {}",
            expected,
            hex::encode(&trailer)
        )));
    }
    out.bytes = r.offset;

    if !pending.is_empty() {
        progress.phase(Phase::Resolving, None);
        resolve_pending(store, &mut pending, &mut by_offset, &mut out.ids)?;
        if !pending.is_empty() {
            return Err(corrupt(format!("{} deltas with missing bases", pending.len())));
        }
    }

    debug!(objects = out.ids.len(), deltas = out.deltas, bytes = out.bytes, "pack decoded");
    Ok(out)
}

/// apply every pending delta whose base is available, until none progress
fn resolve_pending(
    store: &ObjectStore,
    pending: &mut Vec<PendingDelta>,
    by_offset: &mut HashMap<u64, (ObjectKind, ObjectId)>,
    ids: &mut Vec<ObjectId>,
) -> Result<()> {
    loop {
        let mut progressed = false;
        let mut i = 0;
        while i < pending.len() {
            let base = match &pending[i].base {
                Base::Offset(off) => by_offset.get(off).map(|(_, id)| *id),
                Base::Id(id) if store.has(id) => Some(*id),
                Base::Id(_) => None,
            };
            let base_id = match base {
                Some(id) => id,
                None => {
                    i += 1;
                    continue;
                }
            };

            let delta = pending.swap_remove(i);
            let base_obj = store.get(&base_id)?;
            let data = delta::apply(&base_obj.data, &delta.data)?;
            let id = store.put(base_obj.kind, &data)?;
            trace!(offset = delta.offset, base = %base_id, %id, "resolved delta");
            by_offset.insert(delta.offset, (base_obj.kind, id));
            ids.push(id);
            progressed = true;
        }
        if !progressed {
            return Ok(());
        }
    }
}

fn read_entry_header<R: BufRead>(r: &mut HashingReader<R>) -> Result<(u8, usize)> {
    let mut c = r.byte()?;
    let t = (c >> 4) & 0x07;
    let mut size = (c & 0x0f) as usize;
    let mut shift = 4;
    while c & 0x80 != 0 {
        c = r.byte()?;
        if shift > 60 {
            return Err(corrupt("entry size overflow"));
        }
        size |= ((c & 0x7f) as usize) << shift;
        shift += 7;
    }
    if size > MAX_OBJECT_SIZE {
        return Err(corrupt(format!("entry of {} bytes exceeds limit", size)));
    }
    Ok((t, size))
}

/// negative offset encoding used by ofs-delta
fn read_ofs_distance<R: BufRead>(r: &mut HashingReader<R>) -> Result<u64> {
    let mut c = r.byte()?;
    let mut distance = (c & 0x7f) as u64;
    while c & 0x80 != 0 {
        c = r.byte()?;
        distance = distance
            .checked_add(1)
            .and_then(|d| d.checked_mul(128))
            .ok_or_else(|| corrupt("ofs-delta offset overflow"))?
            | (c & 0x7f) as u64;
    }
    Ok(distance)
}

fn inflate<R: BufRead>(r: &mut HashingReader<R>, size: usize) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(size.min(1 << 24));
    let mut decoder = flate2::bufread::ZlibDecoder::new(r);
    decoder
        .read_to_end(&mut data)
        .map_err(|e| match e.kind() {
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => {
                corrupt(format!("bad zlib stream: {}", e))
            }
            _ => read_error(e),
        })?;
    if data.len() != size {
        return Err(corrupt(format!(
            "entry inflated to {} bytes, header says {}",
            data.len(),
            size
        )));
    }
    Ok(data)
}
