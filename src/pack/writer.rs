use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{Error, Result};
use crate::hash::{HashAlgorithm, Hasher};
use crate::object::RawObject;
use crate::pack::type_of_kind;

/// Write adapter that digests everything passing through
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Hasher,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn put(&mut self, data: &[u8]) -> Result<()> {
        self.hasher.update(data);
        self.written += data.len() as u64;
        self.inner
            .write_all(data)
            .map_err(|e| Error::Network(e.to_string()))
    }
}

fn entry_header(t: u8, size: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    let mut c = (t << 4) | (size & 0x0f) as u8;
    let mut rest = size >> 4;
    while rest > 0 {
        out.push(c | 0x80);
        c = (rest & 0x7f) as u8;
        rest >>= 7;
    }
    out.push(c);
    out
}

/// write a version 2 pack of whole (non-delta) objects
///
/// `count` must match the number of objects yielded. returns the number of
/// bytes written, trailer included.
pub fn write_pack<W: Write>(
    out: W,
    algo: HashAlgorithm,
    objects: impl Iterator<Item = Result<RawObject>>,
    count: u32,
) -> Result<u64> {
    let mut w = HashingWriter {
        inner: out,
        hasher: algo.hasher(),
        written: 0,
    };

    let mut header = Vec::with_capacity(12);
    header.extend_from_slice(b"PACK");
    header.extend_from_slice(&2u32.to_be_bytes());
    header.extend_from_slice(&count.to_be_bytes());
    w.put(&header)?;

    let mut seen = 0u32;
    for obj in objects {
        let obj = obj?;
        seen += 1;
        if seen > count {
            return Err(Error::Protocol("more objects than announced".to_string()));
        }

        w.put(&entry_header(type_of_kind(obj.kind), obj.data.len()))?;
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&obj.data)
            .map_err(|e| Error::Protocol(e.to_string()))?;
        let compressed = enc.finish().map_err(|e| Error::Protocol(e.to_string()))?;
        w.put(&compressed)?;
    }
    if seen != count {
        return Err(Error::Protocol(format!(
            "announced {} objects, wrote {}",
            count, seen
        )));
    }

    let HashingWriter {
        mut inner,
        hasher,
        written,
    } = w;
    let digest = hasher.finalize();
    inner
        .write_all(digest.as_bytes())
        .and_then(|_| inner.flush())
        .map_err(|e| Error::Network(e.to_string()))?;
    Ok(written + digest.as_bytes().len() as u64)
}
