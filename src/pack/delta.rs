use crate::error::{Error, Result};

fn corrupt(msg: impl Into<String>) -> Error {
    Error::CorruptPack(format!("delta: {}", msg.into()))
}

/// little-endian base-128 size used in delta headers
fn read_size(delta: &[u8], pos: &mut usize) -> Result<usize> {
    let mut size = 0usize;
    let mut shift = 0;
    loop {
        let byte = *delta.get(*pos).ok_or_else(|| corrupt("truncated size"))?;
        *pos += 1;
        if shift > 56 {
            return Err(corrupt("size overflow"));
        }
        size |= ((byte & 0x7f) as usize) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok(size);
        }
    }
}

/// apply a git delta to its base
pub fn apply(base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let mut pos = 0;
    let src_size = read_size(delta, &mut pos)?;
    if src_size != base.len() {
        return Err(corrupt(format!(
            "base is {} bytes, delta expects {}",
            base.len(),
            src_size
        )));
    }
    let dst_size = read_size(delta, &mut pos)?;
    let mut out = Vec::with_capacity(dst_size.min(1 << 26));

    while pos < delta.len() {
        let cmd = delta[pos];
        pos += 1;

        if cmd & 0x80 != 0 {
            // copy from base: offset bytes flagged by bits 0-3, size by bits 4-6
            let mut offset = 0usize;
            let mut size = 0usize;
            for i in 0..4 {
                if cmd & (1 << i) != 0 {
                    let byte = *delta.get(pos).ok_or_else(|| corrupt("truncated copy"))?;
                    offset |= (byte as usize) << (8 * i);
                    pos += 1;
                }
            }
            for i in 0..3 {
                if cmd & (0x10 << i) != 0 {
                    let byte = *delta.get(pos).ok_or_else(|| corrupt("truncated copy"))?;
                    size |= (byte as usize) << (8 * i);
                    pos += 1;
                }
            }
            if size == 0 {
                size = 0x10000;
            }
            let end = offset
                .checked_add(size)
                .filter(|end| *end <= base.len())
                .ok_or_else(|| corrupt("copy outside base"))?;
            out.extend_from_slice(&base[offset..end]);
        } else if cmd != 0 {
            let n = cmd as usize;
            let data = delta
                .get(pos..pos + n)
                .ok_or_else(|| corrupt("truncated insert"))?;
            out.extend_from_slice(data);
            pos += n;
        } else {
            return Err(corrupt("reserved opcode 0"));
        }
        if out.len() > dst_size {
            return Err(corrupt(format!("result exceeds declared {} bytes", dst_size)));
        }
    }

    if out.len() != dst_size {
        return Err(corrupt(format!(
            "result is {} bytes, expected {}",
            out.len(),
            dst_size
        )));
    }
    Ok(out)
}
