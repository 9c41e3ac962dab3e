// ── Sortable encoding helpers ──────────────────────────────────
//
// Byte-level lexicographic comparison of these encodings matches the
// natural ordering of the encoded values. Signed integers flip the sign
// bit and go big-endian; doubles flip the sign bit when positive and all
// bits when negative.

#[inline]
pub fn encode_i64_sortable(n: i64) -> [u8; 8] {
    ((n as u64) ^ 0x8000_0000_0000_0000).to_be_bytes()
}

#[inline]
pub fn decode_i64_sortable(b: [u8; 8]) -> i64 {
    (u64::from_be_bytes(b) ^ 0x8000_0000_0000_0000) as i64
}

#[inline]
pub fn encode_f64_sortable(f: f64) -> [u8; 8] {
    // -0.0 and 0.0 must produce the same bytes.
    let f = if f == 0.0 { 0.0 } else { f };
    let bits = f.to_bits();
    let encoded = if (bits & 0x8000_0000_0000_0000) != 0 {
        !bits
    } else {
        bits ^ 0x8000_0000_0000_0000
    };
    encoded.to_be_bytes()
}

#[inline]
pub fn decode_f64_sortable(b: [u8; 8]) -> f64 {
    let encoded = u64::from_be_bytes(b);
    let bits = if (encoded & 0x8000_0000_0000_0000) != 0 {
        encoded ^ 0x8000_0000_0000_0000
    } else {
        !encoded
    };
    f64::from_bits(bits)
}

// ── Escaped byte strings ───────────────────────────────────────
//
// Variable-length byte strings are written with 0x00 escaped as
// 0x00 0xFF and terminated by 0x00 0x01. The terminator sorts below any
// continuation, so a string always sorts before its extensions, and the
// encoding is prefix-free.

pub const ESCAPE: u8 = 0x00;
pub const ESCAPED_NUL: u8 = 0xFF;
pub const TERMINATOR: u8 = 0x01;

pub fn write_escaped(buf: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        buf.push(b);
        if b == ESCAPE {
            buf.push(ESCAPED_NUL);
        }
    }
    buf.push(ESCAPE);
    buf.push(TERMINATOR);
}

/// Size in bytes of `bytes` once escaped and terminated.
pub fn escaped_len(bytes: &[u8]) -> usize {
    bytes.len() + bytes.iter().filter(|&&b| b == ESCAPE).count() + 2
}

/// Read an escaped string starting at `*pos`, advancing past its terminator.
pub fn read_escaped(bytes: &[u8], pos: &mut usize) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let b = *bytes.get(*pos)?;
        *pos += 1;
        if b != ESCAPE {
            out.push(b);
            continue;
        }
        let next = *bytes.get(*pos)?;
        *pos += 1;
        match next {
            ESCAPED_NUL => out.push(ESCAPE),
            TERMINATOR => return Some(out),
            _ => return None,
        }
    }
}
