//! Minimal SCALE helpers for composing substrate calls

/// Append a SCALE compact-encoded integer
pub fn encode_compact(value: u64, out: &mut Vec<u8>) {
    match value {
        0..=0x3f => out.push((value as u8) << 2),
        0x40..=0x3fff => out.extend_from_slice(&(((value as u16) << 2) | 0b01).to_le_bytes()),
        0x4000..=0x3fff_ffff => {
            out.extend_from_slice(&(((value as u32) << 2) | 0b10).to_le_bytes())
        }
        _ => {
            let bytes = value.to_le_bytes();
            let len = 8 - (value.leading_zeros() / 8) as usize;
            out.push((((len - 4) as u8) << 2) | 0b11);
            out.extend_from_slice(&bytes[..len]);
        }
    }
}

/// Wrap a call as an unsigned (version 4) extrinsic, length prefixed
pub fn unsigned_extrinsic(call: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(call.len() + 1);
    body.push(0x04);
    body.extend_from_slice(call);

    let mut out = Vec::with_capacity(body.len() + 4);
    encode_compact(body.len() as u64, &mut out);
    out.extend_from_slice(&body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compact(value: u64) -> Vec<u8> {
        let mut out = Vec::new();
        encode_compact(value, &mut out);
        out
    }

    #[test]
    fn test_compact_modes() {
        assert_eq!(compact(0), vec![0x00]);
        assert_eq!(compact(1), vec![0x04]);
        assert_eq!(compact(63), vec![0xfc]);
        assert_eq!(compact(64), vec![0x01, 0x01]);
        assert_eq!(compact(16383), vec![0xfd, 0xff]);
        assert_eq!(compact(16384), vec![0x02, 0x00, 0x01, 0x00]);
        assert_eq!(compact(1 << 30), vec![0x03, 0x00, 0x00, 0x00, 0x40]);
    }

    #[test]
    fn test_unsigned_extrinsic_prefix() {
        let xt = unsigned_extrinsic(&[0x0a, 0x00]);
        assert_eq!(xt, vec![0x0c, 0x04, 0x0a, 0x00]);
    }
}
