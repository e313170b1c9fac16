//! Length-prefixed message codec.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the length header in front of every element.
const LENGTH_PREFIX: usize = 4;

/// Codec errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Message truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Message element {index} is not valid UTF-8")]
    InvalidUtf8 { index: usize },
}

/// Result type for codec operations
pub type CodecResult<T> = Result<T, CodecError>;

/// Pack a sequence of byte strings into a single blob.
pub fn pack<I, T>(items: I) -> Bytes
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut buf = BytesMut::new();
    for item in items {
        let item = item.as_ref();
        buf.reserve(LENGTH_PREFIX + item.len());
        buf.put_u32(item.len() as u32);
        buf.put_slice(item);
    }
    buf.freeze()
}

/// Unpack a blob produced by [`pack`].
///
/// Fails with [`CodecError::Truncated`] when a length header is cut short or
/// declares more bytes than remain.
pub fn unpack(blob: &[u8]) -> CodecResult<Vec<Bytes>> {
    let mut buf = Bytes::copy_from_slice(blob);
    let mut items = Vec::new();

    while buf.has_remaining() {
        if buf.remaining() < LENGTH_PREFIX {
            return Err(CodecError::Truncated {
                needed: LENGTH_PREFIX,
                remaining: buf.remaining(),
            });
        }
        let len = buf.get_u32() as usize;
        if len > buf.remaining() {
            return Err(CodecError::Truncated {
                needed: len,
                remaining: buf.remaining(),
            });
        }
        items.push(buf.split_to(len));
    }

    Ok(items)
}

/// Unpack a blob whose elements must all be UTF-8 strings.
pub fn unpack_strings(blob: &[u8]) -> CodecResult<Vec<String>> {
    unpack(blob)?
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            String::from_utf8(item.to_vec()).map_err(|_| CodecError::InvalidUtf8 { index })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_pack_layout() {
        let blob = pack(["env", ""]);
        assert_eq!(&blob[..], b"\x00\x00\x00\x03env\x00\x00\x00\x00");
    }

    #[test]
    fn test_empty_sequence() {
        let blob = pack(Vec::<Vec<u8>>::new());
        assert!(blob.is_empty());
        assert!(unpack(&blob).unwrap().is_empty());
    }

    #[test]
    fn test_control_bytes_survive() {
        let items = vec![b"a\x00b\nc".to_vec(), vec![0xff; 3]];
        let unpacked = unpack(&pack(&items)).unwrap();
        assert_eq!(unpacked[0], items[0]);
        assert_eq!(unpacked[1], items[1]);
    }

    #[test]
    fn test_declared_length_exceeds_remaining() {
        let mut blob = pack(["GROUP", "prod"]).to_vec();
        blob.truncate(blob.len() - 2);
        assert_eq!(
            unpack(&blob),
            Err(CodecError::Truncated {
                needed: 4,
                remaining: 2
            })
        );
    }

    #[test]
    fn test_partial_length_header() {
        let mut blob = pack(["x"]).to_vec();
        blob.extend_from_slice(&[0, 0]);
        assert!(matches!(unpack(&blob), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn test_unpack_strings_rejects_invalid_utf8() {
        let blob = pack([b"ok".to_vec(), vec![0xc3, 0x28]]);
        assert_eq!(
            unpack_strings(&blob),
            Err(CodecError::InvalidUtf8 { index: 1 })
        );
    }

    proptest! {
        #[test]
        fn prop_unpack_inverts_pack(items in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..16)) {
            let unpacked: Vec<Vec<u8>> = unpack(&pack(&items))
                .unwrap()
                .into_iter()
                .map(|b| b.to_vec())
                .collect();
            prop_assert_eq!(unpacked, items);
        }

        #[test]
        fn prop_truncation_is_detected(items in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..32), 1..8), seed in any::<usize>()) {
            let blob = pack(&items);
            // Cut inside the last element, never exactly on its boundary.
            let last = LENGTH_PREFIX + items[items.len() - 1].len();
            let cut = 1 + seed % (last - 1);
            let result = unpack(&blob[..blob.len() - cut]);
            let truncated = matches!(result, Err(CodecError::Truncated { .. }));
            prop_assert!(truncated);
        }
    }
}
