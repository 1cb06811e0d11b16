// Property-based tests fuzzing the wire codec.
//
// Random inputs verify that primitive encodings round-trip and that
// every built frame keeps the size-prefix invariant.

use proptest::prelude::*;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rmq_stream::stream::constants::*;
use rmq_stream::stream::protocol::decoding;
use rmq_stream::stream::protocol::encoding::{self, FrameBuilder};

proptest! {
    #[test]
    fn prop_string_roundtrip(s in "\\PC{0,200}") {
        let mut buf = BytesMut::new();
        encoding::write_string(&mut buf, &s);
        let mut bytes = buf.freeze();
        prop_assert_eq!(decoding::read_string(&mut bytes).unwrap(), s);
        prop_assert!(!bytes.has_remaining());
    }

    #[test]
    fn prop_byte_array_roundtrip(payload in proptest::collection::vec(any::<u8>(), 0..512)) {
        let mut buf = BytesMut::new();
        encoding::write_byte_array(&mut buf, &payload);
        let mut bytes = buf.freeze();
        prop_assert_eq!(&decoding::read_byte_array(&mut bytes).unwrap()[..], &payload[..]);
        prop_assert!(!bytes.has_remaining());
    }

    #[test]
    fn prop_map_roundtrip(entries in proptest::collection::vec(("\\PC{0,40}", "\\PC{0,40}"), 0..16)) {
        let entries: Vec<(String, String)> = entries;
        let mut buf = BytesMut::new();
        encoding::write_map(&mut buf, &entries);
        let mut bytes = buf.freeze();
        prop_assert_eq!(decoding::read_map(&mut bytes).unwrap(), entries);
        prop_assert!(!bytes.has_remaining());
    }

    #[test]
    fn prop_correlation_id_preserved(correlation_id in any::<u32>()) {
        let frame = FrameBuilder::request(COMMAND_CREATE_STREAM, correlation_id).finish();
        let mut body = frame.slice(4..);
        let header = decoding::read_header(&mut body).unwrap();
        prop_assert_eq!(header.key, COMMAND_CREATE_STREAM);
        prop_assert!(!header.is_response);
        prop_assert_eq!(decoding::read_u32(&mut body, "correlation id").unwrap(), correlation_id);
    }

    #[test]
    fn prop_size_prefix_matches_body(
        publisher_id in any::<u8>(),
        messages in proptest::collection::vec((any::<u64>(), proptest::collection::vec(any::<u8>(), 0..64)), 0..16),
    ) {
        let batch: Vec<(u64, Bytes)> = messages
            .into_iter()
            .map(|(id, body)| (id, Bytes::from(body)))
            .collect();
        let frame = encoding::publish(publisher_id, &batch);
        let size = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        prop_assert_eq!(size as usize, frame.len() - 4);
    }

    #[test]
    fn prop_response_flag_masks_off(key in 1u16..24) {
        let mut buf = BytesMut::new();
        buf.put_u16(key | RESPONSE_FLAG);
        buf.put_u16(PROTOCOL_VERSION);
        let header = decoding::read_header(&mut buf.freeze()).unwrap();
        prop_assert_eq!(header.key, key);
        prop_assert!(header.is_response);
    }
}
