// Offset specifications for Subscribe.
//
// Wire format: an i16 type tag, followed by an i64 value for the Offset
// and Timestamp variants only. LastConsumed never reaches the wire: the
// client resolves it to a concrete Offset via QueryOffset before the
// Subscribe frame is encoded.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{Result, StreamError};

const TYPE_FIRST: i16 = 1;
const TYPE_LAST: i16 = 2;
const TYPE_NEXT: i16 = 3;
const TYPE_OFFSET: i16 = 4;
const TYPE_TIMESTAMP: i16 = 5;

/// Where a subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetSpecification {
    /// The first available offset in the stream.
    First,
    /// The last chunk in the stream.
    Last,
    /// The next offset to be written.
    Next,
    /// An absolute offset.
    Offset(u64),
    /// The first offset stored at or after this timestamp (ms since epoch).
    Timestamp(i64),
    /// The offset after the one last committed under the subscription
    /// name. Client-side synthetic, resolved before transmission.
    LastConsumed,
}

impl OffsetSpecification {
    pub(crate) fn is_last_consumed(&self) -> bool {
        matches!(self, OffsetSpecification::LastConsumed)
    }

    /// Append the wire encoding. LastConsumed is rejected here: it must
    /// have been rewritten to `Offset` by the subscribe path.
    pub(crate) fn write(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            OffsetSpecification::First => buf.put_i16(TYPE_FIRST),
            OffsetSpecification::Last => buf.put_i16(TYPE_LAST),
            OffsetSpecification::Next => buf.put_i16(TYPE_NEXT),
            OffsetSpecification::Offset(offset) => {
                buf.put_i16(TYPE_OFFSET);
                buf.put_u64(*offset);
            }
            OffsetSpecification::Timestamp(timestamp) => {
                buf.put_i16(TYPE_TIMESTAMP);
                buf.put_i64(*timestamp);
            }
            OffsetSpecification::LastConsumed => {
                return Err(StreamError::protocol(
                    "LastConsumed offset specification is not encodable",
                ))
            }
        }
        Ok(())
    }

    /// Decode a wire offset specification.
    pub(crate) fn read(buf: &mut Bytes) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(StreamError::protocol("offset specification truncated"));
        }
        match buf.get_i16() {
            TYPE_FIRST => Ok(OffsetSpecification::First),
            TYPE_LAST => Ok(OffsetSpecification::Last),
            TYPE_NEXT => Ok(OffsetSpecification::Next),
            tag @ (TYPE_OFFSET | TYPE_TIMESTAMP) => {
                if buf.remaining() < 8 {
                    return Err(StreamError::protocol("offset specification truncated"));
                }
                if tag == TYPE_OFFSET {
                    Ok(OffsetSpecification::Offset(buf.get_u64()))
                } else {
                    Ok(OffsetSpecification::Timestamp(buf.get_i64()))
                }
            }
            tag => Err(StreamError::protocol(format!(
                "unknown offset specification type {tag}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(spec: OffsetSpecification) -> OffsetSpecification {
        let mut buf = BytesMut::new();
        spec.write(&mut buf).unwrap();
        let mut bytes = buf.freeze();
        let decoded = OffsetSpecification::read(&mut bytes).unwrap();
        assert!(!bytes.has_remaining(), "trailing bytes after {spec:?}");
        decoded
    }

    #[test]
    fn test_wire_variants_roundtrip() {
        for spec in [
            OffsetSpecification::First,
            OffsetSpecification::Last,
            OffsetSpecification::Next,
            OffsetSpecification::Offset(42),
            OffsetSpecification::Offset(u64::MAX),
            OffsetSpecification::Timestamp(1_620_000_000_000),
            OffsetSpecification::Timestamp(-1),
        ] {
            assert_eq!(roundtrip(spec), spec);
        }
    }

    #[test]
    fn test_last_consumed_is_not_encodable() {
        let mut buf = BytesMut::new();
        let err = OffsetSpecification::LastConsumed.write(&mut buf).unwrap_err();
        assert!(matches!(err, StreamError::Protocol { .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_i16(9);
        assert!(OffsetSpecification::read(&mut buf.freeze()).is_err());
    }
}
