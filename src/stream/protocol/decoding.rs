// Frame decoding.
//
// All reads are bounds-checked and surface `protocol` errors on
// truncated or malformed frames; nothing here panics on wire input.
// Frames arrive as a single `Bytes` buffer; message payloads inside a
// Deliver frame are zero-copy slices of it.

use bytes::{Buf, Bytes};

use crate::stream::broker::Broker;
use crate::stream::constants::*;
use crate::stream::error::{Result, StreamError};
use crate::stream::metadata::{MetadataUpdate, StreamMetadata, StreamsMetadata};

/// Decoded frame header: command key (response flag masked off), the
/// protocol version, and whether the response flag was set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub key: u16,
    pub version: u16,
    pub is_response: bool,
}

/// Typed payload of a correlated response, one variant per command
/// family so dispatch is exhaustively checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    /// Response code only.
    None,
    /// SaslHandshake: advertised mechanisms.
    Mechanisms(Vec<String>),
    /// PeerProperties / Open: a property map.
    Properties(Vec<(String, String)>),
    /// Metadata query result.
    Metadata(StreamsMetadata),
    /// QueryOffset result.
    Offset(u64),
    /// QueryPublisherSequence result.
    Sequence(u64),
    /// Opaque trailing bytes (SASL challenge data).
    Raw(Bytes),
}

/// A correlated response as delivered into a waiting slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerResponse {
    pub code: u16,
    pub kind: ResponseKind,
}

impl ServerResponse {
    /// Error unless the broker answered OK.
    pub fn ok(self) -> Result<ServerResponse> {
        if self.code == RESPONSE_CODE_OK {
            Ok(self)
        } else {
            Err(StreamError::Broker { code: self.code })
        }
    }
}

/// One delivered chunk: a server-side batch of messages for a
/// subscription, plus the offset of its first message.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub first_offset: u64,
    pub epoch: u64,
    pub crc: i32,
    pub messages: Vec<Bytes>,
}

fn need(buf: &Bytes, n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        Err(StreamError::protocol(format!(
            "frame truncated reading {what}: need {n} bytes, have {}",
            buf.remaining()
        )))
    } else {
        Ok(())
    }
}

pub fn read_u8(buf: &mut Bytes, what: &str) -> Result<u8> {
    need(buf, 1, what)?;
    Ok(buf.get_u8())
}

pub fn read_u16(buf: &mut Bytes, what: &str) -> Result<u16> {
    need(buf, 2, what)?;
    Ok(buf.get_u16())
}

pub fn read_u32(buf: &mut Bytes, what: &str) -> Result<u32> {
    need(buf, 4, what)?;
    Ok(buf.get_u32())
}

pub fn read_u64(buf: &mut Bytes, what: &str) -> Result<u64> {
    need(buf, 8, what)?;
    Ok(buf.get_u64())
}

pub fn read_i32(buf: &mut Bytes, what: &str) -> Result<i32> {
    need(buf, 4, what)?;
    Ok(buf.get_i32())
}

/// i16-length-prefixed UTF-8 string.
pub fn read_string(buf: &mut Bytes) -> Result<String> {
    need(buf, 2, "string length")?;
    let len = buf.get_i16();
    if len < 0 {
        return Err(StreamError::protocol(format!("negative string length {len}")));
    }
    let len = len as usize;
    need(buf, len, "string bytes")?;
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec())
        .map_err(|_| StreamError::protocol("string is not valid UTF-8"))
}

/// i32-length-prefixed byte array, zero-copy.
pub fn read_byte_array(buf: &mut Bytes) -> Result<Bytes> {
    let len = read_i32(buf, "byte array length")?;
    if len < 0 {
        return Err(StreamError::protocol(format!(
            "negative byte array length {len}"
        )));
    }
    need(buf, len as usize, "byte array")?;
    Ok(buf.copy_to_bytes(len as usize))
}

pub fn read_string_array(buf: &mut Bytes) -> Result<Vec<String>> {
    let count = read_i32(buf, "array count")?;
    if count < 0 {
        return Err(StreamError::protocol(format!("negative array count {count}")));
    }
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        items.push(read_string(buf)?);
    }
    Ok(items)
}

pub fn read_map(buf: &mut Bytes) -> Result<Vec<(String, String)>> {
    let count = read_i32(buf, "map count")?;
    if count < 0 {
        return Err(StreamError::protocol(format!("negative map count {count}")));
    }
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let key = read_string(buf)?;
        let value = read_string(buf)?;
        entries.push((key, value));
    }
    Ok(entries)
}

/// Decode the key/version header of a frame body (size prefix already
/// stripped by the reader).
pub fn read_header(buf: &mut Bytes) -> Result<FrameHeader> {
    let key = read_u16(buf, "command key")?;
    let version = read_u16(buf, "command version")?;
    if version != PROTOCOL_VERSION {
        return Err(StreamError::protocol(format!(
            "unsupported protocol version {version} for {}",
            command_name(key)
        )));
    }
    Ok(FrameHeader {
        key: key & !RESPONSE_FLAG,
        version,
        is_response: key & RESPONSE_FLAG != 0,
    })
}

/// Decode the body of a correlated response (correlation id already
/// consumed) into its typed payload.
pub fn read_response(key: u16, buf: &mut Bytes) -> Result<ServerResponse> {
    match key {
        // Metadata carries no top-level code, only per-stream codes.
        COMMAND_METADATA => Ok(ServerResponse {
            code: RESPONSE_CODE_OK,
            kind: ResponseKind::Metadata(read_metadata_response(buf)?),
        }),
        COMMAND_SASL_HANDSHAKE => {
            let code = read_u16(buf, "response code")?;
            Ok(ServerResponse {
                code,
                kind: ResponseKind::Mechanisms(read_string_array(buf)?),
            })
        }
        COMMAND_PEER_PROPERTIES | COMMAND_OPEN => {
            let code = read_u16(buf, "response code")?;
            let kind = if buf.has_remaining() {
                ResponseKind::Properties(read_map(buf)?)
            } else {
                ResponseKind::Properties(Vec::new())
            };
            Ok(ServerResponse { code, kind })
        }
        COMMAND_QUERY_OFFSET => {
            let code = read_u16(buf, "response code")?;
            Ok(ServerResponse {
                code,
                kind: ResponseKind::Offset(read_u64(buf, "offset")?),
            })
        }
        COMMAND_QUERY_PUBLISHER_SEQUENCE => {
            let code = read_u16(buf, "response code")?;
            Ok(ServerResponse {
                code,
                kind: ResponseKind::Sequence(read_u64(buf, "sequence")?),
            })
        }
        COMMAND_SASL_AUTHENTICATE => {
            let code = read_u16(buf, "response code")?;
            let kind = if buf.has_remaining() {
                ResponseKind::Raw(read_byte_array(buf)?)
            } else {
                ResponseKind::None
            };
            Ok(ServerResponse { code, kind })
        }
        _ => {
            let code = read_u16(buf, "response code")?;
            Ok(ServerResponse {
                code,
                kind: ResponseKind::None,
            })
        }
    }
}

/// PublishConfirm body: publisher id and the confirmed publishing ids.
pub fn read_publish_confirm(buf: &mut Bytes) -> Result<(u8, Vec<u64>)> {
    let publisher_id = read_u8(buf, "publisher id")?;
    let count = read_i32(buf, "confirm count")?;
    if count < 0 {
        return Err(StreamError::protocol(format!("negative confirm count {count}")));
    }
    let mut ids = Vec::with_capacity(count as usize);
    for _ in 0..count {
        ids.push(read_u64(buf, "publishing id")?);
    }
    Ok((publisher_id, ids))
}

/// PublishError body: publisher id and (publishing id, code) pairs.
pub fn read_publish_error(buf: &mut Bytes) -> Result<(u8, Vec<(u64, u16)>)> {
    let publisher_id = read_u8(buf, "publisher id")?;
    let count = read_i32(buf, "error count")?;
    if count < 0 {
        return Err(StreamError::protocol(format!("negative error count {count}")));
    }
    let mut errors = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let publishing_id = read_u64(buf, "publishing id")?;
        let code = read_u16(buf, "error code")?;
        errors.push((publishing_id, code));
    }
    Ok((publisher_id, errors))
}

/// Deliver body: subscription id plus one chunk. Each entry is a
/// u32-length-prefixed payload handed out as a slice of the frame
/// buffer, without copying the message bytes.
pub fn read_deliver(buf: &mut Bytes) -> Result<(u8, Chunk)> {
    let subscription_id = read_u8(buf, "subscription id")?;
    let _magic_version = read_u8(buf, "chunk magic/version")? as i8;
    let num_entries = read_u16(buf, "chunk entry count")?;
    let _num_records = read_u32(buf, "chunk record count")?;
    let epoch = read_u64(buf, "chunk epoch")?;
    let first_offset = read_u64(buf, "chunk first offset")?;
    let crc = read_i32(buf, "chunk crc")?;
    let _data_length = read_u32(buf, "chunk data length")?;

    let mut messages = Vec::with_capacity(num_entries as usize);
    for _ in 0..num_entries {
        let len = read_u32(buf, "entry length")? as usize;
        need(buf, len, "entry payload")?;
        messages.push(buf.copy_to_bytes(len));
    }

    Ok((
        subscription_id,
        Chunk {
            first_offset,
            epoch,
            crc,
            messages,
        },
    ))
}

/// MetadataUpdate body: a code and the affected stream.
pub fn read_metadata_update(buf: &mut Bytes) -> Result<MetadataUpdate> {
    let code = read_u16(buf, "metadata update code")?;
    let stream = read_string(buf)?;
    Ok(MetadataUpdate { code, stream })
}

/// Tune body, for logging. The raw bytes are echoed back verbatim.
pub fn read_tune(buf: &mut Bytes) -> Result<(u32, u32)> {
    let max_frame_size = read_u32(buf, "tune max frame size")?;
    let heartbeat = read_u32(buf, "tune heartbeat")?;
    Ok((max_frame_size, heartbeat))
}

/// Metadata response body: the node table, then per-stream entries with
/// node references resolved against it.
pub fn read_metadata_response(buf: &mut Bytes) -> Result<StreamsMetadata> {
    let broker_count = read_i32(buf, "broker count")?;
    if broker_count < 0 {
        return Err(StreamError::protocol(format!(
            "negative broker count {broker_count}"
        )));
    }
    let mut brokers = std::collections::HashMap::new();
    for _ in 0..broker_count {
        let reference = read_u16(buf, "broker reference")?;
        let host = read_string(buf)?;
        let port = read_u32(buf, "broker port")?;
        let port = u16::try_from(port)
            .map_err(|_| StreamError::protocol(format!("broker port {port} out of range")))?;
        brokers.insert(reference, Broker::with_address(host, port));
    }

    let stream_count = read_i32(buf, "stream count")?;
    if stream_count < 0 {
        return Err(StreamError::protocol(format!(
            "negative stream count {stream_count}"
        )));
    }
    let mut metadata = StreamsMetadata::default();
    for _ in 0..stream_count {
        let name = read_string(buf)?;
        let code = read_u16(buf, "stream response code")?;
        let leader_reference = read_u16(buf, "leader reference")?;
        let replica_count = read_i32(buf, "replica count")?;
        if replica_count < 0 {
            return Err(StreamError::protocol(format!(
                "negative replica count {replica_count}"
            )));
        }
        let mut replicas = Vec::with_capacity(replica_count as usize);
        for _ in 0..replica_count {
            let reference = read_u16(buf, "replica reference")?;
            if let Some(broker) = brokers.get(&reference) {
                replicas.push(broker.clone());
            }
        }
        metadata.insert(
            name,
            StreamMetadata {
                response_code: code,
                leader: brokers.get(&leader_reference).cloned(),
                replicas,
            },
        );
    }
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn bytes(build: impl FnOnce(&mut BytesMut)) -> Bytes {
        let mut buf = BytesMut::new();
        build(&mut buf);
        buf.freeze()
    }

    #[test]
    fn test_header_masks_response_flag() {
        let mut buf = bytes(|b| {
            b.put_u16(COMMAND_OPEN | RESPONSE_FLAG);
            b.put_u16(PROTOCOL_VERSION);
        });
        let header = read_header(&mut buf).unwrap();
        assert_eq!(header.key, COMMAND_OPEN);
        assert!(header.is_response);
    }

    #[test]
    fn test_header_rejects_unknown_version() {
        let mut buf = bytes(|b| {
            b.put_u16(COMMAND_OPEN);
            b.put_u16(2);
        });
        assert!(matches!(
            read_header(&mut buf),
            Err(StreamError::Protocol { .. })
        ));
    }

    #[test]
    fn test_string_roundtrip() {
        let mut buf = BytesMut::new();
        super::super::encoding::write_string(&mut buf, "stream-a");
        assert_eq!(read_string(&mut buf.freeze()).unwrap(), "stream-a");
    }

    #[test]
    fn test_truncated_string_is_protocol_error() {
        let mut buf = bytes(|b| {
            b.put_i16(10);
            b.put_slice(b"abc");
        });
        assert!(matches!(
            read_string(&mut buf),
            Err(StreamError::Protocol { .. })
        ));
    }

    #[test]
    fn test_sasl_handshake_response() {
        let mut buf = bytes(|b| {
            b.put_u16(RESPONSE_CODE_OK);
            b.put_i32(2);
            b.put_i16(5);
            b.put_slice(b"PLAIN");
            b.put_i16(8);
            b.put_slice(b"EXTERNAL");
        });
        let response = read_response(COMMAND_SASL_HANDSHAKE, &mut buf).unwrap();
        assert_eq!(response.code, RESPONSE_CODE_OK);
        assert_eq!(
            response.kind,
            ResponseKind::Mechanisms(vec!["PLAIN".into(), "EXTERNAL".into()])
        );
    }

    #[test]
    fn test_query_offset_response() {
        let mut buf = bytes(|b| {
            b.put_u16(RESPONSE_CODE_OK);
            b.put_u64(12345);
        });
        let response = read_response(COMMAND_QUERY_OFFSET, &mut buf).unwrap();
        assert_eq!(response.kind, ResponseKind::Offset(12345));
    }

    #[test]
    fn test_code_only_response() {
        let mut buf = bytes(|b| b.put_u16(RESPONSE_CODE_STREAM_ALREADY_EXISTS));
        let response = read_response(COMMAND_CREATE_STREAM, &mut buf).unwrap();
        assert_eq!(response.code, RESPONSE_CODE_STREAM_ALREADY_EXISTS);
        assert_eq!(response.kind, ResponseKind::None);
        assert!(matches!(
            response.ok(),
            Err(StreamError::Broker { code: 5 })
        ));
    }

    #[test]
    fn test_publish_confirm_roundtrip() {
        let mut buf = bytes(|b| {
            b.put_u8(3);
            b.put_i32(3);
            b.put_u64(10);
            b.put_u64(11);
            b.put_u64(12);
        });
        let (publisher_id, ids) = read_publish_confirm(&mut buf).unwrap();
        assert_eq!(publisher_id, 3);
        assert_eq!(ids, vec![10, 11, 12]);
    }

    #[test]
    fn test_publish_error_pairs() {
        let mut buf = bytes(|b| {
            b.put_u8(1);
            b.put_i32(1);
            b.put_u64(99);
            b.put_u16(RESPONSE_CODE_PUBLISHER_DOES_NOT_EXIST);
        });
        let (publisher_id, errors) = read_publish_error(&mut buf).unwrap();
        assert_eq!(publisher_id, 1);
        assert_eq!(errors, vec![(99, RESPONSE_CODE_PUBLISHER_DOES_NOT_EXIST)]);
    }

    #[test]
    fn test_deliver_chunk_messages_are_zero_copy() {
        let frame = bytes(|b| {
            b.put_u8(7); // subscription id
            b.put_u8(0x50); // magic/version
            b.put_u16(2); // num entries
            b.put_u32(2); // num records
            b.put_u64(1); // epoch
            b.put_u64(100); // first offset
            b.put_i32(0); // crc
            b.put_u32(14); // data length
            b.put_u32(3);
            b.put_slice(b"abc");
            b.put_u32(3);
            b.put_slice(b"def");
        });
        let mut buf = frame.clone();
        let (subscription_id, chunk) = read_deliver(&mut buf).unwrap();
        assert_eq!(subscription_id, 7);
        assert_eq!(chunk.first_offset, 100);
        assert_eq!(chunk.messages.len(), 2);
        assert_eq!(&chunk.messages[0][..], b"abc");
        assert_eq!(&chunk.messages[1][..], b"def");
        // same backing allocation as the frame buffer
        assert_eq!(
            chunk.messages[0].as_ptr() as usize,
            frame.as_ptr() as usize + frame.len() - 14 + 4
        );
    }

    #[test]
    fn test_metadata_response_resolves_references() {
        let mut buf = bytes(|b| {
            b.put_i32(2); // brokers
            b.put_u16(0);
            b.put_i16(2);
            b.put_slice(b"n1");
            b.put_u32(5551);
            b.put_u16(1);
            b.put_i16(2);
            b.put_slice(b"n2");
            b.put_u32(5551);
            b.put_i32(1); // streams
            b.put_i16(2);
            b.put_slice(b"s1");
            b.put_u16(RESPONSE_CODE_OK);
            b.put_u16(0); // leader
            b.put_i32(1);
            b.put_u16(1); // replica
        });
        let metadata = read_metadata_response(&mut buf).unwrap();
        let s1 = metadata.get("s1").unwrap();
        assert_eq!(s1.response_code, RESPONSE_CODE_OK);
        assert_eq!(s1.leader.as_ref().unwrap().host, "n1");
        assert_eq!(s1.replicas.len(), 1);
        assert_eq!(s1.replicas[0].host, "n2");
    }

    #[test]
    fn test_tune_body() {
        let mut buf = bytes(|b| {
            b.put_u32(1_048_576);
            b.put_u32(60);
        });
        assert_eq!(read_tune(&mut buf).unwrap(), (1_048_576, 60));
    }
}
