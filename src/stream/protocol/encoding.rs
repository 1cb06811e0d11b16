// Frame encoding.
//
// Wire format:
//
// [4 bytes: Size (big-endian u32)] [u16 Key] [u16 Version] [Body]
//
// Command-initiated exchanges carry a u32 correlation id at the start of
// the body. Strings are i16 length + UTF-8 bytes, byte arrays are i32
// length + raw bytes, maps are i32 count + count x (string, string),
// arrays are i32 count + count x element.
//
// Builders return the complete frame, size prefix included, ready for a
// single write_and_flush call.

use bytes::{BufMut, Bytes, BytesMut};

use crate::stream::constants::*;
use crate::stream::error::Result;
use crate::stream::offset::OffsetSpecification;

/// Append an i16-length-prefixed UTF-8 string.
pub fn write_string(buf: &mut BytesMut, s: &str) {
    buf.put_i16(s.len() as i16);
    buf.put_slice(s.as_bytes());
}

/// Append an i32-length-prefixed byte array.
pub fn write_byte_array(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_i32(bytes.len() as i32);
    buf.put_slice(bytes);
}

/// Append an i32-count-prefixed string->string map.
pub fn write_map(buf: &mut BytesMut, entries: &[(String, String)]) {
    buf.put_i32(entries.len() as i32);
    for (key, value) in entries {
        write_string(buf, key);
        write_string(buf, value);
    }
}

/// Incremental frame builder. Reserves the size prefix up front and
/// backfills it in `finish`, so bodies never need a length computed by
/// hand.
pub struct FrameBuilder {
    buf: BytesMut,
}

impl FrameBuilder {
    /// Frame with no correlation id (Publish, Credit, Heartbeat, ...).
    pub fn command(key: u16) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32(0); // size, backfilled in finish()
        buf.put_u16(key);
        buf.put_u16(PROTOCOL_VERSION);
        FrameBuilder { buf }
    }

    /// Correlated request frame.
    pub fn request(key: u16, correlation_id: u32) -> Self {
        let mut frame = FrameBuilder::command(key);
        frame.buf.put_u32(correlation_id);
        frame
    }

    /// Correlated frame with the response flag set on the key.
    pub fn response(key: u16, correlation_id: u32) -> Self {
        FrameBuilder::request(key | RESPONSE_FLAG, correlation_id)
    }

    pub fn buf(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Backfill the size prefix (body length, excluding the prefix
    /// itself) and freeze the frame.
    pub fn finish(mut self) -> Bytes {
        let size = (self.buf.len() - 4) as u32;
        self.buf[..4].copy_from_slice(&size.to_be_bytes());
        self.buf.freeze()
    }
}

// ===== Per-command frame builders =====

pub fn peer_properties(correlation_id: u32, properties: &[(String, String)]) -> Bytes {
    let mut frame = FrameBuilder::request(COMMAND_PEER_PROPERTIES, correlation_id);
    write_map(frame.buf(), properties);
    frame.finish()
}

pub fn sasl_handshake(correlation_id: u32) -> Bytes {
    FrameBuilder::request(COMMAND_SASL_HANDSHAKE, correlation_id).finish()
}

pub fn sasl_authenticate(correlation_id: u32, mechanism: &str, response: &[u8]) -> Bytes {
    let mut frame = FrameBuilder::request(COMMAND_SASL_AUTHENTICATE, correlation_id);
    write_string(frame.buf(), mechanism);
    write_byte_array(frame.buf(), response);
    frame.finish()
}

/// Echo of a server Tune frame: same command key, same body bytes.
pub fn tune_echo(body: &[u8]) -> Bytes {
    let mut frame = FrameBuilder::command(COMMAND_TUNE);
    frame.buf().put_slice(body);
    frame.finish()
}

pub fn open(correlation_id: u32, virtual_host: &str) -> Bytes {
    let mut frame = FrameBuilder::request(COMMAND_OPEN, correlation_id);
    write_string(frame.buf(), virtual_host);
    frame.finish()
}

pub fn heartbeat() -> Bytes {
    FrameBuilder::command(COMMAND_HEARTBEAT).finish()
}

/// The close frame the client emits on teardown: a response-flagged
/// Close key carrying code OK. The client does not wait for a reply.
pub fn close_ok(correlation_id: u32) -> Bytes {
    let mut frame = FrameBuilder::response(COMMAND_CLOSE, correlation_id);
    frame.buf().put_u16(RESPONSE_CODE_OK);
    frame.finish()
}

pub fn create_stream(correlation_id: u32, stream: &str, args: &[(String, String)]) -> Bytes {
    let mut frame = FrameBuilder::request(COMMAND_CREATE_STREAM, correlation_id);
    write_string(frame.buf(), stream);
    write_map(frame.buf(), args);
    frame.finish()
}

pub fn delete_stream(correlation_id: u32, stream: &str) -> Bytes {
    let mut frame = FrameBuilder::request(COMMAND_DELETE_STREAM, correlation_id);
    write_string(frame.buf(), stream);
    frame.finish()
}

pub fn metadata_query(correlation_id: u32, streams: &[String]) -> Bytes {
    let mut frame = FrameBuilder::request(COMMAND_METADATA, correlation_id);
    frame.buf().put_i32(streams.len() as i32);
    for stream in streams {
        write_string(frame.buf(), stream);
    }
    frame.finish()
}

pub fn declare_publisher(correlation_id: u32, publisher_id: u8, stream: &str) -> Bytes {
    let mut frame = FrameBuilder::request(COMMAND_DECLARE_PUBLISHER, correlation_id);
    frame.buf().put_u8(publisher_id);
    write_string(frame.buf(), ""); // publisher reference, unused
    write_string(frame.buf(), stream);
    frame.finish()
}

pub fn delete_publisher(correlation_id: u32, publisher_id: u8) -> Bytes {
    let mut frame = FrameBuilder::request(COMMAND_DELETE_PUBLISHER, correlation_id);
    frame.buf().put_u8(publisher_id);
    frame.finish()
}

/// Publish batch: not correlated; confirms arrive asynchronously keyed
/// by publisher id and publishing ids.
pub fn publish(publisher_id: u8, messages: &[(u64, Bytes)]) -> Bytes {
    let mut frame = FrameBuilder::command(COMMAND_PUBLISH);
    frame.buf().put_u8(publisher_id);
    frame.buf().put_i32(messages.len() as i32);
    for (publishing_id, body) in messages {
        frame.buf().put_u64(*publishing_id);
        write_byte_array(frame.buf(), body);
    }
    frame.finish()
}

pub fn query_publisher_sequence(correlation_id: u32, reference: &str, stream: &str) -> Bytes {
    let mut frame = FrameBuilder::request(COMMAND_QUERY_PUBLISHER_SEQUENCE, correlation_id);
    write_string(frame.buf(), reference);
    write_string(frame.buf(), stream);
    frame.finish()
}

/// Subscribe frame. `offset` must be a wire variant; LastConsumed is
/// rewritten by the caller before this point.
pub fn subscribe(
    correlation_id: u32,
    subscription_id: u8,
    stream: &str,
    offset: &OffsetSpecification,
    credit: u16,
) -> Result<Bytes> {
    let mut frame = FrameBuilder::request(COMMAND_SUBSCRIBE, correlation_id);
    frame.buf().put_u8(subscription_id);
    write_string(frame.buf(), stream);
    offset.write(frame.buf())?;
    frame.buf().put_u16(credit);
    Ok(frame.finish())
}

pub fn credit(subscription_id: u8, credit: u16) -> Bytes {
    let mut frame = FrameBuilder::command(COMMAND_CREDIT);
    frame.buf().put_u8(subscription_id);
    frame.buf().put_u16(credit);
    frame.finish()
}

/// CommitOffset is fire-and-forget: no correlation id, no reply.
pub fn commit_offset(reference: &str, stream: &str, offset: u64) -> Bytes {
    let mut frame = FrameBuilder::command(COMMAND_COMMIT_OFFSET);
    write_string(frame.buf(), reference);
    write_string(frame.buf(), stream);
    frame.buf().put_u64(offset);
    frame.finish()
}

pub fn query_offset(correlation_id: u32, reference: &str, stream: &str) -> Bytes {
    let mut frame = FrameBuilder::request(COMMAND_QUERY_OFFSET, correlation_id);
    write_string(frame.buf(), reference);
    write_string(frame.buf(), stream);
    frame.finish()
}

pub fn unsubscribe(correlation_id: u32, subscription_id: u8) -> Bytes {
    let mut frame = FrameBuilder::request(COMMAND_UNSUBSCRIBE, correlation_id);
    frame.buf().put_u8(subscription_id);
    frame.finish()
}
