use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::fields::FieldId;
use super::message::{Field, FieldValue, Item, Message};
use crate::error::{BatchdError, Result};

/// Hard ceiling on a single frame. Anything larger is treated as a hostile or
/// corrupt length prefix rather than buffered.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const TAG_STR: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_BOOL: u8 = 3;
const TAG_STR_ARRAY: u8 = 4;

fn malformed(what: impl Into<String>) -> BatchdError {
    BatchdError::Protocol(what.into())
}

/// Encode a message into a self-delimiting frame: a u32 length prefix
/// followed by the payload.
pub fn encode_message(msg: &Message, dst: &mut BytesMut) {
    let start = dst.len();
    dst.put_u32(0); // patched below

    dst.put_u16(msg.command.len() as u16);
    dst.put_slice(msg.command.as_bytes());
    dst.put_u16(msg.version);

    match &msg.error {
        Some(err) => {
            dst.put_u8(1);
            dst.put_u32(err.len() as u32);
            dst.put_slice(err.as_bytes());
        }
        None => dst.put_u8(0),
    }

    dst.put_u16(msg.items.len() as u16);
    for item in &msg.items {
        dst.put_u64(item.bitmap());
        dst.put_u16(item.fields().len() as u16);
        for field in item.fields() {
            dst.put_u8(field.id as u8);
            match &field.value {
                FieldValue::Str(s) => {
                    dst.put_u8(TAG_STR);
                    dst.put_u32(s.len() as u32);
                    dst.put_slice(s.as_bytes());
                }
                FieldValue::Int(n) => {
                    dst.put_u8(TAG_INT);
                    dst.put_i64(*n);
                }
                FieldValue::Bool(b) => {
                    dst.put_u8(TAG_BOOL);
                    dst.put_u8(*b as u8);
                }
                FieldValue::StrArray(strings) => {
                    dst.put_u8(TAG_STR_ARRAY);
                    dst.put_u32(strings.len() as u32);
                    for s in strings {
                        dst.put_u32(s.len() as u32);
                        dst.put_slice(s.as_bytes());
                    }
                }
            }
        }
    }

    let payload_len = (dst.len() - start - 4) as u32;
    dst[start..start + 4].copy_from_slice(&payload_len.to_be_bytes());
}

/// Encode a message into an owned frame (journal records, tests).
pub fn encode_frame(msg: &Message) -> Bytes {
    let mut buf = BytesMut::new();
    encode_message(msg, &mut buf);
    buf.freeze()
}

/// Try to decode one message from the front of `src`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame.
/// Any defect inside a complete frame is a protocol error, never coerced.
pub fn decode_message(src: &mut BytesMut) -> Result<Option<Message>> {
    if src.len() < 4 {
        return Ok(None);
    }
    let payload_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if payload_len > MAX_FRAME_SIZE {
        return Err(malformed(format!("frame of {payload_len} bytes exceeds limit")));
    }
    if src.len() < 4 + payload_len {
        return Ok(None);
    }

    src.advance(4);
    let mut payload = src.split_to(payload_len).freeze();
    let msg = parse_payload(&mut payload)?;
    if payload.has_remaining() {
        return Err(malformed("trailing bytes after message"));
    }
    Ok(Some(msg))
}

fn parse_payload(buf: &mut Bytes) -> Result<Message> {
    let len = read_u16(buf)? as usize;
    let command = read_string(buf, len)?;
    if command.is_empty() {
        return Err(malformed("empty command name"));
    }
    let version = read_u16(buf)?;

    let error = match read_u8(buf)? {
        0 => None,
        1 => {
            let len = read_u32(buf)? as usize;
            Some(read_string(buf, len)?)
        }
        other => return Err(malformed(format!("bad error marker {other}"))),
    };

    let item_count = read_u16(buf)? as usize;
    let mut items = Vec::with_capacity(item_count);
    for _ in 0..item_count {
        items.push(parse_item(buf)?);
    }

    Ok(Message {
        command,
        version,
        error,
        items,
    })
}

fn parse_item(buf: &mut Bytes) -> Result<Item> {
    let bitmap = read_u64(buf)?;
    let field_count = read_u16(buf)? as usize;
    let mut fields = Vec::with_capacity(field_count);
    for _ in 0..field_count {
        fields.push(parse_field(buf)?);
    }
    Item::from_parts(bitmap, fields).ok_or_else(|| malformed("bitmap and field list disagree"))
}

fn parse_field(buf: &mut Bytes) -> Result<Field> {
    let raw_id = read_u8(buf)?;
    let id = FieldId::from_u8(raw_id).ok_or_else(|| malformed(format!("unknown field id {raw_id}")))?;
    let tag = read_u8(buf)?;

    let value = match tag {
        TAG_STR => {
            let len = read_u32(buf)? as usize;
            FieldValue::Str(read_string(buf, len)?)
        }
        TAG_INT => FieldValue::Int(read_i64(buf)?),
        TAG_BOOL => match read_u8(buf)? {
            0 => FieldValue::Bool(false),
            1 => FieldValue::Bool(true),
            other => return Err(malformed(format!("bad boolean byte {other}"))),
        },
        TAG_STR_ARRAY => {
            let count = read_u32(buf)? as usize;
            let mut strings = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let len = read_u32(buf)? as usize;
                strings.push(read_string(buf, len)?);
            }
            FieldValue::StrArray(strings)
        }
        other => return Err(malformed(format!("unknown wire tag {other}"))),
    };

    // The wire tag must match the id's declared type, never silently coerced.
    if value.kind() != id.kind() {
        return Err(malformed(format!(
            "field {id:?} declared {:?} but carried {:?}",
            id.kind(),
            value.kind()
        )));
    }

    Ok(Field { id, value })
}

fn read_u8(buf: &mut Bytes) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(malformed("truncated frame"));
    }
    Ok(buf.get_u8())
}

fn read_u16(buf: &mut Bytes) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(malformed("truncated frame"));
    }
    Ok(buf.get_u16())
}

fn read_u32(buf: &mut Bytes) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(malformed("truncated frame"));
    }
    Ok(buf.get_u32())
}

fn read_u64(buf: &mut Bytes) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(malformed("truncated frame"));
    }
    Ok(buf.get_u64())
}

fn read_i64(buf: &mut Bytes) -> Result<i64> {
    if buf.remaining() < 8 {
        return Err(malformed("truncated frame"));
    }
    Ok(buf.get_i64())
}

fn read_string(buf: &mut Bytes, len: usize) -> Result<String> {
    if buf.remaining() < len {
        return Err(malformed("truncated string"));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| malformed("invalid utf-8 in string"))
}

/// Framed codec for `tokio_util`'s `FramedRead`/`FramedWrite`.
#[derive(Debug, Default)]
pub struct WireCodec;

impl Decoder for WireCodec {
    type Item = Message;
    type Error = BatchdError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        decode_message(src)
    }
}

impl Encoder<Message> for WireCodec {
    type Error = BatchdError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<()> {
        encode_message(&msg, dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> Message {
        let mut item = Item::new();
        item.set_int(FieldId::JobId, 42);
        item.set_str(FieldId::JobName, "nightly-batch");
        item.set_bool(FieldId::Hold, true);
        item.set_array(
            FieldId::Args,
            vec!["-v".to_string(), "--fast".to_string()],
        );
        Message::with_item("add_job", item)
    }

    #[test]
    fn round_trip() {
        let msg = sample_message();
        let mut buf = BytesMut::from(&encode_frame(&msg)[..]);
        let decoded = decode_message(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn round_trip_preserves_absence() {
        let msg = sample_message();
        let mut buf = BytesMut::from(&encode_frame(&msg)[..]);
        let decoded = decode_message(&mut buf).unwrap().unwrap();

        let item = decoded.item().unwrap();
        assert!(item.is_set(FieldId::JobId));
        assert!(!item.is_set(FieldId::Priority));
        assert_eq!(item.get_int(FieldId::Priority), None);
    }

    #[test]
    fn round_trip_error_reply() {
        let msg = Message::error_reply("del_job", "job 9 is running");
        let mut buf = BytesMut::from(&encode_frame(&msg)[..]);
        let decoded = decode_message(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn partial_frame_needs_more_data() {
        let frame = encode_frame(&sample_message());
        for cut in 0..frame.len() {
            let mut buf = BytesMut::from(&frame[..cut]);
            assert!(decode_message(&mut buf).unwrap().is_none(), "cut at {cut}");
        }
    }

    #[test]
    fn two_frames_decode_in_order() {
        let first = sample_message();
        let second = Message::new("stats");
        let mut buf = BytesMut::new();
        encode_message(&first, &mut buf);
        encode_message(&second, &mut buf);

        assert_eq!(decode_message(&mut buf).unwrap().unwrap(), first);
        assert_eq!(decode_message(&mut buf).unwrap().unwrap(), second);
        assert!(decode_message(&mut buf).unwrap().is_none());
    }

    #[test]
    fn type_mismatch_is_malformed() {
        // JobId declared Int; hand-craft a frame carrying it as Str.
        let mut payload = BytesMut::new();
        payload.put_u16(4);
        payload.put_slice(b"test");
        payload.put_u16(1); // version
        payload.put_u8(0); // no error
        payload.put_u16(1); // one item
        payload.put_u64(1 << FieldId::JobId as u8);
        payload.put_u16(1); // one field
        payload.put_u8(FieldId::JobId as u8);
        payload.put_u8(TAG_STR);
        payload.put_u32(2);
        payload.put_slice(b"42");

        let mut buf = BytesMut::new();
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);

        assert!(decode_message(&mut buf).is_err());
    }

    #[test]
    fn bitmap_field_disagreement_is_malformed() {
        let mut payload = BytesMut::new();
        payload.put_u16(4);
        payload.put_slice(b"test");
        payload.put_u16(1);
        payload.put_u8(0);
        payload.put_u16(1);
        // Hold bit set but JobId field present
        payload.put_u64(1 << FieldId::Hold as u8);
        payload.put_u16(1);
        payload.put_u8(FieldId::JobId as u8);
        payload.put_u8(TAG_INT);
        payload.put_i64(42);

        let mut buf = BytesMut::new();
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);

        assert!(decode_message(&mut buf).is_err());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.put_slice(&[0u8; 16]);
        assert!(decode_message(&mut buf).is_err());
    }

    #[test]
    fn unknown_field_id_is_malformed() {
        let mut payload = BytesMut::new();
        payload.put_u16(4);
        payload.put_slice(b"test");
        payload.put_u16(1);
        payload.put_u8(0);
        payload.put_u16(1);
        payload.put_u64(1 << 63);
        payload.put_u16(1);
        payload.put_u8(200);
        payload.put_u8(TAG_INT);
        payload.put_i64(1);

        let mut buf = BytesMut::new();
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);

        assert!(decode_message(&mut buf).is_err());
    }
}
