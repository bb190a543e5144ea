//! Fluentd forward protocol encoding.
//!
//! Records are sent in "Message mode": a MessagePack array of
//! `[tag, time, record]`, with a fourth `{"chunk": id}` option map when an
//! acknowledgment is requested. The collector answers acked messages with a
//! `{"ack": id}` map.

use chrono::{DateTime, Utc};
use rmp::encode::{self, ValueWriteError};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::SendError;
use crate::message::Record;

/// MessagePack extension type used for `EventTime`.
pub const EVENT_TIME_EXT_TYPE: i8 = 0;

/// Collector reply to a message carrying a `chunk` option.
#[derive(Debug, Clone, Deserialize)]
pub struct AckResponse {
    pub ack: String,
}

/// Encode one record as a forward protocol message.
///
/// With `subsecond` set the time is an `EventTime` extension (big-endian
/// seconds then nanoseconds); otherwise it is an integer of Unix seconds.
/// An `EventTime` only holds unsigned 32-bit seconds, so timestamps before
/// 1970 or after 2106 fail with [`SendError::Encode`] in that mode.
pub fn encode_message(
    tag: &str,
    timestamp: DateTime<Utc>,
    record: &Record,
    subsecond: bool,
    chunk: Option<&str>,
) -> Result<Vec<u8>, SendError> {
    let time = if subsecond {
        let seconds = u32::try_from(timestamp.timestamp()).map_err(|_| {
            SendError::Encode(format!(
                "timestamp {} is outside the EventTime range",
                timestamp.to_rfc3339()
            ))
        })?;
        EventTime::Nanos(seconds, timestamp.timestamp_subsec_nanos().min(999_999_999))
    } else {
        EventTime::Seconds(timestamp.timestamp())
    };

    let mut buf = Vec::with_capacity(128 + record.log.len());
    write_message(&mut buf, tag, time, record, chunk)
        .map_err(|e| SendError::Encode(e.to_string()))?;
    Ok(buf)
}

enum EventTime {
    Seconds(i64),
    Nanos(u32, u32),
}

fn write_message(
    buf: &mut Vec<u8>,
    tag: &str,
    time: EventTime,
    record: &Record,
    chunk: Option<&str>,
) -> Result<(), ValueWriteError> {
    let len = if chunk.is_some() { 4 } else { 3 };
    encode::write_array_len(buf, len)?;
    encode::write_str(buf, tag)?;

    match time {
        EventTime::Nanos(seconds, nanos) => {
            encode::write_ext_meta(buf, 8, EVENT_TIME_EXT_TYPE)?;
            buf.extend_from_slice(&seconds.to_be_bytes());
            buf.extend_from_slice(&nanos.to_be_bytes());
        }
        EventTime::Seconds(seconds) => {
            encode::write_sint(buf, seconds)?;
        }
    }

    let fields = record.fields();
    encode::write_map_len(buf, fields.len() as u32)?;
    for (key, value) in fields {
        encode::write_str(buf, key)?;
        encode::write_str(buf, value)?;
    }

    if let Some(chunk) = chunk {
        encode::write_map_len(buf, 1)?;
        encode::write_str(buf, "chunk")?;
        encode::write_str(buf, chunk)?;
    }

    Ok(())
}

/// Read one ack reply from `reader`.
pub async fn read_ack<R>(reader: &mut R) -> Result<AckResponse, SendError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(64);
    let mut chunk = [0u8; 256];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(SendError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before ack",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Ok(response) = rmp_serde::from_slice::<AckResponse>(&buf) {
            return Ok(response);
        }
    }
}

/// A decoded forward protocol message, as a collector would see it.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DecodedMessage {
    pub tag: String,
    pub seconds: i64,
    pub nanos: Option<u32>,
    pub record: Vec<(String, String)>,
    pub chunk: Option<String>,
}

/// Decode one message from the front of `rd`, advancing it.
///
/// Returns `None` when `rd` does not hold a complete message.
#[cfg(test)]
pub(crate) fn decode_message(rd: &mut &[u8]) -> Option<DecodedMessage> {
    use rmp::decode;

    fn read_string(rd: &mut &[u8]) -> Option<String> {
        let len = decode::read_str_len(rd).ok()? as usize;
        if rd.len() < len {
            return None;
        }
        let (s, rest) = rd.split_at(len);
        *rd = rest;
        String::from_utf8(s.to_vec()).ok()
    }

    let mut cursor = *rd;
    let len = decode::read_array_len(&mut cursor).ok()?;
    let tag = read_string(&mut cursor)?;

    let (seconds, nanos) = if cursor.first() == Some(&0xd7) {
        let meta = decode::read_ext_meta(&mut cursor).ok()?;
        if meta.typeid != EVENT_TIME_EXT_TYPE || meta.size != 8 || cursor.len() < 8 {
            return None;
        }
        let seconds = u32::from_be_bytes(cursor[..4].try_into().ok()?);
        let nanos = u32::from_be_bytes(cursor[4..8].try_into().ok()?);
        cursor = &cursor[8..];
        (i64::from(seconds), Some(nanos))
    } else {
        (decode::read_int::<i64, _>(&mut cursor).ok()?, None)
    };

    let pairs = decode::read_map_len(&mut cursor).ok()?;
    let mut record = Vec::with_capacity(pairs as usize);
    for _ in 0..pairs {
        let key = read_string(&mut cursor)?;
        let value = read_string(&mut cursor)?;
        record.push((key, value));
    }

    let chunk = if len == 4 {
        let entries = decode::read_map_len(&mut cursor).ok()?;
        let mut chunk = None;
        for _ in 0..entries {
            let key = read_string(&mut cursor)?;
            let value = read_string(&mut cursor)?;
            if key == "chunk" {
                chunk = Some(value);
            }
        }
        chunk
    } else {
        None
    };

    *rd = cursor;
    Some(DecodedMessage {
        tag,
        seconds,
        nanos,
        record,
        chunk,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::InboundMessage;
    use chrono::TimeZone;

    fn record() -> Record {
        Record::from_message(&InboundMessage::new("abc", "web1", "hello world").with_source("stdout"))
    }

    fn timestamp() -> DateTime<Utc> {
        Utc.timestamp_opt(1_714_564_800, 123_456_789).unwrap()
    }

    #[test]
    fn test_encode_second_precision() {
        let bytes = encode_message("docker.web1", timestamp(), &record(), false, None).unwrap();

        // fixarray of 3, then fixstr tag
        assert_eq!(bytes[0], 0x93);

        let mut rd = bytes.as_slice();
        let msg = decode_message(&mut rd).unwrap();
        assert!(rd.is_empty());
        assert_eq!(msg.tag, "docker.web1");
        assert_eq!(msg.seconds, 1_714_564_800);
        assert_eq!(msg.nanos, None);
        assert_eq!(msg.chunk, None);
        assert_eq!(
            msg.record,
            vec![
                ("log".to_string(), "hello world".to_string()),
                ("container_id".to_string(), "abc".to_string()),
                ("container_name".to_string(), "web1".to_string()),
                ("source".to_string(), "stdout".to_string()),
            ]
        );
    }

    #[test]
    fn test_encode_event_time() {
        let bytes = encode_message("t", timestamp(), &record(), true, None).unwrap();

        // fixext8 marker followed by the ext type
        let ext_at = 2 + 1;
        assert_eq!(bytes[ext_at], 0xd7);
        assert_eq!(bytes[ext_at + 1], 0x00);

        let msg = decode_message(&mut bytes.as_slice()).unwrap();
        assert_eq!(msg.seconds, 1_714_564_800);
        assert_eq!(msg.nanos, Some(123_456_789));
    }

    #[test]
    fn test_event_time_out_of_range() {
        let before_epoch = Utc.with_ymd_and_hms(1969, 12, 31, 23, 59, 59).unwrap();
        let after_2106 = Utc.with_ymd_and_hms(2107, 1, 1, 0, 0, 0).unwrap();

        for ts in [before_epoch, after_2106] {
            let err = encode_message("t", ts, &record(), true, None).unwrap_err();
            assert!(matches!(err, SendError::Encode(_)), "{}", ts);
        }

        let bytes = encode_message("t", before_epoch, &record(), false, None).unwrap();
        let msg = decode_message(&mut bytes.as_slice()).unwrap();
        assert_eq!(msg.seconds, -1);
    }

    #[test]
    fn test_encode_with_chunk() {
        let bytes = encode_message("t", timestamp(), &record(), false, Some("chunk-1")).unwrap();
        assert_eq!(bytes[0], 0x94);

        let msg = decode_message(&mut bytes.as_slice()).unwrap();
        assert_eq!(msg.chunk.as_deref(), Some("chunk-1"));
    }

    #[test]
    fn test_decode_incomplete_message() {
        let bytes = encode_message("t", timestamp(), &record(), false, None).unwrap();
        let mut rd = &bytes[..bytes.len() - 3];
        assert!(decode_message(&mut rd).is_none());
    }

    #[tokio::test]
    async fn test_read_ack() {
        let reply = rmp_serde::to_vec_named(&std::collections::HashMap::from([(
            "ack", "chunk-1",
        )]))
        .unwrap();
        let mut reader = reply.as_slice();

        let ack = read_ack(&mut reader).await.unwrap();
        assert_eq!(ack.ack, "chunk-1");
    }

    #[tokio::test]
    async fn test_read_ack_eof() {
        let mut reader: &[u8] = &[0x81];
        let err = read_ack(&mut reader).await.unwrap_err();
        assert!(matches!(err, SendError::Io(_)));
    }
}
