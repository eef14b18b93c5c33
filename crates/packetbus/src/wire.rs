//! Deterministic envelope wire codec.
//!
//! Big-endian fixed-width fields with length-prefixed UTF-8 strings.
//! Layout:
//!
//! ```text
//! id:u64  priority:i32  type:str  description:str
//! sender:u32  receiver:u32  topic:str  channel:str
//! created:u64  sent:u64  received:u64  ttl:u64          (nanoseconds)
//! attr_count:u32  (key:str value:str)*
//! ```
//!
//! Serialization is a transport mechanism, not a reconstruction of
//! identity: the id is carried across and restored verbatim. Only
//! string-typed attributes survive the round trip; every other
//! [`AttrValue`] variant encodes as the empty string, matching the lossy
//! behavior this format has always had.

use crate::error::BusError;
use crate::message::{AttrValue, Envelope, Message, Metadata, Priority, Route, Timing, VoidMessage};
use std::collections::BTreeMap;
use std::time::Duration;

/// Encodes a message's envelope.
pub fn encode(message: &dyn Message) -> Vec<u8> {
    let env = message.envelope();
    let mut out = Vec::with_capacity(64);

    out.extend_from_slice(&env.id().to_be_bytes());
    out.extend_from_slice(&env.priority.0.to_be_bytes());
    put_str(&mut out, &env.message_type);
    put_str(&mut out, &env.metadata.description);

    out.extend_from_slice(&env.route.sender.to_be_bytes());
    out.extend_from_slice(&env.route.receiver.to_be_bytes());
    put_str(&mut out, &env.route.topic);
    put_str(&mut out, &env.route.channel);

    out.extend_from_slice(&env.timing.created_ns.to_be_bytes());
    out.extend_from_slice(&env.timing.sent_ns.to_be_bytes());
    out.extend_from_slice(&env.timing.received_ns.to_be_bytes());
    out.extend_from_slice(&(env.timing.ttl.as_nanos() as u64).to_be_bytes());

    out.extend_from_slice(&(env.metadata.attributes.len() as u32).to_be_bytes());
    for (key, value) in &env.metadata.attributes {
        put_str(&mut out, key);
        // Lossy by design: non-string attributes flatten to "".
        put_str(&mut out, value.as_str().unwrap_or(""));
    }

    out
}

/// Decodes an envelope previously produced by [`encode`].
///
/// All surviving fields are restored, including the original id. Malformed
/// input fails with [`BusError::Serialization`] without partial effects.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, BusError> {
    let mut cursor = Cursor::new(bytes);

    let id = cursor.u64()?;
    let priority = Priority(cursor.i32()?);
    let message_type = cursor.str()?;
    let description = cursor.str()?;

    let sender = cursor.u32()?;
    let receiver = cursor.u32()?;
    let topic = cursor.str()?;
    let channel = cursor.str()?;

    let created_ns = cursor.u64()?;
    let sent_ns = cursor.u64()?;
    let received_ns = cursor.u64()?;
    let ttl = Duration::from_nanos(cursor.u64()?);

    let attr_count = cursor.u32()?;
    let mut attributes = BTreeMap::new();
    for _ in 0..attr_count {
        let key = cursor.str()?;
        let value = cursor.str()?;
        attributes.insert(key, AttrValue::Str(value));
    }

    Ok(Envelope {
        id,
        message_type,
        priority,
        route: Route {
            sender,
            receiver,
            topic,
            channel,
        },
        timing: Timing {
            created_ns,
            sent_ns,
            received_ns,
            ttl,
        },
        metadata: Metadata {
            description,
            attributes,
        },
    })
}

/// Decodes into a payload-free message carrying the restored envelope.
///
/// The wire format transports envelopes only; payloads never leave the
/// process, so the reconstructed message reports no payload regardless of
/// the carrier it was encoded from.
pub fn decode(bytes: &[u8]) -> Result<VoidMessage, BusError> {
    Ok(VoidMessage::from_envelope(decode_envelope(bytes)?))
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], BusError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| {
                BusError::Serialization(format!(
                    "truncated stream: need {n} bytes at offset {}",
                    self.pos
                ))
            })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, BusError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, BusError> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, BusError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn str(&mut self) -> Result<String, BusError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| BusError::Serialization(format!("invalid UTF-8 string: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{OwnedMessage, VoidMessage};

    fn sample_message() -> OwnedMessage<u64> {
        let mut msg = OwnedMessage::with_payload("packet/raw", 99u64)
            .with_priority(Priority::HIGH);
        let env = msg.envelope_mut();
        env.set_route(Route {
            sender: 3,
            receiver: 9,
            topic: "sensor/temperature/room1".into(),
            channel: "ingest".into(),
        });
        env.set_ttl(Duration::from_millis(250));
        env.set_description("thermocouple frame");
        env.metadata.set_attribute("unit", "celsius");
        env.metadata.set_attribute("samples", 128i64);
        env.timing.mark_sent();
        env.timing.mark_received();
        msg
    }

    #[test]
    fn round_trip_preserves_envelope() {
        let msg = sample_message();
        let bytes = encode(&msg);
        let decoded = decode_envelope(&bytes).unwrap();

        let original = msg.envelope();
        assert_eq!(decoded.id(), original.id());
        assert_eq!(decoded.message_type, original.message_type);
        assert_eq!(decoded.priority, original.priority);
        assert_eq!(decoded.route, original.route);
        assert_eq!(decoded.timing, original.timing);
        assert_eq!(decoded.metadata.description, original.metadata.description);
        assert_eq!(
            decoded.metadata.attribute("unit"),
            Some(&AttrValue::Str("celsius".into()))
        );
    }

    #[test]
    fn non_string_attributes_flatten_to_empty() {
        let mut msg = VoidMessage::new("attrs");
        let meta = &mut msg.envelope_mut().metadata;
        meta.set_attribute("kept", "yes");
        meta.set_attribute("count", 7i64);
        meta.set_attribute("live", true);
        meta.set_attribute("blob", vec![1u8, 2, 3]);

        let decoded = decode_envelope(&encode(&msg)).unwrap();
        assert_eq!(
            decoded.metadata.attribute("kept"),
            Some(&AttrValue::Str("yes".into()))
        );
        assert_eq!(
            decoded.metadata.attribute("count"),
            Some(&AttrValue::Str(String::new()))
        );
        assert_eq!(
            decoded.metadata.attribute("live"),
            Some(&AttrValue::Str(String::new()))
        );
        assert_eq!(
            decoded.metadata.attribute("blob"),
            Some(&AttrValue::Str(String::new()))
        );
    }

    #[test]
    fn decode_yields_payload_free_message_with_preserved_id() {
        let msg = sample_message();
        let restored = decode(&encode(&msg)).unwrap();
        assert_eq!(restored.id(), Message::id(&msg));
        assert_eq!(restored.message_type(), "packet/raw");
        assert!(!restored.has_payload());
        assert_eq!(restored.payload_size(), 0);
    }

    #[test]
    fn truncated_stream_fails() {
        let bytes = encode(&sample_message());
        for cut in [0, 1, 8, bytes.len() / 2, bytes.len() - 1] {
            let err = decode_envelope(&bytes[..cut]).unwrap_err();
            assert!(matches!(err, BusError::Serialization(_)), "cut at {cut}");
        }
    }

    #[test]
    fn bogus_string_length_fails() {
        let mut bytes = encode(&VoidMessage::new("x"));
        // Corrupt the type-string length field (offset 12) to claim more
        // bytes than the stream holds.
        bytes[12..16].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            decode_envelope(&bytes),
            Err(BusError::Serialization(_))
        ));
    }

    #[test]
    fn invalid_utf8_fails() {
        let msg = VoidMessage::new("ab");
        let mut bytes = encode(&msg);
        // The type string "ab" starts right after id + priority + length.
        bytes[16] = 0xFF;
        bytes[17] = 0xFE;
        assert!(matches!(
            decode_envelope(&bytes),
            Err(BusError::Serialization(_))
        ));
    }
}
