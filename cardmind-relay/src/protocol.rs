//! Binary wire protocol for document replication and awareness.
//!
//! Every integer on the wire is an unsigned LEB128 varint. Byte strings are
//! prefixed with their varint length.
//!
//! ```text
//! Frame         := messageType:varint payload
//!
//! messageType 0 (Sync):
//!   payload     := subType:varint body
//!   subType 0   SyncStep1  body := stateVector:bytes
//!   subType 1   SyncStep2  body := update:bytes
//!   subType 2   Update     body := update:bytes
//!
//! messageType 1 (Awareness):
//!   payload     := count:varint entry*count
//!   entry       := clientId:varint clock:varint hasState:u8 [state:bytes (JSON)]
//! ```
//!
//! The varint and length-prefixed byte codec is lib0's, through
//! `yrs::encoding`. Decoding never panics: truncated input, unknown tags and
//! malformed JSON all surface as [`ProtocolError`].

use serde_json::Value;
use yrs::encoding::read::{self, Cursor, Read};
use yrs::encoding::write::Write;

/// Top-level message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Replication sub-protocol
    Sync = 0,
    /// Presence sub-protocol
    Awareness = 1,
}

impl MessageType {
    fn from_tag(tag: u64) -> Result<Self, ProtocolError> {
        match tag {
            0 => Ok(Self::Sync),
            1 => Ok(Self::Awareness),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// Replication sub-messages carried by a `Sync` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Sender's encoded state vector; the receiver answers with a diff.
    SyncStep1(Vec<u8>),
    /// A diff computed against a state vector we sent earlier.
    SyncStep2(Vec<u8>),
    /// An incremental update.
    Update(Vec<u8>),
}

impl SyncMessage {
    fn tag(&self) -> u64 {
        match self {
            SyncMessage::SyncStep1(_) => 0,
            SyncMessage::SyncStep2(_) => 1,
            SyncMessage::Update(_) => 2,
        }
    }

    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            SyncMessage::SyncStep1(_) => "SyncStep1",
            SyncMessage::SyncStep2(_) => "SyncStep2",
            SyncMessage::Update(_) => "Update",
        }
    }

    fn body(&self) -> &[u8] {
        match self {
            SyncMessage::SyncStep1(b) | SyncMessage::SyncStep2(b) | SyncMessage::Update(b) => b,
        }
    }
}

/// One client's presence entry as carried on the wire.
///
/// `state == None` is the explicit "absent" sentinel: the client is gone.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntryUpdate {
    pub client_id: u64,
    pub clock: u64,
    pub state: Option<Value>,
}

impl AwarenessEntryUpdate {
    pub fn new(client_id: u64, clock: u64, state: Option<Value>) -> Self {
        Self { client_id, clock, state }
    }

    /// Removal entry for `client_id`.
    pub fn removal(client_id: u64, clock: u64) -> Self {
        Self { client_id, clock, state: None }
    }

    pub fn is_removal(&self) -> bool {
        self.state.is_none()
    }
}

/// A batch of awareness entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntryUpdate>,
}

impl AwarenessUpdate {
    pub fn new(entries: Vec<AwarenessEntryUpdate>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Sync(SyncMessage),
    Awareness(AwarenessUpdate),
}

impl Frame {
    pub fn sync_step1(state_vector: Vec<u8>) -> Self {
        Frame::Sync(SyncMessage::SyncStep1(state_vector))
    }

    pub fn sync_step2(diff: Vec<u8>) -> Self {
        Frame::Sync(SyncMessage::SyncStep2(diff))
    }

    pub fn update(update: Vec<u8>) -> Self {
        Frame::Sync(SyncMessage::Update(update))
    }

    pub fn awareness(update: AwarenessUpdate) -> Self {
        Frame::Awareness(update)
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Sync(_) => MessageType::Sync,
            Frame::Awareness(_) => MessageType::Awareness,
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut w: Vec<u8> = Vec::new();
        w.write_var(self.message_type() as u64);
        match self {
            Frame::Sync(msg) => {
                w.write_var(msg.tag());
                w.write_buf(msg.body());
            }
            Frame::Awareness(update) => {
                w.write_var(update.entries.len() as u64);
                for entry in &update.entries {
                    w.write_var(entry.client_id);
                    w.write_var(entry.clock);
                    match &entry.state {
                        Some(state) => {
                            w.write_u8(1);
                            w.write_buf(state.to_string());
                        }
                        None => w.write_u8(0),
                    }
                }
            }
        }
        w
    }

    /// Deserialize from the binary wire format.
    ///
    /// Bytes past the end of a well-formed frame are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Cursor::new(bytes);
        match MessageType::from_tag(r.read_var::<u64>()?)? {
            MessageType::Sync => {
                let sub_type = r.read_var::<u64>()?;
                let body = r.read_buf()?.to_vec();
                let msg = match sub_type {
                    0 => SyncMessage::SyncStep1(body),
                    1 => SyncMessage::SyncStep2(body),
                    2 => SyncMessage::Update(body),
                    other => return Err(ProtocolError::UnknownSyncType(other)),
                };
                Ok(Frame::Sync(msg))
            }
            MessageType::Awareness => {
                let count = r.read_var::<u64>()?;
                // Each entry is at least three bytes; don't trust `count` for allocation.
                let remaining = r.buf.len() - r.next;
                let mut entries = Vec::with_capacity((count as usize).min(remaining / 3));
                for _ in 0..count {
                    let client_id = r.read_var::<u64>()?;
                    let clock = r.read_var::<u64>()?;
                    let state = match r.read_u8()? {
                        0 => None,
                        1 => {
                            let raw = r.read_buf()?;
                            let value: Value = serde_json::from_slice(raw)
                                .map_err(|e| ProtocolError::InvalidState(e.to_string()))?;
                            // A JSON `null` state is the removal sentinel too.
                            if value.is_null() { None } else { Some(value) }
                        }
                        other => return Err(ProtocolError::InvalidBool(other)),
                    };
                    entries.push(AwarenessEntryUpdate { client_id, clock, state });
                }
                Ok(Frame::Awareness(AwarenessUpdate { entries }))
            }
        }
    }
}

/// Protocol errors. Any of these closes the offending connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unexpected end of frame: needed {0} more bytes")]
    UnexpectedEnd(usize),
    #[error("invalid varint")]
    InvalidVarInt,
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown message type {0}")]
    UnknownMessageType(u64),
    #[error("unknown sync message type {0}")]
    UnknownSyncType(u64),
    #[error("invalid boolean byte {0:#04x}")]
    InvalidBool(u8),
    #[error("invalid awareness state: {0}")]
    InvalidState(String),
}

impl From<read::Error> for ProtocolError {
    fn from(e: read::Error) -> Self {
        match e {
            read::Error::EndOfBuffer(needed) => ProtocolError::UnexpectedEnd(needed),
            read::Error::InvalidVarInt => ProtocolError::InvalidVarInt,
            other => ProtocolError::Malformed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn var(value: u64) -> Vec<u8> {
        let mut w: Vec<u8> = Vec::new();
        w.write_var(value);
        w
    }

    #[test]
    fn test_varint_known_encodings() {
        assert_eq!(var(0), vec![0x00]);
        assert_eq!(var(127), vec![0x7F]);
        assert_eq!(var(128), vec![0x80, 0x01]);
        assert_eq!(var(300), vec![0xAC, 0x02]);
        assert_eq!(var(u64::MAX).len(), 10);
    }

    #[test]
    fn test_large_client_id_survives() {
        let update = AwarenessUpdate::new(vec![AwarenessEntryUpdate::removal(u64::MAX, 1)]);
        let encoded = Frame::awareness(update.clone()).encode();
        assert_eq!(Frame::decode(&encoded).unwrap(), Frame::Awareness(update));
    }

    #[test]
    fn test_overlong_varint_rejected() {
        let mut bytes = vec![1];
        bytes.extend_from_slice(&[0xFF; 11]);
        assert_eq!(Frame::decode(&bytes), Err(ProtocolError::InvalidVarInt));
    }

    #[test]
    fn test_sync_step1_layout() {
        let frame = Frame::sync_step1(vec![9, 8, 7]);
        // type 0, sub-type 0, length 3, body
        assert_eq!(frame.encode(), vec![0, 0, 3, 9, 8, 7]);
    }

    #[test]
    fn test_update_layout() {
        let frame = Frame::update(vec![1, 2]);
        assert_eq!(frame.encode(), vec![0, 2, 2, 1, 2]);
        assert_eq!(Frame::decode(&[0, 2, 2, 1, 2]).unwrap(), frame);
    }

    #[test]
    fn test_sync_step2_decode() {
        let decoded = Frame::decode(&[0, 1, 0]).unwrap();
        assert_eq!(decoded, Frame::sync_step2(Vec::new()));
    }

    #[test]
    fn test_awareness_layout() {
        let update = AwarenessUpdate::new(vec![
            AwarenessEntryUpdate::new(5, 2, Some(json!({"name": "ann"}))),
            AwarenessEntryUpdate::removal(300, 9),
        ]);
        let encoded = Frame::awareness(update.clone()).encode();

        let state = br#"{"name":"ann"}"#;
        let mut expected = vec![1, 2, 5, 2, 1, state.len() as u8];
        expected.extend_from_slice(state);
        expected.extend_from_slice(&[0xAC, 0x02, 9, 0]);
        assert_eq!(encoded, expected);

        assert_eq!(Frame::decode(&encoded).unwrap(), Frame::Awareness(update));
    }

    #[test]
    fn test_awareness_null_state_is_removal() {
        let mut bytes = vec![1, 1, 7, 3, 1, 4];
        bytes.extend_from_slice(b"null");
        match Frame::decode(&bytes).unwrap() {
            Frame::Awareness(update) => {
                assert_eq!(update.len(), 1);
                assert!(update.entries[0].is_removal());
                assert_eq!(update.entries[0].clock, 3);
            }
            other => panic!("expected awareness frame, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_empty_frame() {
        assert_eq!(Frame::decode(&[]), Err(ProtocolError::UnexpectedEnd(1)));
    }

    #[test]
    fn test_decode_unknown_message_type() {
        assert_eq!(Frame::decode(&[7, 0]), Err(ProtocolError::UnknownMessageType(7)));
    }

    #[test]
    fn test_decode_unknown_sync_type() {
        assert_eq!(Frame::decode(&[0, 3, 0]), Err(ProtocolError::UnknownSyncType(3)));
    }

    #[test]
    fn test_decode_truncated_body() {
        // Claims 5 bytes of update, carries 2.
        assert_eq!(
            Frame::decode(&[0, 2, 5, 1, 2]),
            Err(ProtocolError::UnexpectedEnd(5))
        );
    }

    #[test]
    fn test_decode_truncated_awareness() {
        // Count says two entries, only one present.
        assert!(matches!(
            Frame::decode(&[1, 2, 1, 1, 0]),
            Err(ProtocolError::UnexpectedEnd(_))
        ));
    }

    #[test]
    fn test_decode_invalid_bool() {
        assert_eq!(Frame::decode(&[1, 1, 1, 1, 2]), Err(ProtocolError::InvalidBool(2)));
    }

    #[test]
    fn test_decode_invalid_json_state() {
        let mut bytes = vec![1, 1, 1, 1, 1, 3];
        bytes.extend_from_slice(b"{x]");
        assert!(matches!(
            Frame::decode(&bytes),
            Err(ProtocolError::InvalidState(_))
        ));
    }

    #[test]
    fn test_decode_huge_count_does_not_allocate() {
        // count = 2^40 with no entries behind it
        let mut bytes = vec![1];
        bytes.extend(var(1 << 40));
        assert!(Frame::decode(&bytes).is_err());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Sync as u8, 0);
        assert_eq!(MessageType::Awareness as u8, 1);
        assert_eq!(Frame::update(vec![]).message_type(), MessageType::Sync);
    }
}
