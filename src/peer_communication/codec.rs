//! Framing of [`PeerMessage`]s on a byte stream
//!
//! Every frame consists of
//! - 1 byte type tag ([`MessageKind`])
//! - 4 byte little-endian payload length
//! - the payload: the record of the message, serialized with bincode
//!
//! The receiver picks the record shape from the type tag,
//! a payload that does not decode into exactly that shape is rejected.

use bincode::config::{FixintEncoding, LittleEndian, WithOtherEndian, WithOtherIntEncoding};
use bincode::{DefaultOptions, Options};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::peer_communication::peer_messages::{MessageKind, PeerMessage};

/// Type tag + length
pub const HEADER_LEN: usize = 5;

/// Frames announcing a larger payload are rejected before the payload is read
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to read frame: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown message type tag {0}")]
    UnknownType(u8),
    #[error("frame payload of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),
    #[error("payload does not match a {kind:?} record: {source}")]
    Payload {
        kind: MessageKind,
        source: bincode::Error,
    },
    #[error("failed to serialize {kind:?} record: {source}")]
    Serialize {
        kind: MessageKind,
        source: bincode::Error,
    },
}

/// Fixed-width little-endian integers, trailing bytes after a record are rejected
pub(crate) fn wire_options(
) -> WithOtherEndian<WithOtherIntEncoding<DefaultOptions, FixintEncoding>, LittleEndian> {
    DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}

fn serialize_record<T: Serialize>(kind: MessageKind, record: &T) -> Result<Vec<u8>, CodecError> {
    wire_options()
        .serialize(record)
        .map_err(|source| CodecError::Serialize { kind, source })
}

fn deserialize_record<T: DeserializeOwned>(
    kind: MessageKind,
    payload: &[u8],
) -> Result<T, CodecError> {
    wire_options()
        .deserialize(payload)
        .map_err(|source| CodecError::Payload { kind, source })
}

/// Serializes a message into a single frame, ready to be written to a stream
pub fn encode(message: &PeerMessage) -> Result<Vec<u8>, CodecError> {
    let kind = message.kind();
    let payload = match message {
        PeerMessage::Join(record) => serialize_record(kind, record)?,
        PeerMessage::RingInfo(record) => serialize_record(kind, record)?,
        PeerMessage::Request(record) => serialize_record(kind, record)?,
        PeerMessage::ObjectStored(record) => serialize_record(kind, record)?,
        PeerMessage::ObjectRetrieved(record) => serialize_record(kind, record)?,
    };
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(CodecError::FrameTooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(kind as u8);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decodes the record a frame payload carries into the message its type tag names
pub fn decode_payload(kind: MessageKind, payload: &[u8]) -> Result<PeerMessage, CodecError> {
    Ok(match kind {
        MessageKind::Join => PeerMessage::Join(deserialize_record(kind, payload)?),
        MessageKind::RingInfo => PeerMessage::RingInfo(deserialize_record(kind, payload)?),
        MessageKind::Request => PeerMessage::Request(deserialize_record(kind, payload)?),
        MessageKind::ObjectStored => PeerMessage::ObjectStored(deserialize_record(kind, payload)?),
        MessageKind::ObjectRetrieved => {
            PeerMessage::ObjectRetrieved(deserialize_record(kind, payload)?)
        }
    })
}

/// Reads exactly one frame from `reader`
///
/// Waits until the full header and then the full payload arrived.
/// A stream ending mid-frame results in [`CodecError::Io`].
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<PeerMessage, CodecError> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let kind = MessageKind::try_from(header[0]).map_err(CodecError::UnknownType)?;
    let length = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if length > MAX_PAYLOAD_LEN {
        return Err(CodecError::FrameTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    decode_payload(kind, &payload)
}
