//! Payload codec: control messages to and from the transport's untyped byte payloads.
//!
//! No version byte and no length prefix; payload boundaries come from the transport's own framing.

use std::borrow::Cow;

use crate::protocol::{ControlMessage, READ_RECEIPT_PREFIX, TYPING_START, TYPING_STOP};

/// Encode a message into the bytes handed to `send_bytes`.
pub fn encode_payload(msg: &ControlMessage) -> Vec<u8> {
    match msg {
        ControlMessage::Chat { text } => text.as_bytes().to_vec(),
        ControlMessage::TypingStart => TYPING_START.as_bytes().to_vec(),
        ControlMessage::TypingStop => TYPING_STOP.as_bytes().to_vec(),
        ControlMessage::ReadReceipt { message_id } => {
            let mut out = Vec::with_capacity(READ_RECEIPT_PREFIX.len() + message_id.len());
            out.extend_from_slice(READ_RECEIPT_PREFIX.as_bytes());
            out.extend_from_slice(message_id.as_bytes());
            out
        }
    }
}

/// Decode a received payload. Total: never fails.
///
/// Matching order is part of the protocol: typing-start, typing-stop, read-receipt prefix, then chat.
/// Invalid UTF-8 is replaced with U+FFFD and the result still goes through the same matching.
pub fn decode_payload(bytes: &[u8]) -> ControlMessage {
    let text: Cow<'_, str> = String::from_utf8_lossy(bytes);
    if text == TYPING_START {
        return ControlMessage::TypingStart;
    }
    if text == TYPING_STOP {
        return ControlMessage::TypingStop;
    }
    if let Some(message_id) = text.strip_prefix(READ_RECEIPT_PREFIX) {
        return ControlMessage::ReadReceipt {
            message_id: message_id.to_owned(),
        };
    }
    ControlMessage::Chat {
        text: text.into_owned(),
    }
}
