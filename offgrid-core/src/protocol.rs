//! Offgrid in-band control protocol: message kinds and reserved sentinels.

use serde::{Deserialize, Serialize};

/// Payload sent when the local user starts typing.
pub const TYPING_START: &str = "__typing_start__";

/// Payload sent when the local user stops typing.
pub const TYPING_STOP: &str = "__typing_stop__";

/// Prefix of a read receipt; the rest of the payload is the message id.
pub const READ_RECEIPT_PREFIX: &str = "__read__";

/// Every logical message carried on the single payload channel.
/// Encoding is prefix-tagged UTF-8 with no framing (see wire module).
///
/// Any future control message must use a prefix that ordinary chat text cannot produce.
/// Chat text that happens to equal a sentinel is received as that control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Plain chat text, sent verbatim.
    Chat { text: String },
    TypingStart,
    TypingStop,
    /// Peer has read the message with this id.
    ReadReceipt { message_id: String },
}

impl ControlMessage {
    pub fn chat(text: impl Into<String>) -> Self {
        ControlMessage::Chat { text: text.into() }
    }

    pub fn typing(is_typing: bool) -> Self {
        if is_typing {
            ControlMessage::TypingStart
        } else {
            ControlMessage::TypingStop
        }
    }

    pub fn read_receipt(message_id: impl Into<String>) -> Self {
        ControlMessage::ReadReceipt {
            message_id: message_id.into(),
        }
    }
}
