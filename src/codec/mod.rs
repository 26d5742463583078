//! Binary message codec for the LyncNat relay protocol.
//!
//! The wire format is RFC 5389 (STUN) framing with LyncNat-specific methods
//! and attributes.
//!
//! # Frame Layout
//!
//! | Offset | Size | Field                                     |
//! |--------|------|-------------------------------------------|
//! | 0      | 2    | Message type (method and class, interleaved) |
//! | 2      | 2    | Body length (bytes after the header)      |
//! | 4      | 4    | Magic cookie `21 12 A4 42`                |
//! | 8      | 12   | Transaction ID                            |
//! | 20     | ..   | TLV attributes, each padded to 4 bytes    |
//!
//! Signed frames end with a 24-byte MESSAGE-INTEGRITY attribute holding an
//! HMAC-SHA1 of everything before it.
//!
//! # Usage
//!
//! ```rust,ignore
//! use lyncnat::codec::{Message, MessageFactory};
//!
//! let factory = MessageFactory::new("alice", "api-key");
//! let bytes = factory.keepalive(device_uuid)?;
//! let msg = Message::decode_verified(&bytes, factory.key())?;
//! ```

pub mod arguments;
pub mod constants;
mod factory;
mod header;
pub mod integrity;
mod message;

pub use arguments::{ArgumentDef, ArgumentType, ArgumentValue};
pub use factory::{error_code_value, unix_timestamp, xor_mapped_address_value, MessageFactory};
pub use header::{
    message_type, method_from_type, padded_len, Header, MessageClass, TransactionId, HEADER_SIZE,
    MAGIC_COOKIE,
};
pub use integrity::Integrity;
pub use message::{Attribute, Message};

/// Body length declared by a header prefix, if at least 4 bytes are present.
///
/// Stream transports use this to find frame boundaries.
pub fn declared_frame_len(prefix: &[u8]) -> Option<usize> {
    if prefix.len() < 4 {
        return None;
    }
    Some(HEADER_SIZE + usize::from(u16::from_be_bytes([prefix[2], prefix[3]])))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declared_frame_len() {
        assert_eq!(declared_frame_len(&[0, 1, 0]), None);
        assert_eq!(declared_frame_len(&[0, 1, 0, 0]), Some(20));
        assert_eq!(declared_frame_len(&[0, 1, 0x01, 0x00, 0xFF]), Some(276));
    }
}
