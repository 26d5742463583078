//! Fixed 20-byte header: message type, length, magic cookie, transaction ID.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |0 0|     STUN Message Type     |         Message Length        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Magic Cookie                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Transaction ID (96 bits)                  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The message type interleaves the 12-bit method with the two class bits
//! (C1 at bit 8, C0 at bit 4), per RFC 5389 section 6.

use rand::RngCore;

use crate::error::{LyncnatError, Result};

/// Header size in bytes
pub const HEADER_SIZE: usize = 20;

/// Fixed marker at bytes 4..8
pub const MAGIC_COOKIE: [u8; 4] = [0x21, 0x12, 0xA4, 0x42];

/// Transaction ID size in bytes
pub const TRANSACTION_ID_SIZE: usize = 12;

/// Message class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageClass {
    Request = 0x0000,
    Indication = 0x0010,
    Success = 0x0100,
    Error = 0x0110,
}

impl MessageClass {
    /// Class bits as they sit in the message type.
    pub fn bits(self) -> u16 {
        self as u16
    }

    /// Extract the class from a message type (`type & 0x0110`).
    pub fn from_type(message_type: u16) -> Self {
        match message_type & 0x0110 {
            0x0000 => Self::Request,
            0x0010 => Self::Indication,
            0x0100 => Self::Success,
            _ => Self::Error,
        }
    }

    /// True for success and error responses.
    pub fn is_response(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Indication => "indication",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for MessageClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scatter the method bits around the class bits.
pub fn message_type(class: MessageClass, method: u16) -> u16 {
    let m = method & 0x0FFF;
    let scattered = ((m & 0x0F00) << 2) | ((m & 0x0080) << 2) | ((m & 0x0070) << 1) | (m & 0x000F);
    scattered | class.bits()
}

/// Gather the method bits back out of a message type.
pub fn method_from_type(message_type: u16) -> u16 {
    (message_type & 0x000F)
        | ((message_type & 0x00E0) >> 1)
        | ((message_type & 0x0E00) >> 2)
        | ((message_type & 0x3000) >> 2)
}

/// 96-bit request/response correlator.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TransactionId([u8; TRANSACTION_ID_SIZE]);

impl TransactionId {
    pub fn new(bytes: [u8; TRANSACTION_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Uniformly random ID.
    pub fn random() -> Self {
        let mut bytes = [0u8; TRANSACTION_ID_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        let bytes: [u8; TRANSACTION_ID_SIZE] = slice.try_into().map_err(|_| {
            LyncnatError::Framing(format!(
                "transaction ID must be {} bytes, got {}",
                TRANSACTION_ID_SIZE,
                slice.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; TRANSACTION_ID_SIZE] {
        &self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TransactionId({})", self)
    }
}

/// Parsed fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub class: MessageClass,
    pub method: u16,
    /// Body length (bytes after the header)
    pub length: u16,
    pub transaction_id: TransactionId,
}

impl Header {
    /// Parse and validate the first 20 bytes of a frame.
    ///
    /// Does not check the length against the buffer; callers that hold a
    /// complete frame do that.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(LyncnatError::Framing(format!(
                "frame shorter than {} bytes ({})",
                HEADER_SIZE,
                bytes.len()
            )));
        }
        if bytes[0] & 0xC0 != 0 {
            return Err(LyncnatError::Framing(
                "two first bits in header are not zero".to_string(),
            ));
        }
        if bytes[4..8] != MAGIC_COOKIE {
            return Err(LyncnatError::Framing("magic cookie is not correct".to_string()));
        }

        let message_type = u16::from_be_bytes([bytes[0], bytes[1]]);
        Ok(Self {
            class: MessageClass::from_type(message_type),
            method: method_from_type(message_type),
            length: u16::from_be_bytes([bytes[2], bytes[3]]),
            transaction_id: TransactionId::from_slice(&bytes[8..HEADER_SIZE])?,
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&message_type(self.class, self.method).to_be_bytes());
        buf[2..4].copy_from_slice(&self.length.to_be_bytes());
        buf[4..8].copy_from_slice(&MAGIC_COOKIE);
        buf[8..HEADER_SIZE].copy_from_slice(self.transaction_id.as_bytes());
        buf
    }
}

/// Round up to the next multiple of four.
pub fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::constants::method;

    #[test]
    fn test_binding_request_type() {
        // RFC 5389: Binding request is 0x0001, success 0x0101, error 0x0111
        assert_eq!(message_type(MessageClass::Request, method::BINDING), 0x0001);
        assert_eq!(message_type(MessageClass::Success, method::BINDING), 0x0101);
        assert_eq!(message_type(MessageClass::Error, method::BINDING), 0x0111);
        assert_eq!(message_type(MessageClass::Indication, method::BINDING), 0x0011);
    }

    #[test]
    fn test_method_interleave_inverse() {
        for m in 0..=0x0FFFu16 {
            for class in [
                MessageClass::Request,
                MessageClass::Indication,
                MessageClass::Success,
                MessageClass::Error,
            ] {
                let t = message_type(class, m);
                assert_eq!(t & 0xC000, 0, "top bits must stay clear");
                assert_eq!(method_from_type(t), m);
                assert_eq!(MessageClass::from_type(t), class);
            }
        }
    }

    #[test]
    fn test_keepalive_type_value() {
        // 0xEEA: bits 0-3 = 0xA, bits 4-6 = 0x6, bit 7 = 1, bits 8-11 = 0xE
        let t = message_type(MessageClass::Request, method::KEEPALIVE);
        assert_eq!(t, 0x3ACA);
        assert_eq!(method_from_type(t), method::KEEPALIVE);
    }

    #[test]
    fn test_header_rejects_bad_cookie() {
        let mut bytes = Header {
            class: MessageClass::Request,
            method: method::BINDING,
            length: 0,
            transaction_id: TransactionId::default(),
        }
        .to_bytes();
        assert!(Header::from_bytes(&bytes).is_ok());
        bytes[5] = 0x13;
        assert!(matches!(
            Header::from_bytes(&bytes),
            Err(LyncnatError::Framing(_))
        ));
    }

    #[test]
    fn test_header_rejects_top_bits() {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[4..8].copy_from_slice(&MAGIC_COOKIE);
        bytes[0] = 0x40;
        assert!(Header::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_transaction_id_display_and_equality() {
        let a = TransactionId::new([0xAB; 12]);
        let b = TransactionId::from_slice(&[0xAB; 12]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "ab".repeat(12));
        assert!(TransactionId::from_slice(&[0u8; 11]).is_err());
        assert_ne!(TransactionId::random(), TransactionId::random());
    }

    #[test]
    fn test_padded_len() {
        assert_eq!(padded_len(0), 0);
        assert_eq!(padded_len(1), 4);
        assert_eq!(padded_len(4), 4);
        assert_eq!(padded_len(5), 8);
    }
}
