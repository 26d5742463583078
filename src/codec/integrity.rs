//! HMAC-SHA1 message integrity.
//!
//! The MESSAGE-INTEGRITY attribute is always the last 24 bytes of a signed
//! frame. The HMAC covers every byte before it, with the header length field
//! already counting the integrity attribute. The key is the raw UTF-8 of the
//! account API key.

use hmac::{Hmac, Mac};
use sha1::Sha1;

use super::constants::attr;
use super::header::{padded_len, HEADER_SIZE};
use crate::error::{LyncnatError, Result};

type HmacSha1 = Hmac<Sha1>;

/// HMAC-SHA1 tag size
pub const TAG_SIZE: usize = 20;

/// Attribute header plus tag
pub const INTEGRITY_ATTR_SIZE: usize = 4 + TAG_SIZE;

/// Outcome of checking an inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integrity {
    /// Tag present and correct
    Verified,
    /// Frame carries no MESSAGE-INTEGRITY attribute
    Absent,
}

fn mac(key: &[u8]) -> Result<HmacSha1> {
    HmacSha1::new_from_slice(key)
        .map_err(|e| LyncnatError::Framing(format!("invalid integrity key: {e}")))
}

/// Compute the tag over `data`.
pub fn compute_tag(data: &[u8], key: &[u8]) -> Result<[u8; TAG_SIZE]> {
    let mut mac = mac(key)?;
    mac.update(data);
    let result = mac.finalize();
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&result.into_bytes());
    Ok(tag)
}

/// Append MESSAGE-INTEGRITY to a frame whose length field already includes it.
pub fn sign(frame: &mut Vec<u8>, key: &[u8]) -> Result<()> {
    let tag = compute_tag(frame, key)?;
    frame.extend_from_slice(&attr::MESSAGE_INTEGRITY.to_be_bytes());
    frame.extend_from_slice(&(TAG_SIZE as u16).to_be_bytes());
    frame.extend_from_slice(&tag);
    Ok(())
}

/// Offset of the MESSAGE-INTEGRITY attribute header, if the frame has one.
pub fn locate(frame: &[u8]) -> Option<usize> {
    let mut offset = HEADER_SIZE;
    while offset + 4 <= frame.len() {
        let kind = u16::from_be_bytes([frame[offset], frame[offset + 1]]);
        let len = u16::from_be_bytes([frame[offset + 2], frame[offset + 3]]) as usize;
        if kind == attr::MESSAGE_INTEGRITY {
            return Some(offset);
        }
        offset += 4 + padded_len(len);
    }
    None
}

/// Check the MESSAGE-INTEGRITY attribute of a complete frame.
///
/// Returns [`Integrity::Absent`] when there is nothing to check and
/// [`LyncnatError::Authentication`] when the tag does not match.
pub fn verify(frame: &[u8], key: &[u8]) -> Result<Integrity> {
    let Some(offset) = locate(frame) else {
        return Ok(Integrity::Absent);
    };
    let tag_start = offset + 4;
    let tag = frame
        .get(tag_start..tag_start + TAG_SIZE)
        .ok_or_else(|| LyncnatError::Framing("truncated MESSAGE-INTEGRITY".to_string()))?;

    let mut mac = mac(key)?;
    mac.update(&frame[..offset]);
    mac.verify_slice(tag)
        .map_err(|_| LyncnatError::Authentication)?;
    Ok(Integrity::Verified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::constants::method;
    use crate::codec::message::Message;
    use crate::codec::MessageClass;

    const KEY: &[u8] = b"0123456789abcdef";

    fn signed_frame() -> Vec<u8> {
        Message::new(MessageClass::Request, method::KEEPALIVE)
            .with_attribute(attr::USERNAME, b"alice".to_vec())
            .encode(Some(KEY))
            .unwrap()
    }

    #[test]
    fn test_known_vector() {
        // RFC 2202 test case 2
        let tag = compute_tag(b"what do ya want for nothing?", b"Jefe").unwrap();
        assert_eq!(
            tag,
            hex_literal::hex!("effcdf6ae5eb2fa2d27416d5f184df9c259a7c79")
        );
    }

    #[test]
    fn test_sign_and_verify() {
        let frame = signed_frame();
        assert_eq!(locate(&frame), Some(frame.len() - INTEGRITY_ATTR_SIZE));
        assert_eq!(verify(&frame, KEY).unwrap(), Integrity::Verified);
    }

    #[test]
    fn test_tamper_detected() {
        let mut frame = signed_frame();
        // Flip a bit in the USERNAME value
        frame[24] ^= 0x01;
        assert!(matches!(
            verify(&frame, KEY),
            Err(LyncnatError::Authentication)
        ));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let frame = signed_frame();
        assert!(verify(&frame, b"another key").is_err());
    }

    #[test]
    fn test_absent_integrity() {
        let frame = Message::new(MessageClass::Error, method::BINDING)
            .encode(None)
            .unwrap();
        assert_eq!(verify(&frame, KEY).unwrap(), Integrity::Absent);
    }
}
