//! Decoded frames and their TLV attributes.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use uuid::Uuid;

use super::constants::{attr, method};
use super::header::{padded_len, Header, MessageClass, TransactionId, HEADER_SIZE, MAGIC_COOKIE};
use super::integrity::{self, INTEGRITY_ATTR_SIZE};
use crate::error::{LyncnatError, Result};

/// One TLV attribute, value unpadded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub kind: u16,
    pub value: Vec<u8>,
}

impl Attribute {
    pub fn new(kind: u16, value: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }

    /// Bytes this attribute takes on the wire
    pub fn wire_len(&self) -> usize {
        4 + padded_len(self.value.len())
    }
}

/// A protocol message.
///
/// Attributes keep wire order. Lookup by type returns the first occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub class: MessageClass,
    pub method: u16,
    pub transaction_id: TransactionId,
    attributes: Vec<Attribute>,
}

impl Message {
    /// New message with a random transaction ID.
    pub fn new(class: MessageClass, method: u16) -> Self {
        Self {
            class,
            method: method & 0x0FFF,
            transaction_id: TransactionId::random(),
            attributes: Vec::new(),
        }
    }

    pub fn with_transaction_id(mut self, transaction_id: TransactionId) -> Self {
        self.transaction_id = transaction_id;
        self
    }

    pub fn with_attribute(mut self, kind: u16, value: impl Into<Vec<u8>>) -> Self {
        self.push_attribute(kind, value);
        self
    }

    pub fn push_attribute(&mut self, kind: u16, value: impl Into<Vec<u8>>) {
        self.attributes.push(Attribute::new(kind, value));
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// First attribute of the given type.
    pub fn attribute(&self, kind: u16) -> Option<&[u8]> {
        self.attributes
            .iter()
            .find(|a| a.kind == kind)
            .map(|a| a.value.as_slice())
    }

    pub fn has_attribute(&self, kind: u16) -> bool {
        self.attribute(kind).is_some()
    }

    /// Attribute value as UTF-8.
    pub fn attribute_str(&self, kind: u16) -> Option<&str> {
        self.attribute(kind).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Attribute value as a big-endian u32 (TIMESTAMP, SERVER-TIME, ...).
    pub fn attribute_u32(&self, kind: u16) -> Option<u32> {
        let value = self.attribute(kind)?;
        let bytes: [u8; 4] = value.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    pub fn username(&self) -> Option<&str> {
        self.attribute_str(attr::USERNAME)
    }

    /// DEVICE-ID as a UUID.
    pub fn device_id(&self) -> Option<Uuid> {
        self.attribute(attr::DEVICE_ID)
            .and_then(|v| Uuid::from_slice(v).ok())
    }

    /// ERROR-CODE as (code, reason).
    pub fn error_code(&self) -> Option<(u16, String)> {
        let value = self.attribute(attr::ERROR_CODE)?;
        if value.len() < 4 {
            return None;
        }
        let code = u16::from(value[2] & 0x07) * 100 + u16::from(value[3]);
        let reason = String::from_utf8_lossy(&value[4..])
            .trim_end_matches('\0')
            .to_string();
        Some((code, reason))
    }

    /// XOR-MAPPED-ADDRESS, falling back to MAPPED-ADDRESS.
    ///
    /// Only IPv4 is supported; an IPv6 family is an error.
    pub fn mapped_address(&self) -> Result<Option<SocketAddr>> {
        if let Some(value) = self.attribute(attr::XOR_MAPPED_ADDRESS) {
            let (port, ip) = parse_address(value)?;
            let port = port ^ u16::from_be_bytes([MAGIC_COOKIE[0], MAGIC_COOKIE[1]]);
            let ip = ip ^ u32::from_be_bytes(MAGIC_COOKIE);
            return Ok(Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port)));
        }
        if let Some(value) = self.attribute(attr::MAPPED_ADDRESS) {
            let (port, ip) = parse_address(value)?;
            return Ok(Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port)));
        }
        Ok(None)
    }

    /// Decode a complete frame.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = Header::from_bytes(bytes)?;
        let body_len = bytes.len() - HEADER_SIZE;
        if usize::from(header.length) != body_len {
            return Err(LyncnatError::Framing(format!(
                "message length field is {} but body is {} bytes",
                header.length, body_len
            )));
        }

        let mut attributes = Vec::new();
        let mut offset = HEADER_SIZE;
        while offset < bytes.len() {
            if bytes.len() - offset < 4 {
                return Err(LyncnatError::Framing(format!(
                    "truncated attribute header at offset {}",
                    offset
                )));
            }
            let kind = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
            let len = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;
            let start = offset + 4;
            let end = start + len;
            if end > bytes.len() {
                return Err(LyncnatError::Framing(format!(
                    "attribute {} ({:#06x}) declares {} bytes, only {} left",
                    attr::name(kind),
                    kind,
                    len,
                    bytes.len() - start
                )));
            }
            attributes.push(Attribute::new(kind, &bytes[start..end]));
            offset = (start + padded_len(len)).min(bytes.len());
        }

        Ok(Self {
            class: header.class,
            method: header.method,
            transaction_id: header.transaction_id,
            attributes,
        })
    }

    /// Decode and check integrity against `key`.
    ///
    /// Frames without a MESSAGE-INTEGRITY attribute are accepted.
    pub fn decode_verified(bytes: &[u8], key: &[u8]) -> Result<Self> {
        let message = Self::decode(bytes)?;
        integrity::verify(bytes, key)?;
        Ok(message)
    }

    /// Encode to wire bytes, appending MESSAGE-INTEGRITY when `key` is given.
    ///
    /// With a key, any MESSAGE-INTEGRITY already in the attribute list is
    /// replaced by the freshly computed one.
    pub fn encode(&self, key: Option<&[u8]>) -> Result<Vec<u8>> {
        let attributes: Vec<&Attribute> = self
            .attributes
            .iter()
            .filter(|a| key.is_none() || a.kind != attr::MESSAGE_INTEGRITY)
            .collect();

        let mut body_len: usize = attributes.iter().map(|a| a.wire_len()).sum();
        if key.is_some() {
            body_len += INTEGRITY_ATTR_SIZE;
        }
        let length = u16::try_from(body_len).map_err(|_| {
            LyncnatError::Framing(format!("message body of {} bytes is too large", body_len))
        })?;

        let header = Header {
            class: self.class,
            method: self.method,
            length,
            transaction_id: self.transaction_id,
        };

        let mut buf = Vec::with_capacity(HEADER_SIZE + body_len);
        buf.extend_from_slice(&header.to_bytes());
        for attribute in attributes {
            let len = u16::try_from(attribute.value.len()).map_err(|_| {
                LyncnatError::Framing(format!(
                    "attribute {} value too large",
                    attr::name(attribute.kind)
                ))
            })?;
            buf.extend_from_slice(&attribute.kind.to_be_bytes());
            buf.extend_from_slice(&len.to_be_bytes());
            buf.extend_from_slice(&attribute.value);
            buf.resize(buf.len() + padded_len(attribute.value.len()) - attribute.value.len(), 0);
        }

        if let Some(key) = key {
            integrity::sign(&mut buf, key)?;
        }
        Ok(buf)
    }
}

fn parse_address(value: &[u8]) -> Result<(u16, u32)> {
    if value.len() < 4 {
        return Err(LyncnatError::InvalidMessage(
            "mapped address shorter than 4 bytes".to_string(),
        ));
    }
    match value[1] {
        0x01 if value.len() >= 8 => Ok((
            u16::from_be_bytes([value[2], value[3]]),
            u32::from_be_bytes([value[4], value[5], value[6], value[7]]),
        )),
        0x01 => Err(LyncnatError::InvalidMessage(
            "truncated IPv4 mapped address".to_string(),
        )),
        0x02 => Err(LyncnatError::InvalidMessage(
            "IPv6 mapped addresses are not supported".to_string(),
        )),
        family => Err(LyncnatError::InvalidMessage(format!(
            "unknown address family {:#04x}",
            family
        ))),
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} {} ({:#05x}) tid={}",
            method::name(self.method),
            self.class,
            self.method,
            self.transaction_id
        )?;
        for attribute in &self.attributes {
            write!(
                f,
                "  {:<20} {:#06x} len={:<4}",
                attr::name(attribute.kind),
                attribute.kind,
                attribute.value.len()
            )?;
            match std::str::from_utf8(&attribute.value) {
                Ok(s) if !s.is_empty() && s.chars().all(|c| !c.is_control()) => {
                    writeln!(f, " \"{}\"", s)?;
                }
                _ => {
                    write!(f, " ")?;
                    for byte in &attribute.value {
                        write!(f, "{:02x}", byte)?;
                    }
                    writeln!(f)?;
                }
            }
        }
        Ok(())
    }
}
