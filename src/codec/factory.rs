//! Builders for the frames a device (or a relay stand-in) sends.
//!
//! Every builder returns signed wire bytes except 4xx error responses, which
//! go out without USERNAME or MESSAGE-INTEGRITY.

use std::net::SocketAddr;

use uuid::Uuid;

use super::constants::{attr, begin_session, method, DEFAULT_EXPIRATION_SECS};
use super::header::{padded_len, MessageClass, TransactionId, MAGIC_COOKIE};
use super::message::{Attribute, Message};
use crate::error::{LyncnatError, Result};

/// Current unix time as the 4-byte TIMESTAMP value.
pub fn unix_timestamp() -> [u8; 4] {
    (chrono::Utc::now().timestamp() as u32).to_be_bytes()
}

/// ERROR-CODE value: class and number, reason, zero padded to 4 bytes.
pub fn error_code_value(code: u16, reason: &str) -> Vec<u8> {
    let mut value = vec![0, 0, (code / 100) as u8, (code % 100) as u8];
    value.extend_from_slice(reason.as_bytes());
    value.resize(4 + padded_len(reason.len()), 0);
    value
}

/// XOR-MAPPED-ADDRESS value for an IPv4 endpoint.
pub fn xor_mapped_address_value(addr: SocketAddr) -> Result<Vec<u8>> {
    let SocketAddr::V4(v4) = addr else {
        return Err(LyncnatError::InvalidMessage(
            "IPv6 mapped addresses are not supported".to_string(),
        ));
    };
    let port = v4.port().to_be_bytes();
    let ip = v4.ip().octets();
    Ok(vec![
        0x00,
        0x01,
        port[0] ^ MAGIC_COOKIE[0],
        port[1] ^ MAGIC_COOKIE[1],
        ip[0] ^ MAGIC_COOKIE[0],
        ip[1] ^ MAGIC_COOKIE[1],
        ip[2] ^ MAGIC_COOKIE[2],
        ip[3] ^ MAGIC_COOKIE[3],
    ])
}

/// Frame builder bound to one account's credentials.
#[derive(Clone)]
pub struct MessageFactory {
    username: String,
    api_key: String,
}

impl std::fmt::Debug for MessageFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageFactory")
            .field("username", &self.username)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl MessageFactory {
    pub fn new(username: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            api_key: api_key.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// HMAC key: the API key's UTF-8 bytes.
    pub fn key(&self) -> &[u8] {
        self.api_key.as_bytes()
    }

    fn seal(&self, message: &Message) -> Result<Vec<u8>> {
        message.encode(Some(self.key()))
    }

    /// USERNAME, TIMESTAMP and DEVICE-ID, in that order.
    fn device_request(&self, method: u16, device: Uuid) -> Message {
        Message::new(MessageClass::Request, method)
            .with_attribute(attr::USERNAME, self.username.as_bytes().to_vec())
            .with_attribute(attr::TIMESTAMP, unix_timestamp().to_vec())
            .with_attribute(attr::DEVICE_ID, device.as_bytes().to_vec())
    }

    /// Success response to `request`.
    ///
    /// USERNAME is `username` when given, otherwise echoed from the request,
    /// otherwise this factory's username.
    pub fn success_response(
        &self,
        request: &Message,
        extra: Vec<Attribute>,
        username: Option<&str>,
    ) -> Result<Vec<u8>> {
        let username = username
            .map(|u| u.as_bytes().to_vec())
            .or_else(|| request.attribute(attr::USERNAME).map(<[u8]>::to_vec))
            .unwrap_or_else(|| self.username.as_bytes().to_vec());

        let mut response = Message::new(MessageClass::Success, request.method)
            .with_transaction_id(request.transaction_id);
        for attribute in extra {
            response.push_attribute(attribute.kind, attribute.value);
        }
        response.push_attribute(attr::TIMESTAMP, unix_timestamp().to_vec());
        response.push_attribute(attr::USERNAME, username);
        self.seal(&response)
    }

    /// Error response to `request`.
    pub fn error_response(&self, request: &Message, code: u16, reason: &str) -> Result<Vec<u8>> {
        let mut response = Message::new(MessageClass::Error, request.method)
            .with_transaction_id(request.transaction_id)
            .with_attribute(attr::ERROR_CODE, error_code_value(code, reason))
            .with_attribute(attr::SERVER_TIME, unix_timestamp().to_vec())
            .with_attribute(
                attr::EXPIRATION_POLICY,
                DEFAULT_EXPIRATION_SECS.to_be_bytes().to_vec(),
            );

        if code / 100 == 4 {
            return response.encode(None);
        }
        let username = request
            .attribute(attr::USERNAME)
            .map(<[u8]>::to_vec)
            .unwrap_or_else(|| self.username.as_bytes().to_vec());
        response.push_attribute(attr::USERNAME, username);
        self.seal(&response)
    }

    pub fn keepalive(&self, device: Uuid) -> Result<Vec<u8>> {
        self.seal(&self.device_request(method::KEEPALIVE, device))
    }

    /// Start-session binding request. `name` is sent on a device's first
    /// session.
    pub fn start_session(
        &self,
        device: Uuid,
        name: Option<&str>,
    ) -> Result<(TransactionId, Vec<u8>)> {
        let mut request = self.device_request(method::BINDING, device);
        if let Some(name) = name {
            request.push_attribute(attr::NAME, name.as_bytes().to_vec());
        }
        request.push_attribute(attr::BEGIN_SESSION, vec![begin_session::START]);
        Ok((request.transaction_id, self.seal(&request)?))
    }

    pub fn end_session(&self, device: Uuid) -> Result<Vec<u8>> {
        let request = self
            .device_request(method::BINDING, device)
            .with_attribute(attr::BEGIN_SESSION, vec![begin_session::END]);
        self.seal(&request)
    }

    /// Register a new device under this account. No DEVICE-ID yet.
    pub fn register_device(&self, name: &str) -> Result<(TransactionId, Vec<u8>)> {
        let request = Message::new(MessageClass::Request, method::BINDING)
            .with_attribute(attr::USERNAME, self.username.as_bytes().to_vec())
            .with_attribute(attr::TIMESTAMP, unix_timestamp().to_vec())
            .with_attribute(attr::NAME, name.as_bytes().to_vec())
            .with_attribute(attr::BEGIN_SESSION, vec![begin_session::REGISTER]);
        Ok((request.transaction_id, self.seal(&request)?))
    }

    /// Binding success carrying the client's reflexive address.
    pub fn binding_success(
        &self,
        request: &Message,
        client: SocketAddr,
        device: Option<Uuid>,
    ) -> Result<Vec<u8>> {
        let now = unix_timestamp();
        let mut response = Message::new(MessageClass::Success, request.method)
            .with_transaction_id(request.transaction_id)
            .with_attribute(attr::XOR_MAPPED_ADDRESS, xor_mapped_address_value(client)?)
            .with_attribute(attr::TIMESTAMP, now.to_vec())
            .with_attribute(attr::SERVER_TIME, now.to_vec())
            .with_attribute(
                attr::EXPIRATION_POLICY,
                DEFAULT_EXPIRATION_SECS.to_be_bytes().to_vec(),
            );
        if let Some(device) = device {
            response.push_attribute(attr::DEVICE_ID, device.as_bytes().to_vec());
        }
        self.seal(&response)
    }

    pub fn log_request(&self, device: Uuid, level: u8, text: &str) -> Result<Vec<u8>> {
        let request = self
            .device_request(method::LOG, device)
            .with_attribute(attr::ERROR_LEVEL, vec![level])
            .with_attribute(attr::LOG_MESSAGE, text.as_bytes().to_vec());
        self.seal(&request)
    }

    pub fn event_request(&self, device: Uuid, name: &str, payload: &[u8]) -> Result<Vec<u8>> {
        let request = self
            .device_request(method::EVENT, device)
            .with_attribute(attr::NAME, name.as_bytes().to_vec())
            .with_attribute(attr::PAYLOAD, payload.to_vec());
        self.seal(&request)
    }

    /// Subscribe (or unsubscribe) to an event feed.
    pub fn subscription_request(
        &self,
        device: Uuid,
        event: &str,
        subscribe: bool,
    ) -> Result<Vec<u8>> {
        let method = if subscribe {
            method::SUBSCRIBE
        } else {
            method::UNSUBSCRIBE
        };
        let request = self
            .device_request(method, device)
            .with_attribute(attr::EVENT_NAME, event.as_bytes().to_vec());
        self.seal(&request)
    }
}
