//! Protocol constants: method codes, attribute types and error codes.
//!
//! The RFC 5389 subset comes first in each group, LyncNat additions after.

/// Method codes (12 bits, before interleaving into the message type).
pub mod method {
    /// RFC 5389 binding; also carries start/end session and registration.
    pub const BINDING: u16 = 0x001;
    /// Remote log line.
    pub const LOG: u16 = 0x00A;
    /// Relay-to-device: device has no NAT in front of it.
    pub const NO_NAT: u16 = 0xAAA;
    /// Status snapshot request.
    pub const STATUS_REQUEST: u16 = 0xAEE;
    /// Rename a device.
    pub const CHANGE_NAME: u16 = 0xCAE;
    /// Liveness heartbeat.
    pub const KEEPALIVE: u16 = 0xEEA;
    /// Ping.
    pub const PING: u16 = 0xEE0;
    /// Reset request.
    pub const RESET: u16 = 0xEE1;
    /// Subscribe to an event feed.
    pub const SUBSCRIBE: u16 = 0xEE2;
    /// Unsubscribe from an event feed.
    pub const UNSUBSCRIBE: u16 = 0xEE3;
    /// Device-originated event.
    pub const EVENT: u16 = 0xEE4;
    /// Notification. Shares its code with [`ACTION`].
    pub const NOTIFICATION: u16 = 0xEE5;
    /// Action invocation.
    ///
    /// Identical to [`NOTIFICATION`] in the protocol tables. The relay relies
    /// on this value, so it is kept even though it looks like a clash.
    pub const ACTION: u16 = 0xEE5;
    /// Free-form command.
    pub const CUSTOM_COMMAND: u16 = 0xEE6;
    /// Delete a device.
    pub const DELETE: u16 = 0xEEE;

    /// Human-readable name for logs.
    pub fn name(method: u16) -> &'static str {
        match method {
            BINDING => "binding",
            LOG => "log",
            NO_NAT => "no-nat",
            STATUS_REQUEST => "status-request",
            CHANGE_NAME => "change-name",
            KEEPALIVE => "keepalive",
            PING => "ping",
            RESET => "reset",
            SUBSCRIBE => "subscribe",
            UNSUBSCRIBE => "unsubscribe",
            EVENT => "event",
            ACTION => "action",
            CUSTOM_COMMAND => "custom-command",
            DELETE => "delete",
            _ => "unknown",
        }
    }
}

/// Attribute type codes.
pub mod attr {
    pub const MAPPED_ADDRESS: u16 = 0x0001;
    pub const USERNAME: u16 = 0x0006;
    pub const MESSAGE_INTEGRITY: u16 = 0x0008;
    pub const ERROR_CODE: u16 = 0x0009;
    pub const UNKNOWN_ATTRIBUTES: u16 = 0x000A;
    pub const REALM: u16 = 0x0014;
    pub const NONCE: u16 = 0x0015;
    pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
    pub const SOFTWARE: u16 = 0x8022;
    pub const ALTERNATE_SERVER: u16 = 0x8023;
    pub const FINGERPRINT: u16 = 0x8028;

    pub const TIMESTAMP: u16 = 0x0C01;
    pub const BEGIN_SESSION: u16 = 0x0C02;
    /// 16 raw bytes of the device UUID.
    pub const DEVICE_ID: u16 = 0x0C03;
    pub const DEVICE_ID_CALLEE: u16 = 0x0C04;
    pub const DEVICE_ID_CALLER: u16 = 0x0C05;
    pub const NEW_NAME: u16 = 0x0C06;
    pub const NAME: u16 = 0x0C12;
    pub const SERVER_TIME: u16 = 0x0C13;
    pub const EXPIRATION_POLICY: u16 = 0x0C14;
    pub const LOG_MESSAGE: u16 = 0x0C15;
    pub const ERROR_LEVEL: u16 = 0x0C16;
    pub const EVENT_NAME: u16 = 0x0C17;
    pub const PAYLOAD: u16 = 0x0C18;
    pub const ARGUMENTS: u16 = 0x0C19;

    /// Human-readable name for logs.
    pub fn name(code: u16) -> &'static str {
        match code {
            MAPPED_ADDRESS => "MAPPED-ADDRESS",
            USERNAME => "USERNAME",
            MESSAGE_INTEGRITY => "MESSAGE-INTEGRITY",
            ERROR_CODE => "ERROR-CODE",
            UNKNOWN_ATTRIBUTES => "UNKNOWN-ATTRIBUTES",
            REALM => "REALM",
            NONCE => "NONCE",
            XOR_MAPPED_ADDRESS => "XOR-MAPPED-ADDRESS",
            SOFTWARE => "SOFTWARE",
            ALTERNATE_SERVER => "ALTERNATE-SERVER",
            FINGERPRINT => "FINGERPRINT",
            TIMESTAMP => "TIMESTAMP",
            BEGIN_SESSION => "BEGIN-SESSION",
            DEVICE_ID => "DEVICE-ID",
            DEVICE_ID_CALLEE => "DEVICE-ID-CALLEE",
            DEVICE_ID_CALLER => "DEVICE-ID-CALLER",
            NEW_NAME => "NEW-NAME",
            NAME => "NAME",
            SERVER_TIME => "SERVER-TIME",
            EXPIRATION_POLICY => "EXPIRATION-POLICY",
            LOG_MESSAGE => "LOG-MESSAGE",
            ERROR_LEVEL => "ERROR-LEVEL",
            EVENT_NAME => "EVENT-NAME",
            PAYLOAD => "PAYLOAD",
            ARGUMENTS => "ARGUMENTS",
            _ => "UNKNOWN",
        }
    }
}

/// ERROR-CODE values.
pub mod error_code {
    pub const TRY_ALTERNATE: u16 = 300;
    pub const BAD_REQUEST: u16 = 400;
    pub const UNAUTHORIZED: u16 = 401;
    /// Device UUID unknown to the relay.
    pub const UNKNOWN_DEVICE: u16 = 404;
    pub const UNKNOWN_ATTRIBUTE: u16 = 420;
    pub const STALE_NONCE: u16 = 438;
    pub const SERVER_ERROR: u16 = 500;

    pub const INVALID_NAME: u16 = 600;
    pub const OUT_OF_MEMORY: u16 = 601;
    pub const BAD_FILE: u16 = 602;
    pub const INSTALL_FAILED: u16 = 603;
    pub const NOT_AVAILABLE: u16 = 604;
    pub const BAD_TIMESTAMP: u16 = 605;
    pub const DEVICE_QUOTA_EXCEEDED: u16 = 606;
    pub const DUPLICATE_UUID: u16 = 607;
}

/// BEGIN-SESSION attribute values.
pub mod begin_session {
    pub const END: u8 = 0x00;
    pub const START: u8 = 0x01;
    pub const REGISTER: u8 = 0x02;
}

/// Seconds a relay-issued message stays valid.
pub const DEFAULT_EXPIRATION_SECS: u32 = 60;
