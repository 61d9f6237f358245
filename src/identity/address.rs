//! Self-describing network addresses.
//!
//! An address is a slash-separated list of segments whose first segment
//! names the transport protocol:
//!
//! | transport     | form                          |
//! |---------------|-------------------------------|
//! | radio         | `radio/<device-id>`           |
//! | data channel  | `webrtc/<signaling-id>`       |
//! | socket        | `tcp/<host>/<port>`           |
//! | relay         | `relay/<server-id>/<peer>`    |
//!
//! Parsing is strict so that `parse(s).to_string() == s` for every accepted
//! `s`.

use crate::utils::{MessengerError, NetworkError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transport kinds, ordered by dial priority (first is preferred)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Short-range radio
    Radio,
    /// Peer data channel
    DataChannel,
    /// Direct socket
    Socket,
    /// Relay server
    Relay,
}

impl TransportKind {
    /// Protocol segment used in addresses
    pub fn protocol(&self) -> &'static str {
        match self {
            Self::Radio => "radio",
            Self::DataChannel => "webrtc",
            Self::Socket => "tcp",
            Self::Relay => "relay",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.protocol())
    }
}

/// A parsed network address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Address {
    /// `radio/<device-id>`
    Radio {
        /// Radio device identifier
        device_id: String,
    },
    /// `webrtc/<signaling-id>`
    DataChannel {
        /// Identifier on the signaling channel
        signaling_id: String,
    },
    /// `tcp/<host>/<port>`
    Socket {
        /// IP literal or DNS name
        host: String,
        /// TCP port
        port: u16,
    },
    /// `relay/<server-id>/<peer>`
    Relay {
        /// Relay server identifier
        server_id: String,
        /// Peer's registration name on that server
        peer: String,
    },
}

/// Parse an address string
pub fn parse_address(input: &str) -> Result<Address> {
    input.parse()
}

impl Address {
    /// Transport this address belongs to
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Radio { .. } => TransportKind::Radio,
            Self::DataChannel { .. } => TransportKind::DataChannel,
            Self::Socket { .. } => TransportKind::Socket,
            Self::Relay { .. } => TransportKind::Relay,
        }
    }

    /// `host:port` for socket addresses
    pub fn socket_target(&self) -> Option<String> {
        match self {
            Self::Socket { host, port } if host.contains(':') => Some(format!("[{host}]:{port}")),
            Self::Socket { host, port } => Some(format!("{host}:{port}")),
            _ => None,
        }
    }
}

fn malformed(input: &str, reason: &str) -> MessengerError {
    NetworkError::MalformedAddress {
        address: input.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn segment<'a>(input: &str, value: Option<&'a str>, name: &str) -> Result<&'a str> {
    let value = value.ok_or_else(|| malformed(input, &format!("missing {name}")))?;
    if value.is_empty() || value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(malformed(input, &format!("invalid {name}")));
    }
    Ok(value)
}

impl FromStr for Address {
    type Err = MessengerError;

    fn from_str(input: &str) -> Result<Self> {
        let mut parts = input.split('/');
        let protocol = parts.next().unwrap_or_default();

        let address = match protocol {
            "radio" => Self::Radio {
                device_id: segment(input, parts.next(), "device id")?.to_string(),
            },
            "webrtc" => Self::DataChannel {
                signaling_id: segment(input, parts.next(), "signaling id")?.to_string(),
            },
            "tcp" => {
                let host = segment(input, parts.next(), "host")?.to_string();
                let port_text = segment(input, parts.next(), "port")?;
                if !port_text.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(malformed(input, "port is not a number"));
                }
                if port_text.len() > 1 && port_text.starts_with('0') {
                    return Err(malformed(input, "port has leading zero"));
                }
                let port = port_text
                    .parse::<u16>()
                    .map_err(|_| malformed(input, "port is not a number"))?;
                if port == 0 {
                    return Err(malformed(input, "port 0"));
                }
                Self::Socket { host, port }
            }
            "relay" => Self::Relay {
                server_id: segment(input, parts.next(), "server id")?.to_string(),
                peer: segment(input, parts.next(), "peer")?.to_string(),
            },
            "" => return Err(malformed(input, "empty address")),
            other => return Err(malformed(input, &format!("unknown protocol '{other}'"))),
        };

        if parts.next().is_some() {
            return Err(malformed(input, "trailing segments"));
        }
        Ok(address)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Radio { device_id } => write!(f, "radio/{device_id}"),
            Self::DataChannel { signaling_id } => write!(f, "webrtc/{signaling_id}"),
            Self::Socket { host, port } => write!(f, "tcp/{host}/{port}"),
            Self::Relay { server_id, peer } => write!(f, "relay/{server_id}/{peer}"),
        }
    }
}

impl TryFrom<String> for Address {
    type Error = MessengerError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ErrorKind;

    #[test]
    fn test_roundtrip_identical() {
        for text in [
            "radio/AA:BB:CC:DD",
            "webrtc/peer-42",
            "tcp/192.168.1.20/4001",
            "tcp/::1/4001",
            "tcp/node.example.org/65535",
            "relay/eu-1/ethereum:0xb0b",
        ] {
            let address = parse_address(text).unwrap();
            assert_eq!(address.to_string(), text);
        }
    }

    #[test]
    fn test_malformed() {
        for text in [
            "",
            "radio",
            "radio/",
            "carrier-pigeon/1",
            "tcp/host",
            "tcp/host/port",
            "tcp/host/0",
            "tcp/host/04001",
            "tcp/host/70000",
            "tcp/host/+80",
            "tcp/example.org/-1",
            "relay/server",
            "relay/server/peer/extra",
            "webrtc/has space",
        ] {
            let err = parse_address(text).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::MalformedAddress, "{text}");
        }
    }

    #[test]
    fn test_kind_and_priority() {
        let radio = parse_address("radio/x").unwrap();
        let relay = parse_address("relay/s/p").unwrap();
        assert_eq!(radio.kind(), TransportKind::Radio);
        assert!(radio.kind() < relay.kind());
        assert!(TransportKind::DataChannel < TransportKind::Socket);
    }

    #[test]
    fn test_socket_target() {
        let v4 = parse_address("tcp/10.0.0.1/80").unwrap();
        let v6 = parse_address("tcp/::1/80").unwrap();
        assert_eq!(v4.socket_target().unwrap(), "10.0.0.1:80");
        assert_eq!(v6.socket_target().unwrap(), "[::1]:80");
        assert!(parse_address("radio/x").unwrap().socket_target().is_none());
    }

    #[test]
    fn test_serde_as_string() {
        let address = parse_address("relay/eu-1/bob").unwrap();
        let json = serde_json::to_string(&address).unwrap();
        assert_eq!(json, "\"relay/eu-1/bob\"");
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, address);
    }
}
