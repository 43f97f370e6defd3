//! Identification payload and identity model
//!
//! ```text
//! | Next Payload  |C|  RESERVED   |         Payload Length        |
//! |   ID Type     |                 RESERVED                      |
//! ~                   Identification Data                         ~
//! ```
//!
//! The codec starts at the `Payload Length` field. The length covers the
//! full 8-byte fixed part, so the identity data is `length - 8` bytes. The
//! length floor is 9: an identity with no data is rejected.

use super::constants::PayloadType;
use super::payload::{narrow, read_length, PayloadCodec};
use crate::ipsec::{Error, Result};
use bytes::{Buf, BufMut, Bytes};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Identification type (RFC 7296 Section 3.5)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdType {
    /// Single four-octet IPv4 address
    Ipv4Addr,
    /// Fully qualified domain name
    Fqdn,
    /// RFC 822 email address
    Rfc822Addr,
    /// Single sixteen-octet IPv6 address
    Ipv6Addr,
    /// ASN.1 X.500 Distinguished Name
    DerAsn1Dn,
    /// ASN.1 X.509 GeneralName
    DerAsn1Gn,
    /// Opaque octet stream
    KeyId,
    /// Unassigned code, carried through untouched
    Unknown(u8),
}

impl From<u8> for IdType {
    fn from(value: u8) -> Self {
        match value {
            1 => IdType::Ipv4Addr,
            2 => IdType::Fqdn,
            3 => IdType::Rfc822Addr,
            5 => IdType::Ipv6Addr,
            9 => IdType::DerAsn1Dn,
            10 => IdType::DerAsn1Gn,
            11 => IdType::KeyId,
            other => IdType::Unknown(other),
        }
    }
}

impl From<IdType> for u8 {
    fn from(id_type: IdType) -> u8 {
        match id_type {
            IdType::Ipv4Addr => 1,
            IdType::Fqdn => 2,
            IdType::Rfc822Addr => 3,
            IdType::Ipv6Addr => 5,
            IdType::DerAsn1Dn => 9,
            IdType::DerAsn1Gn => 10,
            IdType::KeyId => 11,
            IdType::Unknown(code) => code,
        }
    }
}

impl IdType {
    /// FQDN and RFC 822 identities carry text
    pub fn is_textual(self) -> bool {
        matches!(self, IdType::Fqdn | IdType::Rfc822Addr)
    }
}

/// A typed identity with an opaque payload
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    /// Identity type
    pub id_type: IdType,
    /// Opaque identity data
    pub data: Bytes,
}

impl Identity {
    /// Create identity from type and data
    pub fn new(id_type: IdType, data: impl Into<Bytes>) -> Self {
        Identity {
            id_type,
            data: data.into(),
        }
    }

    /// FQDN identity
    pub fn fqdn(name: &str) -> Self {
        Identity::new(IdType::Fqdn, name.as_bytes().to_vec())
    }

    /// RFC 822 identity
    pub fn email(address: &str) -> Self {
        Identity::new(IdType::Rfc822Addr, address.as_bytes().to_vec())
    }

    /// KEY_ID identity
    pub fn key_id(key_id: &[u8]) -> Self {
        Identity::new(IdType::KeyId, key_id.to_vec())
    }

    /// IPv4 or IPv6 address identity
    pub fn from_ip(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => Identity::new(IdType::Ipv4Addr, v4.octets().to_vec()),
            IpAddr::V6(v6) => Identity::new(IdType::Ipv6Addr, v6.octets().to_vec()),
        }
    }

    /// Data as UTF-8 for textual identity types
    pub fn as_str(&self) -> Option<&str> {
        if self.id_type.is_textual() {
            std::str::from_utf8(&self.data).ok()
        } else {
            None
        }
    }

    /// Address for IP identity types
    pub fn as_ip(&self) -> Option<IpAddr> {
        match self.id_type {
            IdType::Ipv4Addr => <[u8; 4]>::try_from(&self.data[..]).ok().map(IpAddr::from),
            IdType::Ipv6Addr => <[u8; 16]>::try_from(&self.data[..]).ok().map(IpAddr::from),
            _ => None,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(text) = self.as_str() {
            return f.write_str(text);
        }
        if let Some(addr) = self.as_ip() {
            return write!(f, "{}", addr);
        }
        match self.id_type {
            IdType::KeyId => write!(f, "keyid:{}", hex::encode(&self.data)),
            other => write!(f, "id{}:{}", u8::from(other), hex::encode(&self.data)),
        }
    }
}

/// Identification payload (IDi / IDr)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdPayload {
    /// Carried identity
    pub id: Identity,
}

impl IdPayload {
    /// Fixed part: generic header, ID type and 3 reserved bytes
    pub const HEADER_SIZE: usize = 8;

    /// Wrap an identity
    pub fn new(id: Identity) -> Self {
        IdPayload { id }
    }
}

impl PayloadCodec for IdPayload {
    const PAYLOAD_TYPE: PayloadType = PayloadType::IDi;
    const MIN_LENGTH: usize = 9;

    fn parse<B: Buf>(buf: &mut B) -> Result<Self> {
        let length = read_length(buf, Self::MIN_LENGTH)?;
        let id_type = IdType::from(buf.get_u8());
        buf.advance(3);
        let data = buf.copy_to_bytes(length - Self::HEADER_SIZE);
        Ok(IdPayload {
            id: Identity { id_type, data },
        })
    }

    fn serialize<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u16(narrow("identification length", self.length())?);
        buf.put_u8(self.id.id_type.into());
        buf.put_bytes(0, 3);
        buf.put_slice(&self.id.data);
        Ok(())
    }

    fn length(&self) -> usize {
        Self::HEADER_SIZE + self.id.data.len()
    }
}

/// Allowed-identity template of a peer policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdTemplate {
    /// Any identity
    Any,
    /// Exactly this textual identity of the given type
    Exact {
        /// Identity type
        id_type: IdType,
        /// Identity value; hex for binary types
        value: String,
    },
    /// Any identity of the given type
    AnyOfType {
        /// Identity type
        id_type: IdType,
    },
    /// FQDN or RFC 822 identity ending in `suffix` (`*.example.com`,
    /// `*@example.com`)
    Suffix {
        /// Identity type
        id_type: IdType,
        /// Required suffix, without the leading `*`
        suffix: String,
    },
}

impl IdTemplate {
    /// Template matching exactly `id`
    pub fn exact(id: &Identity) -> Self {
        let value = match id.as_str() {
            Some(text) => text.to_string(),
            None => hex::encode(&id.data),
        };
        IdTemplate::Exact {
            id_type: id.id_type,
            value,
        }
    }

    /// Parse a `*.domain` or `*@domain` wildcard
    pub fn wildcard(id_type: IdType, pattern: &str) -> Result<Self> {
        if !id_type.is_textual() {
            return Err(Error::InvalidParameter(format!(
                "Wildcards apply to FQDN and RFC822 identities only, got {:?}",
                id_type
            )));
        }
        let suffix = pattern.strip_prefix('*').ok_or_else(|| {
            Error::InvalidParameter(format!("Wildcard must start with '*': {}", pattern))
        })?;
        Ok(IdTemplate::Suffix {
            id_type,
            suffix: suffix.to_string(),
        })
    }

    /// Check whether `id` satisfies this template
    pub fn matches(&self, id: &Identity) -> bool {
        match self {
            IdTemplate::Any => true,
            IdTemplate::AnyOfType { id_type } => *id_type == id.id_type,
            IdTemplate::Exact { id_type, value } => {
                if *id_type != id.id_type {
                    return false;
                }
                match id.as_str() {
                    Some(text) => text.eq_ignore_ascii_case(value),
                    None => hex::decode(value).map_or(false, |raw| raw == id.data),
                }
            }
            IdTemplate::Suffix { id_type, suffix } => {
                *id_type == id.id_type
                    && id.as_str().map_or(false, |text| {
                        text.len() > suffix.len()
                            && text.to_ascii_lowercase().ends_with(&suffix.to_ascii_lowercase())
                    })
            }
        }
    }
}
