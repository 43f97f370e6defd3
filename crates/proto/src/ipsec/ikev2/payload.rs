//! IKEv2 payload codecs
//!
//! Implements the payloads of RFC 7296 Section 3.2 onwards. Every payload
//! shares the same shape: a 4-byte generic header followed by a typed,
//! fixed-size prefix and a variable body.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | Next Payload  |C|  RESERVED   |         Payload Length        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The message decoder consumes `Next Payload` and the critical octet
//! itself. A [`PayloadCodec`] starts at the `Payload Length` field: it
//! reads the length, checks it against its own floor, and then consumes
//! exactly `length - 4` further bytes.

use super::constants::{wire_enum, NotifyType, PayloadType};
use super::id::IdPayload;
use super::proposal::{Proposal, ProtocolId};
use crate::ipsec::{Error, Result};
use bytes::{Buf, BufMut, Bytes};

/// Critical bit in the second octet of the generic header
pub const CRITICAL_FLAG: u8 = 0x80;

/// Generic IKE payload header (4 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    /// Raw next payload type
    pub next_payload: u8,

    /// Critical bit (if set, the receiver must understand this payload)
    pub critical: bool,

    /// Total payload length including this header
    pub length: u16,
}

impl PayloadHeader {
    /// Generic header size
    pub const SIZE: usize = 4;

    /// Read a generic header
    pub fn read<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(Error::BufferTooShort {
                required: Self::SIZE,
                available: buf.remaining(),
            });
        }

        let next_payload = buf.get_u8();
        let critical = buf.get_u8() & CRITICAL_FLAG != 0;
        let length = buf.get_u16();

        if (length as usize) < Self::SIZE {
            return Err(Error::InvalidLength {
                minimum: Self::SIZE,
                actual: length as usize,
            });
        }

        Ok(PayloadHeader {
            next_payload,
            critical,
            length,
        })
    }

    /// Write a generic header
    pub fn write<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.next_payload);
        buf.put_u8(if self.critical { CRITICAL_FLAG } else { 0 });
        buf.put_u16(self.length);
    }

    /// Known next payload type, if any
    pub fn next_payload_type(&self) -> Option<PayloadType> {
        PayloadType::try_from(self.next_payload).ok()
    }
}

/// Read the `Payload Length` field and validate it against `minimum`.
///
/// On success the cursor holds at least `length - 4` more bytes, which
/// is exactly what the payload body occupies.
pub(crate) fn read_length<B: Buf>(buf: &mut B, minimum: usize) -> Result<usize> {
    if buf.remaining() < 2 {
        return Err(Error::BufferTooShort {
            required: 2,
            available: buf.remaining(),
        });
    }

    let length = buf.get_u16() as usize;
    if length < minimum {
        return Err(Error::InvalidLength {
            minimum,
            actual: length,
        });
    }

    let body = length - PayloadHeader::SIZE;
    if buf.remaining() < body {
        return Err(Error::BufferTooShort {
            required: body,
            available: buf.remaining(),
        });
    }

    Ok(length)
}

/// Narrow a length or count to the width of its wire field
pub(crate) fn narrow<T: TryFrom<usize>>(what: &str, value: usize) -> Result<T> {
    T::try_from(value)
        .map_err(|_| Error::InvalidPayload(format!("{} {} overflows its field", what, value)))
}

fn length_field(length: usize) -> Result<u16> {
    narrow("payload length", length)
}

/// Codec contract shared by every payload kind
pub trait PayloadCodec: Sized {
    /// Payload type this codec handles
    const PAYLOAD_TYPE: PayloadType;

    /// Floor for the `Payload Length` field
    const MIN_LENGTH: usize;

    /// Parse starting at the `Payload Length` field
    fn parse<B: Buf>(buf: &mut B) -> Result<Self>;

    /// Serialize starting at the `Payload Length` field
    ///
    /// Fails when a length or count does not fit its field.
    fn serialize<B: BufMut>(&self, buf: &mut B) -> Result<()>;

    /// Value of the `Payload Length` field, generic header included
    fn length(&self) -> usize;

    /// Parse from a slice positioned at the `Payload Length` field
    fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cursor = data;
        Self::parse(&mut cursor)
    }

    /// Serialize to a fresh buffer, starting at the `Payload Length` field
    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.length() - 2);
        self.serialize(&mut out)?;
        Ok(out)
    }

    /// Decode a complete payload, generic header included
    fn decode(data: &[u8]) -> Result<(PayloadHeader, Self)> {
        let mut cursor = data;
        if cursor.remaining() < PayloadHeader::SIZE {
            return Err(Error::BufferTooShort {
                required: PayloadHeader::SIZE,
                available: cursor.remaining(),
            });
        }
        let next_payload = cursor.get_u8();
        let critical = cursor.get_u8() & CRITICAL_FLAG != 0;
        let payload = Self::parse(&mut cursor)?;

        Ok((
            PayloadHeader {
                next_payload,
                critical,
                length: length_field(payload.length())?,
            },
            payload,
        ))
    }

    /// Encode a complete payload, generic header included
    fn encode(&self, next_payload: u8) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.length());
        out.put_u8(next_payload);
        out.put_u8(0);
        self.serialize(&mut out)?;
        Ok(out)
    }
}

/// Nonce Payload (RFC 7296 Section 3.9)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoncePayload {
    /// Nonce data
    pub nonce: Bytes,
}

impl NoncePayload {
    /// Minimum nonce size
    pub const MIN_NONCE_SIZE: usize = 16;

    /// Maximum nonce size
    pub const MAX_NONCE_SIZE: usize = 256;

    /// Create nonce payload, validating its size
    pub fn new(nonce: impl Into<Bytes>) -> Result<Self> {
        let nonce = nonce.into();
        if nonce.len() < Self::MIN_NONCE_SIZE || nonce.len() > Self::MAX_NONCE_SIZE {
            return Err(Error::InvalidPayload(format!(
                "Nonce size {} outside {}..={}",
                nonce.len(),
                Self::MIN_NONCE_SIZE,
                Self::MAX_NONCE_SIZE
            )));
        }
        Ok(NoncePayload { nonce })
    }
}

impl PayloadCodec for NoncePayload {
    const PAYLOAD_TYPE: PayloadType = PayloadType::Nonce;
    const MIN_LENGTH: usize = PayloadHeader::SIZE + Self::MIN_NONCE_SIZE;

    fn parse<B: Buf>(buf: &mut B) -> Result<Self> {
        let length = read_length(buf, Self::MIN_LENGTH)?;
        if length > PayloadHeader::SIZE + Self::MAX_NONCE_SIZE {
            return Err(Error::InvalidPayload(format!(
                "Nonce payload length {} too large",
                length
            )));
        }
        Ok(NoncePayload {
            nonce: buf.copy_to_bytes(length - PayloadHeader::SIZE),
        })
    }

    fn serialize<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u16(length_field(self.length())?);
        buf.put_slice(&self.nonce);
        Ok(())
    }

    fn length(&self) -> usize {
        PayloadHeader::SIZE + self.nonce.len()
    }
}

/// Key Exchange Payload (RFC 7296 Section 3.4)
///
/// ```text
/// |   Diffie-Hellman Group Num    |           RESERVED            |
/// ~                       Key Exchange Data                       ~
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KePayload {
    /// Diffie-Hellman group number
    pub dh_group: u16,

    /// Public key exchange value
    pub key_data: Bytes,
}

impl KePayload {
    /// Create key exchange payload
    pub fn new(dh_group: u16, key_data: impl Into<Bytes>) -> Self {
        KePayload {
            dh_group,
            key_data: key_data.into(),
        }
    }
}

impl PayloadCodec for KePayload {
    const PAYLOAD_TYPE: PayloadType = PayloadType::KE;
    const MIN_LENGTH: usize = 8;

    fn parse<B: Buf>(buf: &mut B) -> Result<Self> {
        let length = read_length(buf, Self::MIN_LENGTH)?;
        let dh_group = buf.get_u16();
        buf.advance(2);
        Ok(KePayload {
            dh_group,
            key_data: buf.copy_to_bytes(length - Self::MIN_LENGTH),
        })
    }

    fn serialize<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u16(length_field(self.length())?);
        buf.put_u16(self.dh_group);
        buf.put_u16(0);
        buf.put_slice(&self.key_data);
        Ok(())
    }

    fn length(&self) -> usize {
        Self::MIN_LENGTH + self.key_data.len()
    }
}

wire_enum! {
    /// Authentication Method (RFC 7296 Section 3.8)
    pub enum AuthMethod: u8 {
        /// RSA Digital Signature
        RsaSig = 1,
        /// Shared Key Message Integrity Code
        SharedKeyMic = 2,
        /// DSS Digital Signature
        DssSig = 3,
        /// Generic Digital Signature (RFC 7427)
        DigitalSignature = 14,
    }
}

/// Authentication Payload (RFC 7296 Section 3.8)
///
/// ```text
/// | Auth Method   |                RESERVED                       |
/// ~                      Authentication Data                      ~
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPayload {
    /// Authentication method
    pub method: AuthMethod,

    /// Authentication data
    pub data: Bytes,
}

impl AuthPayload {
    /// Create authentication payload
    pub fn new(method: AuthMethod, data: impl Into<Bytes>) -> Self {
        AuthPayload {
            method,
            data: data.into(),
        }
    }
}

impl PayloadCodec for AuthPayload {
    const PAYLOAD_TYPE: PayloadType = PayloadType::AUTH;
    const MIN_LENGTH: usize = 8;

    fn parse<B: Buf>(buf: &mut B) -> Result<Self> {
        let length = read_length(buf, Self::MIN_LENGTH)?;
        let method = AuthMethod::try_from(buf.get_u8())?;
        buf.advance(3);
        Ok(AuthPayload {
            method,
            data: buf.copy_to_bytes(length - Self::MIN_LENGTH),
        })
    }

    fn serialize<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u16(length_field(self.length())?);
        buf.put_u8(self.method.into());
        buf.put_bytes(0, 3);
        buf.put_slice(&self.data);
        Ok(())
    }

    fn length(&self) -> usize {
        Self::MIN_LENGTH + self.data.len()
    }
}

/// Notify Payload (RFC 7296 Section 3.10)
///
/// ```text
/// |  Protocol ID  |   SPI Size    |      Notify Message Type      |
/// ~                Security Parameter Index (SPI)                 ~
/// ~                       Notification Data                       ~
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyPayload {
    /// Protocol ID (0 when no SA is concerned)
    pub protocol_id: u8,

    /// Notify message type
    pub notify_type: NotifyType,

    /// SPI of the concerned SA, may be empty
    pub spi: Bytes,

    /// Notification data
    pub data: Bytes,
}

impl NotifyPayload {
    /// Create a notification not tied to an SA
    pub fn new(notify_type: NotifyType, data: impl Into<Bytes>) -> Self {
        NotifyPayload {
            protocol_id: 0,
            notify_type,
            spi: Bytes::new(),
            data: data.into(),
        }
    }

    /// Create a COOKIE notification
    pub fn cookie(cookie: impl Into<Bytes>) -> Self {
        NotifyPayload::new(NotifyType::COOKIE, cookie)
    }

    /// Attach the SPI of the concerned SA
    pub fn with_spi(mut self, protocol: ProtocolId, spi: impl Into<Bytes>) -> Self {
        self.protocol_id = protocol.into();
        self.spi = spi.into();
        self
    }
}

impl PayloadCodec for NotifyPayload {
    const PAYLOAD_TYPE: PayloadType = PayloadType::N;
    const MIN_LENGTH: usize = 8;

    fn parse<B: Buf>(buf: &mut B) -> Result<Self> {
        let length = read_length(buf, Self::MIN_LENGTH)?;
        let protocol_id = buf.get_u8();
        let spi_size = buf.get_u8() as usize;
        let notify_type = NotifyType(buf.get_u16());

        let variable = length - Self::MIN_LENGTH;
        if spi_size > variable {
            return Err(Error::InvalidPayload(format!(
                "Notify SPI size {} exceeds payload body {}",
                spi_size, variable
            )));
        }

        let spi = buf.copy_to_bytes(spi_size);
        let data = buf.copy_to_bytes(variable - spi_size);
        Ok(NotifyPayload {
            protocol_id,
            notify_type,
            spi,
            data,
        })
    }

    fn serialize<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u16(length_field(self.length())?);
        buf.put_u8(self.protocol_id);
        buf.put_u8(narrow("notify SPI size", self.spi.len())?);
        buf.put_u16(self.notify_type.0);
        buf.put_slice(&self.spi);
        buf.put_slice(&self.data);
        Ok(())
    }

    fn length(&self) -> usize {
        Self::MIN_LENGTH + self.spi.len() + self.data.len()
    }
}

/// Delete Payload (RFC 7296 Section 3.11)
///
/// ```text
/// | Protocol ID   |   SPI Size    |          Num of SPIs          |
/// ~               Security Parameter Index(es) (SPI)              ~
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePayload {
    /// Protocol of the deleted SAs
    pub protocol_id: ProtocolId,

    /// Size of each SPI
    pub spi_size: u8,

    /// Deleted SPIs
    pub spis: Vec<Bytes>,
}

impl DeletePayload {
    /// Delete the IKE SA carrying this payload
    pub fn ike() -> Self {
        DeletePayload {
            protocol_id: ProtocolId::Ike,
            spi_size: 0,
            spis: Vec::new(),
        }
    }

    /// Delete Child SAs by their 4-byte SPIs
    pub fn child(protocol_id: ProtocolId, spis: &[u32]) -> Self {
        DeletePayload {
            protocol_id,
            spi_size: 4,
            spis: spis
                .iter()
                .map(|spi| Bytes::copy_from_slice(&spi.to_be_bytes()))
                .collect(),
        }
    }

    /// 4-byte SPIs as integers (Child SA deletions)
    pub fn child_spis(&self) -> Vec<u32> {
        if self.spi_size != 4 {
            return Vec::new();
        }
        self.spis
            .iter()
            .map(|spi| u32::from_be_bytes([spi[0], spi[1], spi[2], spi[3]]))
            .collect()
    }
}

impl PayloadCodec for DeletePayload {
    const PAYLOAD_TYPE: PayloadType = PayloadType::D;
    const MIN_LENGTH: usize = 8;

    fn parse<B: Buf>(buf: &mut B) -> Result<Self> {
        let length = read_length(buf, Self::MIN_LENGTH)?;
        let protocol_id = ProtocolId::try_from(buf.get_u8())?;
        let spi_size = buf.get_u8();
        let count = buf.get_u16() as usize;

        let variable = length - Self::MIN_LENGTH;
        if spi_size as usize * count != variable {
            return Err(Error::InvalidPayload(format!(
                "Delete payload carries {} SPI bytes, expected {} x {}",
                variable, count, spi_size
            )));
        }

        let spis = (0..count)
            .map(|_| buf.copy_to_bytes(spi_size as usize))
            .collect();
        Ok(DeletePayload {
            protocol_id,
            spi_size,
            spis,
        })
    }

    fn serialize<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u16(length_field(self.length())?);
        buf.put_u8(self.protocol_id.into());
        buf.put_u8(self.spi_size);
        buf.put_u16(narrow("delete SPI count", self.spis.len())?);
        for spi in &self.spis {
            buf.put_slice(spi);
        }
        Ok(())
    }

    fn length(&self) -> usize {
        Self::MIN_LENGTH + self.spis.iter().map(Bytes::len).sum::<usize>()
    }
}

/// Vendor ID Payload (RFC 7296 Section 3.12)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorPayload {
    /// Opaque vendor identifier
    pub vendor_id: Bytes,
}

impl PayloadCodec for VendorPayload {
    const PAYLOAD_TYPE: PayloadType = PayloadType::V;
    const MIN_LENGTH: usize = PayloadHeader::SIZE;

    fn parse<B: Buf>(buf: &mut B) -> Result<Self> {
        let length = read_length(buf, Self::MIN_LENGTH)?;
        Ok(VendorPayload {
            vendor_id: buf.copy_to_bytes(length - PayloadHeader::SIZE),
        })
    }

    fn serialize<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u16(length_field(self.length())?);
        buf.put_slice(&self.vendor_id);
        Ok(())
    }

    fn length(&self) -> usize {
        PayloadHeader::SIZE + self.vendor_id.len()
    }
}

/// Security Association Payload (RFC 7296 Section 3.3)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaPayload {
    /// Offered or selected proposals
    pub proposals: Vec<Proposal>,
}

impl SaPayload {
    /// Create SA payload
    pub fn new(proposals: Vec<Proposal>) -> Self {
        SaPayload { proposals }
    }
}

impl PayloadCodec for SaPayload {
    const PAYLOAD_TYPE: PayloadType = PayloadType::SA;
    const MIN_LENGTH: usize = PayloadHeader::SIZE;

    fn parse<B: Buf>(buf: &mut B) -> Result<Self> {
        let length = read_length(buf, Self::MIN_LENGTH)?;
        let mut body = buf.copy_to_bytes(length - PayloadHeader::SIZE);

        let mut proposals = Vec::new();
        while body.has_remaining() {
            let (proposal, is_last) = Proposal::read(&mut body)?;
            proposals.push(proposal);
            if is_last && body.has_remaining() {
                return Err(Error::InvalidPayload(
                    "Data after last proposal in SA payload".to_string(),
                ));
            }
        }
        Ok(SaPayload { proposals })
    }

    fn serialize<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u16(length_field(self.length())?);
        let count = self.proposals.len();
        for (i, proposal) in self.proposals.iter().enumerate() {
            proposal.write(buf, i + 1 == count)?;
        }
        Ok(())
    }

    fn length(&self) -> usize {
        PayloadHeader::SIZE
            + self
                .proposals
                .iter()
                .map(Proposal::encoded_len)
                .sum::<usize>()
    }
}

/// Encrypted and Authenticated payload (RFC 7296 Section 3.14)
///
/// Always the last payload of a message. Its generic header's
/// `Next Payload` names the first payload inside the ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    /// Type of the first inner payload
    pub first_inner: u8,

    /// IV, ciphertext and integrity checksum
    pub data: Bytes,
}

/// A decoded payload of an IKE message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IkePayload {
    /// Security Association
    Sa(SaPayload),
    /// Key Exchange
    Ke(KePayload),
    /// Identification - Initiator
    IdI(IdPayload),
    /// Identification - Responder
    IdR(IdPayload),
    /// Authentication
    Auth(AuthPayload),
    /// Nonce
    Nonce(NoncePayload),
    /// Notify
    Notify(NotifyPayload),
    /// Delete
    Delete(DeletePayload),
    /// Vendor ID
    Vendor(VendorPayload),
    /// Encrypted and Authenticated
    Encrypted(EncryptedPayload),
    /// Payload without a codec here, kept verbatim
    Raw {
        /// Raw payload type
        payload_type: u8,
        /// Critical bit as received
        critical: bool,
        /// Body after the generic header
        data: Bytes,
    },
}

impl IkePayload {
    /// Raw payload type of this payload
    pub fn payload_type(&self) -> u8 {
        let known = match self {
            IkePayload::Sa(_) => PayloadType::SA,
            IkePayload::Ke(_) => PayloadType::KE,
            IkePayload::IdI(_) => PayloadType::IDi,
            IkePayload::IdR(_) => PayloadType::IDr,
            IkePayload::Auth(_) => PayloadType::AUTH,
            IkePayload::Nonce(_) => PayloadType::Nonce,
            IkePayload::Notify(_) => PayloadType::N,
            IkePayload::Delete(_) => PayloadType::D,
            IkePayload::Vendor(_) => PayloadType::V,
            IkePayload::Encrypted(_) => PayloadType::SK,
            IkePayload::Raw { payload_type, .. } => return *payload_type,
        };
        known.into()
    }

    /// Value of the `Payload Length` field
    pub fn length(&self) -> usize {
        match self {
            IkePayload::Sa(p) => p.length(),
            IkePayload::Ke(p) => p.length(),
            IkePayload::IdI(p) | IkePayload::IdR(p) => p.length(),
            IkePayload::Auth(p) => p.length(),
            IkePayload::Nonce(p) => p.length(),
            IkePayload::Notify(p) => p.length(),
            IkePayload::Delete(p) => p.length(),
            IkePayload::Vendor(p) => p.length(),
            IkePayload::Encrypted(p) => PayloadHeader::SIZE + p.data.len(),
            IkePayload::Raw { data, .. } => PayloadHeader::SIZE + data.len(),
        }
    }

    /// Parse one payload body whose type and critical bit were read from
    /// the preceding header. The cursor sits on the `Payload Length` field.
    ///
    /// Unknown payloads are kept verbatim unless critical, in which case
    /// the whole message must be rejected.
    pub fn read<B: Buf>(payload_type: u8, critical: bool, buf: &mut B) -> Result<Self> {
        let known = PayloadType::try_from(payload_type).ok();
        Ok(match known {
            Some(PayloadType::SA) => IkePayload::Sa(SaPayload::parse(buf)?),
            Some(PayloadType::KE) => IkePayload::Ke(KePayload::parse(buf)?),
            Some(PayloadType::IDi) => IkePayload::IdI(IdPayload::parse(buf)?),
            Some(PayloadType::IDr) => IkePayload::IdR(IdPayload::parse(buf)?),
            Some(PayloadType::AUTH) => IkePayload::Auth(AuthPayload::parse(buf)?),
            Some(PayloadType::Nonce) => IkePayload::Nonce(NoncePayload::parse(buf)?),
            Some(PayloadType::N) => IkePayload::Notify(NotifyPayload::parse(buf)?),
            Some(PayloadType::D) => IkePayload::Delete(DeletePayload::parse(buf)?),
            Some(PayloadType::V) => IkePayload::Vendor(VendorPayload::parse(buf)?),
            None if critical => {
                return Err(Error::InvalidMessage(format!(
                    "Unsupported critical payload: {}",
                    payload_type
                )))
            }
            _ => {
                let length = read_length(buf, PayloadHeader::SIZE)?;
                IkePayload::Raw {
                    payload_type,
                    critical,
                    data: buf.copy_to_bytes(length - PayloadHeader::SIZE),
                }
            }
        })
    }

    /// Write the full payload, generic header included
    ///
    /// An Encrypted payload writes its first inner type instead of
    /// `next_payload`.
    pub fn write<B: BufMut>(&self, next_payload: u8, buf: &mut B) -> Result<()> {
        match self {
            IkePayload::Encrypted(p) => buf.put_u8(p.first_inner),
            _ => buf.put_u8(next_payload),
        }
        let critical = matches!(self, IkePayload::Raw { critical: true, .. });
        buf.put_u8(if critical { CRITICAL_FLAG } else { 0 });

        match self {
            IkePayload::Sa(p) => p.serialize(buf),
            IkePayload::Ke(p) => p.serialize(buf),
            IkePayload::IdI(p) | IkePayload::IdR(p) => p.serialize(buf),
            IkePayload::Auth(p) => p.serialize(buf),
            IkePayload::Nonce(p) => p.serialize(buf),
            IkePayload::Notify(p) => p.serialize(buf),
            IkePayload::Delete(p) => p.serialize(buf),
            IkePayload::Vendor(p) => p.serialize(buf),
            IkePayload::Encrypted(EncryptedPayload { data, .. }) | IkePayload::Raw { data, .. } => {
                buf.put_u16(length_field(PayloadHeader::SIZE + data.len())?);
                buf.put_slice(data);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::ikev2::proposal::{EncrTransformId, Transform};

    #[test]
    fn test_payload_header() {
        let header = PayloadHeader {
            next_payload: PayloadType::Nonce.into(),
            critical: true,
            length: 36,
        };
        let mut bytes = Vec::new();
        header.write(&mut bytes);
        assert_eq!(bytes, vec![40, 0x80, 0, 36]);

        let parsed = PayloadHeader::read(&mut bytes.as_slice()).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.next_payload_type(), Some(PayloadType::Nonce));
    }

    #[test]
    fn test_payload_header_length_below_floor() {
        let result = PayloadHeader::read(&mut &[0u8, 0, 0, 3][..]);
        assert!(matches!(
            result,
            Err(Error::InvalidLength {
                minimum: 4,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_nonce_payload() {
        let nonce = NoncePayload::new(vec![1u8; 32]).unwrap();
        assert_eq!(nonce.length(), 36);

        let bytes = nonce.to_bytes().unwrap();
        assert_eq!(&bytes[0..2], &36u16.to_be_bytes());
        assert_eq!(NoncePayload::from_bytes(&bytes).unwrap(), nonce);
    }

    #[test]
    fn test_nonce_size_limits() {
        assert!(NoncePayload::new(vec![1u8; 10]).is_err());
        assert!(NoncePayload::new(vec![1u8; 300]).is_err());

        // Length field of 4 + 15 is under the floor
        let mut bytes = vec![0u8, 19];
        bytes.extend_from_slice(&[0u8; 15]);
        assert!(matches!(
            NoncePayload::from_bytes(&bytes),
            Err(Error::InvalidLength { .. })
        ));
    }

    #[test]
    fn test_ke_payload_layout() {
        let ke = KePayload::new(31, vec![0xAA; 32]);
        let bytes = ke.to_bytes().unwrap();

        assert_eq!(ke.length(), 40);
        assert_eq!(&bytes[0..2], &40u16.to_be_bytes());
        assert_eq!(&bytes[2..4], &31u16.to_be_bytes());
        assert_eq!(&bytes[4..6], &[0, 0]);
        assert_eq!(KePayload::from_bytes(&bytes).unwrap(), ke);
    }

    #[test]
    fn test_ke_truncated() {
        let mut bytes = KePayload::new(14, vec![0xBB; 256]).to_bytes().unwrap();
        bytes.truncate(100);
        assert!(matches!(
            KePayload::from_bytes(&bytes),
            Err(Error::BufferTooShort { .. })
        ));
    }

    #[test]
    fn test_auth_payload() {
        let auth = AuthPayload::new(AuthMethod::SharedKeyMic, vec![0x42; 32]);
        let bytes = auth.to_bytes().unwrap();
        assert_eq!(bytes[2], 2);
        assert_eq!(&bytes[3..6], &[0, 0, 0]);
        assert_eq!(AuthPayload::from_bytes(&bytes).unwrap(), auth);

        let mut unknown = bytes.clone();
        unknown[2] = 200;
        assert!(AuthPayload::from_bytes(&unknown).is_err());
    }

    #[test]
    fn test_notify_with_spi() {
        let notify = NotifyPayload::new(NotifyType::REKEY_SA, Vec::new())
            .with_spi(ProtocolId::Esp, vec![0, 0, 0x10, 0x01]);
        let bytes = notify.to_bytes().unwrap();

        assert_eq!(notify.length(), 12);
        assert_eq!(bytes[2], u8::from(ProtocolId::Esp));
        assert_eq!(bytes[3], 4);
        assert_eq!(NotifyPayload::from_bytes(&bytes).unwrap(), notify);
    }

    #[test]
    fn test_notify_spi_size_overflow() {
        // SPI size 8 but only 2 bytes of body
        let bytes = [0u8, 10, 3, 8, 0x40, 0x06, 1, 2];
        assert!(matches!(
            NotifyPayload::from_bytes(&bytes),
            Err(Error::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_delete_payload() {
        let delete = DeletePayload::child(ProtocolId::Esp, &[0x1001, 0x1002]);
        let bytes = delete.to_bytes().unwrap();
        assert_eq!(delete.length(), 16);

        let parsed = DeletePayload::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.child_spis(), vec![0x1001, 0x1002]);

        let ike = DeletePayload::ike();
        assert_eq!(DeletePayload::from_bytes(&ike.to_bytes().unwrap()).unwrap(), ike);
    }

    #[test]
    fn test_delete_spi_count_mismatch() {
        let mut bytes = DeletePayload::child(ProtocolId::Esp, &[1, 2]).to_bytes().unwrap();
        // Claim three SPIs
        bytes[4..6].copy_from_slice(&3u16.to_be_bytes());
        assert!(matches!(
            DeletePayload::from_bytes(&bytes),
            Err(Error::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_sa_payload() {
        let sa = SaPayload::new(vec![
            Proposal::new(1, ProtocolId::Ike)
                .add_transform(Transform::encr_with_key_len(EncrTransformId::AesCbc, 128)),
            Proposal::new(2, ProtocolId::Ike)
                .add_transform(Transform::encr_with_key_len(EncrTransformId::AesCbc, 256)),
        ]);
        let bytes = sa.to_bytes().unwrap();
        assert_eq!(bytes.len() + 2, sa.length());

        let parsed = SaPayload::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, sa);
    }

    #[test]
    fn test_full_payload_encode_decode() {
        let vendor = VendorPayload {
            vendor_id: Bytes::from_static(b"ike-proto"),
        };
        let wire = vendor.encode(PayloadType::None.into()).unwrap();
        assert_eq!(wire.len(), vendor.length());

        let (header, parsed) = VendorPayload::decode(&wire).unwrap();
        assert_eq!(header.length as usize, wire.len());
        assert!(!header.critical);
        assert_eq!(parsed, vendor);
    }

    #[test]
    fn test_unknown_payload_kept_raw() {
        let bytes = [0u8, 7, 0xDE, 0xAD, 0xBE];
        let payload = IkePayload::read(200, false, &mut &bytes[..]).unwrap();
        assert_eq!(
            payload,
            IkePayload::Raw {
                payload_type: 200,
                critical: false,
                data: Bytes::from_static(&[0xDE, 0xAD, 0xBE]),
            }
        );

        let mut out = Vec::new();
        payload.write(0, &mut out).unwrap();
        assert_eq!(&out[2..], &bytes[..]);
    }

    #[test]
    fn test_unknown_critical_payload_rejected() {
        let bytes = [0u8, 4];
        assert!(matches!(
            IkePayload::read(200, true, &mut &bytes[..]),
            Err(Error::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_oversized_fields_fail_to_serialize() {
        let notify = NotifyPayload::new(NotifyType::REKEY_SA, Vec::new())
            .with_spi(ProtocolId::Esp, vec![0u8; 256]);
        assert!(matches!(notify.to_bytes(), Err(Error::InvalidPayload(_))));

        let vendor = VendorPayload {
            vendor_id: Bytes::from(vec![0u8; 70_000]),
        };
        assert!(matches!(
            vendor.encode(PayloadType::None.into()),
            Err(Error::InvalidPayload(_))
        ));

        let raw = IkePayload::Raw {
            payload_type: 200,
            critical: false,
            data: Bytes::from(vec![0u8; u16::MAX as usize]),
        };
        assert!(raw.write(0, &mut Vec::new()).is_err());
    }
}
