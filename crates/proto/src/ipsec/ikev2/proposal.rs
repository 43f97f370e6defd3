//! SA payload contents: proposals, transforms and their negotiation
//!
//! ```text
//! SA Payload
//!   └── Proposal(s)
//!         └── Transform(s)
//!               └── Attribute(s)
//! ```
//!
//! An offer lists alternatives per transform type; the answer carries
//! exactly one transform of every type the offer named (RFC 7296
//! Section 2.7).

use super::constants::wire_enum;
use super::payload::narrow;
use crate::ipsec::{Error, Result};
use bytes::{Buf, BufMut};

wire_enum! {
    /// Transform Type (RFC 7296 Section 3.3.2)
    pub enum TransformType: u8 {
        /// Encryption Algorithm (ENCR)
        Encr = 1,
        /// Pseudo-random Function (PRF)
        Prf = 2,
        /// Integrity Algorithm (INTEG)
        Integ = 3,
        /// Diffie-Hellman Group (D-H)
        Dh = 4,
        /// Extended Sequence Numbers (ESN)
        Esn = 5,
    }
}

wire_enum! {
    /// ENCR transform IDs
    pub enum EncrTransformId: u16 {
        /// AES-CBC, key length carried in the Key Length attribute
        AesCbc = 12,
        /// AES-CTR
        AesCtr = 13,
        /// AES-GCM with 16-byte ICV
        AesGcm16 = 20,
        /// ChaCha20-Poly1305
        ChaCha20Poly1305 = 28,
    }
}

impl EncrTransformId {
    /// Combined-mode ciphers need no separate INTEG transform
    pub fn is_aead(self) -> bool {
        matches!(self, EncrTransformId::AesGcm16 | EncrTransformId::ChaCha20Poly1305)
    }
}

wire_enum! {
    /// PRF transform IDs
    pub enum PrfTransformId: u16 {
        /// HMAC-SHA2-256
        HmacSha256 = 5,
        /// HMAC-SHA2-384
        HmacSha384 = 6,
        /// HMAC-SHA2-512
        HmacSha512 = 7,
    }
}

wire_enum! {
    /// INTEG transform IDs
    pub enum IntegTransformId: u16 {
        /// HMAC-SHA2-256-128
        HmacSha256_128 = 12,
        /// HMAC-SHA2-384-192
        HmacSha384_192 = 13,
        /// HMAC-SHA2-512-256
        HmacSha512_256 = 14,
    }
}

wire_enum! {
    /// D-H group transform IDs
    pub enum DhTransformId: u16 {
        /// 2048-bit MODP
        Group14 = 14,
        /// 3072-bit MODP
        Group15 = 15,
        /// 256-bit random ECP
        Group19 = 19,
        /// Curve25519
        Group31 = 31,
    }
}

/// ESN transform ID meaning "no extended sequence numbers"
const ESN_NONE: u16 = 0;

const ATTR_KEY_LENGTH: u16 = 14;
const ATTR_FORMAT_TV: u16 = 0x8000;

/// Transform attribute (RFC 7296 Section 3.3.5)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformAttribute {
    /// Type/Value form, AF bit set (Key Length uses this)
    Short {
        /// Attribute type without the AF bit
        attr_type: u16,
        /// Attribute value
        value: u16,
    },
    /// Type/Length/Value form
    Long {
        /// Attribute type
        attr_type: u16,
        /// Attribute value
        value: Vec<u8>,
    },
}

impl TransformAttribute {
    fn encoded_len(&self) -> usize {
        match self {
            TransformAttribute::Short { .. } => 4,
            TransformAttribute::Long { value, .. } => 4 + value.len(),
        }
    }

    fn write<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        match self {
            TransformAttribute::Short { attr_type, value } => {
                buf.put_u16(attr_type | ATTR_FORMAT_TV);
                buf.put_u16(*value);
            }
            TransformAttribute::Long { attr_type, value } => {
                buf.put_u16(attr_type & !ATTR_FORMAT_TV);
                buf.put_u16(narrow("attribute value", value.len())?);
                buf.put_slice(value);
            }
        }
        Ok(())
    }

    fn read<B: Buf>(buf: &mut B) -> Result<Self> {
        need(buf, 4)?;
        let raw_type = buf.get_u16();
        let attr_type = raw_type & !ATTR_FORMAT_TV;
        let second = buf.get_u16();

        if raw_type & ATTR_FORMAT_TV != 0 {
            return Ok(TransformAttribute::Short {
                attr_type,
                value: second,
            });
        }

        let len = second as usize;
        need(buf, len)?;
        let mut value = vec![0u8; len];
        buf.copy_to_slice(&mut value);
        Ok(TransformAttribute::Long { attr_type, value })
    }
}

fn need<B: Buf>(buf: &B, required: usize) -> Result<()> {
    if buf.remaining() < required {
        return Err(Error::BufferTooShort {
            required,
            available: buf.remaining(),
        });
    }
    Ok(())
}

/// One algorithm choice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transform {
    /// Transform type
    pub transform_type: TransformType,

    /// Raw transform ID; unknown IDs are kept so offers can be answered
    pub transform_id: u16,

    /// Attributes
    pub attributes: Vec<TransformAttribute>,
}

impl Transform {
    /// Fixed part of a transform substructure
    pub const HEADER_SIZE: usize = 8;

    /// Transform without attributes
    pub fn new(transform_type: TransformType, transform_id: u16) -> Self {
        Transform {
            transform_type,
            transform_id,
            attributes: Vec::new(),
        }
    }

    /// ENCR transform
    pub fn encr(id: EncrTransformId) -> Self {
        Transform::new(TransformType::Encr, id.into())
    }

    /// ENCR transform with a Key Length attribute in bits
    pub fn encr_with_key_len(id: EncrTransformId, key_bits: u16) -> Self {
        let mut transform = Transform::encr(id);
        transform.attributes.push(TransformAttribute::Short {
            attr_type: ATTR_KEY_LENGTH,
            value: key_bits,
        });
        transform
    }

    /// PRF transform
    pub fn prf(id: PrfTransformId) -> Self {
        Transform::new(TransformType::Prf, id.into())
    }

    /// INTEG transform
    pub fn integ(id: IntegTransformId) -> Self {
        Transform::new(TransformType::Integ, id.into())
    }

    /// D-H transform
    pub fn dh(id: DhTransformId) -> Self {
        Transform::new(TransformType::Dh, id.into())
    }

    /// Key Length attribute in bits, if present
    pub fn key_length(&self) -> Option<u16> {
        self.attributes.iter().find_map(|attr| match attr {
            TransformAttribute::Short { attr_type, value } if *attr_type == ATTR_KEY_LENGTH => {
                Some(*value)
            }
            _ => None,
        })
    }

    /// Same type, ID and key length
    pub fn is_compatible_with(&self, other: &Transform) -> bool {
        self.transform_type == other.transform_type
            && self.transform_id == other.transform_id
            && self.key_length() == other.key_length()
    }

    /// Total encoded length of this substructure
    pub fn encoded_len(&self) -> usize {
        Self::HEADER_SIZE
            + self
                .attributes
                .iter()
                .map(TransformAttribute::encoded_len)
                .sum::<usize>()
    }

    /// Serialize transform substructure (RFC 7296 Section 3.3.2)
    ///
    /// ```text
    /// | Last Substruc |   RESERVED    |        Transform Length       |
    /// |Transform Type |   RESERVED    |          Transform ID         |
    /// ~                      Transform Attributes                     ~
    /// ```
    pub fn write<B: BufMut>(&self, buf: &mut B, is_last: bool) -> Result<()> {
        buf.put_u8(if is_last { 0 } else { 3 });
        buf.put_u8(0);
        buf.put_u16(narrow("transform length", self.encoded_len())?);
        buf.put_u8(self.transform_type.into());
        buf.put_u8(0);
        buf.put_u16(self.transform_id);
        for attr in &self.attributes {
            attr.write(buf)?;
        }
        Ok(())
    }

    /// Parse one transform substructure, returning it with its "last" flag
    pub fn read<B: Buf>(buf: &mut B) -> Result<(Self, bool)> {
        need(buf, Self::HEADER_SIZE)?;

        let is_last = buf.get_u8() == 0;
        buf.advance(1);
        let length = buf.get_u16() as usize;
        if length < Self::HEADER_SIZE {
            return Err(Error::InvalidLength {
                minimum: Self::HEADER_SIZE,
                actual: length,
            });
        }
        need(buf, length - 4)?;

        let transform_type = TransformType::try_from(buf.get_u8())?;
        buf.advance(1);
        let transform_id = buf.get_u16();

        let mut attr_bytes = buf.copy_to_bytes(length - Self::HEADER_SIZE);
        let mut attributes = Vec::new();
        while attr_bytes.has_remaining() {
            attributes.push(TransformAttribute::read(&mut attr_bytes)?);
        }

        Ok((
            Transform {
                transform_type,
                transform_id,
                attributes,
            },
            is_last,
        ))
    }
}

wire_enum! {
    /// Security protocol of a proposal, notification or deletion
    pub enum ProtocolId: u8 {
        /// IKE SA
        Ike = 1,
        /// Authentication Header
        Ah = 2,
        /// Encapsulating Security Payload
        Esp = 3,
    }
}

/// Set of transforms offered, configured or chosen for one protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    /// Proposal number (1-based)
    pub proposal_num: u8,

    /// Protocol ID
    pub protocol_id: ProtocolId,

    /// Sender's SPI; empty in the initial IKE_SA_INIT offer
    pub spi: Vec<u8>,

    /// Transforms; several of one type are alternatives
    pub transforms: Vec<Transform>,
}

impl Proposal {
    /// Fixed part of a proposal substructure
    pub const HEADER_SIZE: usize = 8;

    /// Empty proposal
    pub fn new(proposal_num: u8, protocol_id: ProtocolId) -> Self {
        Proposal {
            proposal_num,
            protocol_id,
            spi: Vec::new(),
            transforms: Vec::new(),
        }
    }

    /// Append a transform
    pub fn add_transform(mut self, transform: Transform) -> Self {
        self.transforms.push(transform);
        self
    }

    /// Set SPI
    pub fn with_spi(mut self, spi: Vec<u8>) -> Self {
        self.spi = spi;
        self
    }

    /// First transform of the given type
    pub fn get_transform(&self, transform_type: TransformType) -> Option<&Transform> {
        self.transforms
            .iter()
            .find(|t| t.transform_type == transform_type)
    }

    fn has(&self, transform_type: TransformType) -> bool {
        self.get_transform(transform_type).is_some()
    }

    /// Chosen encryption algorithm and its key length
    pub fn encr(&self) -> Option<(EncrTransformId, Option<u16>)> {
        let transform = self.get_transform(TransformType::Encr)?;
        let id = EncrTransformId::try_from(transform.transform_id).ok()?;
        Some((id, transform.key_length()))
    }

    /// Chosen PRF
    pub fn prf(&self) -> Option<PrfTransformId> {
        self.get_transform(TransformType::Prf)
            .and_then(|t| PrfTransformId::try_from(t.transform_id).ok())
    }

    /// Chosen integrity algorithm
    pub fn integ(&self) -> Option<IntegTransformId> {
        self.get_transform(TransformType::Integ)
            .and_then(|t| IntegTransformId::try_from(t.transform_id).ok())
    }

    /// Chosen D-H group
    pub fn dh(&self) -> Option<DhTransformId> {
        self.get_transform(TransformType::Dh)
            .and_then(|t| DhTransformId::try_from(t.transform_id).ok())
    }

    /// Whether every transform type the protocol requires is present.
    ///
    /// IKE needs ENCR, PRF and D-H; ESP needs ENCR; AH needs INTEG and no
    /// ENCR. IKE and ESP also need INTEG unless the cipher is AEAD.
    pub fn is_complete(&self) -> bool {
        let aead = self
            .get_transform(TransformType::Encr)
            .and_then(|t| EncrTransformId::try_from(t.transform_id).ok())
            .map_or(false, EncrTransformId::is_aead);
        let integ = aead || self.has(TransformType::Integ);

        match self.protocol_id {
            ProtocolId::Ike => {
                self.has(TransformType::Encr)
                    && self.has(TransformType::Prf)
                    && self.has(TransformType::Dh)
                    && integ
            }
            ProtocolId::Esp => self.has(TransformType::Encr) && integ,
            ProtocolId::Ah => self.has(TransformType::Integ) && !self.has(TransformType::Encr),
        }
    }

    /// Answer this offer from one configured proposal.
    ///
    /// Every transform type the offer names must be one the configuration
    /// names, and for each of them the first offered transform matching a
    /// configured one is chosen. An offered ESN type the configuration does
    /// not name is answered with "no ESN" when the peer allows it. INTEG may
    /// be left out only behind an AEAD cipher. The answer keeps the offer's
    /// number and SPI and must be complete for its protocol.
    pub fn negotiate(&self, configured: &Proposal) -> Option<Proposal> {
        if self.protocol_id != configured.protocol_id || self.transforms.is_empty() {
            return None;
        }

        let mut types: Vec<TransformType> = Vec::new();
        for transform in self.transforms.iter().chain(&configured.transforms) {
            if !types.contains(&transform.transform_type) {
                types.push(transform.transform_type);
            }
        }

        let mut chosen: Vec<Transform> = Vec::with_capacity(types.len());
        for transform_type in types {
            let mut offered = self
                .transforms
                .iter()
                .filter(|t| t.transform_type == transform_type)
                .peekable();
            let allowed: Vec<&Transform> = configured
                .transforms
                .iter()
                .filter(|t| t.transform_type == transform_type)
                .collect();

            let pick = if allowed.is_empty() {
                if transform_type != TransformType::Esn {
                    return None;
                }
                offered.find(|t| t.transform_id == ESN_NONE)
            } else if offered.peek().is_none() {
                let aead = chosen.iter().any(|t| {
                    t.transform_type == TransformType::Encr
                        && EncrTransformId::try_from(t.transform_id).map_or(false, EncrTransformId::is_aead)
                });
                if transform_type == TransformType::Integ && aead {
                    continue;
                }
                return None;
            } else {
                offered.find(|ours| allowed.iter().any(|theirs| ours.is_compatible_with(theirs)))
            };
            chosen.push(pick?.clone());
        }

        let answer = Proposal {
            proposal_num: self.proposal_num,
            protocol_id: self.protocol_id,
            spi: self.spi.clone(),
            transforms: chosen,
        };
        answer.is_complete().then_some(answer)
    }

    /// Total encoded length of this substructure
    pub fn encoded_len(&self) -> usize {
        Self::HEADER_SIZE
            + self.spi.len()
            + self
                .transforms
                .iter()
                .map(Transform::encoded_len)
                .sum::<usize>()
    }

    /// Serialize proposal substructure (RFC 7296 Section 3.3.1)
    ///
    /// ```text
    /// | Last Substruc |   RESERVED    |         Proposal Length       |
    /// | Proposal Num  |  Protocol ID  |    SPI Size   |Num  Transforms|
    /// ~                        SPI (variable)                         ~
    /// ~                        <Transforms>                           ~
    /// ```
    pub fn write<B: BufMut>(&self, buf: &mut B, is_last: bool) -> Result<()> {
        buf.put_u8(if is_last { 0 } else { 2 });
        buf.put_u8(0);
        buf.put_u16(narrow("proposal length", self.encoded_len())?);
        buf.put_u8(self.proposal_num);
        buf.put_u8(self.protocol_id.into());
        buf.put_u8(narrow("SPI size", self.spi.len())?);
        buf.put_u8(narrow("transform count", self.transforms.len())?);
        buf.put_slice(&self.spi);

        let count = self.transforms.len();
        for (i, transform) in self.transforms.iter().enumerate() {
            transform.write(buf, i + 1 == count)?;
        }
        Ok(())
    }

    /// Parse one proposal substructure, returning it with its "last" flag
    pub fn read<B: Buf>(buf: &mut B) -> Result<(Self, bool)> {
        need(buf, Self::HEADER_SIZE)?;

        let is_last = buf.get_u8() == 0;
        buf.advance(1);
        let length = buf.get_u16() as usize;
        if length < Self::HEADER_SIZE {
            return Err(Error::InvalidLength {
                minimum: Self::HEADER_SIZE,
                actual: length,
            });
        }
        need(buf, length - 4)?;

        // Everything below is bounded by the proposal length
        let mut body = buf.copy_to_bytes(length - 4);

        let proposal_num = body.get_u8();
        let protocol_id = ProtocolId::try_from(body.get_u8())?;
        let spi_size = body.get_u8() as usize;
        let num_transforms = body.get_u8() as usize;

        need(&body, spi_size)?;
        let mut spi = vec![0u8; spi_size];
        body.copy_to_slice(&mut spi);

        let mut transforms = Vec::with_capacity(num_transforms);
        for _ in 0..num_transforms {
            let (transform, _) = Transform::read(&mut body)?;
            transforms.push(transform);
        }

        if body.has_remaining() {
            return Err(Error::InvalidPayload(format!(
                "Proposal {} has {} trailing bytes",
                proposal_num,
                body.remaining()
            )));
        }

        Ok((
            Proposal {
                proposal_num,
                protocol_id,
                spi,
                transforms,
            },
            is_last,
        ))
    }
}

/// Answer the first offered proposal any configured proposal accepts
pub fn select_proposal(offered: &[Proposal], configured: &[Proposal]) -> Result<Proposal> {
    offered
        .iter()
        .find_map(|offer| configured.iter().find_map(|config| offer.negotiate(config)))
        .ok_or(Error::NoProposalChosen)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ike_proposal() -> Proposal {
        Proposal::new(1, ProtocolId::Ike)
            .add_transform(Transform::encr_with_key_len(EncrTransformId::AesCbc, 256))
            .add_transform(Transform::prf(PrfTransformId::HmacSha256))
            .add_transform(Transform::integ(IntegTransformId::HmacSha256_128))
            .add_transform(Transform::dh(DhTransformId::Group14))
    }

    fn types(proposal: &Proposal) -> Vec<TransformType> {
        proposal.transforms.iter().map(|t| t.transform_type).collect()
    }

    #[test]
    fn test_transform_wire_layout() {
        let transform = Transform::encr_with_key_len(EncrTransformId::AesCbc, 128);
        let mut bytes = Vec::new();
        transform.write(&mut bytes, true).unwrap();

        assert_eq!(bytes.len(), 12);
        assert_eq!(bytes[0], 0); // last
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 12);
        assert_eq!(bytes[4], u8::from(TransformType::Encr));
        assert_eq!(u16::from_be_bytes([bytes[6], bytes[7]]), 12);
        assert_eq!(&bytes[8..12], &[0x80, 0x0E, 0x00, 0x80]);

        let (parsed, is_last) = Transform::read(&mut bytes.as_slice()).unwrap();
        assert!(is_last);
        assert_eq!(parsed, transform);
        assert_eq!(parsed.key_length(), Some(128));
    }

    #[test]
    fn test_transform_length_below_header() {
        let bytes = [0u8, 0, 0, 4, 1, 0, 0, 12];
        let result = Transform::read(&mut &bytes[..]);
        assert!(matches!(result, Err(Error::InvalidLength { .. })));
    }

    #[test]
    fn test_unknown_transform_type_rejected() {
        let bytes = [0u8, 0, 0, 8, 9, 0, 0, 1];
        let result = Transform::read(&mut &bytes[..]);
        assert!(matches!(result, Err(Error::InvalidPayload(_))));
    }

    #[test]
    fn test_proposal_wire_layout() {
        let proposal = ike_proposal().with_spi(vec![0xAA; 8]);
        let mut bytes = Vec::new();
        proposal.write(&mut bytes, true).unwrap();

        assert_eq!(bytes.len(), proposal.encoded_len());
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]) as usize, bytes.len());
        assert_eq!(bytes[5], u8::from(ProtocolId::Ike));
        assert_eq!(bytes[6], 8); // SPI size
        assert_eq!(bytes[7], 4); // transforms

        let (parsed, is_last) = Proposal::read(&mut bytes.as_slice()).unwrap();
        assert!(is_last);
        assert_eq!(parsed, proposal);
    }

    #[test]
    fn test_proposal_truncated() {
        let mut bytes = Vec::new();
        ike_proposal().write(&mut bytes, false).unwrap();
        bytes.truncate(bytes.len() - 3);

        let result = Proposal::read(&mut bytes.as_slice());
        assert!(matches!(result, Err(Error::BufferTooShort { .. })));
    }

    #[test]
    fn test_proposal_unknown_protocol() {
        let mut bytes = Vec::new();
        Proposal::new(1, ProtocolId::Esp).write(&mut bytes, true).unwrap();
        bytes[5] = 9;

        let result = Proposal::read(&mut bytes.as_slice());
        assert!(matches!(result, Err(Error::InvalidPayload(_))));
    }

    #[test]
    fn test_oversized_counts_are_errors() {
        let long_spi = Proposal::new(1, ProtocolId::Esp).with_spi(vec![0; 256]);
        assert!(matches!(
            long_spi.write(&mut Vec::new(), true),
            Err(Error::InvalidPayload(_))
        ));

        let mut many = Proposal::new(1, ProtocolId::Esp);
        many.transforms = vec![Transform::encr(EncrTransformId::AesCbc); 256];
        assert!(matches!(many.write(&mut Vec::new(), true), Err(Error::InvalidPayload(_))));

        let mut wide = Transform::encr(EncrTransformId::AesCbc);
        wide.attributes.push(TransformAttribute::Long {
            attr_type: 1,
            value: vec![0; 70_000],
        });
        assert!(wide.write(&mut Vec::new(), true).is_err());
    }

    #[test]
    fn test_compatibility_considers_key_length() {
        let aes128 = Transform::encr_with_key_len(EncrTransformId::AesCbc, 128);
        let aes256 = Transform::encr_with_key_len(EncrTransformId::AesCbc, 256);

        assert!(aes128.is_compatible_with(&aes128.clone()));
        assert!(!aes128.is_compatible_with(&aes256));
    }

    #[test]
    fn test_negotiate_picks_one_per_type() {
        let offer = Proposal::new(3, ProtocolId::Ike)
            .add_transform(Transform::encr_with_key_len(EncrTransformId::AesCbc, 128))
            .add_transform(Transform::encr_with_key_len(EncrTransformId::AesCbc, 256))
            .add_transform(Transform::prf(PrfTransformId::HmacSha512))
            .add_transform(Transform::prf(PrfTransformId::HmacSha256))
            .add_transform(Transform::integ(IntegTransformId::HmacSha256_128))
            .add_transform(Transform::dh(DhTransformId::Group14));

        let answer = offer.negotiate(&ike_proposal()).unwrap();
        assert_eq!(answer.proposal_num, 3);
        assert_eq!(answer.transforms.len(), 4);
        assert_eq!(answer.encr(), Some((EncrTransformId::AesCbc, Some(256))));
        assert_eq!(answer.prf(), Some(PrfTransformId::HmacSha256));
        assert_eq!(answer.integ(), Some(IntegTransformId::HmacSha256_128));
        assert_eq!(answer.dh(), Some(DhTransformId::Group14));
    }

    #[test]
    fn test_negotiate_rejects_empty_offer() {
        let empty = Proposal::new(1, ProtocolId::Ike);
        assert!(empty.negotiate(&ike_proposal()).is_none());
        assert!(matches!(
            select_proposal(&[empty], &[ike_proposal()]),
            Err(Error::NoProposalChosen)
        ));
    }

    #[test]
    fn test_negotiate_rejects_partial_offer() {
        // Every offered transform is acceptable, but D-H is missing
        let mut no_dh = ike_proposal();
        no_dh.transforms.retain(|t| t.transform_type != TransformType::Dh);
        assert!(no_dh.negotiate(&ike_proposal()).is_none());

        let encr_only = Proposal::new(1, ProtocolId::Ike)
            .add_transform(Transform::encr_with_key_len(EncrTransformId::AesCbc, 256));
        assert!(encr_only.negotiate(&ike_proposal()).is_none());
    }

    #[test]
    fn test_negotiate_rejects_unconfigured_type() {
        let esp = Proposal::new(1, ProtocolId::Esp)
            .add_transform(Transform::encr_with_key_len(EncrTransformId::AesCbc, 128))
            .add_transform(Transform::integ(IntegTransformId::HmacSha256_128));
        let offer = esp.clone().add_transform(Transform::dh(DhTransformId::Group14));

        assert!(offer.negotiate(&esp).is_none());
    }

    #[test]
    fn test_negotiate_esn_defaults_to_none() {
        let esp = Proposal::new(1, ProtocolId::Esp)
            .add_transform(Transform::encr_with_key_len(EncrTransformId::AesCbc, 128))
            .add_transform(Transform::integ(IntegTransformId::HmacSha256_128));

        let with_both = esp
            .clone()
            .add_transform(Transform::new(TransformType::Esn, 1))
            .add_transform(Transform::new(TransformType::Esn, ESN_NONE));
        let answer = with_both.negotiate(&esp).unwrap();
        assert_eq!(
            answer.get_transform(TransformType::Esn).unwrap().transform_id,
            ESN_NONE
        );

        let esn_only = esp.clone().add_transform(Transform::new(TransformType::Esn, 1));
        assert!(esn_only.negotiate(&esp).is_none());
    }

    #[test]
    fn test_negotiate_aead_needs_no_integ() {
        let configured = Proposal::new(1, ProtocolId::Esp)
            .add_transform(Transform::encr_with_key_len(EncrTransformId::AesGcm16, 128))
            .add_transform(Transform::encr_with_key_len(EncrTransformId::AesCbc, 128))
            .add_transform(Transform::integ(IntegTransformId::HmacSha256_128));

        let gcm = Proposal::new(1, ProtocolId::Esp)
            .add_transform(Transform::encr_with_key_len(EncrTransformId::AesGcm16, 128));
        let answer = gcm.negotiate(&configured).unwrap();
        assert_eq!(types(&answer), vec![TransformType::Encr]);

        let cbc = Proposal::new(1, ProtocolId::Esp)
            .add_transform(Transform::encr_with_key_len(EncrTransformId::AesCbc, 128));
        assert!(cbc.negotiate(&configured).is_none());
    }

    #[test]
    fn test_completeness_per_protocol() {
        assert!(ike_proposal().is_complete());
        assert!(!Proposal::new(1, ProtocolId::Ike).is_complete());

        let ah = Proposal::new(1, ProtocolId::Ah)
            .add_transform(Transform::integ(IntegTransformId::HmacSha256_128));
        assert!(ah.is_complete());
        assert!(!ah
            .clone()
            .add_transform(Transform::encr(EncrTransformId::AesCbc))
            .is_complete());

        let chacha = Proposal::new(1, ProtocolId::Esp)
            .add_transform(Transform::encr(EncrTransformId::ChaCha20Poly1305));
        assert!(chacha.is_complete());
    }

    #[test]
    fn test_select_proposal_skips_unacceptable_offers() {
        let offered = vec![
            Proposal::new(1, ProtocolId::Ike)
                .add_transform(Transform::encr(EncrTransformId::AesGcm16)),
            ike_proposal(),
        ];

        let selected = select_proposal(&offered, &[ike_proposal()]).unwrap();
        assert_eq!(selected, ike_proposal());
    }

    #[test]
    fn test_select_proposal_protocol_mismatch() {
        let offered = vec![Proposal::new(1, ProtocolId::Esp)
            .add_transform(Transform::encr(EncrTransformId::ChaCha20Poly1305))];

        let result = select_proposal(&offered, &[ike_proposal()]);
        assert!(matches!(result, Err(Error::NoProposalChosen)));
    }

    #[test]
    fn test_id_codes() {
        assert_eq!(TransformType::try_from(4).unwrap(), TransformType::Dh);
        assert!(TransformType::try_from(99).is_err());
        assert_eq!(EncrTransformId::try_from(12).unwrap(), EncrTransformId::AesCbc);
        assert_eq!(u16::from(DhTransformId::Group31), 31);
        assert_eq!(ProtocolId::try_from(3).unwrap(), ProtocolId::Esp);
        assert!(EncrTransformId::AesGcm16.is_aead());
        assert!(!EncrTransformId::AesCbc.is_aead());
    }
}
