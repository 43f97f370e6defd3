//! IKEv2 message structures and parsing
//!
//! Implements the IKE message format defined in RFC 7296 Section 3.1,
//! including protection of the Encrypted payload (Section 3.14).

use super::constants::*;
use super::id::IdPayload;
use super::payload::{
    narrow, read_length, AuthPayload, DeletePayload, EncryptedPayload, IkePayload, NoncePayload, NotifyPayload,
    PayloadHeader, SaPayload, CRITICAL_FLAG,
};
use crate::ipsec::crypto::CipherSuite;
use crate::ipsec::{Error, Result};
use bytes::{Buf, BufMut, Bytes};
use subtle::ConstantTimeEq;

/// IKE message header (28 bytes)
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       IKE SA Initiator's SPI                  |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       IKE SA Responder's SPI                  |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Next Payload | MjVer | MnVer | Exchange Type |     Flags     |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                          Message ID                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                            Length                             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IkeHeader {
    /// Initiator's SPI
    pub spi_i: u64,

    /// Responder's SPI (zero in the IKE_SA_INIT request)
    pub spi_r: u64,

    /// Raw type of the first payload
    pub next_payload: u8,

    /// Protocol version (0x20 for IKEv2)
    pub version: u8,

    /// Exchange type
    pub exchange_type: ExchangeType,

    /// Message flags
    pub flags: IkeFlags,

    /// Message ID
    pub message_id: u32,

    /// Total message length in bytes (including header)
    pub length: u32,
}

impl IkeHeader {
    /// Create a header with no payloads yet
    pub fn new(
        exchange_type: ExchangeType,
        spi_i: u64,
        spi_r: u64,
        flags: IkeFlags,
        message_id: u32,
    ) -> Self {
        IkeHeader {
            spi_i,
            spi_r,
            next_payload: PayloadType::None.into(),
            version: IKE_VERSION,
            exchange_type,
            flags,
            message_id,
            length: IKE_HEADER_SIZE as u32,
        }
    }

    /// Parse the fixed header
    ///
    /// # Errors
    ///
    /// Returns error if the buffer is shorter than 28 bytes, the major
    /// version is not 2, the exchange type is unknown or the length field
    /// is out of range.
    pub fn read<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < IKE_HEADER_SIZE {
            return Err(Error::BufferTooShort {
                required: IKE_HEADER_SIZE,
                available: buf.remaining(),
            });
        }

        let spi_i = buf.get_u64();
        let spi_r = buf.get_u64();
        let next_payload = buf.get_u8();

        let version = buf.get_u8();
        if version >> 4 != IKE_VERSION >> 4 {
            return Err(Error::UnsupportedVersion(version));
        }

        let raw_exchange = buf.get_u8();
        let exchange_type = ExchangeType::try_from(raw_exchange)
            .map_err(|_| Error::UnsupportedExchangeType(raw_exchange))?;
        let flags = IkeFlags::new(buf.get_u8());
        let message_id = buf.get_u32();

        let length = buf.get_u32();
        if (length as usize) < IKE_HEADER_SIZE {
            return Err(Error::InvalidLength {
                minimum: IKE_HEADER_SIZE,
                actual: length as usize,
            });
        }
        if length > MAX_IKE_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge(length));
        }

        Ok(IkeHeader {
            spi_i,
            spi_r,
            next_payload,
            version,
            exchange_type,
            flags,
            message_id,
            length,
        })
    }

    /// Write the fixed header
    pub fn write<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64(self.spi_i);
        buf.put_u64(self.spi_r);
        buf.put_u8(self.next_payload);
        buf.put_u8(self.version);
        buf.put_u8(self.exchange_type.into());
        buf.put_u8(self.flags.value());
        buf.put_u32(self.message_id);
        buf.put_u32(self.length);
    }
}

/// Decode a payload chain starting with payload type `first`.
///
/// An Encrypted payload ends the chain.
fn decode_chain<B: Buf>(first: u8, buf: &mut B) -> Result<Vec<IkePayload>> {
    let mut payloads = Vec::new();
    let mut current = first;

    while current != u8::from(PayloadType::None) {
        if buf.remaining() < PayloadHeader::SIZE {
            return Err(Error::BufferTooShort {
                required: PayloadHeader::SIZE,
                available: buf.remaining(),
            });
        }
        let next = buf.get_u8();
        let critical = buf.get_u8() & CRITICAL_FLAG != 0;

        if current == u8::from(PayloadType::SK) {
            let length = read_length(buf, PayloadHeader::SIZE)?;
            payloads.push(IkePayload::Encrypted(EncryptedPayload {
                first_inner: next,
                data: buf.copy_to_bytes(length - PayloadHeader::SIZE),
            }));
            break;
        }

        payloads.push(IkePayload::read(current, critical, buf)?);
        current = next;
    }

    Ok(payloads)
}

fn encode_chain<B: BufMut>(payloads: &[IkePayload], buf: &mut B) -> Result<()> {
    for (i, payload) in payloads.iter().enumerate() {
        let next = payloads
            .get(i + 1)
            .map_or(u8::from(PayloadType::None), IkePayload::payload_type);
        payload.write(next, buf)?;
    }
    Ok(())
}

fn first_type(payloads: &[IkePayload]) -> u8 {
    payloads
        .first()
        .map_or(u8::from(PayloadType::None), IkePayload::payload_type)
}

/// Header length field for a message of `length` bytes
fn message_length(length: usize) -> Result<u32> {
    match u32::try_from(length) {
        Ok(length) if length <= MAX_IKE_MESSAGE_SIZE => Ok(length),
        _ => Err(Error::MessageTooLarge(
            u32::try_from(length).unwrap_or(u32::MAX),
        )),
    }
}

/// A complete IKE message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IkeMessage {
    /// Fixed header
    pub header: IkeHeader,

    /// Payloads in wire order
    pub payloads: Vec<IkePayload>,
}

impl IkeMessage {
    /// Create an empty message
    pub fn new(header: IkeHeader) -> Self {
        IkeMessage {
            header,
            payloads: Vec::new(),
        }
    }

    /// Append a payload
    pub fn with_payload(mut self, payload: IkePayload) -> Self {
        self.payloads.push(payload);
        self
    }

    /// Decode a datagram
    ///
    /// Any malformed payload aborts decoding of the whole message.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = data;
        let header = IkeHeader::read(&mut cursor)?;

        if header.length as usize != data.len() {
            return Err(Error::InvalidMessage(format!(
                "Header length {} does not match datagram size {}",
                header.length,
                data.len()
            )));
        }

        let payloads = decode_chain(header.next_payload, &mut cursor)?;
        if cursor.has_remaining() {
            return Err(Error::InvalidMessage(format!(
                "{} bytes after last payload",
                cursor.remaining()
            )));
        }

        Ok(IkeMessage { header, payloads })
    }

    /// Encode to wire format, fixing up the chain and length fields
    pub fn encode(&self) -> Result<Vec<u8>> {
        let length = IKE_HEADER_SIZE + self.payloads.iter().map(IkePayload::length).sum::<usize>();

        let mut header = self.header.clone();
        header.next_payload = first_type(&self.payloads);
        header.length = message_length(length)?;

        let mut out = Vec::with_capacity(length);
        header.write(&mut out);
        encode_chain(&self.payloads, &mut out)?;
        Ok(out)
    }

    /// Encode with every payload moved inside an Encrypted payload
    ///
    /// Padding follows RFC 7296 Section 3.14: zero pad bytes followed by
    /// the pad length, bringing the plaintext to a block multiple.
    pub fn seal(&self, suite: &dyn CipherSuite, iv: &[u8]) -> Result<Vec<u8>> {
        let block = suite.block_size();

        let mut plaintext = Vec::new();
        encode_chain(&self.payloads, &mut plaintext)?;
        let pad = (block - (plaintext.len() + 1) % block) % block;
        plaintext.put_bytes(0, pad);
        plaintext.put_u8(narrow("pad length", pad)?);

        let ciphertext = suite.encrypt(&plaintext, iv);
        let icv_len = suite.integrity_size();
        let sk_length = PayloadHeader::SIZE + iv.len() + ciphertext.len() + icv_len;
        let length = IKE_HEADER_SIZE + sk_length;

        let mut header = self.header.clone();
        header.next_payload = PayloadType::SK.into();
        header.length = message_length(length)?;

        let mut out = Vec::with_capacity(length);
        header.write(&mut out);
        out.put_u8(first_type(&self.payloads));
        out.put_u8(0);
        out.put_u16(narrow("encrypted payload length", sk_length)?);
        out.put_slice(iv);
        out.put_slice(&ciphertext);

        let icv = suite.compute_integrity(&out);
        out.put_slice(&icv);
        Ok(out)
    }

    /// Verify and decrypt a datagram ending in an Encrypted payload
    ///
    /// The returned message carries the inner payloads in place of the
    /// Encrypted payload.
    pub fn open(datagram: &[u8], suite: &dyn CipherSuite) -> Result<Self> {
        let mut message = IkeMessage::decode(datagram)?;
        let encrypted = match message.payloads.pop() {
            Some(IkePayload::Encrypted(encrypted)) => encrypted,
            _ => {
                return Err(Error::InvalidMessage(
                    "Message has no Encrypted payload".to_string(),
                ))
            }
        };

        let iv_len = suite.iv_size();
        let icv_len = suite.integrity_size();
        let block = suite.block_size();
        let data = &encrypted.data;

        if data.len() < iv_len + block + icv_len {
            return Err(Error::BufferTooShort {
                required: iv_len + block + icv_len,
                available: data.len(),
            });
        }
        let ct_len = data.len() - iv_len - icv_len;
        if ct_len % block != 0 {
            return Err(Error::InvalidPayload(format!(
                "Ciphertext of {} bytes is not a multiple of {}",
                ct_len, block
            )));
        }

        let signed = &datagram[..datagram.len() - icv_len];
        let expected = suite.compute_integrity(signed);
        if !bool::from(expected.ct_eq(&data[iv_len + ct_len..])) {
            return Err(Error::AuthenticationFailed(
                "Integrity checksum mismatch".to_string(),
            ));
        }

        let plaintext = suite.decrypt(&data[iv_len..iv_len + ct_len], &data[..iv_len]);
        let pad = plaintext[plaintext.len() - 1] as usize;
        if pad + 1 > plaintext.len() {
            return Err(Error::InvalidPayload(format!(
                "Pad length {} exceeds plaintext",
                pad
            )));
        }

        let mut inner = Bytes::from(plaintext);
        inner.truncate(inner.len() - pad - 1);
        let payloads = decode_chain(encrypted.first_inner, &mut inner)?;
        if inner.has_remaining() {
            return Err(Error::InvalidPayload(
                "Trailing bytes inside Encrypted payload".to_string(),
            ));
        }

        message.payloads.extend(payloads);
        Ok(message)
    }

    /// Whether the response flag is clear
    pub fn is_request(&self) -> bool {
        !self.header.flags.is_response()
    }

    /// First notification of the given type
    pub fn notify(&self, notify_type: NotifyType) -> Option<&NotifyPayload> {
        self.payloads.iter().find_map(|p| match p {
            IkePayload::Notify(n) if n.notify_type == notify_type => Some(n),
            _ => None,
        })
    }

    /// Data of the COOKIE notification, if any
    pub fn cookie(&self) -> Option<&Bytes> {
        self.notify(NotifyType::COOKIE).map(|n| &n.data)
    }

    /// Nonce payload, if any
    pub fn nonce(&self) -> Option<&NoncePayload> {
        self.payloads.iter().find_map(|p| match p {
            IkePayload::Nonce(n) => Some(n),
            _ => None,
        })
    }

    /// SA payload, if any
    pub fn sa(&self) -> Option<&SaPayload> {
        self.payloads.iter().find_map(|p| match p {
            IkePayload::Sa(sa) => Some(sa),
            _ => None,
        })
    }

    /// Initiator identification, if any
    pub fn initiator_id(&self) -> Option<&IdPayload> {
        self.payloads.iter().find_map(|p| match p {
            IkePayload::IdI(id) => Some(id),
            _ => None,
        })
    }

    /// Responder identification, if any
    pub fn responder_id(&self) -> Option<&IdPayload> {
        self.payloads.iter().find_map(|p| match p {
            IkePayload::IdR(id) => Some(id),
            _ => None,
        })
    }

    /// Authentication payload, if any
    pub fn auth(&self) -> Option<&AuthPayload> {
        self.payloads.iter().find_map(|p| match p {
            IkePayload::Auth(auth) => Some(auth),
            _ => None,
        })
    }

    /// First error notification, if any
    pub fn error_notify(&self) -> Option<NotifyType> {
        self.payloads.iter().find_map(|p| match p {
            IkePayload::Notify(n) if n.notify_type.is_error() => Some(n.notify_type),
            _ => None,
        })
    }

    /// Whether the last payload is an Encrypted payload
    pub fn is_encrypted(&self) -> bool {
        matches!(self.payloads.last(), Some(IkePayload::Encrypted(_)))
    }

    /// All Delete payloads
    pub fn deletes(&self) -> impl Iterator<Item = &DeletePayload> {
        self.payloads.iter().filter_map(|p| match p {
            IkePayload::Delete(d) => Some(d),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::crypto::{CbcHmacSuite, SuiteKeys};
    use crate::ipsec::ikev2::id::Identity;
    use crate::ipsec::ikev2::payload::KePayload;
    use crate::ipsec::ikev2::proposal::{
        DhTransformId, EncrTransformId, IntegTransformId, PrfTransformId, Proposal, ProtocolId,
        Transform,
    };

    fn sa_init_request() -> IkeMessage {
        let proposal = Proposal::new(1, ProtocolId::Ike)
            .add_transform(Transform::encr_with_key_len(EncrTransformId::AesCbc, 128))
            .add_transform(Transform::prf(PrfTransformId::HmacSha256))
            .add_transform(Transform::integ(IntegTransformId::HmacSha256_128))
            .add_transform(Transform::dh(DhTransformId::Group14));

        IkeMessage::new(IkeHeader::new(
            ExchangeType::IkeSaInit,
            0x0102030405060708,
            0,
            IkeFlags::request(true),
            0,
        ))
        .with_payload(IkePayload::Sa(SaPayload::new(vec![proposal])))
        .with_payload(IkePayload::Ke(KePayload::new(14, vec![0xAB; 256])))
        .with_payload(IkePayload::Nonce(NoncePayload::new(vec![0x11; 32]).unwrap()))
    }

    fn suite() -> CbcHmacSuite {
        CbcHmacSuite::new(
            IntegTransformId::HmacSha256_128,
            SuiteKeys::new(&[0x01; 16], &[0x02; 32]),
        )
        .unwrap()
    }

    #[test]
    fn test_header_layout() {
        let header = IkeHeader::new(ExchangeType::IkeAuth, 1, 2, IkeFlags::response(false), 7);
        let mut bytes = Vec::new();
        header.write(&mut bytes);

        assert_eq!(bytes.len(), IKE_HEADER_SIZE);
        assert_eq!(bytes[17], 0x20);
        assert_eq!(bytes[18], 35);
        assert_eq!(bytes[19], IkeFlags::RESPONSE);
        assert_eq!(IkeHeader::read(&mut bytes.as_slice()).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_version() {
        let mut bytes = Vec::new();
        IkeHeader::new(ExchangeType::IkeSaInit, 1, 0, IkeFlags::request(true), 0)
            .write(&mut bytes);
        bytes[17] = 0x10;
        assert!(matches!(
            IkeHeader::read(&mut bytes.as_slice()),
            Err(Error::UnsupportedVersion(0x10))
        ));

        bytes[17] = 0x20;
        bytes[18] = 99;
        assert!(matches!(
            IkeHeader::read(&mut bytes.as_slice()),
            Err(Error::UnsupportedExchangeType(99))
        ));
    }

    #[test]
    fn test_message_encode_decode() {
        let message = sa_init_request();
        let wire = message.encode().unwrap();

        assert_eq!(wire[16], u8::from(PayloadType::SA));
        let decoded = IkeMessage::decode(&wire).unwrap();
        assert_eq!(decoded.payloads, message.payloads);
        assert_eq!(decoded.header.length as usize, wire.len());
        assert_eq!(decoded.encode().unwrap(), wire);
        assert!(decoded.is_request());
        assert_eq!(decoded.nonce().unwrap().nonce.len(), 32);
    }

    #[test]
    fn test_message_length_mismatch() {
        let mut wire = sa_init_request().encode().unwrap();
        wire.push(0);
        assert!(matches!(
            IkeMessage::decode(&wire),
            Err(Error::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_truncated_payload_aborts_decode() {
        let mut wire = sa_init_request().encode().unwrap();
        wire.truncate(wire.len() - 10);
        let len = wire.len() as u32;
        wire[24..28].copy_from_slice(&len.to_be_bytes());
        assert!(IkeMessage::decode(&wire).unwrap_err().is_parse_error());
    }

    #[test]
    fn test_unknown_critical_payload_rejected() {
        let mut message = sa_init_request();
        message.payloads.push(IkePayload::Raw {
            payload_type: 200,
            critical: true,
            data: Bytes::from_static(b"x"),
        });
        let wire = message.encode().unwrap();
        assert!(matches!(
            IkeMessage::decode(&wire),
            Err(Error::InvalidMessage(_))
        ));

        message.payloads.pop();
        message.payloads.push(IkePayload::Raw {
            payload_type: 200,
            critical: false,
            data: Bytes::from_static(b"x"),
        });
        let wire = message.encode().unwrap();
        assert_eq!(IkeMessage::decode(&wire).unwrap().payloads.len(), 4);
    }

    #[test]
    fn test_cookie_lookup() {
        let message = sa_init_request()
            .with_payload(IkePayload::Notify(NotifyPayload::cookie(vec![9u8; 32])));
        let decoded = IkeMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded.cookie().map(|c| c.len()), Some(32));
    }

    #[test]
    fn test_seal_open() {
        let message = IkeMessage::new(IkeHeader::new(
            ExchangeType::IkeAuth,
            0x10,
            0x20,
            IkeFlags::request(true),
            1,
        ))
        .with_payload(IkePayload::IdI(IdPayload::new(Identity::fqdn("host.example"))))
        .with_payload(IkePayload::Notify(NotifyPayload::new(
            NotifyType::INITIAL_CONTACT,
            Vec::new(),
        )));

        let suite = suite();
        let wire = message.seal(&suite, &[0x33; 16]).unwrap();
        assert_eq!(wire[16], u8::from(PayloadType::SK));

        let opened = IkeMessage::open(&wire, &suite).unwrap();
        assert_eq!(opened.payloads, message.payloads);
        assert_eq!(
            opened.initiator_id().unwrap().id,
            Identity::fqdn("host.example")
        );
    }

    #[test]
    fn test_open_rejects_tampering() {
        let message = IkeMessage::new(IkeHeader::new(
            ExchangeType::Informational,
            1,
            2,
            IkeFlags::request(true),
            3,
        ))
        .with_payload(IkePayload::Delete(DeletePayload::ike()));

        let suite = suite();
        let mut wire = message.seal(&suite, &[0u8; 16]).unwrap();
        let pos = IKE_HEADER_SIZE + PayloadHeader::SIZE + 20;
        wire[pos] ^= 0x01;

        assert!(matches!(
            IkeMessage::open(&wire, &suite),
            Err(Error::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_open_rejects_misaligned_ciphertext() {
        let message = IkeMessage::new(IkeHeader::new(
            ExchangeType::Informational,
            1,
            2,
            IkeFlags::request(true),
            3,
        ))
        .with_payload(IkePayload::Encrypted(EncryptedPayload {
            first_inner: 0,
            data: Bytes::from(vec![0u8; 16 + 17 + 16]),
        }));
        let wire = message.encode().unwrap();

        assert!(matches!(
            IkeMessage::open(&wire, &suite()),
            Err(Error::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_oversized_message_rejected_on_encode() {
        let mut message = sa_init_request();
        for _ in 0..3 {
            message.payloads.push(IkePayload::Raw {
                payload_type: 200,
                critical: false,
                data: Bytes::from(vec![0u8; 30_000]),
            });
        }
        assert!(matches!(message.encode(), Err(Error::MessageTooLarge(_))));
        assert!(matches!(
            message.seal(&suite(), &[0u8; 16]),
            Err(Error::MessageTooLarge(_))
        ));
    }
}
