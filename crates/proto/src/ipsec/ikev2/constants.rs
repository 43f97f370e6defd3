//! Header-level registries of RFC 7296

/// IKE version 2 (major version = 2, minor version = 0)
pub const IKE_VERSION: u8 = 0x20;

/// Largest datagram the engine will emit or accept
pub const MAX_IKE_MESSAGE_SIZE: u32 = 65535;

/// Fixed IKE header size
pub const IKE_HEADER_SIZE: usize = 28;

/// Declare a closed IANA registry as a fieldless enum.
///
/// Decoding goes through `TryFrom<repr>` and fails with
/// [`Error::InvalidPayload`](crate::ipsec::Error::InvalidPayload) for
/// unassigned codes; encoding is `From<Enum> for repr`.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident: $repr:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $code:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr($repr)]
        $vis enum $name {
            $( $(#[$vmeta])* $variant = $code, )+
        }

        impl TryFrom<$repr> for $name {
            type Error = $crate::ipsec::Error;

            fn try_from(code: $repr) -> ::core::result::Result<Self, Self::Error> {
                match code {
                    $( $code => Ok($name::$variant), )+
                    other => Err($crate::ipsec::Error::InvalidPayload(format!(
                        concat!("unassigned ", stringify!($name), " {}"),
                        other
                    ))),
                }
            }
        }

        impl From<$name> for $repr {
            fn from(value: $name) -> $repr {
                value as $repr
            }
        }
    };
}

pub(crate) use wire_enum;

wire_enum! {
    /// Exchange Types (RFC 7296 Section 3.1)
    pub enum ExchangeType: u8 {
        /// IKE_SA_INIT
        IkeSaInit = 34,
        /// IKE_AUTH
        IkeAuth = 35,
        /// CREATE_CHILD_SA
        CreateChildSa = 36,
        /// INFORMATIONAL
        Informational = 37,
    }
}

/// IKE header flags octet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IkeFlags(u8);

impl IkeFlags {
    /// Set on responses
    pub const RESPONSE: u8 = 0x20;
    /// Set by the original initiator of the IKE SA
    pub const INITIATOR: u8 = 0x08;

    const DEFINED: u8 = 0x38;

    /// Flags as received; undefined bits are dropped
    pub fn new(value: u8) -> Self {
        IkeFlags(value & Self::DEFINED)
    }

    /// Flags for a request sent by the given side
    pub fn request(is_initiator: bool) -> Self {
        IkeFlags(if is_initiator { Self::INITIATOR } else { 0 })
    }

    /// Flags for a response sent by the given side
    pub fn response(is_initiator: bool) -> Self {
        IkeFlags(Self::request(is_initiator).0 | Self::RESPONSE)
    }

    /// Response bit
    pub fn is_response(self) -> bool {
        self.0 & Self::RESPONSE != 0
    }

    /// Initiator bit
    pub fn is_initiator(self) -> bool {
        self.0 & Self::INITIATOR != 0
    }

    /// Octet as written on the wire
    pub fn value(self) -> u8 {
        self.0
    }
}

wire_enum! {
    /// Payload kinds the codec understands (RFC 7296 Section 3.2)
    ///
    /// Anything else travels as a raw payload.
    pub enum PayloadType: u8 {
        /// End of the chain
        None = 0,
        /// Security Association
        SA = 33,
        /// Key Exchange
        KE = 34,
        /// Identification - Initiator
        IDi = 35,
        /// Identification - Responder
        IDr = 36,
        /// Authentication
        AUTH = 39,
        /// Nonce
        Nonce = 40,
        /// Notify
        N = 41,
        /// Delete
        D = 42,
        /// Vendor ID
        V = 43,
        /// Encrypted and Authenticated
        SK = 46,
    }
}

/// Notify Message Type (RFC 7296 Section 3.10.1)
///
/// Open-ended: unknown types are carried through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotifyType(pub u16);

impl NotifyType {
    /// INVALID_SYNTAX
    pub const INVALID_SYNTAX: NotifyType = NotifyType(7);
    /// NO_PROPOSAL_CHOSEN
    pub const NO_PROPOSAL_CHOSEN: NotifyType = NotifyType(14);
    /// AUTHENTICATION_FAILED
    pub const AUTHENTICATION_FAILED: NotifyType = NotifyType(24);
    /// INITIAL_CONTACT
    pub const INITIAL_CONTACT: NotifyType = NotifyType(16384);
    /// COOKIE
    pub const COOKIE: NotifyType = NotifyType(16390);
    /// REKEY_SA
    pub const REKEY_SA: NotifyType = NotifyType(16393);

    /// Error types occupy 1..16383, status types 16384 and up
    pub fn is_error(self) -> bool {
        (1..16384).contains(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::Error;

    #[test]
    fn test_exchange_type_codes() {
        assert_eq!(ExchangeType::try_from(36).unwrap(), ExchangeType::CreateChildSa);
        assert_eq!(u8::from(ExchangeType::Informational), 37);
        assert!(matches!(ExchangeType::try_from(99), Err(Error::InvalidPayload(_))));
    }

    #[test]
    fn test_flags_per_side() {
        let flags = IkeFlags::request(true);
        assert!(!flags.is_response());
        assert!(flags.is_initiator());

        assert_eq!(IkeFlags::response(false).value(), IkeFlags::RESPONSE);
        assert_eq!(
            IkeFlags::response(true).value(),
            IkeFlags::RESPONSE | IkeFlags::INITIATOR
        );
        assert_eq!(IkeFlags::new(0xFF).value(), 0x38);
    }

    #[test]
    fn test_payload_registry_excludes_unparsed_kinds() {
        assert_eq!(PayloadType::try_from(35).unwrap(), PayloadType::IDi);
        assert_eq!(u8::from(PayloadType::Nonce), 40);
        // CERT and TSi are not decoded and stay raw
        assert!(PayloadType::try_from(37).is_err());
        assert!(PayloadType::try_from(44).is_err());
    }

    #[test]
    fn test_notify_classes() {
        assert!(NotifyType::NO_PROPOSAL_CHOSEN.is_error());
        assert!(NotifyType(16383).is_error());
        assert!(!NotifyType::COOKIE.is_error());
        assert!(!NotifyType(0).is_error());
    }
}
