//! The errors that can be emitted by the wire codec, framing transport,
//! crypto primitives, secure channel, registry and matchmaking layers.

use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};
use std::io;

/// Errors raised by the wire codec (C1).
#[derive(Debug)]
pub enum CodecError {
    /// A read or write ran past the end of the available buffer.
    BufferTooSmall,
    /// The leading tag byte did not name a known message type.
    UnknownTag(u8),
    /// A length-prefixed field claimed a size larger than its container.
    InvalidLength,
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            CodecError::BufferTooSmall => write!(f, "codec error: buffer too small"),
            CodecError::UnknownTag(t) => write!(f, "codec error: unknown tag {}", t),
            CodecError::InvalidLength => write!(f, "codec error: invalid length field"),
        }
    }
}

impl StdError for CodecError {}

/// Errors raised by the framing transport (C2).
#[derive(Debug)]
pub enum FramingError {
    /// The declared frame length exceeds `MAX_FRAME_SIZE`.
    FrameTooLarge(usize),
    /// The peer closed the connection mid-frame.
    ConnectionLost,
    /// An underlying I/O error occurred.
    Io(io::Error),
    /// The codec could not decode the frame's payload.
    Codec(CodecError),
}

impl Display for FramingError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            FramingError::FrameTooLarge(n) => write!(f, "framing error: frame too large ({} bytes)", n),
            FramingError::ConnectionLost => write!(f, "framing error: connection lost"),
            FramingError::Io(ref e) => write!(f, "framing error: {}", e),
            FramingError::Codec(ref e) => write!(f, "framing error: {}", e),
        }
    }
}

impl StdError for FramingError {}

impl From<io::Error> for FramingError {
    fn from(e: io::Error) -> FramingError {
        if e.kind() == io::ErrorKind::UnexpectedEof || e.kind() == io::ErrorKind::ConnectionReset {
            FramingError::ConnectionLost
        } else {
            FramingError::Io(e)
        }
    }
}

impl From<CodecError> for FramingError {
    fn from(e: CodecError) -> FramingError {
        FramingError::Codec(e)
    }
}

/// Errors raised by the crypto primitives (C3).
#[derive(Debug)]
pub enum CryptoError {
    /// AEAD authentication failed; no plaintext is released.
    AeadVerifyFailed,
    /// A digital signature failed to verify.
    SignatureInvalid,
    /// Key agreement failed to produce a shared secret.
    KeyAgreementFailed,
    /// HKDF was asked to derive more output than the PRK can expand.
    DerivationFailed,
    /// The certificate's DER encoding was malformed.
    MalformedCertificate,
    /// The certificate's signature does not chain to the CA in the store.
    UntrustedCertificate,
    /// The certificate has expired or is not yet valid.
    CertificateExpired,
    /// The certificate's serial number is present in the CRL.
    CertificateRevoked,
}

impl Display for CryptoError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let msg = match *self {
            CryptoError::AeadVerifyFailed => "AEAD verification failed",
            CryptoError::SignatureInvalid => "signature verification failed",
            CryptoError::KeyAgreementFailed => "key agreement failed",
            CryptoError::DerivationFailed => "key derivation failed",
            CryptoError::MalformedCertificate => "certificate is malformed",
            CryptoError::UntrustedCertificate => "certificate does not chain to the CA store",
            CryptoError::CertificateExpired => "certificate is expired or not yet valid",
            CryptoError::CertificateRevoked => "certificate is revoked",
        };
        write!(f, "crypto error: {}", msg)
    }
}

impl StdError for CryptoError {}

/// Errors raised by the secure channel (C4): handshake and record layer.
#[derive(Debug)]
pub enum ChannelError {
    /// A handshake message arrived in the wrong step.
    UnexpectedMessage,
    /// A handshake message was received twice.
    DuplicateHandshakeMessage,
    /// A `SECURE_MESSAGE` arrived before the peer was authenticated.
    NotAuthenticated,
    /// The sequence counter would overflow on the next send.
    SequenceExhausted,
    Framing(FramingError),
    Crypto(CryptoError),
}

impl Display for ChannelError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            ChannelError::UnexpectedMessage => write!(f, "channel error: unexpected message for current state"),
            ChannelError::DuplicateHandshakeMessage => write!(f, "channel error: duplicate handshake message"),
            ChannelError::NotAuthenticated => write!(f, "channel error: peer not authenticated"),
            ChannelError::SequenceExhausted => write!(f, "channel error: sequence counter exhausted"),
            ChannelError::Framing(ref e) => write!(f, "channel error: {}", e),
            ChannelError::Crypto(ref e) => write!(f, "channel error: {}", e),
        }
    }
}

impl StdError for ChannelError {}

impl From<FramingError> for ChannelError {
    fn from(e: FramingError) -> ChannelError {
        ChannelError::Framing(e)
    }
}

impl From<CryptoError> for ChannelError {
    fn from(e: CryptoError) -> ChannelError {
        ChannelError::Crypto(e)
    }
}

impl From<CodecError> for ChannelError {
    fn from(e: CodecError) -> ChannelError {
        ChannelError::Framing(FramingError::Codec(e))
    }
}

/// Errors raised by matchmaking handlers (C7) and resource limits (C6/C8).
#[derive(Debug)]
pub enum MatchmakingError {
    /// The user registry is full.
    RegistryFull,
    /// The identity is not present in the peer certificate directory.
    UnknownIdentity,
    /// The identity is already registered to another connection.
    IdentityTaken,
    /// A message arrived for a state that does not accept it.
    InvalidTransition,
    Channel(ChannelError),
}

impl Display for MatchmakingError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            MatchmakingError::RegistryFull => write!(f, "matchmaking error: user registry full"),
            MatchmakingError::UnknownIdentity => write!(f, "matchmaking error: unknown identity"),
            MatchmakingError::IdentityTaken => write!(f, "matchmaking error: identity already taken"),
            MatchmakingError::InvalidTransition => write!(f, "matchmaking error: invalid state transition"),
            MatchmakingError::Channel(ref e) => write!(f, "matchmaking error: {}", e),
        }
    }
}

impl StdError for MatchmakingError {}

impl From<ChannelError> for MatchmakingError {
    fn from(e: ChannelError) -> MatchmakingError {
        MatchmakingError::Channel(e)
    }
}

/// Errors raised by the user registry (C6).
#[derive(Debug)]
pub enum RegistryError {
    /// The registry already holds `MAX_USERS` entries.
    Full,
    /// No user record exists for the given identity or descriptor.
    NotFound,
    /// The identity is already registered to a live connection.
    AlreadyRegistered,
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            RegistryError::Full => write!(f, "registry error: registry is full"),
            RegistryError::NotFound => write!(f, "registry error: no such user"),
            RegistryError::AlreadyRegistered => write!(f, "registry error: identity already registered"),
        }
    }
}

impl StdError for RegistryError {}

/// Errors raised by the server dispatcher (C8).
#[derive(Debug)]
pub enum DispatchError {
    /// `mio` readiness polling failed.
    Io(io::Error),
    /// The bounded work queue rejected an item because it is full.
    QueueFull,
}

impl Display for DispatchError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            DispatchError::Io(ref e) => write!(f, "dispatch error: {}", e),
            DispatchError::QueueFull => write!(f, "dispatch error: work queue full"),
        }
    }
}

impl StdError for DispatchError {}

impl From<io::Error> for DispatchError {
    fn from(e: io::Error) -> DispatchError {
        DispatchError::Io(e)
    }
}

/// Top-level error unifying every component, used at the binary boundary.
#[derive(Debug)]
pub enum Error {
    Codec(CodecError),
    Framing(FramingError),
    Crypto(CryptoError),
    Channel(ChannelError),
    Matchmaking(MatchmakingError),
    Registry(RegistryError),
    Dispatch(DispatchError),
    Io(io::Error),
    /// A fatal configuration problem (bad path, malformed CA, etc).
    Config(String),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            Error::Codec(ref e) => write!(f, "{}", e),
            Error::Framing(ref e) => write!(f, "{}", e),
            Error::Crypto(ref e) => write!(f, "{}", e),
            Error::Channel(ref e) => write!(f, "{}", e),
            Error::Matchmaking(ref e) => write!(f, "{}", e),
            Error::Registry(ref e) => write!(f, "{}", e),
            Error::Dispatch(ref e) => write!(f, "{}", e),
            Error::Io(ref e) => write!(f, "io error: {}", e),
            Error::Config(ref s) => write!(f, "configuration error: {}", s),
        }
    }
}

impl StdError for Error {}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Error {
        Error::Codec(e)
    }
}
impl From<FramingError> for Error {
    fn from(e: FramingError) -> Error {
        Error::Framing(e)
    }
}
impl From<CryptoError> for Error {
    fn from(e: CryptoError) -> Error {
        Error::Crypto(e)
    }
}
impl From<ChannelError> for Error {
    fn from(e: ChannelError) -> Error {
        Error::Channel(e)
    }
}
impl From<MatchmakingError> for Error {
    fn from(e: MatchmakingError) -> Error {
        Error::Matchmaking(e)
    }
}
impl From<RegistryError> for Error {
    fn from(e: RegistryError) -> Error {
        Error::Registry(e)
    }
}
impl From<DispatchError> for Error {
    fn from(e: DispatchError) -> Error {
        Error::Dispatch(e)
    }
}
impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}
