use num_enum::{TryFromPrimitive, TryFromPrimitiveError};
use std::fmt;
use std::io::Error as IoError;
use std::string::String;
use yasna::ASN1Error;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RdpErrorKind {
    /// Unexpected data
    InvalidData,
    /// Respond from server or client is not valid
    InvalidRespond,
    /// Features not implemented
    NotImplemented,
    /// During connection sequence
    /// A security level is negotiated
    /// If no level can be defined a ProtocolNegFailure is emitted
    ProtocolNegFailure,
    /// Protocol automata transition is not expected
    InvalidAutomata,
    /// A security protocol
    /// selected was not handled
    InvalidProtocol,
    /// A wire value does not map to any known enum variant
    InvalidCast,
    /// During security exchange some
    /// checksum are computed
    InvalidChecksum,
    InvalidOptionalField,
    /// A declared length does not fit
    /// in the received buffer or in the frame capacity
    InvalidSize,
    /// TPKT header carries an unexpected version tag
    InvalidVersion,
    /// TPDU type code is not one of the known kinds
    UnknownPdu,
    /// Public key blob does not start with the RSA1 magic
    InvalidMagic,
    /// Declared modulus length is outside the accepted range
    InvalidModulusSize,
    /// Certificate or certificate chain is malformed
    InvalidCertificate,
    /// Some channel or user can be rejected
    /// by server during connection step
    RejectedByServer,
    /// Disconnect receive from server
    Disconnect,
    /// Indicate an unknown field
    Unknown,
    UnexpectedType,
}

/// ProtocolNegFailureCode defines the failure codes
/// for the RDP Negotiation Failure message (2.2.1.2.2).
/// It is sent by the server to inform the client of a failure
/// that has occurred while preparing security for the connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProtocolNegFailureCode {
    Unknown(u32),
    SslRequiredByServer,
    SslNotAllowedByServer,
    SslCertNotOnServer,
    InconsistentFlags,
    HybridRequiredByServer,
    SslWithUserAuthRequiredByServer,
}

impl ProtocolNegFailureCode {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => ProtocolNegFailureCode::SslRequiredByServer,
            2 => ProtocolNegFailureCode::SslNotAllowedByServer,
            3 => ProtocolNegFailureCode::SslCertNotOnServer,
            4 => ProtocolNegFailureCode::InconsistentFlags,
            5 => ProtocolNegFailureCode::HybridRequiredByServer,
            6 => ProtocolNegFailureCode::SslWithUserAuthRequiredByServer,
            code => ProtocolNegFailureCode::Unknown(code),
        }
    }

    /// Wire value of the failure code
    pub fn code(&self) -> u32 {
        match self {
            ProtocolNegFailureCode::SslRequiredByServer => 1,
            ProtocolNegFailureCode::SslNotAllowedByServer => 2,
            ProtocolNegFailureCode::SslCertNotOnServer => 3,
            ProtocolNegFailureCode::InconsistentFlags => 4,
            ProtocolNegFailureCode::HybridRequiredByServer => 5,
            ProtocolNegFailureCode::SslWithUserAuthRequiredByServer => 6,
            ProtocolNegFailureCode::Unknown(code) => *code,
        }
    }
}

impl fmt::Display for ProtocolNegFailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolNegFailureCode::SslRequiredByServer => write!(
                f,
                "the server requires that the client support enhanced RDP Security with TLS or CredSSP"
            ),
            ProtocolNegFailureCode::SslNotAllowedByServer => write!(
                f,
                "the server is configured to only use standard RDP security mechanisms"
            ),
            ProtocolNegFailureCode::SslCertNotOnServer => write!(
                f,
                "the server does not possess a valid authentication certificate"
            ),
            ProtocolNegFailureCode::InconsistentFlags => write!(
                f,
                "the list of requested security protocols is not consistent with the current security protocol in effect"
            ),
            ProtocolNegFailureCode::HybridRequiredByServer => write!(
                f,
                "the server requires that the client support enhanced RDP security with CredSSP"
            ),
            ProtocolNegFailureCode::SslWithUserAuthRequiredByServer => write!(
                f,
                "the server requires TLS with certificate-based client authentication"
            ),
            ProtocolNegFailureCode::Unknown(code) => {
                write!(f, "unknown negotiation failure {}", code)
            }
        }
    }
}

/// Step of the connection sequence in which a fatal error happened
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Phase {
    Framing,
    ChannelNegotiation,
    KeyExchange,
    Licensing,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Framing => "framing",
            Phase::ChannelNegotiation => "channel negotiation",
            Phase::KeyExchange => "key exchange",
            Phase::Licensing => "licensing",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct RdpError {
    /// Kind of error
    kind: RdpErrorKind,
    /// Associated message of the context
    message: String,
}

impl RdpError {
    /// create a new RDP error
    /// # Example
    /// ```
    /// use rdp::model::error::{RdpError, RdpErrorKind};
    /// let error = RdpError::new(RdpErrorKind::Disconnect, "disconnected");
    /// ```
    pub fn new(kind: RdpErrorKind, message: &str) -> Self {
        RdpError {
            kind,
            message: String::from(message),
        }
    }

    /// Return the kind of error
    ///
    /// # Example
    /// ```
    /// use rdp::model::error::{RdpError, RdpErrorKind};
    /// let error = RdpError::new(RdpErrorKind::Disconnect, "disconnected");
    /// assert_eq!(error.kind(), RdpErrorKind::Disconnect)
    /// ```
    pub fn kind(&self) -> RdpErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug)]
pub enum Error {
    /// RDP error
    RdpError(RdpError),
    /// All kind of IO error
    Io(IoError),
    /// SSL handshake error
    SslHandshakeError,
    /// SSL error
    SslError(String),
    /// ASN1 parser error
    ASN1Error(ASN1Error),
    /// try error
    TryError(String),
    // All kind of parse error
    FromError(String),
    /// Server refused every requested security protocol
    NegotiationFailure(ProtocolNegFailureCode),
    /// Fatal failure of the connection sequence
    Handshake { phase: Phase, cause: Box<Error> },
}

impl Error {
    /// Build an error from a kind and a context message
    pub fn rdp(kind: RdpErrorKind, message: &str) -> Self {
        Error::RdpError(RdpError::new(kind, message))
    }

    /// Kind of the underlying RDP error if any
    ///
    /// # Example
    /// ```
    /// use rdp::model::error::{Error, Phase, RdpErrorKind};
    /// let error = Error::rdp(RdpErrorKind::InvalidMagic, "bad magic").during(Phase::ChannelNegotiation);
    /// assert_eq!(error.kind(), Some(RdpErrorKind::InvalidMagic));
    /// assert_eq!(error.phase(), Some(Phase::ChannelNegotiation));
    /// ```
    pub fn kind(&self) -> Option<RdpErrorKind> {
        match self {
            Error::RdpError(e) => Some(e.kind()),
            Error::NegotiationFailure(_) => Some(RdpErrorKind::ProtocolNegFailure),
            Error::Handshake { cause, .. } => cause.kind(),
            _ => None,
        }
    }

    /// Phase of the connection sequence that failed
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Error::Handshake { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Tag the error with the phase in which it happened.
    /// An already tagged error keeps its original phase.
    pub fn during(self, phase: Phase) -> Self {
        match self {
            Error::Handshake { .. } => self,
            cause => Error::Handshake {
                phase,
                cause: Box::new(cause),
            },
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::RdpError(e) => write!(f, "{:?}: {}", e.kind(), e.message()),
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::SslHandshakeError => f.write_str("tls handshake error"),
            Error::SslError(e) => write!(f, "tls error: {}", e),
            Error::ASN1Error(e) => write!(f, "asn1 error: {:?}", e),
            Error::TryError(e) => write!(f, "conversion error: {}", e),
            Error::FromError(e) => write!(f, "parse error: {}", e),
            Error::NegotiationFailure(code) => write!(f, "negotiation failure: {}", code),
            Error::Handshake { phase, cause } => write!(f, "{} failed: {}", phase, cause),
        }
    }
}

impl std::error::Error for Error {}

/// From IO Error
impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

impl From<ASN1Error> for Error {
    fn from(e: ASN1Error) -> Error {
        Error::ASN1Error(e)
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Error {
        Error::SslError(e.to_string())
    }
}

impl<T: TryFromPrimitive> From<TryFromPrimitiveError<T>> for Error {
    fn from(_: TryFromPrimitiveError<T>) -> Self {
        Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidCast,
            "Invalid enum conversion",
        ))
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(err: std::num::TryFromIntError) -> Self {
        Error::TryError(err.to_string())
    }
}

pub type RdpResult<T> = Result<T, Error>;

/// Attach a connection phase to a fallible step
pub trait PhaseContext<T> {
    fn during(self, phase: Phase) -> RdpResult<T>;
}

impl<T> PhaseContext<T> for RdpResult<T> {
    fn during(self, phase: Phase) -> RdpResult<T> {
        self.map_err(|e| e.during(phase))
    }
}

/// Try options is waiting try trait for the next rust
#[macro_export]
macro_rules! try_option {
    ($val: expr, $expr: expr) => {
        if let Some(x) = $val {
            Ok(x)
        } else {
            Err($crate::model::error::Error::RdpError(
                $crate::model::error::RdpError::new(
                    $crate::model::error::RdpErrorKind::InvalidOptionalField,
                    $expr,
                ),
            ))
        }
    };
}
