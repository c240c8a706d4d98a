use thiserror::Error;

/// Failure to turn one share link into a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("malformed uri: {0}")]
    MalformedUri(String),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid base64: {0}")]
    InvalidBase64(String),
    #[error("invalid json: {0}")]
    InvalidJson(String),
    #[error("duplicate name: {0}")]
    DuplicateName(String),
}

impl DecodeError {
    pub fn kind(&self) -> &'static str {
        match self {
            DecodeError::UnsupportedProtocol(_) => "UnsupportedProtocol",
            DecodeError::MalformedUri(_) => "MalformedURI",
            DecodeError::MissingField(_) => "MissingField",
            DecodeError::InvalidBase64(_) => "InvalidBase64",
            DecodeError::InvalidJson(_) => "InvalidJSON",
            DecodeError::DuplicateName(_) => "DuplicateName",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BundleError {
    #[error("no valid proxies found ({skipped} items skipped)")]
    NoValidProxies { skipped: usize },
}

/// Errors from the daemon's local control API.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control api unavailable: {0}")]
    Unavailable(String),
    #[error("control api protocol error: {0}")]
    Protocol(String),
    #[error("control api rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl ControlError {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlError::Unavailable(_) => "ControlUnavailable",
            ControlError::Protocol(_) => "ControlProtocolError",
            ControlError::Rejected { .. } => "ControlRejected",
        }
    }
}

impl From<reqwest::Error> for ControlError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ControlError::Protocol(e.to_string())
        } else {
            ControlError::Unavailable(e.to_string())
        }
    }
}

/// Per-name probe failure. Always surfaces as latency `-1` in results.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("unreachable")]
    Unreachable,
    #[error("failed to resolve {host}: {reason}")]
    ResolutionFailure { host: String, reason: String },
    #[error("no descriptor for proxy {0}")]
    UnknownProxy(String),
    #[error(transparent)]
    Control(#[from] ControlError),
}

impl ProbeError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeError::Unreachable => "Unreachable",
            ProbeError::ResolutionFailure { .. } => "ResolutionFailure",
            ProbeError::UnknownProxy(_) => "UnknownProxy",
            ProbeError::Control(e) => e.kind(),
        }
    }
}
