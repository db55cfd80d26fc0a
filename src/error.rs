#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    ConnectFailed,
    BindFailed,
    NotConnected,
    SendFailed,
    RecvFailed,
    FrameTooLong,
    MalformedMessage,
    TransactionPending,
    ConnectionClosed,
    InvalidArgument,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub msg: String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, msg: String) -> Self {
        Self { kind, msg }
    }

    #[must_use]
    pub fn kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            msg: String::default(),
        }
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::kind(kind)
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(value: std::num::TryFromIntError) -> Self {
        Self {
            kind: ErrorKind::InvalidArgument,
            msg: value.to_string(),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.msg.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            write!(f, "{:?}: {}", self.kind, self.msg)
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
