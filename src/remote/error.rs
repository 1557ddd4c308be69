use crate::remote::ptid::ThreadId;
use std::fmt::{Display, Formatter};
use std::str::Utf8Error;
use std::string::FromUtf8Error;

/// Failure reply sent by the stub (`E<code>` or `E.<message>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Errno-like code, the meaning is stub specific.
    Code(u8),
    /// Human readable message.
    Message(String),
}

impl RemoteError {
    /// Parse an error reply. Return `None` if reply is not an error reply.
    pub fn parse(reply: &[u8]) -> Option<Self> {
        let rest = reply.strip_prefix(b"E")?;
        if let Some(msg) = rest.strip_prefix(b".") {
            return Some(RemoteError::Message(
                String::from_utf8_lossy(msg).into_owned(),
            ));
        }
        if rest.len() == 2 && rest.iter().all(u8::is_ascii_hexdigit) {
            let code = u8::from_str_radix(std::str::from_utf8(rest).ok()?, 16).ok()?;
            return Some(RemoteError::Code(code));
        }
        None
    }
}

impl Display for RemoteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteError::Code(code) => write!(f, "error code {code:#04x}"),
            RemoteError::Message(msg) => f.write_str(msg),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- transport errors ------------------------------------------
    #[error("remote link closed")]
    LinkClosed,
    #[error("remote link i/o: {0}")]
    IO(#[from] std::io::Error),
    #[error("serial line setup: {0}")]
    Termios(nix::Error),

    // --------------------------------- protocol errors -------------------------------------------
    #[error("packet checksum mismatch: expected {expected:#04x}, computed {computed:#04x}")]
    Checksum { expected: u8, computed: u8 },
    #[error("malformed packet: {0}")]
    MalformedPacket(String),
    #[error("packet lost after {0} attempts")]
    PacketLost(u32),
    #[error("unexpected reply to `{request}`: {reply}")]
    UnexpectedReply { request: String, reply: String },
    #[error("request of {size} bytes does not fit packet payload limit {limit}")]
    PacketTooLong { size: usize, limit: usize },
    #[error(transparent)]
    Utf8(#[from] Utf8Error),
    #[error(transparent)]
    FromUtf8(#[from] FromUtf8Error),

    // --------------------------------- capability errors -----------------------------------------
    #[error("remote target does not support `{0}`")]
    PacketUnsupported(&'static str),

    // --------------------------------- rejection errors ------------------------------------------
    #[error("remote failure reply: {0}")]
    PacketRejected(RemoteError),

    // --------------------------------- watchdog errors -------------------------------------------
    #[error("watchdog timeout has expired, target detached")]
    WatchdogTimeout,
    #[error("connection abandoned after unanswered interrupt")]
    Abandoned,

    // --------------------------------- engine errors ---------------------------------------------
    #[error("thread {0} not found")]
    ThreadNotFound(ThreadId),
    #[error("register {0} not found in architecture layout")]
    RegisterNotFound(u32),
    #[error("register {0} value is unavailable")]
    RegisterUnavailable(u32),
    #[error("target is running, operation requires a stopped target")]
    TargetRunning,
    #[error("target is not running")]
    TargetNotRunning,
    #[error("operation requires an extended-remote connection")]
    NotExtended,
    #[error("non-stop mode requested but not supported by the remote target")]
    NonStopUnsupported,
    #[error("memory range of {len} bytes at {addr:#x} exceeds the address space")]
    AddressOverflow { addr: u64, len: usize },
    #[error("memory transfer stopped after {transferred} bytes: {source}")]
    PartialTransfer {
        transferred: usize,
        #[source]
        source: Box<Error>,
    },
    #[error("configuration: {0}")]
    Config(#[from] toml::de::Error),
}

impl Error {
    /// Return a hint to a caller - continue using the session after error or drop it.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::LinkClosed => true,
            Error::IO(_) => true,
            Error::Termios(_) => true,
            Error::WatchdogTimeout => true,
            Error::Abandoned => true,
            Error::PartialTransfer { source, .. } => source.is_fatal(),

            Error::Checksum { .. } => false,
            Error::MalformedPacket(_) => false,
            Error::PacketLost(_) => false,
            Error::UnexpectedReply { .. } => false,
            Error::PacketTooLong { .. } => false,
            Error::Utf8(_) => false,
            Error::FromUtf8(_) => false,
            Error::PacketUnsupported(_) => false,
            Error::PacketRejected(_) => false,
            Error::ThreadNotFound(_) => false,
            Error::RegisterNotFound(_) => false,
            Error::RegisterUnavailable(_) => false,
            Error::TargetRunning => false,
            Error::TargetNotRunning => false,
            Error::NotExtended => false,
            Error::NonStopUnsupported => false,
            Error::AddressOverflow { .. } => false,
            Error::Config(_) => false,
        }
    }

    pub(crate) fn malformed(what: impl Into<String>) -> Self {
        Error::MalformedPacket(what.into())
    }

    pub(crate) fn unexpected(request: &[u8], reply: &[u8]) -> Self {
        Error::UnexpectedReply {
            request: String::from_utf8_lossy(request).into_owned(),
            reply: String::from_utf8_lossy(reply).into_owned(),
        }
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "remote", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "remote", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
