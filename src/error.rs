use natpunch_core::endpoint::BindStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("decode: {0}")]
    Decode(String),
    #[error("encode: {0}")]
    Encode(String),
    #[error("bind port {port} failed: {status:?}")]
    BindFailed { port: u16, status: BindStatus },
    #[error("handshake with {node_id} timed out")]
    HandshakeTimeout { node_id: u32 },
    #[error("no parents to reach {node_id}")]
    NoParents { node_id: u32 },
    #[error("target {node_id} unknown to the rendezvous server")]
    UnknownTarget { node_id: u32 },
    #[error("client {client_id} is already moving")]
    AlreadyMoving { client_id: u32 },
    #[error("session with parent {parent} expired")]
    SessionExpired { parent: u32 },
    #[error("{node_id} is unreachable: {reason}")]
    Unreachable { node_id: u32, reason: String },
    #[error("invalid config: {0}")]
    Config(String),
    #[error(transparent)]
    Core(#[from] natpunch_core::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("shutdown")]
    Shutdown,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn decode(what: impl Into<String>) -> Self {
        Error::Decode(what.into())
    }

    pub(crate) fn encode(what: impl Into<String>) -> Self {
        Error::Encode(what.into())
    }
}
