use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::endpoint::Transport;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("{transport:?} port {port} is not bound")]
    NotBound { port: u16, transport: Transport },
    #[error("port {port} is already bound by {owner:?}")]
    PortConflict { port: u16, owner: Transport },
    #[error("bind {addr} failed: {reason}")]
    BindFailed { addr: SocketAddr, reason: String },
    #[error("connect to {addr} failed: {reason}")]
    ConnectFailed { addr: SocketAddr, reason: String },
    #[error("frame too large: len is {len} but the limit is {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("encode: {0}")]
    Encode(String),
    #[error("invalid nat descriptor: {field} = {value}")]
    InvalidNat { field: &'static str, value: u8 },
    #[error("truncated: need {need} bytes but {remaining} remain")]
    Truncated { need: usize, remaining: usize },
    #[error("endpoint is shut down")]
    Shutdown,
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;
