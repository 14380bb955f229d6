//! IPMI transport layer abstraction.
//!
//! Defines the `IpmiTransport` trait for command/response exchange with the
//! controller, allowing different implementations (ipmitool, mock, etc.).

use std::fmt;

use thiserror::Error;

use crate::protocol::CompletionCode;

#[derive(Error, Debug)]
pub enum TransportError {
    /// The request went out but nothing came back.
    #[error("No response from target")]
    NoResponse,

    #[error("Failed to open channel: {0}")]
    OpenFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Channel closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Family of the underlying channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// IPMI over LAN / LAN+ sessions.
    Lan,
    /// System interface (KCS, open driver) or IPMB.
    Local,
}

/// A raw IPMI request.
#[derive(Clone, PartialEq, Eq)]
pub struct IpmiRequest {
    pub netfn: u8,
    pub cmd: u8,
    pub data: Vec<u8>,
}

impl IpmiRequest {
    pub fn new(netfn: u8, cmd: u8, data: Vec<u8>) -> Self {
        Self { netfn, cmd, data }
    }
}

impl fmt::Debug for IpmiRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IpmiRequest(netfn=0x{:02X} cmd=0x{:02X} len={})",
            self.netfn,
            self.cmd,
            self.data.len()
        )
    }
}

/// A raw IPMI response. `data` excludes the completion code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpmiResponse {
    pub ccode: CompletionCode,
    pub data: Vec<u8>,
}

impl IpmiResponse {
    pub fn new(ccode: impl Into<CompletionCode>, data: Vec<u8>) -> Self {
        Self {
            ccode: ccode.into(),
            data,
        }
    }

    /// Response carrying only a completion code.
    pub fn code(ccode: impl Into<CompletionCode>) -> Self {
        Self::new(ccode, Vec::new())
    }
}

/// Abstract IPMI transport interface.
///
/// The engine owns the channel exclusively for the whole upgrade and keeps
/// exactly one command outstanding.
pub trait IpmiTransport: Send + Sync {
    /// Send a request and block until the response arrives.
    ///
    /// Returns `TransportError::NoResponse` when the target did not answer.
    fn send_recv(&self, req: &IpmiRequest) -> Result<IpmiResponse, TransportError>;

    /// Channel family, used to pick the no-response compensation.
    fn channel_kind(&self) -> ChannelKind;

    /// Largest request payload (netfn/cmd excluded) the channel can carry.
    fn max_request_size(&self) -> usize;

    /// Whether the target is the controller at the end of the channel rather
    /// than a bridged one.
    fn is_directly_attached(&self) -> bool {
        true
    }

    /// Close and reopen the channel after the target dropped the session.
    fn reopen(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
