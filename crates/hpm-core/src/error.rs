//! Engine-level error type.

use thiserror::Error;

use crate::component::ComponentSet;
use crate::image::ImageError;
use crate::image::validate::CompatError;
use crate::protocol::CompletionCode;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum HpmError {
    #[error("Image file not found: {path}")]
    FileNotFound { path: String },

    #[error("Failed to read image {path}: {source}")]
    ReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image error: {0}")]
    Image(#[from] ImageError),

    #[error("Target not compatible with image: {0}")]
    Incompatible(#[from] CompatError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("No response to command 0x{cmd:02X} (netfn 0x{netfn:02X})")]
    NoResponse { netfn: u8, cmd: u8 },

    #[error("Command 0x{cmd:02X} failed with completion code {code}")]
    DeviceError { cmd: u8, code: CompletionCode },

    #[error("Malformed response to command 0x{cmd:02X}: expected {expected} bytes, got {actual}")]
    MalformedResponse {
        cmd: u8,
        expected: usize,
        actual: usize,
    },

    #[error("Component {0} is not supported by the target")]
    UnsupportedComponent(u8),

    #[error("Unsupported component property selector 0x{0:02X}")]
    UnsupportedSelector(u8),

    #[error("Backup not supported by components {0}")]
    BackupUnsupported(ComponentSet),

    #[error("Preparation not supported by components {0}")]
    PreparationUnsupported(ComponentSet),

    #[error("Channel request size {max_request} leaves no room for block data")]
    RequestSizeTooSmall { max_request: usize },

    #[error("Block {block} rejected at every block size")]
    BufferTooSmall { block: u8 },

    #[error("Upload of component {component} failed at block {block}: {code}")]
    UploadFailed {
        component: u8,
        block: u8,
        code: CompletionCode,
    },

    #[error("{operation} did not complete within {secs}s")]
    Timeout { operation: &'static str, secs: u64 },

    #[error("Firmware activation failed: {code}")]
    ActivationFailed { code: CompletionCode },

    #[error("Self-test failed: result 0x{result:02X} detail 0x{detail:02X}")]
    SelfTestFailed { result: u8, detail: u8 },

    #[error("Rollback failed: {code}")]
    RollbackFailed { code: CompletionCode },

    #[error("Target does not support manual rollback")]
    ManualRollbackUnsupported,

    #[error("Upgrade aborted: {0}")]
    Aborted(String),
}

impl HpmError {
    /// Long-duration timeouts open the door to a rollback-status follow-up.
    pub fn is_timeout(&self) -> bool {
        matches!(self, HpmError::Timeout { .. })
    }
}

pub type Result<T, E = HpmError> = std::result::Result<T, E>;
