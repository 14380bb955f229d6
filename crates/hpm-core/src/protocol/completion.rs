//! Completion code classification.
//!
//! Every IPMI response carries a one-byte completion code. The upgrade engine
//! cares less about the individual value than about which family it belongs to:
//! terminal success, long-duration "in progress", transient inaccessibility,
//! node busy, or a block that was too large for the target.

use std::fmt;

use super::constants::*;

/// Completion code returned by the target.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionCode(u8);

impl CompletionCode {
    pub const SUCCESS: Self = Self(CC_SUCCESS);
    pub const IN_PROGRESS: Self = Self(CC_COMMAND_IN_PROGRESS);
    pub const TIMEOUT: Self = Self(CC_TIMEOUT);
    pub const INVALID_LENGTH: Self = Self(CC_REQ_DATA_INV_LENGTH);

    pub const fn new(code: u8) -> Self {
        Self(code)
    }

    /// Raw value.
    pub const fn value(&self) -> u8 {
        self.0
    }

    pub fn is_success(&self) -> bool {
        self.0 == CC_SUCCESS
    }

    /// Long-duration command still running.
    pub fn is_in_progress(&self) -> bool {
        self.0 == CC_COMMAND_IN_PROGRESS
    }

    /// Status read back by Get Upgrade Status while a long-duration command
    /// runs. Some local drivers report 0xD5 on the first poll.
    pub fn is_status_pending(&self) -> bool {
        matches!(self.0, CC_COMMAND_IN_PROGRESS | CC_ILLEGAL_STATE)
    }

    /// Target temporarily unreachable.
    pub fn is_inaccessible(&self) -> bool {
        matches!(
            self.0,
            CC_UNSPECIFIED_ERROR | CC_TIMEOUT | CC_DESTINATION_UNAVAILABLE
        )
    }

    pub fn is_node_busy(&self) -> bool {
        self.0 == CC_NODE_BUSY
    }

    /// Upload block rejected because of its size.
    pub fn is_block_too_large(&self) -> bool {
        matches!(self.0, CC_REQ_DATA_INV_LENGTH | CC_REQ_DATA_FIELD_EXCEED)
    }

    /// Codes for which an upload block may be resent unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self.0, CC_TIMEOUT | CC_DESTINATION_UNAVAILABLE)
    }

    /// Human readable description for logs.
    pub fn describe(&self) -> &'static str {
        match self.0 {
            CC_SUCCESS => "success",
            CC_COMMAND_IN_PROGRESS => "command in progress",
            CC_ROLLBACK_FAILURE => "rollback failure",
            CC_COMPARE_MISMATCH => "image mismatch",
            CC_NODE_BUSY => "node busy",
            CC_INVALID_COMMAND => "invalid command",
            CC_TIMEOUT => "timeout",
            CC_REQ_DATA_INV_LENGTH => "request data length invalid",
            CC_REQ_DATA_FIELD_EXCEED => "request data field length limit exceeded",
            CC_PARAM_OUT_OF_RANGE => "parameter out of range",
            CC_INVALID_DATA_FIELD => "invalid data field in request",
            CC_DESTINATION_UNAVAILABLE => "destination unavailable",
            CC_ILLEGAL_STATE => "command not supported in present state",
            CC_UNSPECIFIED_ERROR => "unspecified error",
            _ => "unknown",
        }
    }
}

impl From<u8> for CompletionCode {
    fn from(code: u8) -> Self {
        Self(code)
    }
}

impl fmt::Debug for CompletionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompletionCode(0x{:02X} '{}')", self.0, self.describe())
    }
}

impl fmt::Display for CompletionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X} ({})", self.0, self.describe())
    }
}
