// Network functions
pub const NETFN_APP: u8 = 0x06;
pub const NETFN_PICMG: u8 = 0x2C;

/// Every PICMG request and response payload starts with this identifier.
pub const PICMG_IDENTIFIER: u8 = 0x00;

// Application commands
pub const CMD_GET_DEVICE_ID: u8 = 0x01;

// HPM.1 upgrade commands
pub const CMD_GET_TARGET_UPG_CAPABILITIES: u8 = 0x2E;
pub const CMD_GET_COMPONENT_PROPERTIES: u8 = 0x2F;
pub const CMD_ABORT_UPGRADE: u8 = 0x30;
pub const CMD_INITIATE_UPGRADE_ACTION: u8 = 0x31;
pub const CMD_UPLOAD_FIRMWARE_BLOCK: u8 = 0x32;
pub const CMD_FINISH_FIRMWARE_UPLOAD: u8 = 0x33;
pub const CMD_GET_UPGRADE_STATUS: u8 = 0x34;
pub const CMD_ACTIVATE_FIRMWARE: u8 = 0x35;
pub const CMD_QUERY_SELFTEST_RESULT: u8 = 0x36;
pub const CMD_QUERY_ROLLBACK_STATUS: u8 = 0x37;
pub const CMD_MANUAL_FIRMWARE_ROLLBACK: u8 = 0x38;

// Completion codes
pub const CC_SUCCESS: u8 = 0x00;
pub const CC_COMMAND_IN_PROGRESS: u8 = 0x80;
pub const CC_ROLLBACK_FAILURE: u8 = 0x81;
pub const CC_COMPARE_MISMATCH: u8 = 0x83;
pub const CC_NODE_BUSY: u8 = 0xC0;
pub const CC_INVALID_COMMAND: u8 = 0xC1;
pub const CC_TIMEOUT: u8 = 0xC3;
pub const CC_REQ_DATA_INV_LENGTH: u8 = 0xC7;
pub const CC_REQ_DATA_FIELD_EXCEED: u8 = 0xC8;
pub const CC_PARAM_OUT_OF_RANGE: u8 = 0xC9;
pub const CC_INVALID_DATA_FIELD: u8 = 0xCC;
pub const CC_DESTINATION_UNAVAILABLE: u8 = 0xD3;
pub const CC_ILLEGAL_STATE: u8 = 0xD5;
pub const CC_UNSPECIFIED_ERROR: u8 = 0xFF;

// Initiate Upgrade Action codes
pub const ACTION_BACKUP: u8 = 0x00;
pub const ACTION_PREPARE: u8 = 0x01;
pub const ACTION_UPLOAD_FOR_UPGRADE: u8 = 0x02;
pub const ACTION_UPLOAD_FOR_COMPARE: u8 = 0x03;

// Get Component Properties selectors
pub const SELECTOR_GENERAL: u8 = 0x00;
pub const SELECTOR_CURRENT_VERSION: u8 = 0x01;
pub const SELECTOR_DESCRIPTION: u8 = 0x02;
pub const SELECTOR_ROLLBACK_VERSION: u8 = 0x03;
pub const SELECTOR_DEFERRED_VERSION: u8 = 0x04;
pub const SELECTOR_OEM_FIRST: u8 = 0xC0;

/// Self-test result byte meaning "no error".
pub const SELFTEST_PASSED: u8 = 0x55;

/// Activate Firmware rollback override policy: do not roll back on failure.
pub const ROLLBACK_OVERRIDE: u8 = 0x01;

/// PICMG identifier + block number.
pub const UPLOAD_BLOCK_HEADER_LEN: usize = 2;

/// Length of the component description string returned by the target.
pub const COMPONENT_DESC_LEN: usize = 12;

/// Stored timeouts are expressed in units of this many seconds.
pub const TIMEOUT_UNIT_SECS: u64 = 5;

pub const MAX_COMPONENTS: u8 = 8;

pub const DEFAULT_INACCESS_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_UPGRADE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_UPLOAD_RETRY_LIMIT: u32 = 3;
pub const LAN_PACKET_RESIZE_LIMIT: u32 = 6;
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 25;
