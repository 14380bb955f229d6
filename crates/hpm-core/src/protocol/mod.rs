//! Protocol module - HPM.1 command set definitions.

pub mod completion;
pub mod constants;
pub mod messages;

pub use completion::CompletionCode;
pub use constants::*;
pub use messages::{
    BlockResync, ComponentProperty, DeviceIdentity, GeneralProperties, GlobalCapabilities,
    PropertySelector, RollbackSupport, SelfTestResult, TargetCapabilities, TargetTimeouts,
    UpgradeAction, UpgradeStatus,
};
