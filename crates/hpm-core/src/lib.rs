//! HPM-Core: PICMG HPM.1 firmware upgrade engine in Rust.
//!
//! This crate drives an IPM Controller through the HPM.1 upgrade procedure:
//! image validation, capability negotiation, per-component version
//! comparison, block upload, activation and rollback follow-up.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Command codes, completion codes, request/response encoding
//! - **Transport**: IPMI channel abstraction (ipmitool, mock)
//! - **Envelope**: Retry and inaccessibility handling around every command
//! - **Image**: HPM.1 image container parsing and validation
//! - **State**: State machine and action record interpreter
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use hpm_core::session::{EngineConfig, UpgradeOptions, UpgradeSession};
//! use hpm_core::transport::IpmitoolTransport;
//!
//! let config = EngineConfig::default();
//! let transport = IpmitoolTransport::new(config.transport.clone());
//! let mut session = UpgradeSession::new(transport, config);
//!
//! let opts = UpgradeOptions { activate: true, ..Default::default() };
//! let report = session.upgrade_file(Path::new("ipmc.hpm"), &opts).expect("upgrade failed");
//! println!("{}", report);
//! ```

pub mod clock;
pub mod component;
pub mod envelope;
pub mod error;
pub mod events;
pub mod image;
pub mod poll;
pub mod protocol;
pub mod report;
pub mod session;
pub mod state;
pub mod target;
pub mod transport;
pub mod upload;
pub mod version;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use component::ComponentSet;
pub use error::{HpmError, Result};
pub use events::{HpmEvent, HpmObserver, NullObserver, PollKind, TracingObserver};
pub use image::{FirmwareImage, ImageBuilder, ImageError, ImageHeader};
pub use protocol::{CompletionCode, DeviceIdentity, TargetCapabilities};
pub use report::{ComponentResult, FinalStatus, UpgradeReport};
pub use session::{EngineConfig, UpgradeOptions, UpgradeSession};
pub use state::{UpgradeContext, UpgradeState};
pub use transport::{IpmiTransport, IpmitoolTransport, MockTransport, TransportError};
pub use version::{FwVersion, UpgradeDecision, VersionTable};
