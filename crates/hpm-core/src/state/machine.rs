//! State machine implementation for the upgrade run.

use std::fmt;
use std::sync::Arc;

use crate::component::ComponentSet;
use crate::events::{HpmEvent, HpmObserver};
use crate::image::FirmwareImage;
use crate::protocol::constants::MAX_COMPONENTS;
use crate::protocol::{DeviceIdentity, GeneralProperties, TargetCapabilities};
use crate::report::ComponentResult;
use crate::version::VersionTable;

/// Stage of an upgrade run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpgradeState {
    #[default]
    Idle,
    ImageLoaded,
    IntegrityValidated,
    /// Target negotiated and component properties read.
    Prepared,
    /// Uploading the given component.
    Uploading(u8),
    Uploaded,
    Activating,
    Activated,
    Failed,
    Aborted,
}

impl fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradeState::Idle => write!(f, "IDLE"),
            UpgradeState::ImageLoaded => write!(f, "IMAGE_LOADED"),
            UpgradeState::IntegrityValidated => write!(f, "INTEGRITY_VALIDATED"),
            UpgradeState::Prepared => write!(f, "PREPARED"),
            UpgradeState::Uploading(id) => write!(f, "UPLOADING({})", id),
            UpgradeState::Uploaded => write!(f, "UPLOADED"),
            UpgradeState::Activating => write!(f, "ACTIVATING"),
            UpgradeState::Activated => write!(f, "ACTIVATED"),
            UpgradeState::Failed => write!(f, "FAILED"),
            UpgradeState::Aborted => write!(f, "ABORTED"),
        }
    }
}

impl UpgradeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UpgradeState::Activated | UpgradeState::Failed | UpgradeState::Aborted
        )
    }
}

/// Runtime state of one upgrade run.
///
/// Created per invocation; dropping it releases the image buffer.
#[derive(Debug, Default)]
pub struct UpgradeContext {
    pub state: UpgradeState,
    pub image: Option<Arc<FirmwareImage>>,
    pub identity: Option<DeviceIdentity>,
    pub capabilities: Option<TargetCapabilities>,
    /// General properties per component, as read from the target.
    pub properties: [Option<GeneralProperties>; MAX_COMPONENTS as usize],
    /// Components selected for upgrade.
    pub update_mask: ComponentSet,
    pub current_component: Option<u8>,
    pub versions: VersionTable,
    pub results: [Option<ComponentResult>; MAX_COMPONENTS as usize],
    /// Status polls made while waiting for activation.
    pub activation_polls: Option<u32>,
}

impl UpgradeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transition to a new state.
    pub fn goto_state(&mut self, new_state: UpgradeState, observer: &dyn HpmObserver) {
        tracing::info!(from = %self.state, to = %new_state, "State transition");
        observer.on_event(&HpmEvent::StateChanged {
            from: self.state,
            to: new_state,
        });
        self.state = new_state;
    }

    pub fn properties(&self, component: u8) -> Option<&GeneralProperties> {
        self.properties.get(component as usize)?.as_ref()
    }

    /// Members of `set` whose properties fail `check`.
    pub fn lacking(&self, set: ComponentSet, check: impl Fn(&GeneralProperties) -> bool) -> ComponentSet {
        let mut missing = ComponentSet::EMPTY;
        for id in set.iter() {
            if !self.properties(id).is_some_and(&check) {
                missing.insert(id);
            }
        }
        missing
    }

    pub fn set_result(&mut self, component: u8, result: ComponentResult) {
        if let Some(slot) = self.results.get_mut(component as usize) {
            *slot = Some(result);
        }
    }

    pub fn result(&self, component: u8) -> Option<ComponentResult> {
        self.results.get(component as usize).copied().flatten()
    }
}
