//! Target capability and component property queries.

use tracing::{debug, instrument};

use crate::clock::Clock;
use crate::component::ComponentSet;
use crate::envelope::Envelope;
use crate::error::{HpmError, Result};
use crate::protocol::constants::MAX_COMPONENTS;
use crate::protocol::messages;
use crate::protocol::{
    ComponentProperty, DeviceIdentity, GeneralProperties, PropertySelector, TargetCapabilities,
};
use crate::transport::IpmiTransport;
use crate::version::{FwVersion, VersionInfo, VersionTable};

/// Get Device ID.
#[instrument(level = "debug", skip(env))]
pub fn get_device_identity<T: IpmiTransport, C: Clock>(
    env: &mut Envelope<T, C>,
) -> Result<DeviceIdentity> {
    let rsp = env.command(&messages::get_device_id())?;
    let identity = DeviceIdentity::parse(&rsp.data)?;
    debug!(identity = %identity, "Target identity");
    Ok(identity)
}

/// Get Target Upgrade Capabilities.
#[instrument(level = "debug", skip(env))]
pub fn get_target_capabilities<T: IpmiTransport, C: Clock>(
    env: &mut Envelope<T, C>,
) -> Result<TargetCapabilities> {
    let rsp = env.command(&messages::get_target_capabilities())?;
    let caps = TargetCapabilities::parse(&rsp.data)?;
    debug!(components = %caps.components, global = ?caps.global, "Target capabilities");
    Ok(caps)
}

/// Get Component Properties for one component and selector.
///
/// With `supported` known, components outside it are rejected before any
/// traffic.
pub fn get_component_properties<T: IpmiTransport, C: Clock>(
    env: &mut Envelope<T, C>,
    supported: Option<ComponentSet>,
    component: u8,
    selector: PropertySelector,
) -> Result<ComponentProperty> {
    if component >= MAX_COMPONENTS || supported.is_some_and(|s| !s.contains(component)) {
        return Err(HpmError::UnsupportedComponent(component));
    }
    let rsp = env.command(&messages::get_component_properties(component, selector))?;
    ComponentProperty::parse(selector, &rsp.data)
}

/// Per-component properties and versions, as read from the target.
#[derive(Debug, Clone, Default)]
pub struct ComponentSnapshot {
    pub general: GeneralProperties,
    pub active: Option<FwVersion>,
    pub description: Option<String>,
    pub rollback: Option<FwVersion>,
    pub deferred: Option<FwVersion>,
}

/// Read general properties, description and versions of one component.
///
/// Rollback and deferred versions are only asked for when the component
/// advertises them; a target refusing either query leaves it unset.
pub fn read_component<T: IpmiTransport, C: Clock>(
    env: &mut Envelope<T, C>,
    supported: ComponentSet,
    component: u8,
) -> Result<ComponentSnapshot> {
    let supported = Some(supported);
    let mut snapshot = ComponentSnapshot::default();

    if let ComponentProperty::General(general) =
        get_component_properties(env, supported, component, PropertySelector::General)?
    {
        snapshot.general = general;
    }
    if let ComponentProperty::CurrentVersion(v) =
        get_component_properties(env, supported, component, PropertySelector::CurrentVersion)?
    {
        snapshot.active = Some(v);
    }
    if let ComponentProperty::Description(d) =
        get_component_properties(env, supported, component, PropertySelector::Description)?
    {
        snapshot.description = Some(d);
    }

    if snapshot.general.rollback_supported() {
        match get_component_properties(env, supported, component, PropertySelector::Rollback) {
            Ok(ComponentProperty::Rollback(v)) => snapshot.rollback = Some(v),
            Ok(_) => {}
            Err(HpmError::DeviceError { code, .. }) => {
                debug!(component, code = %code, "Rollback version unavailable");
            }
            Err(e) => return Err(e),
        }
    }
    if snapshot.general.deferred_activation() {
        match get_component_properties(env, supported, component, PropertySelector::Deferred) {
            Ok(ComponentProperty::Deferred(v)) => snapshot.deferred = Some(v),
            Ok(_) => {}
            Err(HpmError::DeviceError { code, .. }) => {
                debug!(component, code = %code, "Deferred version unavailable");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(snapshot)
}

impl ComponentSnapshot {
    /// Copy the target side of the snapshot into a version table entry.
    pub fn apply_to(&self, info: &mut VersionInfo) {
        info.active = self.active;
        info.rollback = self.rollback;
        info.deferred = self.deferred;
        info.target_description = self.description.clone();
        info.rollback_supported = self.general.rollback_supported();
        info.deferred_activation = self.general.deferred_activation();
    }
}

/// Version table for every component the target supports.
pub fn read_versions<T: IpmiTransport, C: Clock>(
    env: &mut Envelope<T, C>,
    caps: &TargetCapabilities,
) -> Result<VersionTable> {
    let mut table = VersionTable::new();
    for id in caps.components.iter() {
        let snapshot = read_component(env, caps.components, id)?;
        if let Some(info) = table.get_mut(id) {
            snapshot.apply_to(info);
        }
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::events::NullObserver;
    use crate::protocol::constants::*;
    use crate::session::EngineConfig;
    use crate::transport::{IpmiResponse, MockReply, MockTransport};

    fn envelope(mock: &MockTransport) -> Envelope<MockTransport, ManualClock> {
        Envelope::new(
            mock.clone(),
            ManualClock::new(),
            EngineConfig::default(),
            Arc::new(NullObserver),
        )
    }

    #[test]
    fn test_unsupported_component_no_traffic() {
        let mock = MockTransport::new();
        let mut env = envelope(&mock);
        let err = get_component_properties(
            &mut env,
            Some(ComponentSet::from_bits(0x01)),
            3,
            PropertySelector::General,
        )
        .unwrap_err();
        assert!(matches!(err, HpmError::UnsupportedComponent(3)));
        assert!(matches!(
            get_component_properties(&mut env, None, 8, PropertySelector::General),
            Err(HpmError::UnsupportedComponent(8))
        ));
        assert!(mock.requests().is_empty());
    }

    #[test]
    fn test_read_component_with_rollback() {
        let mock = MockTransport::new();
        mock.set_responder(|req| {
            let selector = req.data.get(2).copied().unwrap_or(0xFF);
            let data = match selector {
                SELECTOR_GENERAL => vec![0x00, 0x10],
                SELECTOR_CURRENT_VERSION => vec![0x00, 1, 2, 0, 0, 0, 3],
                SELECTOR_DESCRIPTION => {
                    let mut d = vec![0x00];
                    d.extend_from_slice(b"IPMC\0");
                    d
                }
                SELECTOR_ROLLBACK_VERSION => vec![0x00, 1, 1, 0, 0, 0, 0],
                _ => return MockReply::Response(IpmiResponse::code(CC_INVALID_DATA_FIELD)),
            };
            MockReply::Response(IpmiResponse::new(0x00, data))
        });

        let mut env = envelope(&mock);
        let snap = read_component(&mut env, ComponentSet::from_bits(0x01), 0).unwrap();
        assert_eq!(snap.active, Some(FwVersion::new(1, 2, [0, 0, 0, 3])));
        assert_eq!(snap.rollback, Some(FwVersion::new(1, 1, [0, 0, 0, 0])));
        assert_eq!(snap.description.as_deref(), Some("IPMC"));
        assert!(snap.deferred.is_none());
        assert_eq!(mock.requests_for(CMD_GET_COMPONENT_PROPERTIES).len(), 4);
    }

    #[test]
    fn test_device_error_surfaces() {
        let mock = MockTransport::new();
        mock.queue_code(CC_INVALID_COMMAND);
        let mut env = envelope(&mock);
        assert!(matches!(
            get_target_capabilities(&mut env),
            Err(HpmError::DeviceError { cmd: CMD_GET_TARGET_UPG_CAPABILITIES, .. })
        ));
    }
}
