//! Upgrade session - high-level orchestrator for the HPM.1 procedure.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::envelope::Envelope;
use crate::error::{HpmError, Result};
use crate::events::{HpmEvent, HpmObserver, PollKind, TracingObserver};
use crate::image::{
    FirmwareImage, ImageCapabilities, ImageHeader, validate_device_compatibility,
};
use crate::poll::{send_and_wait, wait_for_completion};
use crate::protocol::constants::*;
use crate::protocol::messages;
use crate::protocol::{
    CompletionCode, ComponentProperty, DeviceIdentity, GlobalCapabilities, PropertySelector,
    SelfTestResult, TargetCapabilities, UpgradeStatus,
};
use crate::report::{ComponentResult, UpgradeReport};
use crate::state::actions::{execute_records, interpret_records};
use crate::state::machine::{UpgradeContext, UpgradeState};
use crate::target::{
    get_component_properties, get_device_identity, get_target_capabilities, read_component,
    read_versions,
};
use crate::transport::{IpmiTransport, IpmitoolConfig};
use crate::version::{UpgradeDecision, VersionTable};

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Inaccessibility timeout used before target capabilities are known.
    pub inaccess_timeout_secs: u64,
    /// Upgrade timeout used before target capabilities are known.
    pub upgrade_timeout_secs: u64,
    /// Delay between status polls; never below 100 ms.
    pub poll_interval_ms: u64,
    /// Resends of one block allowed for transient completion codes.
    pub upload_retry_limit: u32,
    /// Block shrinks synthesized for a silent LAN target.
    pub lan_resize_limit: u32,
    /// Synthesize completion codes when a LAN target does not answer.
    pub compat_shims: bool,
    /// ipmitool channel settings.
    pub transport: IpmitoolConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            inaccess_timeout_secs: DEFAULT_INACCESS_TIMEOUT_SECS,
            upgrade_timeout_secs: DEFAULT_UPGRADE_TIMEOUT_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            upload_retry_limit: DEFAULT_UPLOAD_RETRY_LIMIT,
            lan_resize_limit: LAN_PACKET_RESIZE_LIMIT,
            compat_shims: true,
            transport: IpmitoolConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(DEFAULT_POLL_INTERVAL_MS))
    }
}

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct UpgradeOptions {
    /// Upgrade every component and tolerate identity mismatches.
    pub force: bool,
    /// Activate the new firmware after upload.
    pub activate: bool,
    /// Upload for comparison instead of upgrade.
    pub compare: bool,
    /// Decide and report, send nothing that changes the target.
    pub preview: bool,
    /// Restrict the run to one component.
    pub component: Option<u8>,
    /// Ask the target not to roll back automatically on activation.
    pub rollback_override: bool,
    /// Never ask the operator for confirmation.
    pub unattended: bool,
}

/// Result of a successful activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationOutcome {
    /// Status polls made while activation was in progress.
    pub polls: u32,
    pub self_test: Option<SelfTestResult>,
}

/// Target identity, capabilities and component versions.
#[derive(Debug, Clone)]
pub struct TargetSummary {
    pub identity: DeviceIdentity,
    pub capabilities: TargetCapabilities,
    pub versions: VersionTable,
}

/// Read an image file into memory.
pub fn load_image(path: &Path) -> Result<Vec<u8>> {
    info!(path = %path.display(), "Loading image");
    std::fs::read(path).map_err(|e| {
        let path = path.display().to_string();
        if e.kind() == io::ErrorKind::NotFound {
            HpmError::FileNotFound { path }
        } else {
            HpmError::ReadError { path, source: e }
        }
    })
}

/// Upgrade session - drives one target through the HPM.1 stages.
pub struct UpgradeSession<T: IpmiTransport, C: Clock, O: HpmObserver> {
    observer: Arc<O>,
    env: Envelope<T, C>,
}

impl<T: IpmiTransport> UpgradeSession<T, SystemClock, TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(transport: T, config: EngineConfig) -> Self {
        Self::with_observer(transport, SystemClock::new(), config, Arc::new(TracingObserver))
    }
}

impl<T: IpmiTransport, C: Clock, O: HpmObserver + 'static> UpgradeSession<T, C, O> {
    /// Create a new session with a custom clock and observer.
    pub fn with_observer(transport: T, clock: C, config: EngineConfig, observer: Arc<O>) -> Self {
        let shared: Arc<dyn HpmObserver> = observer.clone();
        Self {
            observer,
            env: Envelope::new(transport, clock, config, shared),
        }
    }

    pub fn envelope(&self) -> &Envelope<T, C> {
        &self.env
    }

    /// Load, validate and apply an image file.
    #[instrument(skip(self, opts))]
    pub fn upgrade_file(&mut self, path: &Path, opts: &UpgradeOptions) -> Result<UpgradeReport> {
        self.execute(|| load_image(path), opts)
    }

    /// Validate and apply an image already in memory.
    pub fn upgrade(&mut self, data: Vec<u8>, opts: &UpgradeOptions) -> Result<UpgradeReport> {
        self.execute(move || Ok(data), opts)
    }

    fn execute(
        &mut self,
        load: impl FnOnce() -> Result<Vec<u8>>,
        opts: &UpgradeOptions,
    ) -> Result<UpgradeReport> {
        self.env.reset();
        self.env.set_target_timeouts(None);
        let mut ctx = UpgradeContext::new();

        match self.run_stages(load, &mut ctx, opts) {
            Ok(()) => {
                let report = UpgradeReport::from_context(&ctx);
                info!(status = %report.status, "Upgrade run finished");
                Ok(report)
            }
            Err(e) => {
                let terminal = match e {
                    HpmError::Aborted(_) | HpmError::Incompatible(_) => UpgradeState::Aborted,
                    _ => UpgradeState::Failed,
                };
                error!(error = %e, state = %ctx.state, "Upgrade run stopped");
                ctx.goto_state(terminal, self.observer.as_ref());
                Err(e)
            }
        }
    }

    fn run_stages(
        &mut self,
        load: impl FnOnce() -> Result<Vec<u8>>,
        ctx: &mut UpgradeContext,
        opts: &UpgradeOptions,
    ) -> Result<()> {
        let data = load()?;
        ctx.goto_state(UpgradeState::ImageLoaded, self.observer.as_ref());

        let image = Arc::new(FirmwareImage::from_bytes(data)?);
        info!(len = image.len(), components = %image.header().components, "Image validated");
        ctx.image = Some(Arc::clone(&image));
        ctx.goto_state(UpgradeState::IntegrityValidated, self.observer.as_ref());

        self.prepare(&image, ctx, opts)?;
        ctx.goto_state(UpgradeState::Prepared, self.observer.as_ref());

        ctx.update_mask = interpret_records(&image, ctx, opts, self.observer.as_ref())?;

        if opts.preview {
            for (id, info) in ctx.versions.iter().filter(|(_, i)| i.decision.is_some()) {
                let result = match info.decision {
                    Some(UpgradeDecision::Upgrade) => ComponentResult::Previewed,
                    _ => ComponentResult::Skipped,
                };
                ctx.results[id as usize] = Some(result);
            }
            info!(update_mask = %ctx.update_mask, "Preview only, nothing sent");
            return Ok(());
        }

        execute_records(&mut self.env, &image, ctx, opts)?;
        ctx.goto_state(UpgradeState::Uploaded, self.observer.as_ref());

        let mask = ctx.update_mask;
        if mask.is_empty() {
            info!("All components up to date, nothing to activate");
        } else if opts.activate && !opts.compare {
            ctx.goto_state(UpgradeState::Activating, self.observer.as_ref());
            let caps = ctx.capabilities.unwrap_or_default();
            let rollback_capable = ctx.lacking(mask, |p| p.rollback_supported()) != mask;
            let outcome = self.activation_stage(
                &caps,
                Some(image.header()),
                rollback_capable,
                opts.rollback_override,
            )?;
            ctx.activation_polls = Some(outcome.polls);
            ctx.goto_state(UpgradeState::Activated, self.observer.as_ref());
        } else if !opts.compare {
            info!("Firmware uploaded; activation deferred");
        }

        self.observer.on_event(&HpmEvent::Complete { components: mask });
        Ok(())
    }

    /// Negotiate with the target and read every image component.
    #[instrument(skip_all)]
    fn prepare(
        &mut self,
        image: &FirmwareImage,
        ctx: &mut UpgradeContext,
        opts: &UpgradeOptions,
    ) -> Result<()> {
        let identity = get_device_identity(&mut self.env)?;
        let caps = get_target_capabilities(&mut self.env)?;
        ctx.identity = Some(identity);
        ctx.capabilities = Some(caps);
        self.env.set_target_timeouts(Some(caps.timeouts));

        let header = image.header();
        if let Err(issues) = validate_device_compatibility(header, &identity) {
            for issue in &issues {
                warn!("{}", issue);
                self.observer.on_event(&HpmEvent::CompatibilityIssue {
                    message: issue.to_string(),
                });
            }
            if opts.force || opts.preview {
                warn!("Continuing despite identity mismatch");
            } else if !opts.unattended
                && self
                    .observer
                    .confirm("The image does not match the target. Continue anyway?")
            {
                info!("Operator accepted identity mismatch");
            } else if let Some(first) = issues.into_iter().next() {
                return Err(HpmError::Incompatible(first));
            }
        }

        for id in header.components.iter() {
            if !caps.components.contains(id) {
                warn!(component = id, "Image component not supported by target");
                continue;
            }
            let snapshot = read_component(&mut self.env, caps.components, id)?;
            ctx.properties[id as usize] = Some(snapshot.general);
            if let Some(info) = ctx.versions.get_mut(id) {
                snapshot.apply_to(info);
                info.in_image = true;
            }
        }
        Ok(())
    }

    /// Timeout for a wait advertised by both target and image, in 5 s units.
    fn long_timeout(&self, target_units: u8, image_units: u8) -> Duration {
        match target_units.max(image_units) {
            0 => self.env.upgrade_timeout(),
            units => Duration::from_secs(units as u64 * TIMEOUT_UNIT_SECS),
        }
    }

    fn activation_stage(
        &mut self,
        caps: &TargetCapabilities,
        header: Option<&ImageHeader>,
        rollback_capable: bool,
        rollback_override: bool,
    ) -> Result<ActivationOutcome> {
        info!(rollback_override, "Activating firmware");
        let req = messages::activate_firmware(rollback_override);
        let timeout = self.env.upgrade_timeout();

        let result = match send_and_wait(&mut self.env, &req, PollKind::Activation, timeout) {
            Ok(outcome) if outcome.code.is_success() => {
                self.verify_self_test(caps, header)
                    .map(|self_test| ActivationOutcome {
                        polls: outcome.polls,
                        self_test,
                    })
            }
            Ok(outcome) => Err(HpmError::ActivationFailed { code: outcome.code }),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            let follow_up = matches!(
                e,
                HpmError::ActivationFailed { .. } | HpmError::SelfTestFailed { .. }
            ) || e.is_timeout();
            if follow_up && caps.global.contains(GlobalCapabilities::AUTO_ROLLBACK) && rollback_capable
            {
                self.follow_rollback(caps, header);
            }
        }
        result
    }

    fn verify_self_test(
        &mut self,
        caps: &TargetCapabilities,
        header: Option<&ImageHeader>,
    ) -> Result<Option<SelfTestResult>> {
        let image_self_test =
            header.is_some_and(|h| h.capabilities.contains(ImageCapabilities::SELF_TEST));
        if !caps.global.contains(GlobalCapabilities::SELF_TEST) && !image_self_test {
            return Ok(None);
        }

        let timeout = self.long_timeout(
            caps.timeouts.self_test,
            header.map(|h| h.self_test_timeout).unwrap_or(0),
        );
        info!(timeout = ?timeout, "Waiting for self-test");
        let outcome = wait_for_completion(&mut self.env, PollKind::SelfTest, timeout)?;
        if !outcome.code.is_success() {
            warn!(code = %outcome.code, "Upgrade status before self-test");
        }

        let result = self.selftest_result()?;
        if !result.passed() {
            error!(
                result = %format!("0x{:02X}", result.result),
                detail = %format!("0x{:02X}", result.detail),
                "Self-test failed"
            );
            return Err(HpmError::SelfTestFailed {
                result: result.result,
                detail: result.detail,
            });
        }
        info!("Self-test passed");
        Ok(Some(result))
    }

    /// Report the outcome of an automatic rollback. Never fails the caller.
    fn follow_rollback(&mut self, caps: &TargetCapabilities, header: Option<&ImageHeader>) {
        let timeout = self.long_timeout(
            caps.timeouts.rollback,
            header.map(|h| h.rollback_timeout).unwrap_or(0),
        );
        warn!(timeout = ?timeout, "Waiting for automatic rollback");
        match wait_for_completion(&mut self.env, PollKind::Rollback, timeout) {
            Ok(outcome) => {
                self.observer
                    .on_event(&HpmEvent::RollbackStatus { code: outcome.code });
                if outcome.code.is_success() {
                    info!("Automatic rollback completed");
                } else {
                    error!(code = %outcome.code, "Automatic rollback failed");
                }
            }
            Err(e) => error!(error = %e, "Rollback status unavailable"),
        }
    }

    /// Validate an image without touching the target.
    pub fn check_image(data: Vec<u8>) -> Result<FirmwareImage> {
        Ok(FirmwareImage::from_bytes(data)?)
    }

    /// Identity, capabilities and versions of every supported component.
    #[instrument(skip(self))]
    pub fn target_summary(&mut self) -> Result<TargetSummary> {
        let identity = get_device_identity(&mut self.env)?;
        let capabilities = self.negotiate()?;
        let versions = read_versions(&mut self.env, &capabilities)?;
        Ok(TargetSummary {
            identity,
            capabilities,
            versions,
        })
    }

    fn negotiate(&mut self) -> Result<TargetCapabilities> {
        let caps = get_target_capabilities(&mut self.env)?;
        self.env.set_target_timeouts(Some(caps.timeouts));
        Ok(caps)
    }

    pub fn target_capabilities(&mut self) -> Result<TargetCapabilities> {
        self.negotiate()
    }

    pub fn component_properties(&mut self, component: u8, selector: u8) -> Result<ComponentProperty> {
        let selector = PropertySelector::from_byte(selector)?;
        let caps = self.negotiate()?;
        get_component_properties(&mut self.env, Some(caps.components), component, selector)
    }

    pub fn abort(&mut self) -> Result<()> {
        self.env.command(&messages::abort_upgrade())?;
        info!("Upgrade aborted");
        Ok(())
    }

    pub fn upgrade_status(&mut self) -> Result<UpgradeStatus> {
        let rsp = self.env.command(&messages::get_upgrade_status())?;
        UpgradeStatus::parse(&rsp.data)
    }

    /// Activate whatever firmware the target holds, then verify it.
    #[instrument(skip(self))]
    pub fn activate(&mut self, rollback_override: bool) -> Result<ActivationOutcome> {
        let caps = self.negotiate()?;
        self.activation_stage(&caps, None, true, rollback_override)
    }

    /// Manual Firmware Rollback, waiting for it to finish.
    #[instrument(skip(self))]
    pub fn manual_rollback(&mut self) -> Result<CompletionCode> {
        let caps = self.negotiate()?;
        if !caps.global.contains(GlobalCapabilities::MANUAL_ROLLBACK) {
            return Err(HpmError::ManualRollbackUnsupported);
        }
        let timeout = self.long_timeout(caps.timeouts.rollback, 0);
        let outcome = send_and_wait(
            &mut self.env,
            &messages::manual_firmware_rollback(),
            PollKind::Rollback,
            timeout,
        )?;
        self.observer
            .on_event(&HpmEvent::RollbackStatus { code: outcome.code });
        if !outcome.code.is_success() {
            return Err(HpmError::RollbackFailed { code: outcome.code });
        }
        info!("Manual rollback completed");
        Ok(outcome.code)
    }

    /// Single Query Rollback Status.
    pub fn rollback_status(&mut self) -> Result<CompletionCode> {
        let rsp = self.env.send(&messages::query_rollback_status())?;
        self.observer.on_event(&HpmEvent::RollbackStatus { code: rsp.ccode });
        Ok(rsp.ccode)
    }

    pub fn selftest_result(&mut self) -> Result<SelfTestResult> {
        let rsp = self.env.command(&messages::query_selftest_result())?;
        let result = SelfTestResult::parse(&rsp.data)?;
        self.observer.on_event(&HpmEvent::SelfTestResult {
            result: result.result,
            detail: result.detail,
        });
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::clock::ManualClock;
    use crate::component::ComponentSet;
    use crate::events::NullObserver;
    use crate::image::ImageBuilder;
    use crate::image::builder::reseal;
    use crate::image::{CompatError, ImageError};
    use crate::report::FinalStatus;
    use crate::transport::{IpmiResponse, MockReply, MockTransport};
    use crate::version::FwVersion;

    const V1: FwVersion = FwVersion::new(1, 0, [0, 0, 0, 1]);
    const V2: FwVersion = FwVersion::new(2, 0, [0, 0, 0, 1]);

    /// Scripted IPMC answering every HPM.1 command.
    #[derive(Clone)]
    struct SimTarget {
        components: u8,
        global: u8,
        general: [u8; 8],
        active: [FwVersion; 8],
        /// Status polls answered "in progress" after Activate Firmware.
        activation_polls: u32,
        finish_code: u8,
        selftest: u8,
        /// Direct answer to Activate Firmware when not in progress.
        activate_code: u8,
    }

    impl Default for SimTarget {
        fn default() -> Self {
            Self {
                components: 0x03,
                global: 0x00,
                general: [0; 8],
                active: [V1; 8],
                activation_polls: 0,
                finish_code: CC_SUCCESS,
                selftest: SELFTEST_PASSED,
                activate_code: CC_SUCCESS,
            }
        }
    }

    impl SimTarget {
        fn install(self, mock: &MockTransport) {
            let mut pending = 0u32;
            mock.set_responder(move |req| {
                let ok = |data: Vec<u8>| MockReply::Response(IpmiResponse::new(0x00, data));
                match (req.netfn, req.cmd) {
                    (NETFN_APP, CMD_GET_DEVICE_ID) => ok(vec![
                        0x12, 0x01, 0x02, 0x10, 0x02, 0x00, 0x5A, 0x31, 0x00, 0x34, 0x12,
                    ]),
                    (_, CMD_GET_TARGET_UPG_CAPABILITIES) => ok(vec![
                        0x00,
                        0x01,
                        self.global,
                        self.components,
                        0x0C,
                        0x0C,
                        0x0C,
                        0x0C,
                    ]),
                    (_, CMD_GET_COMPONENT_PROPERTIES) => {
                        let id = req.data[1] as usize;
                        match req.data[2] {
                            SELECTOR_GENERAL => ok(vec![0x00, self.general[id]]),
                            SELECTOR_CURRENT_VERSION => {
                                let mut data = vec![0x00];
                                data.extend_from_slice(&self.active[id].to_bytes());
                                ok(data)
                            }
                            SELECTOR_DESCRIPTION => ok(vec![0x00, b'C', b'0' + id as u8, 0]),
                            _ => MockReply::Response(IpmiResponse::code(CC_INVALID_DATA_FIELD)),
                        }
                    }
                    (_, CMD_ACTIVATE_FIRMWARE) if self.activate_code != CC_SUCCESS => {
                        MockReply::Response(IpmiResponse::code(self.activate_code))
                    }
                    (_, CMD_ACTIVATE_FIRMWARE) if self.activation_polls > 0 => {
                        pending = self.activation_polls;
                        MockReply::Response(IpmiResponse::code(CC_COMMAND_IN_PROGRESS))
                    }
                    (_, CMD_GET_UPGRADE_STATUS) => {
                        let cc = if pending > 1 {
                            pending -= 1;
                            CC_COMMAND_IN_PROGRESS
                        } else {
                            pending = 0;
                            CC_SUCCESS
                        };
                        ok(vec![0x00, CMD_ACTIVATE_FIRMWARE, cc])
                    }
                    (_, CMD_FINISH_FIRMWARE_UPLOAD) => {
                        MockReply::Response(IpmiResponse::code(self.finish_code))
                    }
                    (_, CMD_QUERY_SELFTEST_RESULT) => ok(vec![0x00, self.selftest, 0x00]),
                    _ => ok(vec![0x00]),
                }
            });
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<HpmEvent>>,
        accept: bool,
    }

    impl RecordingObserver {
        fn states(&self) -> Vec<UpgradeState> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    HpmEvent::StateChanged { to, .. } => Some(*to),
                    _ => None,
                })
                .collect()
        }
    }

    impl HpmObserver for RecordingObserver {
        fn on_event(&self, event: &HpmEvent) {
            self.events.lock().unwrap().push(event.clone());
        }

        fn confirm(&self, _prompt: &str) -> bool {
            self.accept
        }
    }

    fn session<O: HpmObserver + 'static>(
        mock: &MockTransport,
        observer: Arc<O>,
    ) -> UpgradeSession<MockTransport, ManualClock, O> {
        UpgradeSession::with_observer(
            mock.clone(),
            ManualClock::new(),
            EngineConfig::default(),
            observer,
        )
    }

    fn two_component_image() -> Vec<u8> {
        ImageBuilder::new()
            .upload(0, V1, "BOOT", vec![0x11; 40])
            .upload(1, V2, "APP", vec![0x22; 50])
            .build()
    }

    #[test]
    fn test_skip_unchanged_update_changed() {
        let mock = MockTransport::new();
        SimTarget::default().install(&mock);
        let mut session = session(&mock, Arc::new(NullObserver));

        let report = session
            .upgrade(two_component_image(), &UpgradeOptions::default())
            .unwrap();

        assert_eq!(report.update_mask, ComponentSet::single(1));
        let c0 = report.component(0).unwrap();
        assert_eq!(c0.decision, Some(UpgradeDecision::Skip));
        assert_eq!(c0.result, Some(ComponentResult::Skipped));
        let c1 = report.component(1).unwrap();
        assert_eq!(c1.decision, Some(UpgradeDecision::Upgrade));
        assert_eq!(c1.result, Some(ComponentResult::Updated));

        let initiated = mock.requests_for(CMD_INITIATE_UPGRADE_ACTION);
        assert_eq!(initiated.len(), 1);
        assert_eq!(initiated[0].data, vec![0x00, 0x02, ACTION_UPLOAD_FOR_UPGRADE]);
        // 50 bytes in 23-byte blocks.
        assert_eq!(mock.requests_for(CMD_UPLOAD_FIRMWARE_BLOCK).len(), 3);
        assert_eq!(report.status, FinalStatus::Success);
        assert_eq!(report.final_state, UpgradeState::Uploaded);
        assert!(mock.requests_for(CMD_ACTIVATE_FIRMWARE).is_empty());
    }

    #[test]
    fn test_corrupted_signature_sends_nothing() {
        let mock = MockTransport::new();
        SimTarget::default().install(&mock);
        let observer = Arc::new(RecordingObserver::default());
        let mut session = session(&mock, observer.clone());

        let mut data = two_component_image();
        data[3] = b'?';
        reseal(&mut data);
        let err = session.upgrade(data, &UpgradeOptions::default()).unwrap_err();

        assert!(matches!(err, HpmError::Image(ImageError::InvalidSignature)));
        assert!(mock.requests().is_empty());
        assert_eq!(observer.states().last(), Some(&UpgradeState::Failed));
    }

    #[test]
    fn test_activation_polled_twice() {
        let mock = MockTransport::new();
        SimTarget {
            activation_polls: 2,
            ..Default::default()
        }
        .install(&mock);
        let mut session = session(&mock, Arc::new(NullObserver));

        let opts = UpgradeOptions {
            activate: true,
            ..Default::default()
        };
        let report = session.upgrade(two_component_image(), &opts).unwrap();
        assert_eq!(report.final_state, UpgradeState::Activated);
        assert_eq!(report.activation_polls, Some(2));
        assert_eq!(mock.requests_for(CMD_GET_UPGRADE_STATUS).len(), 2);
    }

    #[test]
    fn test_identity_mismatch_unattended_aborts() {
        let mock = MockTransport::new();
        SimTarget::default().install(&mock);
        let observer = Arc::new(RecordingObserver::default());
        let mut session = session(&mock, observer.clone());

        let data = ImageBuilder::new()
            .product_id(0x9999)
            .upload(1, V2, "APP", vec![0; 8])
            .build();
        let err = session.upgrade(data, &UpgradeOptions::default()).unwrap_err();
        assert!(matches!(err, HpmError::Incompatible(CompatError::ProductIdMismatch { .. })));
        assert_eq!(observer.states().last(), Some(&UpgradeState::Aborted));
        let reported = observer
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, HpmEvent::CompatibilityIssue { .. }))
            .count();
        assert_eq!(reported, 1);
        assert!(mock.requests_for(CMD_UPLOAD_FIRMWARE_BLOCK).is_empty());
    }

    #[test]
    fn test_identity_mismatch_confirmed() {
        let mock = MockTransport::new();
        SimTarget::default().install(&mock);
        let observer = Arc::new(RecordingObserver {
            accept: true,
            ..Default::default()
        });
        let mut session = session(&mock, observer);

        let data = ImageBuilder::new()
            .product_id(0x9999)
            .upload(1, V2, "APP", vec![0; 8])
            .build();
        let report = session.upgrade(data, &UpgradeOptions::default()).unwrap();
        assert_eq!(report.component(1).unwrap().result, Some(ComponentResult::Updated));
    }

    #[test]
    fn test_compare_mismatch() {
        let mock = MockTransport::new();
        SimTarget {
            finish_code: CC_COMPARE_MISMATCH,
            ..Default::default()
        }
        .install(&mock);
        let mut session = session(&mock, Arc::new(NullObserver));

        let opts = UpgradeOptions {
            compare: true,
            activate: true,
            ..Default::default()
        };
        let report = session.upgrade(two_component_image(), &opts).unwrap();
        assert_eq!(report.status, FinalStatus::ComparisonMismatch);
        assert_eq!(report.component(1).unwrap().result, Some(ComponentResult::Mismatch));
        let initiated = mock.requests_for(CMD_INITIATE_UPGRADE_ACTION);
        assert_eq!(initiated[0].data[2], ACTION_UPLOAD_FOR_COMPARE);
        assert!(mock.requests_for(CMD_ACTIVATE_FIRMWARE).is_empty());
    }

    #[test]
    fn test_preview_sends_no_upgrade_traffic() {
        let mock = MockTransport::new();
        SimTarget::default().install(&mock);
        let mut session = session(&mock, Arc::new(NullObserver));

        let opts = UpgradeOptions {
            preview: true,
            ..Default::default()
        };
        let report = session.upgrade(two_component_image(), &opts).unwrap();
        assert_eq!(report.component(1).unwrap().result, Some(ComponentResult::Previewed));
        assert_eq!(report.component(0).unwrap().result, Some(ComponentResult::Skipped));
        assert!(mock.requests_for(CMD_INITIATE_UPGRADE_ACTION).is_empty());
        assert!(mock.requests_for(CMD_UPLOAD_FIRMWARE_BLOCK).is_empty());
    }

    #[test]
    fn test_self_test_failure_follows_rollback() {
        let mock = MockTransport::new();
        let mut general = [0u8; 8];
        general[1] = 0x10;
        SimTarget {
            global: (GlobalCapabilities::SELF_TEST | GlobalCapabilities::AUTO_ROLLBACK).bits(),
            general,
            selftest: 0x57,
            ..Default::default()
        }
        .install(&mock);
        let mut session = session(&mock, Arc::new(NullObserver));

        let opts = UpgradeOptions {
            activate: true,
            ..Default::default()
        };
        let err = session.upgrade(two_component_image(), &opts).unwrap_err();
        assert!(matches!(err, HpmError::SelfTestFailed { result: 0x57, .. }));
        assert_eq!(mock.requests_for(CMD_QUERY_ROLLBACK_STATUS).len(), 1);
    }

    #[test]
    fn test_activate_rejected_in_present_state() {
        let mock = MockTransport::new();
        SimTarget {
            activate_code: CC_ILLEGAL_STATE,
            ..Default::default()
        }
        .install(&mock);
        let mut session = session(&mock, Arc::new(NullObserver));

        let err = session.activate(false).unwrap_err();
        assert!(matches!(
            err,
            HpmError::ActivationFailed { code } if code.value() == CC_ILLEGAL_STATE
        ));
        assert!(mock.requests_for(CMD_GET_UPGRADE_STATUS).is_empty());
        assert!(mock.requests_for(CMD_QUERY_ROLLBACK_STATUS).is_empty());
    }

    #[test]
    fn test_unsupported_backup_refused_before_upload() {
        let mock = MockTransport::new();
        SimTarget::default().install(&mock);
        let observer = Arc::new(RecordingObserver::default());
        let mut session = session(&mock, observer.clone());

        let data = ImageBuilder::new()
            .upload(0, V2, "BOOT", vec![0x11; 40])
            .backup(ComponentSet::single(0))
            .build();
        let err = session.upgrade(data, &UpgradeOptions::default()).unwrap_err();

        assert!(matches!(err, HpmError::BackupUnsupported(set) if set == ComponentSet::single(0)));
        assert!(mock.requests_for(CMD_INITIATE_UPGRADE_ACTION).is_empty());
        assert!(mock.requests_for(CMD_UPLOAD_FIRMWARE_BLOCK).is_empty());
        assert!(mock.requests_for(CMD_FINISH_FIRMWARE_UPLOAD).is_empty());
        assert_eq!(observer.states().last(), Some(&UpgradeState::Failed));
    }

    #[test]
    fn test_file_not_found() {
        let mock = MockTransport::new();
        let mut session = session(&mock, Arc::new(NullObserver));
        let err = session
            .upgrade_file(Path::new("/nonexistent/image.hpm"), &UpgradeOptions::default())
            .unwrap_err();
        assert!(matches!(err, HpmError::FileNotFound { .. }));
    }

    #[test]
    fn test_standalone_commands() {
        let mock = MockTransport::new();
        SimTarget::default().install(&mock);
        let mut session = session(&mock, Arc::new(NullObserver));

        session.abort().unwrap();
        assert!(session.rollback_status().unwrap().is_success());
        assert!(session.selftest_result().unwrap().passed());
        assert!(matches!(
            session.manual_rollback(),
            Err(HpmError::ManualRollbackUnsupported)
        ));
        assert!(matches!(
            session.component_properties(0, 0x07),
            Err(HpmError::UnsupportedSelector(0x07))
        ));
        let prop = session.component_properties(1, SELECTOR_DESCRIPTION).unwrap();
        assert_eq!(prop, ComponentProperty::Description("C1".to_string()));

        let summary = session.target_summary().unwrap();
        assert_eq!(summary.identity.product_id, 0x1234);
        assert_eq!(summary.versions.get(1).unwrap().active, Some(V1));
    }

    #[test]
    fn test_config_toml_round_trip() {
        let path = std::env::temp_dir().join(format!("hpm-config-{}.toml", std::process::id()));
        let config = EngineConfig {
            poll_interval_ms: 250,
            compat_shims: false,
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        let loaded = EngineConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.poll_interval(), Duration::from_millis(250));
        assert!(!loaded.compat_shims);
        assert_eq!(loaded.transport.interface, "open");
        assert_eq!(
            EngineConfig {
                poll_interval_ms: 10,
                ..Default::default()
            }
            .poll_interval(),
            Duration::from_millis(100)
        );
    }
}
