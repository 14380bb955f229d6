//! Transport resilience envelope.
//!
//! Every command of an upgrade run goes through [`Envelope::send`], which
//! retries inaccessible and busy targets within the negotiated timeouts and,
//! on LAN channels, papers over silent targets with synthesized completion
//! codes.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{HpmError, Result};
use crate::events::{HpmEvent, HpmObserver};
use crate::protocol::constants::*;
use crate::protocol::{CompletionCode, TargetTimeouts};
use crate::session::EngineConfig;
use crate::transport::{ChannelKind, IpmiRequest, IpmiResponse, IpmiTransport, TransportError};

/// Retry and timeout wrapper around one exclusively owned transport.
///
/// Counters live here, so they start fresh for every envelope.
pub struct Envelope<T: IpmiTransport, C: Clock> {
    transport: T,
    clock: C,
    observer: Arc<dyn HpmObserver>,
    config: EngineConfig,
    timeouts: Option<TargetTimeouts>,
    /// Block-size reductions synthesized for silent LAN uploads.
    resize_attempts: u32,
    /// At least one upload block went through.
    block_accepted: bool,
    retries: u32,
}

impl<T: IpmiTransport, C: Clock> Envelope<T, C> {
    pub fn new(transport: T, clock: C, config: EngineConfig, observer: Arc<dyn HpmObserver>) -> Self {
        Self {
            transport,
            clock,
            observer,
            config,
            timeouts: None,
            resize_attempts: 0,
            block_accepted: false,
            retries: 0,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn observer(&self) -> &dyn HpmObserver {
        self.observer.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn channel_kind(&self) -> ChannelKind {
        self.transport.channel_kind()
    }

    pub fn max_request_size(&self) -> usize {
        self.transport.max_request_size()
    }

    /// Use the target's advertised timeouts instead of the defaults.
    pub fn set_target_timeouts(&mut self, timeouts: Option<TargetTimeouts>) {
        self.timeouts = timeouts;
    }

    pub fn target_timeouts(&self) -> Option<TargetTimeouts> {
        self.timeouts
    }

    /// Forget per-run counters.
    pub fn reset(&mut self) {
        self.resize_attempts = 0;
        self.block_accepted = false;
        self.retries = 0;
    }

    pub fn mark_block_accepted(&mut self) {
        self.block_accepted = true;
    }

    /// Number of resends performed for inaccessible or busy targets.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn emit(&self, event: HpmEvent) {
        self.observer.on_event(&event);
    }

    pub fn poll_interval(&self) -> Duration {
        self.config.poll_interval()
    }

    pub fn upgrade_timeout(&self) -> Duration {
        let secs = self
            .timeouts
            .map(|t| t.upgrade_secs())
            .filter(|s| *s > 0)
            .unwrap_or(self.config.upgrade_timeout_secs);
        Duration::from_secs(secs)
    }

    pub fn inaccessibility_timeout(&self) -> Duration {
        let secs = self
            .timeouts
            .map(|t| t.inaccessibility_secs())
            .filter(|s| *s > 0)
            .unwrap_or(self.config.inaccess_timeout_secs);
        Duration::from_secs(secs)
    }

    /// Send a command, retrying while the target is inaccessible or busy.
    ///
    /// Returns the final response whatever its completion code.
    pub fn send(&mut self, req: &IpmiRequest) -> Result<IpmiResponse> {
        let start = self.clock.now();
        let inaccess = self.inaccessibility_timeout();
        let upgrade = self.upgrade_timeout();

        loop {
            let rsp = self.exchange(req)?;
            let elapsed = self.clock.now().saturating_sub(start);
            let code = rsp.ccode;

            let limit = if code.is_inaccessible() {
                inaccess
            } else if code.is_node_busy() {
                upgrade
            } else {
                return Ok(rsp);
            };
            if elapsed >= limit {
                warn!(cmd = %format!("0x{:02X}", req.cmd), code = %code, "Giving up after {:?}", elapsed);
                return Ok(rsp);
            }

            debug!(cmd = %format!("0x{:02X}", req.cmd), code = %code, "Target not ready, retrying");
            self.clock.sleep(self.poll_interval());
            self.retries += 1;
        }
    }

    /// Send a command that must complete successfully.
    pub fn command(&mut self, req: &IpmiRequest) -> Result<IpmiResponse> {
        let rsp = self.send(req)?;
        if !rsp.ccode.is_success() {
            return Err(HpmError::DeviceError {
                cmd: req.cmd,
                code: rsp.ccode,
            });
        }
        Ok(rsp)
    }

    /// One round trip, with the no-response compensation applied.
    fn exchange(&mut self, req: &IpmiRequest) -> Result<IpmiResponse> {
        self.emit(HpmEvent::CommandSent {
            netfn: req.netfn,
            cmd: req.cmd,
            length: req.data.len(),
        });

        let rsp = match self.transport.send_recv(req) {
            Ok(rsp) => rsp,
            Err(TransportError::NoResponse) => self.compensate(req)?,
            Err(e) => return Err(e.into()),
        };

        self.emit(HpmEvent::ResponseReceived {
            cmd: req.cmd,
            code: rsp.ccode,
            length: rsp.data.len(),
        });
        Ok(rsp)
    }

    /// Synthesize a completion code for a silent LAN target.
    fn compensate(&mut self, req: &IpmiRequest) -> Result<IpmiResponse> {
        let no_response = HpmError::NoResponse {
            netfn: req.netfn,
            cmd: req.cmd,
        };
        if !self.config.compat_shims
            || req.netfn != NETFN_PICMG
            || self.transport.channel_kind() != ChannelKind::Lan
        {
            return Err(no_response);
        }

        match req.cmd {
            CMD_UPLOAD_FIRMWARE_BLOCK => {
                if self.block_accepted || self.resize_attempts >= self.config.lan_resize_limit {
                    return Err(no_response);
                }
                self.resize_attempts += 1;
                warn!(attempt = self.resize_attempts, "No response to upload block, shrinking");
                Ok(IpmiResponse::code(CompletionCode::INVALID_LENGTH))
            }
            CMD_ACTIVATE_FIRMWARE | CMD_MANUAL_FIRMWARE_ROLLBACK => {
                debug!("No response during activation, assuming in progress");
                Ok(IpmiResponse::code(CompletionCode::IN_PROGRESS))
            }
            CMD_GET_UPGRADE_STATUS | CMD_QUERY_ROLLBACK_STATUS | CMD_QUERY_SELFTEST_RESULT
                if self.transport.is_directly_attached() =>
            {
                warn!("No response to status query, reopening session");
                self.transport.reopen()?;
                Ok(IpmiResponse::code(CompletionCode::TIMEOUT))
            }
            _ => Err(no_response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::NullObserver;
    use crate::protocol::messages;
    use crate::transport::MockTransport;

    fn envelope(mock: &MockTransport, clock: &ManualClock) -> Envelope<MockTransport, ManualClock> {
        Envelope::new(
            mock.clone(),
            clock.clone(),
            EngineConfig::default(),
            Arc::new(NullObserver),
        )
    }

    #[test]
    fn test_inaccessible_then_success() {
        let mock = MockTransport::new();
        let clock = ManualClock::new();
        for _ in 0..5 {
            mock.queue_code(CC_TIMEOUT);
        }
        mock.queue_response(0x00, &[0x00, 0x34, 0x00]);

        let mut env = envelope(&mock, &clock);
        let rsp = env.send(&messages::get_upgrade_status()).unwrap();
        assert!(rsp.ccode.is_success());
        assert_eq!(env.retries(), 5);
        assert_eq!(clock.sleep_count(), 5);
        assert_eq!(mock.requests().len(), 6);
    }

    #[test]
    fn test_inaccessible_until_timeout() {
        let mock = MockTransport::new();
        let clock = ManualClock::new();
        mock.set_responder(|_| crate::transport::MockReply::Response(IpmiResponse::code(0xFF)));

        let mut env = envelope(&mock, &clock);
        let err = env.command(&messages::get_upgrade_status()).unwrap_err();
        assert!(matches!(err, HpmError::DeviceError { code, .. } if code.value() == 0xFF));

        let timeout = env.inaccessibility_timeout();
        assert!(clock.now() >= timeout);
        assert!(clock.now() <= timeout + env.poll_interval());
    }

    #[test]
    fn test_node_busy_uses_upgrade_timeout() {
        let mock = MockTransport::new();
        let clock = ManualClock::new();
        mock.set_responder(|_| crate::transport::MockReply::Response(IpmiResponse::code(CC_NODE_BUSY)));

        let mut env = envelope(&mock, &clock);
        env.set_target_timeouts(Some(TargetTimeouts {
            upgrade: 2,
            self_test: 0,
            rollback: 0,
            inaccessibility: 12,
        }));
        let rsp = env.send(&messages::abort_upgrade()).unwrap();
        assert!(rsp.ccode.is_node_busy());
        assert!(clock.now() >= Duration::from_secs(10));
        assert!(clock.now() <= Duration::from_secs(10) + env.poll_interval());
    }

    #[test]
    fn test_lan_upload_silence_becomes_shrink() {
        let mock = MockTransport::lan();
        let clock = ManualClock::new();
        let mut env = envelope(&mock, &clock);

        for _ in 0..LAN_PACKET_RESIZE_LIMIT {
            let rsp = env.send(&messages::upload_firmware_block(0, &[0; 4])).unwrap();
            assert!(rsp.ccode.is_block_too_large());
        }
        assert!(matches!(
            env.send(&messages::upload_firmware_block(0, &[0; 4])),
            Err(HpmError::NoResponse { .. })
        ));
    }

    #[test]
    fn test_lan_upload_silence_after_accepted_block() {
        let mock = MockTransport::lan();
        let clock = ManualClock::new();
        let mut env = envelope(&mock, &clock);
        env.mark_block_accepted();
        assert!(env.send(&messages::upload_firmware_block(3, &[0; 4])).is_err());
    }

    #[test]
    fn test_lan_activate_silence_is_in_progress() {
        let mock = MockTransport::lan();
        let clock = ManualClock::new();
        let mut env = envelope(&mock, &clock);
        let rsp = env.send(&messages::activate_firmware(false)).unwrap();
        assert!(rsp.ccode.is_in_progress());
    }

    #[test]
    fn test_lan_status_silence_reopens() {
        let mock = MockTransport::lan();
        let clock = ManualClock::new();
        mock.queue_no_response();
        mock.queue_response(0x00, &[0x00, 0x35, 0x00]);

        let mut env = envelope(&mock, &clock);
        let rsp = env.send(&messages::get_upgrade_status()).unwrap();
        assert!(rsp.ccode.is_success());
        assert_eq!(mock.reopen_count(), 1);
        assert_eq!(env.retries(), 1);
    }

    #[test]
    fn test_local_silence_is_error() {
        let mock = MockTransport::new();
        let clock = ManualClock::new();
        let mut env = envelope(&mock, &clock);
        assert!(matches!(
            env.send(&messages::activate_firmware(false)),
            Err(HpmError::NoResponse { cmd: CMD_ACTIVATE_FIRMWARE, .. })
        ));
    }

    #[test]
    fn test_shims_disabled() {
        let mock = MockTransport::lan();
        let clock = ManualClock::new();
        let config = EngineConfig {
            compat_shims: false,
            ..Default::default()
        };
        let mut env = Envelope::new(mock.clone(), clock, config, Arc::new(NullObserver));
        assert!(env.send(&messages::activate_firmware(false)).is_err());
    }
}
