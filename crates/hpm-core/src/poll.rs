//! Long-duration status polling.

use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::clock::Clock;
use crate::envelope::Envelope;
use crate::error::{HpmError, Result};
use crate::events::{HpmEvent, PollKind};
use crate::protocol::messages::{self, UpgradeStatus};
use crate::protocol::CompletionCode;
use crate::transport::{IpmiRequest, IpmiTransport};

/// Result of a finished poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    /// First code that was not "in progress".
    pub code: CompletionCode,
    /// Status queries made.
    pub polls: u32,
}

impl PollKind {
    fn operation(&self) -> &'static str {
        match self {
            PollKind::Upgrade => "Upgrade command",
            PollKind::Activation => "Firmware activation",
            PollKind::SelfTest => "Self-test",
            PollKind::Rollback => "Rollback",
        }
    }
}

/// Poll until the long-running command finishes or `timeout` elapses.
///
/// Rollback polls read Query Rollback Status, everything else reads the last
/// completion code from Get Upgrade Status. Each query is preceded by one
/// poll interval of sleep.
#[instrument(level = "debug", skip(env), fields(kind = %kind))]
pub fn wait_for_completion<T: IpmiTransport, C: Clock>(
    env: &mut Envelope<T, C>,
    kind: PollKind,
    timeout: Duration,
) -> Result<PollOutcome> {
    let start = env.clock().now();
    let interval = env.poll_interval();
    let mut polls = 0u32;

    loop {
        env.clock().sleep(interval);
        let code = query(env, kind)?;
        polls += 1;
        env.emit(HpmEvent::PollStatus { kind, code, polls });

        if !code.is_in_progress() {
            debug!(polls, code = %code, "Long-duration command finished");
            return Ok(PollOutcome { code, polls });
        }

        let elapsed = env.clock().now().saturating_sub(start);
        if elapsed >= timeout {
            warn!(polls, "Gave up waiting after {:?}", elapsed);
            return Err(HpmError::Timeout {
                operation: kind.operation(),
                secs: timeout.as_secs(),
            });
        }
    }
}

/// Send `req` and, if the target answers "in progress", wait for the final
/// code. `polls` is zero when the first response was already terminal.
pub fn send_and_wait<T: IpmiTransport, C: Clock>(
    env: &mut Envelope<T, C>,
    req: &IpmiRequest,
    kind: PollKind,
    timeout: Duration,
) -> Result<PollOutcome> {
    let rsp = env.send(req)?;
    if rsp.ccode.is_in_progress() {
        return wait_for_completion(env, kind, timeout);
    }
    Ok(PollOutcome {
        code: rsp.ccode,
        polls: 0,
    })
}

fn query<T: IpmiTransport, C: Clock>(
    env: &mut Envelope<T, C>,
    kind: PollKind,
) -> Result<CompletionCode> {
    match kind {
        PollKind::Rollback => {
            let rsp = env.send(&messages::query_rollback_status())?;
            Ok(rsp.ccode)
        }
        PollKind::Upgrade | PollKind::Activation | PollKind::SelfTest => {
            let req = messages::get_upgrade_status();
            let rsp = env.send(&req)?;
            // Some drivers answer the first query with a transitional code.
            if rsp.ccode.is_status_pending() {
                return Ok(CompletionCode::IN_PROGRESS);
            }
            if !rsp.ccode.is_success() {
                return Err(HpmError::DeviceError {
                    cmd: req.cmd,
                    code: rsp.ccode,
                });
            }
            let last = UpgradeStatus::parse(&rsp.data)?.last_completion;
            if last.is_status_pending() {
                return Ok(CompletionCode::IN_PROGRESS);
            }
            Ok(last)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::events::NullObserver;
    use crate::protocol::constants::*;
    use crate::session::EngineConfig;
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
    fn test_polls_until_terminal() {
        let mock = MockTransport::new();
        let clock = ManualClock::new();
        mock.queue_response(0x00, &[0x00, CMD_ACTIVATE_FIRMWARE, CC_COMMAND_IN_PROGRESS]);
        mock.queue_response(0x00, &[0x00, CMD_ACTIVATE_FIRMWARE, CC_COMMAND_IN_PROGRESS]);
        mock.queue_response(0x00, &[0x00, CMD_ACTIVATE_FIRMWARE, CC_SUCCESS]);

        let mut env = envelope(&mock, &clock);
        let outcome =
            wait_for_completion(&mut env, PollKind::Activation, Duration::from_secs(60)).unwrap();
        assert!(outcome.code.is_success());
        assert_eq!(outcome.polls, 3);
        assert_eq!(clock.now(), Duration::from_millis(300));
    }

    #[test]
    fn test_transitional_first_poll() {
        let mock = MockTransport::new();
        let clock = ManualClock::new();
        mock.queue_code(CC_ILLEGAL_STATE);
        mock.queue_response(0x00, &[0x00, CMD_FINISH_FIRMWARE_UPLOAD, CC_COMPARE_MISMATCH]);

        let mut env = envelope(&mock, &clock);
        let outcome =
            wait_for_completion(&mut env, PollKind::Upgrade, Duration::from_secs(60)).unwrap();
        assert_eq!(outcome.code.value(), CC_COMPARE_MISMATCH);
        assert_eq!(outcome.polls, 2);
    }

    #[test]
    fn test_rollback_reads_response_code() {
        let mock = MockTransport::new();
        let clock = ManualClock::new();
        mock.queue_code(CC_COMMAND_IN_PROGRESS);
        mock.queue_code(CC_ROLLBACK_FAILURE);

        let mut env = envelope(&mock, &clock);
        let outcome =
            wait_for_completion(&mut env, PollKind::Rollback, Duration::from_secs(60)).unwrap();
        assert_eq!(outcome.code.value(), CC_ROLLBACK_FAILURE);
        assert_eq!(mock.requests_for(CMD_QUERY_ROLLBACK_STATUS).len(), 2);
    }

    #[test]
    fn test_transitional_last_completion() {
        let mock = MockTransport::new();
        let clock = ManualClock::new();
        mock.queue_response(0x00, &[0x00, CMD_ACTIVATE_FIRMWARE, CC_ILLEGAL_STATE]);
        mock.queue_response(0x00, &[0x00, CMD_ACTIVATE_FIRMWARE, CC_SUCCESS]);

        let mut env = envelope(&mock, &clock);
        let outcome =
            wait_for_completion(&mut env, PollKind::Activation, Duration::from_secs(60)).unwrap();
        assert!(outcome.code.is_success());
        assert_eq!(outcome.polls, 2);
    }

    #[test]
    fn test_direct_illegal_state_is_final() {
        let mock = MockTransport::new();
        let clock = ManualClock::new();
        mock.queue_code(CC_ILLEGAL_STATE);

        let mut env = envelope(&mock, &clock);
        let outcome = send_and_wait(
            &mut env,
            &messages::activate_firmware(false),
            PollKind::Activation,
            Duration::from_secs(60),
        )
        .unwrap();
        assert_eq!(outcome.code.value(), CC_ILLEGAL_STATE);
        assert_eq!(outcome.polls, 0);
        assert!(mock.requests_for(CMD_GET_UPGRADE_STATUS).is_empty());
    }

    #[test]
    fn test_poll_timeout() {
        let mock = MockTransport::new();
        let clock = ManualClock::new();
        mock.set_responder(|_| {
            crate::transport::MockReply::Response(crate::transport::IpmiResponse::new(
                0x00,
                vec![0x00, CMD_ACTIVATE_FIRMWARE, CC_COMMAND_IN_PROGRESS],
            ))
        });

        let mut env = envelope(&mock, &clock);
        let err = wait_for_completion(&mut env, PollKind::Activation, Duration::from_secs(1))
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(clock.now(), Duration::from_secs(1));
    }
}
