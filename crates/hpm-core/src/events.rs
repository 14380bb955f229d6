//! Event system for UI decoupling.
//!
//! Lets a CLI (or any other front end) follow an upgrade run without the
//! engine knowing how the output is rendered.

use std::fmt;

use crate::component::ComponentSet;
use crate::protocol::CompletionCode;
use crate::state::UpgradeState;
use crate::version::UpgradeDecision;

/// Which long-running operation a status poll belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollKind {
    Upgrade,
    Activation,
    SelfTest,
    Rollback,
}

impl fmt::Display for PollKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollKind::Upgrade => write!(f, "upgrade"),
            PollKind::Activation => write!(f, "activation"),
            PollKind::SelfTest => write!(f, "self-test"),
            PollKind::Rollback => write!(f, "rollback"),
        }
    }
}

/// Events emitted during an upgrade run.
#[derive(Debug, Clone)]
pub enum HpmEvent {
    /// Orchestrator state changed.
    StateChanged { from: UpgradeState, to: UpgradeState },
    /// Upgrade/skip decision for one component.
    ComponentDecision {
        component: u8,
        decision: UpgradeDecision,
    },
    /// Image and target disagree on identity.
    CompatibilityIssue { message: String },
    /// Upload progress for the current component.
    Progress {
        component: u8,
        sent: u64,
        total: u64,
        percent: u8,
    },
    /// Request handed to the transport.
    CommandSent { netfn: u8, cmd: u8, length: usize },
    /// Response returned by the transport.
    ResponseReceived {
        cmd: u8,
        code: CompletionCode,
        length: usize,
    },
    /// One iteration of a long-duration status poll.
    PollStatus {
        kind: PollKind,
        code: CompletionCode,
        polls: u32,
    },
    SelfTestResult { result: u8, detail: u8 },
    RollbackStatus { code: CompletionCode },
    /// Run finished; `components` were updated.
    Complete { components: ComponentSet },
}

/// Observer trait for receiving upgrade events.
///
/// Implement this trait in your UI layer to receive updates and to answer
/// operator confirmations.
pub trait HpmObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &HpmEvent);

    /// Ask the operator to confirm a risky step. Unattended by default.
    fn confirm(&self, _prompt: &str) -> bool {
        false
    }
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl HpmObserver for NullObserver {
    fn on_event(&self, _event: &HpmEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl HpmObserver for TracingObserver {
    fn on_event(&self, event: &HpmEvent) {
        match event {
            HpmEvent::StateChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "State changed");
            }
            HpmEvent::ComponentDecision {
                component,
                decision,
            } => {
                tracing::info!(component, decision = %decision, "Component decision");
            }
            HpmEvent::CompatibilityIssue { message } => {
                tracing::warn!("Compatibility: {}", message);
            }
            HpmEvent::Progress {
                component,
                sent,
                total,
                percent,
            } => {
                tracing::debug!(
                    component,
                    sent,
                    total,
                    progress = %format!("{}%", percent),
                    "Upload progress"
                );
            }
            HpmEvent::CommandSent { netfn, cmd, length } => {
                tracing::trace!(
                    netfn = %format!("0x{:02X}", netfn),
                    cmd = %format!("0x{:02X}", cmd),
                    len = length,
                    "Request"
                );
            }
            HpmEvent::ResponseReceived { cmd, code, length } => {
                tracing::trace!(
                    cmd = %format!("0x{:02X}", cmd),
                    code = %code,
                    len = length,
                    "Response"
                );
            }
            HpmEvent::PollStatus { kind, code, polls } => {
                tracing::debug!(kind = %kind, code = %code, polls, "Status poll");
            }
            HpmEvent::SelfTestResult { result, detail } => {
                tracing::info!(
                    result = %format!("0x{:02X}", result),
                    detail = %format!("0x{:02X}", detail),
                    "Self-test result"
                );
            }
            HpmEvent::RollbackStatus { code } => {
                tracing::info!(code = %code, "Rollback status");
            }
            HpmEvent::Complete { components } => {
                tracing::info!(components = %components, "Upgrade complete");
            }
        }
    }
}

/// Whole-number percentage, clamped to 100.
pub fn percent(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((sent.min(total) * 100) / total) as u8
}
