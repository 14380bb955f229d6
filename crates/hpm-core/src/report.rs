//! Per-component version report and final run status.

use std::fmt;

use crate::component::ComponentSet;
use crate::state::machine::{UpgradeContext, UpgradeState};
use crate::version::{FwVersion, UpgradeDecision};

/// What happened to one component during the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentResult {
    Skipped,
    Updated,
    Compared,
    Mismatch,
    Previewed,
}

impl fmt::Display for ComponentResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentResult::Skipped => write!(f, "Skipped"),
            ComponentResult::Updated => write!(f, "Updated"),
            ComponentResult::Compared => write!(f, "Compared"),
            ComponentResult::Mismatch => write!(f, "Mismatch"),
            ComponentResult::Previewed => write!(f, "Previewed"),
        }
    }
}

/// Overall outcome of a run that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalStatus {
    Success,
    ComparisonMismatch,
}

impl fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinalStatus::Success => write!(f, "Success"),
            FinalStatus::ComparisonMismatch => write!(f, "Comparison mismatch"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentReport {
    pub component: u8,
    pub description: Option<String>,
    pub active: Option<FwVersion>,
    pub rollback: Option<FwVersion>,
    pub image: Option<FwVersion>,
    pub decision: Option<UpgradeDecision>,
    pub result: Option<ComponentResult>,
}

/// Report of a finished upgrade, compare or preview run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeReport {
    pub components: Vec<ComponentReport>,
    pub update_mask: ComponentSet,
    pub final_state: UpgradeState,
    pub status: FinalStatus,
    /// Status polls made while waiting for activation.
    pub activation_polls: Option<u32>,
}

impl UpgradeReport {
    /// Build from the context of a run; only components present in the image
    /// are listed.
    pub fn from_context(ctx: &UpgradeContext) -> Self {
        let components: Vec<ComponentReport> = ctx
            .versions
            .iter()
            .filter(|(_, info)| info.in_image)
            .map(|(id, info)| ComponentReport {
                component: id,
                description: info
                    .image_description
                    .clone()
                    .or_else(|| info.target_description.clone()),
                active: info.active,
                rollback: info.rollback,
                image: info.image,
                decision: info.decision,
                result: ctx.result(id),
            })
            .collect();

        let status = if components
            .iter()
            .any(|c| c.result == Some(ComponentResult::Mismatch))
        {
            FinalStatus::ComparisonMismatch
        } else {
            FinalStatus::Success
        };

        Self {
            components,
            update_mask: ctx.update_mask,
            final_state: ctx.state,
            status,
            activation_polls: ctx.activation_polls,
        }
    }

    pub fn component(&self, id: u8) -> Option<&ComponentReport> {
        self.components.iter().find(|c| c.component == id)
    }
}

fn version_cell(v: &Option<FwVersion>) -> String {
    match v {
        Some(v) => v.to_string(),
        None => "---".to_string(),
    }
}

impl fmt::Display for UpgradeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<3} {:<20} {:<16} {:<16} {:<16} {:<8} {}",
            "ID", "Name", "Active", "Backup", "Image", "Action", "Result"
        )?;
        writeln!(f, "{}", "-".repeat(92))?;
        for c in &self.components {
            writeln!(
                f,
                "{:<3} {:<20} {:<16} {:<16} {:<16} {:<8} {}",
                c.component,
                c.description.as_deref().unwrap_or(""),
                version_cell(&c.active),
                version_cell(&c.rollback),
                version_cell(&c.image),
                c.decision.map(|d| d.to_string()).unwrap_or_else(|| "-".into()),
                c.result.map(|r| r.to_string()).unwrap_or_else(|| "-".into()),
            )?;
        }
        writeln!(f, "{}", "-".repeat(92))?;
        if let Some(polls) = self.activation_polls {
            writeln!(f, "Activation polls: {}", polls)?;
        }
        write!(f, "Status: {} ({})", self.status, self.final_state)
    }
}
