//! Action record interpretation and dispatch.
//!
//! Records are walked twice: once to decide which components need an upgrade
//! (no traffic), then again to run Backup, Prepare and UploadFirmware against
//! the target for the selected components.

use tracing::{debug, info, instrument};

use crate::clock::Clock;
use crate::component::ComponentSet;
use crate::envelope::Envelope;
use crate::error::{HpmError, Result};
use crate::events::{HpmEvent, HpmObserver, PollKind};
use crate::image::{Action, ActionRecord, FirmwareImage, ImageError};
use crate::poll::send_and_wait;
use crate::protocol::messages;
use crate::protocol::{TargetCapabilities, UpgradeAction};
use crate::report::ComponentResult;
use crate::session::UpgradeOptions;
use crate::state::machine::{UpgradeContext, UpgradeState};
use crate::transport::IpmiTransport;
use crate::upload::Uploader;
use crate::version::{UpgradeDecision, image_version_upgradable};

/// Component addressed by a record, rejecting components the target lacks.
fn record_component(record: &ActionRecord<'_>, caps: &TargetCapabilities) -> Result<u8> {
    let missing = record.components.difference(caps.components);
    if let Some(id) = missing.lowest() {
        return Err(HpmError::UnsupportedComponent(id));
    }
    record.components.lowest().ok_or_else(|| {
        HpmError::Image(ImageError::InvalidActionRecord {
            offset: record.offset,
            reason: "empty component mask",
        })
    })
}

/// Every component of a Backup or Prepare record must support the action.
fn check_support(record: &ActionRecord<'_>, ctx: &UpgradeContext) -> Result<()> {
    match record.action {
        Action::Backup => {
            let missing = ctx.lacking(record.components, |p| p.rollback_supported());
            if !missing.is_empty() {
                return Err(HpmError::BackupUnsupported(missing));
            }
        }
        Action::Prepare => {
            let missing = ctx.lacking(record.components, |p| p.preparation_supported());
            if !missing.is_empty() {
                return Err(HpmError::PreparationUnsupported(missing));
            }
        }
        Action::UploadFirmware(_) => {}
    }
    Ok(())
}

/// Walk every record and decide, per uploaded component, whether to upgrade.
///
/// Backup and Prepare support is checked here, so an image the target cannot
/// apply is refused before anything is written. Returns the update mask.
/// Sends nothing to the target.
#[instrument(skip_all)]
pub fn interpret_records(
    image: &FirmwareImage,
    ctx: &mut UpgradeContext,
    opts: &UpgradeOptions,
    observer: &dyn HpmObserver,
) -> Result<ComponentSet> {
    let caps = ctx.capabilities.unwrap_or_default();
    let mut visited = 0usize;

    for record in image.action_records() {
        let record = record?;
        visited += 1;
        let component = record_component(&record, &caps)?;

        let segment = match &record.action {
            Action::Backup | Action::Prepare => {
                if !opts.compare {
                    check_support(&record, ctx)?;
                }
                continue;
            }
            Action::UploadFirmware(segment) => segment,
        };
        let Some(info) = ctx.versions.get_mut(component) else {
            return Err(HpmError::UnsupportedComponent(component));
        };
        info.in_image = true;
        info.image = Some(segment.version);
        info.image_description = Some(segment.description.clone());

        let decision = if opts.component.is_some_and(|c| c != component) {
            UpgradeDecision::Skip
        } else if opts.force {
            UpgradeDecision::Upgrade
        } else if image_version_upgradable(
            &segment.version,
            &info.active.unwrap_or_default(),
            &info.rollback.unwrap_or_default(),
            info.rollback_supported,
        ) {
            UpgradeDecision::Upgrade
        } else {
            UpgradeDecision::Skip
        };

        debug!(component, image = %segment.version, decision = %decision, "Upgrade decision");
        info.decision = Some(decision);
        observer.on_event(&HpmEvent::ComponentDecision {
            component,
            decision,
        });
    }

    let mask = ctx.versions.selected();
    info!(records = visited, update_mask = %mask, "Action records interpreted");
    Ok(mask)
}

/// Run every record against the target, in file order.
///
/// Backup and Prepare address the record mask filtered to the update mask
/// and are skipped in compare mode. Their support was checked by
/// [`interpret_records`]. Uploads for unselected components are
/// skipped without traffic.
pub fn execute_records<T: IpmiTransport, C: Clock>(
    env: &mut Envelope<T, C>,
    image: &FirmwareImage,
    ctx: &mut UpgradeContext,
    opts: &UpgradeOptions,
) -> Result<()> {
    let caps = ctx.capabilities.unwrap_or_default();

    for record in image.action_records() {
        let record = record?;
        let component = record_component(&record, &caps)?;

        match &record.action {
            Action::Backup | Action::Prepare => {
                let targets = record.components.intersection(ctx.update_mask);
                if opts.compare || targets.is_empty() {
                    debug!(record = %record.action_type(), "Skipping record");
                    continue;
                }
                let action = if matches!(record.action, Action::Backup) {
                    UpgradeAction::Backup
                } else {
                    UpgradeAction::Prepare
                };
                info!(components = %targets, action = ?action, "Initiating upgrade action");
                initiate(env, targets, action)?;
            }
            Action::UploadFirmware(segment) => {
                if !ctx.update_mask.contains(component) {
                    ctx.set_result(component, ComponentResult::Skipped);
                    continue;
                }
                ctx.current_component = Some(component);
                ctx.goto_state(UpgradeState::Uploading(component), env.observer());

                let action = if opts.compare {
                    UpgradeAction::UploadForCompare
                } else {
                    UpgradeAction::UploadForUpgrade
                };
                initiate(env, ComponentSet::single(component), action)?;

                let outcome = Uploader::new(env, component, opts.compare).run(segment.payload)?;
                let result = match (opts.compare, outcome.mismatch) {
                    (true, true) => ComponentResult::Mismatch,
                    (true, false) => ComponentResult::Compared,
                    (false, _) => ComponentResult::Updated,
                };
                ctx.set_result(component, result);
            }
        }
    }

    ctx.current_component = None;
    Ok(())
}

/// Initiate Upgrade Action, waiting out an "in progress" answer.
pub fn initiate<T: IpmiTransport, C: Clock>(
    env: &mut Envelope<T, C>,
    components: ComponentSet,
    action: UpgradeAction,
) -> Result<()> {
    let req = messages::initiate_upgrade_action(components, action);
    let timeout = env.upgrade_timeout();
    let outcome = send_and_wait(env, &req, PollKind::Upgrade, timeout)?;
    if !outcome.code.is_success() {
        return Err(HpmError::DeviceError {
            cmd: req.cmd,
            code: outcome.code,
        });
    }
    Ok(())
}
