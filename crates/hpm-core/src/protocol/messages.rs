//! Request builders and response decoders for the HPM.1 command set.

use std::fmt;
use std::io::Cursor;

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt};

use super::completion::CompletionCode;
use super::constants::*;
use crate::component::ComponentSet;
use crate::error::{HpmError, Result};
use crate::transport::IpmiRequest;
use crate::version::FwVersion;

bitflags! {
    /// Global capabilities advertised by Get Target Upgrade Capabilities.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GlobalCapabilities: u8 {
        const UPGRADE_UNDESIRABLE = 1 << 0;
        const AUTO_ROLLBACK_OVERRIDE = 1 << 1;
        const DEGRADED_DURING_UPGRADE = 1 << 2;
        const DEFERRED_ACTIVATION = 1 << 3;
        const SERVICE_AFFECTED = 1 << 4;
        const MANUAL_ROLLBACK = 1 << 5;
        const AUTO_ROLLBACK = 1 << 6;
        const SELF_TEST = 1 << 7;
    }
}

bitflags! {
    /// General component properties (selector 0), rollback bits excluded.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ComponentFlags: u8 {
        const COLD_RESET_REQUIRED = 1 << 0;
        const DEFERRED_ACTIVATION = 1 << 1;
        const COMPARISON = 1 << 2;
        const PREPARATION = 1 << 3;
    }
}

/// Rollback/backup support field of the general component properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RollbackSupport {
    #[default]
    None,
    Automatic,
    Manual,
    Reserved,
}

impl RollbackSupport {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => RollbackSupport::None,
            1 => RollbackSupport::Automatic,
            2 => RollbackSupport::Manual,
            _ => RollbackSupport::Reserved,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, RollbackSupport::None)
    }
}

/// Decoded general properties of one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GeneralProperties {
    pub flags: ComponentFlags,
    pub rollback: RollbackSupport,
}

impl GeneralProperties {
    pub fn from_byte(byte: u8) -> Self {
        Self {
            flags: ComponentFlags::from_bits_truncate(byte),
            rollback: RollbackSupport::from_bits(byte >> 4),
        }
    }

    pub fn cold_reset_required(&self) -> bool {
        self.flags.contains(ComponentFlags::COLD_RESET_REQUIRED)
    }

    pub fn deferred_activation(&self) -> bool {
        self.flags.contains(ComponentFlags::DEFERRED_ACTIVATION)
    }

    pub fn comparison_supported(&self) -> bool {
        self.flags.contains(ComponentFlags::COMPARISON)
    }

    pub fn preparation_supported(&self) -> bool {
        self.flags.contains(ComponentFlags::PREPARATION)
    }

    pub fn rollback_supported(&self) -> bool {
        self.rollback.is_supported()
    }
}

/// Timeouts advertised by the target, in 5-second units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TargetTimeouts {
    pub upgrade: u8,
    pub self_test: u8,
    pub rollback: u8,
    pub inaccessibility: u8,
}

impl TargetTimeouts {
    pub fn upgrade_secs(&self) -> u64 {
        self.upgrade as u64 * TIMEOUT_UNIT_SECS
    }

    pub fn self_test_secs(&self) -> u64 {
        self.self_test as u64 * TIMEOUT_UNIT_SECS
    }

    pub fn rollback_secs(&self) -> u64 {
        self.rollback as u64 * TIMEOUT_UNIT_SECS
    }

    pub fn inaccessibility_secs(&self) -> u64 {
        self.inaccessibility as u64 * TIMEOUT_UNIT_SECS
    }
}

/// Response to Get Target Upgrade Capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TargetCapabilities {
    pub hpm_version: u8,
    pub global: GlobalCapabilities,
    pub components: ComponentSet,
    pub timeouts: TargetTimeouts,
}

impl TargetCapabilities {
    pub const RESPONSE_LEN: usize = 8;

    pub fn parse(data: &[u8]) -> Result<Self> {
        let body = picmg_body(CMD_GET_TARGET_UPG_CAPABILITIES, data, Self::RESPONSE_LEN)?;
        Ok(Self {
            hpm_version: body[0],
            global: GlobalCapabilities::from_bits_truncate(body[1]),
            components: ComponentSet::from_bits(body[2]),
            timeouts: TargetTimeouts {
                upgrade: body[3],
                self_test: body[4],
                rollback: body[5],
                inaccessibility: body[6],
            },
        })
    }
}

impl fmt::Display for TargetCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |c: GlobalCapabilities| if self.global.contains(c) { "yes" } else { "no" };
        writeln!(f, "Target Upgrade Capabilities:")?;
        writeln!(f, "  HPM.1 version:             {}", self.hpm_version)?;
        writeln!(f, "  Components:                {}", self.components)?;
        writeln!(f, "  Self-test:                 {}", flag(GlobalCapabilities::SELF_TEST))?;
        writeln!(f, "  Automatic rollback:        {}", flag(GlobalCapabilities::AUTO_ROLLBACK))?;
        writeln!(f, "  Manual rollback:           {}", flag(GlobalCapabilities::MANUAL_ROLLBACK))?;
        writeln!(f, "  Deferred activation:       {}", flag(GlobalCapabilities::DEFERRED_ACTIVATION))?;
        writeln!(f, "  Service affected:          {}", flag(GlobalCapabilities::SERVICE_AFFECTED))?;
        writeln!(f, "  Degraded during upgrade:   {}", flag(GlobalCapabilities::DEGRADED_DURING_UPGRADE))?;
        writeln!(f, "  Upgrade timeout:           {}s", self.timeouts.upgrade_secs())?;
        writeln!(f, "  Self-test timeout:         {}s", self.timeouts.self_test_secs())?;
        writeln!(f, "  Rollback timeout:          {}s", self.timeouts.rollback_secs())?;
        write!(f, "  Inaccessibility timeout:   {}s", self.timeouts.inaccessibility_secs())
    }
}

/// Identity reported by the IPMI Get Device ID command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceIdentity {
    pub device_id: u8,
    pub device_revision: u8,
    /// Major (7 bits) and BCD minor firmware revision.
    pub firmware_revision: [u8; 2],
    pub ipmi_version: u8,
    /// 20-bit IANA manufacturer id.
    pub manufacturer_id: u32,
    pub product_id: u16,
}

impl DeviceIdentity {
    pub const RESPONSE_LEN: usize = 11;

    pub fn parse(data: &[u8]) -> Result<Self> {
        let short = || HpmError::MalformedResponse {
            cmd: CMD_GET_DEVICE_ID,
            expected: Self::RESPONSE_LEN,
            actual: data.len(),
        };
        if data.len() < Self::RESPONSE_LEN {
            return Err(short());
        }
        let mut cursor = Cursor::new(&data[6..]);
        let manufacturer_id = cursor.read_u24::<LittleEndian>().map_err(|_| short())? & 0x0F_FFFF;
        let product_id = cursor.read_u16::<LittleEndian>().map_err(|_| short())?;
        Ok(Self {
            device_id: data[0],
            device_revision: data[1] & 0x0F,
            firmware_revision: [data[2] & 0x7F, data[3]],
            ipmi_version: data[4],
            manufacturer_id,
            product_id,
        })
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "device 0x{:02X} rev {} fw {}.{:02X} manufacturer 0x{:05X} product 0x{:04X}",
            self.device_id,
            self.device_revision,
            self.firmware_revision[0],
            self.firmware_revision[1],
            self.manufacturer_id,
            self.product_id
        )
    }
}

/// Get Component Properties selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertySelector {
    General,
    CurrentVersion,
    Description,
    Rollback,
    Deferred,
    Oem(u8),
}

impl PropertySelector {
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            SELECTOR_GENERAL => Ok(PropertySelector::General),
            SELECTOR_CURRENT_VERSION => Ok(PropertySelector::CurrentVersion),
            SELECTOR_DESCRIPTION => Ok(PropertySelector::Description),
            SELECTOR_ROLLBACK_VERSION => Ok(PropertySelector::Rollback),
            SELECTOR_DEFERRED_VERSION => Ok(PropertySelector::Deferred),
            b if b >= SELECTOR_OEM_FIRST => Ok(PropertySelector::Oem(b)),
            b => Err(HpmError::UnsupportedSelector(b)),
        }
    }

    pub fn to_byte(&self) -> u8 {
        match self {
            PropertySelector::General => SELECTOR_GENERAL,
            PropertySelector::CurrentVersion => SELECTOR_CURRENT_VERSION,
            PropertySelector::Description => SELECTOR_DESCRIPTION,
            PropertySelector::Rollback => SELECTOR_ROLLBACK_VERSION,
            PropertySelector::Deferred => SELECTOR_DEFERRED_VERSION,
            PropertySelector::Oem(b) => *b,
        }
    }
}

/// Decoded Get Component Properties payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentProperty {
    General(GeneralProperties),
    CurrentVersion(FwVersion),
    Description(String),
    Rollback(FwVersion),
    Deferred(FwVersion),
    Oem(Vec<u8>),
}

impl ComponentProperty {
    pub fn parse(selector: PropertySelector, data: &[u8]) -> Result<Self> {
        let cmd = CMD_GET_COMPONENT_PROPERTIES;
        match selector {
            PropertySelector::General => {
                let body = picmg_body(cmd, data, 2)?;
                Ok(ComponentProperty::General(GeneralProperties::from_byte(body[0])))
            }
            PropertySelector::CurrentVersion => {
                Ok(ComponentProperty::CurrentVersion(parse_version(cmd, data)?))
            }
            PropertySelector::Rollback => Ok(ComponentProperty::Rollback(parse_version(cmd, data)?)),
            PropertySelector::Deferred => Ok(ComponentProperty::Deferred(parse_version(cmd, data)?)),
            PropertySelector::Description => {
                let body = picmg_body(cmd, data, 1)?;
                let len = body.len().min(COMPONENT_DESC_LEN);
                Ok(ComponentProperty::Description(c_string(&body[..len])))
            }
            PropertySelector::Oem(_) => {
                let body = picmg_body(cmd, data, 1)?;
                Ok(ComponentProperty::Oem(body.to_vec()))
            }
        }
    }
}

impl fmt::Display for ComponentProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentProperty::General(p) => write!(
                f,
                "cold reset: {}, deferred activation: {}, comparison: {}, preparation: {}, rollback: {:?}",
                p.cold_reset_required(),
                p.deferred_activation(),
                p.comparison_supported(),
                p.preparation_supported(),
                p.rollback
            ),
            ComponentProperty::CurrentVersion(v) => write!(f, "current version: {}", v),
            ComponentProperty::Description(s) => write!(f, "description: {}", s),
            ComponentProperty::Rollback(v) => write!(f, "rollback version: {}", v),
            ComponentProperty::Deferred(v) => write!(f, "deferred version: {}", v),
            ComponentProperty::Oem(bytes) => {
                write!(f, "oem:")?;
                for b in bytes {
                    write!(f, " {:02X}", b)?;
                }
                Ok(())
            }
        }
    }
}

/// Initiate Upgrade Action codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeAction {
    Backup,
    Prepare,
    UploadForUpgrade,
    UploadForCompare,
}

impl UpgradeAction {
    pub fn code(&self) -> u8 {
        match self {
            UpgradeAction::Backup => ACTION_BACKUP,
            UpgradeAction::Prepare => ACTION_PREPARE,
            UpgradeAction::UploadForUpgrade => ACTION_UPLOAD_FOR_UPGRADE,
            UpgradeAction::UploadForCompare => ACTION_UPLOAD_FOR_COMPARE,
        }
    }
}

/// Response to Get Upgrade Status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeStatus {
    pub command_in_progress: u8,
    pub last_completion: CompletionCode,
}

impl UpgradeStatus {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let body = picmg_body(CMD_GET_UPGRADE_STATUS, data, 3)?;
        Ok(Self {
            command_in_progress: body[0],
            last_completion: CompletionCode::new(body[1]),
        })
    }
}

/// Response to Query Self-test Result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelfTestResult {
    pub result: u8,
    pub detail: u8,
}

impl SelfTestResult {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let body = picmg_body(CMD_QUERY_SELFTEST_RESULT, data, 3)?;
        Ok(Self {
            result: body[0],
            detail: body[1],
        })
    }

    pub fn passed(&self) -> bool {
        self.result == SELFTEST_PASSED
    }
}

/// Trailing offset/length pair some targets append to Upload Firmware Block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockResync {
    pub offset: u32,
    pub length: u32,
}

impl BlockResync {
    pub const RESPONSE_LEN: usize = 9;

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::RESPONSE_LEN {
            return None;
        }
        let mut cursor = Cursor::new(&data[1..]);
        let offset = cursor.read_u32::<LittleEndian>().ok()?;
        let length = cursor.read_u32::<LittleEndian>().ok()?;
        Some(Self { offset, length })
    }
}

pub fn get_device_id() -> IpmiRequest {
    IpmiRequest::new(NETFN_APP, CMD_GET_DEVICE_ID, Vec::new())
}

pub fn get_target_capabilities() -> IpmiRequest {
    picmg_request(CMD_GET_TARGET_UPG_CAPABILITIES, &[])
}

pub fn get_component_properties(component: u8, selector: PropertySelector) -> IpmiRequest {
    picmg_request(CMD_GET_COMPONENT_PROPERTIES, &[component, selector.to_byte()])
}

pub fn abort_upgrade() -> IpmiRequest {
    picmg_request(CMD_ABORT_UPGRADE, &[])
}

pub fn initiate_upgrade_action(components: ComponentSet, action: UpgradeAction) -> IpmiRequest {
    picmg_request(CMD_INITIATE_UPGRADE_ACTION, &[components.bits(), action.code()])
}

pub fn upload_firmware_block(block: u8, payload: &[u8]) -> IpmiRequest {
    let mut data = Vec::with_capacity(payload.len() + UPLOAD_BLOCK_HEADER_LEN);
    data.push(PICMG_IDENTIFIER);
    data.push(block);
    data.extend_from_slice(payload);
    IpmiRequest::new(NETFN_PICMG, CMD_UPLOAD_FIRMWARE_BLOCK, data)
}

pub fn finish_firmware_upload(component: u8, image_length: u32) -> IpmiRequest {
    let len = image_length.to_le_bytes();
    picmg_request(
        CMD_FINISH_FIRMWARE_UPLOAD,
        &[component, len[0], len[1], len[2], len[3]],
    )
}

pub fn get_upgrade_status() -> IpmiRequest {
    picmg_request(CMD_GET_UPGRADE_STATUS, &[])
}

pub fn activate_firmware(rollback_override: bool) -> IpmiRequest {
    if rollback_override {
        picmg_request(CMD_ACTIVATE_FIRMWARE, &[ROLLBACK_OVERRIDE])
    } else {
        picmg_request(CMD_ACTIVATE_FIRMWARE, &[])
    }
}

pub fn query_selftest_result() -> IpmiRequest {
    picmg_request(CMD_QUERY_SELFTEST_RESULT, &[])
}

pub fn query_rollback_status() -> IpmiRequest {
    picmg_request(CMD_QUERY_ROLLBACK_STATUS, &[])
}

pub fn manual_firmware_rollback() -> IpmiRequest {
    picmg_request(CMD_MANUAL_FIRMWARE_ROLLBACK, &[])
}

fn picmg_request(cmd: u8, args: &[u8]) -> IpmiRequest {
    let mut data = Vec::with_capacity(args.len() + 1);
    data.push(PICMG_IDENTIFIER);
    data.extend_from_slice(args);
    IpmiRequest::new(NETFN_PICMG, cmd, data)
}

/// Response payload after the PICMG identifier, checked for minimum length
/// (identifier included).
fn picmg_body(cmd: u8, data: &[u8], min_len: usize) -> Result<&[u8]> {
    if data.len() < min_len.max(1) {
        return Err(HpmError::MalformedResponse {
            cmd,
            expected: min_len.max(1),
            actual: data.len(),
        });
    }
    Ok(&data[1..])
}

fn parse_version(cmd: u8, data: &[u8]) -> Result<FwVersion> {
    let body = picmg_body(cmd, data, 1 + FwVersion::SIZE)?;
    let mut bytes = [0u8; FwVersion::SIZE];
    bytes.copy_from_slice(&body[..FwVersion::SIZE]);
    Ok(FwVersion::from_bytes(&bytes))
}

/// ASCII up to the first NUL, trailing blanks trimmed.
pub(crate) fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim_end().to_string()
}
