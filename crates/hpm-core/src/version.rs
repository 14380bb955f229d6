//! Component firmware versions and the upgrade-necessity decision.

use std::fmt;

use crate::component::ComponentSet;
use crate::protocol::constants::MAX_COMPONENTS;

/// Six-byte HPM.1 firmware version: major, minor, four auxiliary bytes.
///
/// Versions are opaque tuples. They are only ever compared for equality;
/// nothing in the upgrade procedure orders them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FwVersion {
    pub major: u8,
    pub minor: u8,
    pub aux: [u8; 4],
}

impl FwVersion {
    pub const SIZE: usize = 6;

    pub const fn new(major: u8, minor: u8, aux: [u8; 4]) -> Self {
        Self { major, minor, aux }
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            major: bytes[0],
            minor: bytes[1],
            aux: [bytes[2], bytes[3], bytes[4], bytes[5]],
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        [
            self.major,
            self.minor,
            self.aux[0],
            self.aux[1],
            self.aux[2],
            self.aux[3],
        ]
    }
}

impl fmt::Display for FwVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:3}.{:02X} {:02X}{:02X}{:02X}{:02X}",
            self.major & 0x7F,
            self.minor,
            self.aux[0],
            self.aux[1],
            self.aux[2],
            self.aux[3]
        )
    }
}

/// Decide whether a component has to be upgraded.
///
/// Upgrade when the image differs from the active copy. When it matches the
/// active copy, a target that keeps a rollback copy is still upgraded if the
/// rollback copy differs, so both banks end up holding the image.
pub fn image_version_upgradable(
    image: &FwVersion,
    active: &FwVersion,
    rollback: &FwVersion,
    rollback_supported: bool,
) -> bool {
    if image != active {
        return true;
    }
    if !rollback_supported {
        return false;
    }
    image != rollback
}

/// Per-component decision taken while interpreting the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeDecision {
    Upgrade,
    Skip,
}

impl fmt::Display for UpgradeDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradeDecision::Upgrade => write!(f, "Upgrade"),
            UpgradeDecision::Skip => write!(f, "Skip"),
        }
    }
}

/// Version information gathered for one component.
#[derive(Debug, Clone, Default)]
pub struct VersionInfo {
    /// Component present in the image header.
    pub in_image: bool,
    /// Versions reported by the target.
    pub active: Option<FwVersion>,
    pub rollback: Option<FwVersion>,
    pub deferred: Option<FwVersion>,
    /// Version carried by the image segment.
    pub image: Option<FwVersion>,
    /// Description carried by the image segment.
    pub image_description: Option<String>,
    /// Description reported by the target.
    pub target_description: Option<String>,
    pub rollback_supported: bool,
    pub deferred_activation: bool,
    pub decision: Option<UpgradeDecision>,
}

impl VersionInfo {
    pub fn is_selected(&self) -> bool {
        self.decision == Some(UpgradeDecision::Upgrade)
    }
}

/// Version table indexed by component id.
#[derive(Debug, Clone, Default)]
pub struct VersionTable {
    entries: [VersionInfo; MAX_COMPONENTS as usize],
}

impl VersionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: u8) -> Option<&VersionInfo> {
        self.entries.get(id as usize)
    }

    pub fn get_mut(&mut self, id: u8) -> Option<&mut VersionInfo> {
        self.entries.get_mut(id as usize)
    }

    /// Components whose decision is `Upgrade`.
    pub fn selected(&self) -> ComponentSet {
        let mut set = ComponentSet::EMPTY;
        for (id, info) in self.iter() {
            if info.is_selected() {
                set.insert(id);
            }
        }
        set
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &VersionInfo)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(id, info)| (id as u8, info))
    }
}
