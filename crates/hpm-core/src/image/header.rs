//! HPM.1 upgrade image header.

use std::fmt;
use std::io::Cursor;

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt};

use super::ImageError;
use crate::component::ComponentSet;
use crate::protocol::constants::TIMEOUT_UNIT_SECS;

/// Image signature.
pub const IMAGE_SIGNATURE: &[u8; 8] = b"PICMGFWU";

/// Only header format understood.
pub const IMAGE_FORMAT_VERSION: u8 = 0x00;

/// Offsets inside the fixed part of the header.
pub const SIGNATURE_OFFSET: usize = 0;
pub const FORMAT_VERSION_OFFSET: usize = 8;
pub const COMPONENTS_OFFSET: usize = 21;
pub const OEM_LENGTH_OFFSET: usize = 25;

bitflags! {
    /// Image capability flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ImageCapabilities: u8 {
        const SELF_TEST = 1 << 0;
        const AUTO_ROLLBACK = 1 << 1;
        const MANUAL_ROLLBACK = 1 << 2;
        const SERVICE_AFFECTED = 1 << 3;
    }
}

/// Parsed image header. Read-only after parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    pub signature: [u8; 8],
    pub format_version: u8,
    pub device_id: u8,
    pub device_revision: u8,
    pub firmware_revision: [u8; 2],
    /// 20-bit IANA manufacturer id.
    pub manufacturer_id: u32,
    pub product_id: u16,
    /// Earliest target firmware revision able to take this image.
    pub compat_revision: [u8; 2],
    pub capabilities: ImageCapabilities,
    pub components: ComponentSet,
    /// Timeouts in 5-second units.
    pub self_test_timeout: u8,
    pub rollback_timeout: u8,
    pub inaccess_timeout: u8,
    pub oem_data_length: u16,
}

impl ImageHeader {
    /// Size of the fixed part, OEM data and checksum byte excluded.
    pub const SIZE: usize = 27;

    pub fn parse(data: &[u8]) -> Result<Self, ImageError> {
        if data.len() < Self::SIZE {
            return Err(ImageError::TooSmall {
                actual: data.len(),
                minimum: Self::SIZE,
            });
        }
        let mut signature = [0u8; 8];
        signature.copy_from_slice(&data[SIGNATURE_OFFSET..FORMAT_VERSION_OFFSET]);

        let mut cursor = Cursor::new(&data[FORMAT_VERSION_OFFSET..Self::SIZE]);
        let format_version = cursor.read_u8()?;
        let device_id = cursor.read_u8()?;
        let device_revision = cursor.read_u8()?;
        let firmware_revision = [cursor.read_u8()?, cursor.read_u8()?];
        let manufacturer_id = cursor.read_u24::<LittleEndian>()? & 0x0F_FFFF;
        let product_id = cursor.read_u16::<LittleEndian>()?;
        let compat_revision = [cursor.read_u8()?, cursor.read_u8()?];
        let capabilities = ImageCapabilities::from_bits_truncate(cursor.read_u8()?);
        let components = ComponentSet::from_bits(cursor.read_u8()?);
        let self_test_timeout = cursor.read_u8()?;
        let rollback_timeout = cursor.read_u8()?;
        let inaccess_timeout = cursor.read_u8()?;
        let oem_data_length = cursor.read_u16::<LittleEndian>()?;

        Ok(Self {
            signature,
            format_version,
            device_id,
            device_revision,
            firmware_revision,
            manufacturer_id,
            product_id,
            compat_revision,
            capabilities,
            components,
            self_test_timeout,
            rollback_timeout,
            inaccess_timeout,
            oem_data_length,
        })
    }

    /// Offset of the header checksum byte.
    pub fn checksum_offset(&self) -> usize {
        Self::SIZE + self.oem_data_length as usize
    }

    /// Offset of the first action record.
    pub fn records_offset(&self) -> usize {
        self.checksum_offset() + 1
    }

    pub fn self_test_secs(&self) -> u64 {
        self.self_test_timeout as u64 * TIMEOUT_UNIT_SECS
    }

    pub fn rollback_secs(&self) -> u64 {
        self.rollback_timeout as u64 * TIMEOUT_UNIT_SECS
    }

    pub fn inaccess_secs(&self) -> u64 {
        self.inaccess_timeout as u64 * TIMEOUT_UNIT_SECS
    }
}

impl fmt::Display for ImageHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cap = |c: ImageCapabilities| if self.capabilities.contains(c) { "yes" } else { "no" };
        writeln!(f, "HPM.1 Image Header:")?;
        writeln!(f, "  Device ID:                 0x{:02X}", self.device_id)?;
        writeln!(f, "  Device revision:           {}", self.device_revision)?;
        writeln!(
            f,
            "  Firmware revision:         {}.{:02X}",
            self.firmware_revision[0], self.firmware_revision[1]
        )?;
        writeln!(f, "  Manufacturer ID:           0x{:05X}", self.manufacturer_id)?;
        writeln!(f, "  Product ID:                0x{:04X}", self.product_id)?;
        writeln!(
            f,
            "  Earliest compatible:       {}.{:02X}",
            self.compat_revision[0], self.compat_revision[1]
        )?;
        writeln!(f, "  Components:                {}", self.components)?;
        writeln!(f, "  Self-test:                 {}", cap(ImageCapabilities::SELF_TEST))?;
        writeln!(f, "  Automatic rollback:        {}", cap(ImageCapabilities::AUTO_ROLLBACK))?;
        writeln!(f, "  Manual rollback:           {}", cap(ImageCapabilities::MANUAL_ROLLBACK))?;
        writeln!(f, "  Service affected:          {}", cap(ImageCapabilities::SERVICE_AFFECTED))?;
        writeln!(f, "  Self-test timeout:         {}s", self.self_test_secs())?;
        writeln!(f, "  Rollback timeout:          {}s", self.rollback_secs())?;
        writeln!(f, "  Inaccessibility timeout:   {}s", self.inaccess_secs())?;
        write!(f, "  OEM data:                  {} bytes", self.oem_data_length)
    }
}
