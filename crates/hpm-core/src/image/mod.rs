//! HPM.1 upgrade image handling.
//!
//! - `header`: fixed header parsing
//! - `action`: action record walking
//! - `validate`: integrity and device compatibility checks
//! - `builder`: image construction

pub mod action;
pub mod builder;
pub mod header;
pub mod validate;

use thiserror::Error;

pub use action::{
    Action, ActionRecord, ActionRecords, ActionType, ChecksumForm, ImageSegment,
};
pub use builder::ImageBuilder;
pub use header::{ImageCapabilities, ImageHeader};
pub use validate::{
    CompatError, MD5_TRAILER_LEN, compatibility_issues, validate_device_compatibility,
    validate_integrity,
};

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Image too small: {actual} bytes, minimum {minimum}")]
    TooSmall { actual: usize, minimum: usize },
    #[error("Invalid image signature")]
    InvalidSignature,
    #[error("Unsupported image format version 0x{0:02X}")]
    UnsupportedVersion(u8),
    #[error("Header checksum mismatch (sum 0x{sum:02X})")]
    HeaderChecksumMismatch { sum: u8 },
    #[error("MD5 trailer mismatch")]
    Md5Mismatch,
    #[error("Invalid action record at offset {offset}: {reason}")]
    InvalidActionRecord { offset: usize, reason: &'static str },
    #[error("Action record at offset {offset} runs past the image end")]
    Truncated { offset: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A validated upgrade image held in memory.
#[derive(Debug)]
pub struct FirmwareImage {
    data: Vec<u8>,
    header: ImageHeader,
}

impl FirmwareImage {
    /// Validate integrity and parse the header.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, ImageError> {
        validate_integrity(&data)?;
        let header = ImageHeader::parse(&data)?;
        Ok(Self { data, header })
    }

    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    pub fn raw_data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset where action records end and the MD5 trailer begins.
    pub fn records_end(&self) -> usize {
        self.data.len().saturating_sub(MD5_TRAILER_LEN)
    }

    /// Iterate the action records in file order.
    pub fn action_records(&self) -> ActionRecords<'_> {
        ActionRecords::new(&self.data, self.header.records_offset(), self.records_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentSet;
    use crate::version::FwVersion;

    #[test]
    fn test_records_end_at_trailer() {
        let data = ImageBuilder::new()
            .backup(ComponentSet::from_bits(0x03))
            .prepare(ComponentSet::from_bits(0x03))
            .upload(0, FwVersion::new(1, 0, [0; 4]), "BOOT", vec![0x11; 40])
            .upload(1, FwVersion::new(2, 1, [0; 4]), "APP", vec![0x22; 100])
            .build();
        let image = FirmwareImage::from_bytes(data).unwrap();

        let mut records = image.action_records();
        let mut count = 0;
        for record in records.by_ref() {
            record.unwrap();
            count += 1;
        }
        assert_eq!(count, 4);
        assert_eq!(records.position(), image.len() - 16);
        assert_eq!(records.position(), image.records_end());
    }

    #[test]
    fn test_rejects_corrupt_image() {
        let mut data = ImageBuilder::new()
            .upload(0, FwVersion::default(), "BOOT", vec![0; 8])
            .build();
        data[0] = b'X';
        assert!(FirmwareImage::from_bytes(data).is_err());
    }
}
