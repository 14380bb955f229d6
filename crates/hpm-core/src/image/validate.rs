//! Image integrity and target compatibility checks.

use md5::{Digest, Md5};
use thiserror::Error;
use tracing::debug;

use super::ImageError;
use super::header::{
    FORMAT_VERSION_OFFSET, IMAGE_FORMAT_VERSION, IMAGE_SIGNATURE, ImageHeader, OEM_LENGTH_OFFSET,
    SIGNATURE_OFFSET,
};
use crate::protocol::DeviceIdentity;

pub const MD5_TRAILER_LEN: usize = 16;

/// Smallest buffer able to hold a header, its checksum byte and the trailer.
pub const MIN_IMAGE_LEN: usize = ImageHeader::SIZE + 1 + MD5_TRAILER_LEN;

/// MD5 of everything before the trailer.
pub fn md5_digest(data: &[u8]) -> [u8; MD5_TRAILER_LEN] {
    let mut out = [0u8; MD5_TRAILER_LEN];
    out.copy_from_slice(Md5::digest(data).as_slice());
    out
}

/// Check the MD5 trailer, signature, format version and header checksum.
///
/// Checks run in that order; the first failure is returned.
pub fn validate_integrity(data: &[u8]) -> Result<(), ImageError> {
    if data.len() < MIN_IMAGE_LEN {
        return Err(ImageError::TooSmall {
            actual: data.len(),
            minimum: MIN_IMAGE_LEN,
        });
    }
    let oem_len =
        u16::from_le_bytes([data[OEM_LENGTH_OFFSET], data[OEM_LENGTH_OFFSET + 1]]) as usize;
    let checksum_offset = ImageHeader::SIZE + oem_len;
    let minimum = checksum_offset + 1 + MD5_TRAILER_LEN;
    if data.len() < minimum {
        return Err(ImageError::TooSmall {
            actual: data.len(),
            minimum,
        });
    }

    let (body, trailer) = data.split_at(data.len() - MD5_TRAILER_LEN);
    if md5_digest(body) != trailer {
        return Err(ImageError::Md5Mismatch);
    }

    if &data[SIGNATURE_OFFSET..FORMAT_VERSION_OFFSET] != IMAGE_SIGNATURE {
        return Err(ImageError::InvalidSignature);
    }

    let format_version = data[FORMAT_VERSION_OFFSET];
    if format_version != IMAGE_FORMAT_VERSION {
        return Err(ImageError::UnsupportedVersion(format_version));
    }

    let sum = data[..=checksum_offset]
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b));
    if sum != 0 {
        return Err(ImageError::HeaderChecksumMismatch { sum });
    }

    debug!(len = data.len(), oem_len, "Image integrity verified");
    Ok(())
}

/// Mismatch between the image header and the target identity.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompatError {
    #[error("device ID mismatch: image 0x{image:02X}, target 0x{target:02X}")]
    DeviceIdMismatch { image: u8, target: u8 },
    #[error("product ID mismatch: image 0x{image:04X}, target 0x{target:04X}")]
    ProductIdMismatch { image: u16, target: u16 },
    #[error("manufacturer ID mismatch: image 0x{image:05X}, target 0x{target:05X}")]
    ManufacturerIdMismatch { image: u32, target: u32 },
    #[error(
        "target firmware {target_major}.{target_minor:02X} is older than the earliest compatible revision {image_major}.{image_minor:02X}"
    )]
    EarliestRevisionIncompatible {
        image_major: u8,
        image_minor: u8,
        target_major: u8,
        target_minor: u8,
    },
}

/// Every mismatch between `header` and `identity`, in check order.
pub fn compatibility_issues(header: &ImageHeader, identity: &DeviceIdentity) -> Vec<CompatError> {
    let mut issues = Vec::new();

    if header.device_id != identity.device_id {
        issues.push(CompatError::DeviceIdMismatch {
            image: header.device_id,
            target: identity.device_id,
        });
    }
    if header.product_id != identity.product_id {
        issues.push(CompatError::ProductIdMismatch {
            image: header.product_id,
            target: identity.product_id,
        });
    }
    if header.manufacturer_id != identity.manufacturer_id {
        issues.push(CompatError::ManufacturerIdMismatch {
            image: header.manufacturer_id,
            target: identity.manufacturer_id,
        });
    }

    let earliest = (header.compat_revision[0], header.compat_revision[1]);
    let target = (identity.firmware_revision[0] & 0x7F, identity.firmware_revision[1]);
    if target < earliest {
        issues.push(CompatError::EarliestRevisionIncompatible {
            image_major: earliest.0,
            image_minor: earliest.1,
            target_major: target.0,
            target_minor: target.1,
        });
    }

    issues
}

/// Every mismatch between `header` and `identity`; the caller decides whether
/// to override them.
pub fn validate_device_compatibility(
    header: &ImageHeader,
    identity: &DeviceIdentity,
) -> Result<(), Vec<CompatError>> {
    let issues = compatibility_issues(header, identity);
    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::builder::{ImageBuilder, reseal};
    use crate::version::FwVersion;

    fn sample() -> Vec<u8> {
        ImageBuilder::new()
            .upload(0, FwVersion::new(1, 2, [0; 4]), "BOOT", vec![0x5A; 64])
            .build()
    }

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            device_id: 0x12,
            device_revision: 1,
            firmware_revision: [0x02, 0x10],
            ipmi_version: 0x02,
            manufacturer_id: 0x315A,
            product_id: 0x1234,
        }
    }

    #[test]
    fn test_valid_image() {
        assert!(validate_integrity(&sample()).is_ok());
    }

    #[test]
    fn test_bit_flip_detected_by_md5() {
        let clean = sample();
        let body_len = clean.len() - MD5_TRAILER_LEN;
        for offset in [0, 9, ImageHeader::SIZE, body_len / 2, body_len - 1] {
            for bit in [0u8, 3, 7] {
                let mut data = clean.clone();
                data[offset] ^= 1 << bit;
                assert!(
                    matches!(validate_integrity(&data), Err(ImageError::Md5Mismatch)),
                    "offset {} bit {}",
                    offset,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_header_corruption_detected_by_checksum() {
        let mut data = sample();
        data[10] ^= 0x40;
        reseal(&mut data);
        assert!(matches!(
            validate_integrity(&data),
            Err(ImageError::HeaderChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_bad_signature() {
        let mut data = sample();
        data[0] = b'X';
        reseal(&mut data);
        assert!(matches!(validate_integrity(&data), Err(ImageError::InvalidSignature)));
    }

    #[test]
    fn test_bad_format_version() {
        let mut data = sample();
        data[FORMAT_VERSION_OFFSET] = 0x01;
        reseal(&mut data);
        assert!(matches!(
            validate_integrity(&data),
            Err(ImageError::UnsupportedVersion(0x01))
        ));
    }

    #[test]
    fn test_too_small() {
        assert!(matches!(
            validate_integrity(&[0u8; 20]),
            Err(ImageError::TooSmall { actual: 20, .. })
        ));
    }

    #[test]
    fn test_compatible_target() {
        let data = ImageBuilder::new()
            .device_id(0x12)
            .manufacturer_id(0x315A)
            .product_id(0x1234)
            .compat_revision(2, 0x10)
            .build();
        let header = ImageHeader::parse(&data).unwrap();
        assert!(compatibility_issues(&header, &identity()).is_empty());
        assert!(validate_device_compatibility(&header, &identity()).is_ok());
    }

    #[test]
    fn test_reports_every_mismatch() {
        let data = ImageBuilder::new()
            .device_id(0x13)
            .manufacturer_id(0x315A)
            .product_id(0x9999)
            .compat_revision(3, 0x00)
            .build();
        let header = ImageHeader::parse(&data).unwrap();
        let issues = compatibility_issues(&header, &identity());
        assert_eq!(issues.len(), 3);
        assert!(matches!(issues[0], CompatError::DeviceIdMismatch { image: 0x13, target: 0x12 }));
        assert!(matches!(issues[1], CompatError::ProductIdMismatch { .. }));
        assert!(matches!(
            issues[2],
            CompatError::EarliestRevisionIncompatible { target_major: 2, .. }
        ));
    }

    #[test]
    fn test_revision_major_ignores_update_bit() {
        let data = ImageBuilder::new()
            .device_id(0x12)
            .manufacturer_id(0x315A)
            .product_id(0x1234)
            .compat_revision(2, 0x11)
            .build();
        let header = ImageHeader::parse(&data).unwrap();
        let mut target = identity();
        target.firmware_revision = [0x82, 0x10];
        let issues = validate_device_compatibility(&header, &target).unwrap_err();
        assert_eq!(issues.len(), 1);
        assert!(matches!(
            issues[0],
            CompatError::EarliestRevisionIncompatible { target_major: 2, target_minor: 0x10, .. }
        ));
    }
}
