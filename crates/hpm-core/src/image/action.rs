//! Action record parsing.
//!
//! Records follow the header checksum byte and run up to the MD5 trailer.
//! Each record is three bytes (component mask, action type, checksum);
//! UploadFirmware records carry an inline image segment: version, description,
//! payload length and the payload itself.

use std::fmt;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use tracing::debug;

use super::ImageError;
use crate::component::ComponentSet;
use crate::protocol::messages::c_string;
use crate::version::FwVersion;

pub const ACTION_RECORD_LEN: usize = 3;
pub const DESCRIPTION_LEN: usize = 21;
/// Version + description + payload length.
pub const SEGMENT_HEADER_LEN: usize = FwVersion::SIZE + DESCRIPTION_LEN + 4;

const ACTION_BACKUP: u8 = 0;
const ACTION_PREPARE: u8 = 1;
const ACTION_UPLOAD_FIRMWARE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    Backup,
    Prepare,
    UploadFirmware,
}

impl ActionType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            ACTION_BACKUP => Some(ActionType::Backup),
            ACTION_PREPARE => Some(ActionType::Prepare),
            ACTION_UPLOAD_FIRMWARE => Some(ActionType::UploadFirmware),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            ActionType::Backup => ACTION_BACKUP,
            ActionType::Prepare => ACTION_PREPARE,
            ActionType::UploadFirmware => ACTION_UPLOAD_FIRMWARE,
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionType::Backup => write!(f, "Backup"),
            ActionType::Prepare => write!(f, "Prepare"),
            ActionType::UploadFirmware => write!(f, "Upload Firmware"),
        }
    }
}

/// Which byte range the record checksum covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumForm {
    /// The three record bytes only.
    Short,
    /// Record bytes plus the embedded segment header.
    Extended,
}

/// Firmware image segment following an UploadFirmware record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSegment<'a> {
    pub version: FwVersion,
    pub description: String,
    pub payload: &'a [u8],
}

impl ImageSegment<'_> {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action<'a> {
    Backup,
    Prepare,
    UploadFirmware(ImageSegment<'a>),
}

/// One parsed action record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRecord<'a> {
    /// Offset of the record inside the image.
    pub offset: usize,
    pub components: ComponentSet,
    pub action: Action<'a>,
    pub checksum_form: ChecksumForm,
}

impl ActionRecord<'_> {
    pub fn action_type(&self) -> ActionType {
        match self.action {
            Action::Backup => ActionType::Backup,
            Action::Prepare => ActionType::Prepare,
            Action::UploadFirmware(_) => ActionType::UploadFirmware,
        }
    }

    /// Bytes the record occupies, inline segment and payload included.
    pub fn encoded_len(&self) -> usize {
        match &self.action {
            Action::UploadFirmware(segment) => {
                ACTION_RECORD_LEN + SEGMENT_HEADER_LEN + segment.payload.len()
            }
            _ => ACTION_RECORD_LEN,
        }
    }
}

/// Additive checksum: the sum of all bytes, checksum byte included, is zero.
pub fn checksum_ok(bytes: &[u8]) -> bool {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)) == 0
}

/// Value that makes `bytes` followed by it sum to zero.
pub fn checksum_of(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        .wrapping_neg()
}

/// Iterator over the action records between `start` and `end`.
///
/// Stops after the first error.
#[derive(Debug)]
pub struct ActionRecords<'a> {
    data: &'a [u8],
    cursor: usize,
    end: usize,
    failed: bool,
}

impl<'a> ActionRecords<'a> {
    pub fn new(data: &'a [u8], start: usize, end: usize) -> Self {
        Self {
            data,
            cursor: start,
            end: end.min(data.len()),
            failed: false,
        }
    }

    /// Offset of the next record.
    pub fn position(&self) -> usize {
        self.cursor
    }

    fn parse_next(&mut self) -> Result<ActionRecord<'a>, ImageError> {
        let offset = self.cursor;
        if offset + ACTION_RECORD_LEN > self.end {
            return Err(ImageError::Truncated { offset });
        }
        let record = &self.data[offset..offset + ACTION_RECORD_LEN];
        let components = ComponentSet::from_bits(record[0]);
        let action_type = ActionType::from_byte(record[1]).ok_or(ImageError::InvalidActionRecord {
            offset,
            reason: "unknown action type",
        })?;

        let record = match action_type {
            ActionType::Backup | ActionType::Prepare => {
                if !checksum_ok(record) {
                    return Err(ImageError::InvalidActionRecord {
                        offset,
                        reason: "checksum mismatch",
                    });
                }
                ActionRecord {
                    offset,
                    components,
                    action: if action_type == ActionType::Backup {
                        Action::Backup
                    } else {
                        Action::Prepare
                    },
                    checksum_form: ChecksumForm::Short,
                }
            }
            ActionType::UploadFirmware => self.parse_upload(offset, components)?,
        };

        self.cursor = offset + record.encoded_len();
        Ok(record)
    }

    fn parse_upload(
        &self,
        offset: usize,
        components: ComponentSet,
    ) -> Result<ActionRecord<'a>, ImageError> {
        let segment_start = offset + ACTION_RECORD_LEN;
        let payload_start = segment_start + SEGMENT_HEADER_LEN;
        if payload_start > self.end {
            return Err(ImageError::Truncated { offset });
        }

        // Images exist with either checksum span; accept both.
        let checksum_form = if checksum_ok(&self.data[offset..segment_start]) {
            ChecksumForm::Short
        } else if checksum_ok(&self.data[offset..payload_start]) {
            debug!(offset, "Upload record checksum covers the segment header");
            ChecksumForm::Extended
        } else {
            return Err(ImageError::InvalidActionRecord {
                offset,
                reason: "checksum mismatch",
            });
        };

        let header = &self.data[segment_start..payload_start];
        let mut version = [0u8; FwVersion::SIZE];
        version.copy_from_slice(&header[..FwVersion::SIZE]);
        let description = c_string(&header[FwVersion::SIZE..FwVersion::SIZE + DESCRIPTION_LEN]);
        let mut cursor = Cursor::new(&header[FwVersion::SIZE + DESCRIPTION_LEN..]);
        let length = cursor.read_u32::<LittleEndian>()? as usize;

        let payload_end = payload_start
            .checked_add(length)
            .filter(|end| *end <= self.end)
            .ok_or(ImageError::Truncated { offset })?;

        Ok(ActionRecord {
            offset,
            components,
            action: Action::UploadFirmware(ImageSegment {
                version: FwVersion::from_bytes(&version),
                description,
                payload: &self.data[payload_start..payload_end],
            }),
            checksum_form,
        })
    }
}

impl<'a> Iterator for ActionRecords<'a> {
    type Item = Result<ActionRecord<'a>, ImageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.cursor >= self.end {
            return None;
        }
        let result = self.parse_next();
        if result.is_err() {
            self.failed = true;
        }
        Some(result)
    }
}
