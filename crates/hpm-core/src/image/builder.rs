//! Construction of well-formed HPM.1 images.

use byteorder::{LittleEndian, WriteBytesExt};

use super::action::{DESCRIPTION_LEN, checksum_of};
use super::header::{IMAGE_FORMAT_VERSION, IMAGE_SIGNATURE, ImageCapabilities};
use super::validate::{MD5_TRAILER_LEN, md5_digest};
use crate::component::ComponentSet;
use crate::version::FwVersion;

#[derive(Debug, Clone)]
enum PlannedRecord {
    Backup(ComponentSet),
    Prepare(ComponentSet),
    Upload {
        component: u8,
        version: FwVersion,
        description: String,
        payload: Vec<u8>,
    },
}

/// Builder for upgrade images.
///
/// The header component mask defaults to the union of all uploaded
/// components.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    device_id: u8,
    device_revision: u8,
    firmware_revision: [u8; 2],
    manufacturer_id: u32,
    product_id: u16,
    compat_revision: [u8; 2],
    capabilities: ImageCapabilities,
    components: Option<ComponentSet>,
    timeouts: [u8; 3],
    oem_data: Vec<u8>,
    extended_checksum: bool,
    records: Vec<PlannedRecord>,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self {
            device_id: 0x12,
            device_revision: 0x01,
            firmware_revision: [0x02, 0x10],
            manufacturer_id: 0x00_315A,
            product_id: 0x1234,
            compat_revision: [0x00, 0x00],
            capabilities: ImageCapabilities::empty(),
            components: None,
            timeouts: [0, 0, 0],
            oem_data: Vec::new(),
            extended_checksum: false,
            records: Vec::new(),
        }
    }
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device_id(mut self, id: u8) -> Self {
        self.device_id = id;
        self
    }

    pub fn device_revision(mut self, rev: u8) -> Self {
        self.device_revision = rev;
        self
    }

    pub fn firmware_revision(mut self, major: u8, minor: u8) -> Self {
        self.firmware_revision = [major, minor];
        self
    }

    pub fn manufacturer_id(mut self, id: u32) -> Self {
        self.manufacturer_id = id & 0x0F_FFFF;
        self
    }

    pub fn product_id(mut self, id: u16) -> Self {
        self.product_id = id;
        self
    }

    pub fn compat_revision(mut self, major: u8, minor: u8) -> Self {
        self.compat_revision = [major, minor];
        self
    }

    pub fn capabilities(mut self, caps: ImageCapabilities) -> Self {
        self.capabilities = caps;
        self
    }

    /// Override the header component mask.
    pub fn components(mut self, components: ComponentSet) -> Self {
        self.components = Some(components);
        self
    }

    /// Self-test, rollback and inaccessibility timeouts in 5-second units.
    pub fn timeouts(mut self, self_test: u8, rollback: u8, inaccess: u8) -> Self {
        self.timeouts = [self_test, rollback, inaccess];
        self
    }

    pub fn oem_data(mut self, data: &[u8]) -> Self {
        self.oem_data = data.to_vec();
        self
    }

    /// Checksum upload records over the segment header as well.
    pub fn extended_checksum(mut self, enabled: bool) -> Self {
        self.extended_checksum = enabled;
        self
    }

    pub fn backup(mut self, components: ComponentSet) -> Self {
        self.records.push(PlannedRecord::Backup(components));
        self
    }

    pub fn prepare(mut self, components: ComponentSet) -> Self {
        self.records.push(PlannedRecord::Prepare(components));
        self
    }

    pub fn upload(
        mut self,
        component: u8,
        version: FwVersion,
        description: &str,
        payload: Vec<u8>,
    ) -> Self {
        self.records.push(PlannedRecord::Upload {
            component,
            version,
            description: description.to_string(),
            payload,
        });
        self
    }

    fn header_components(&self) -> ComponentSet {
        if let Some(components) = self.components {
            return components;
        }
        let mut set = ComponentSet::EMPTY;
        for record in &self.records {
            if let PlannedRecord::Upload { component, .. } = record {
                set.insert(*component);
            }
        }
        set
    }

    /// Serialize the image, trailer included.
    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_header(&mut out);
        for record in &self.records {
            self.write_record(&mut out, record);
        }
        out.extend_from_slice(&[0u8; MD5_TRAILER_LEN]);
        reseal(&mut out);
        out
    }

    // Writes into a Vec<u8> cannot fail.
    fn write_header(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(IMAGE_SIGNATURE);
        out.push(IMAGE_FORMAT_VERSION);
        out.push(self.device_id);
        out.push(self.device_revision);
        out.extend_from_slice(&self.firmware_revision);
        let _ = out.write_u24::<LittleEndian>(self.manufacturer_id);
        let _ = out.write_u16::<LittleEndian>(self.product_id);
        out.extend_from_slice(&self.compat_revision);
        out.push(self.capabilities.bits());
        out.push(self.header_components().bits());
        out.extend_from_slice(&self.timeouts);
        let _ = out.write_u16::<LittleEndian>(self.oem_data.len() as u16);
        out.extend_from_slice(&self.oem_data);
        let checksum = checksum_of(out);
        out.push(checksum);
    }

    fn write_record(&self, out: &mut Vec<u8>, record: &PlannedRecord) {
        match record {
            PlannedRecord::Backup(set) => {
                let rec = [set.bits(), 0x00];
                out.extend_from_slice(&rec);
                out.push(checksum_of(&rec));
            }
            PlannedRecord::Prepare(set) => {
                let rec = [set.bits(), 0x01];
                out.extend_from_slice(&rec);
                out.push(checksum_of(&rec));
            }
            PlannedRecord::Upload {
                component,
                version,
                description,
                payload,
            } => {
                let rec = [ComponentSet::single(*component).bits(), 0x02];

                let mut segment = Vec::with_capacity(FwVersion::SIZE + DESCRIPTION_LEN + 4);
                segment.extend_from_slice(&version.to_bytes());
                let mut desc = [0u8; DESCRIPTION_LEN];
                // Keep a terminating NUL.
                let len = description.len().min(DESCRIPTION_LEN - 1);
                desc[..len].copy_from_slice(&description.as_bytes()[..len]);
                segment.extend_from_slice(&desc);
                let _ = segment.write_u32::<LittleEndian>(payload.len() as u32);

                let checksum = if self.extended_checksum {
                    let mut span = rec.to_vec();
                    span.extend_from_slice(&segment);
                    checksum_of(&span)
                } else {
                    checksum_of(&rec)
                };
                out.extend_from_slice(&rec);
                out.push(checksum);
                out.extend_from_slice(&segment);
                out.extend_from_slice(payload);
            }
        }
    }
}

/// Recompute the MD5 trailer over the rest of the image.
pub fn reseal(data: &mut [u8]) {
    if data.len() < MD5_TRAILER_LEN {
        return;
    }
    let body_len = data.len() - MD5_TRAILER_LEN;
    let digest = md5_digest(&data[..body_len]);
    data[body_len..].copy_from_slice(&digest);
}
