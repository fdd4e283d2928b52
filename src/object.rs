#[cfg(feature = "serde")]
use serde::Serialize;

use byteorder::{LittleEndian, ReadBytesExt};
use num_traits::{FromPrimitive, ToPrimitive};
use std::io::Cursor;
use std::time::SystemTime;

use crate::data::{parse_ptp_date, PtpData, PtpRead, PtpWrite};
use crate::storage::{
    AccessType, AssociationCode, FilesystemType, ObjectFormatCode, StorageType,
};
use crate::Error;

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct DeviceInfo {
    pub version: u16,
    pub vendor_ex_id: u32,
    pub vendor_ex_version: u16,
    pub vendor_extension_desc: String,
    pub functional_mode: u16,
    pub operations_supported: Vec<u16>,
    pub events_supported: Vec<u16>,
    pub device_properties_supported: Vec<u16>,
    pub capture_formats: Vec<u16>,
    pub image_formats: Vec<u16>,
    pub manufacturer: String,
    pub model: String,
    pub device_version: String,
    pub serial_number: String,
}

impl DeviceInfo {
    pub fn decode(buf: &[u8]) -> Result<DeviceInfo, Error> {
        let mut cur = Cursor::new(buf);

        Ok(DeviceInfo {
            version: cur.read_ptp_u16()?,
            vendor_ex_id: cur.read_ptp_u32()?,
            vendor_ex_version: cur.read_ptp_u16()?,
            vendor_extension_desc: cur.read_ptp_str()?,
            functional_mode: cur.read_ptp_u16()?,
            operations_supported: cur.read_ptp_u16_vec()?,
            events_supported: cur.read_ptp_u16_vec()?,
            device_properties_supported: cur.read_ptp_u16_vec()?,
            capture_formats: cur.read_ptp_u16_vec()?,
            image_formats: cur.read_ptp_u16_vec()?,
            manufacturer: cur.read_ptp_str()?,
            model: cur.read_ptp_str()?,
            device_version: cur.read_ptp_str()?,
            serial_number: cur.read_ptp_str()?,
        })
    }

    /// Whether this device advertises `GetPartialObject64 (0x95C1)`, the
    /// MTP vendor extension the filesystem view prefers for reads once
    /// available.
    pub fn supports_partial_object_64(&self) -> bool {
        self.operations_supported.contains(&0x95C1)
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct ObjectInfo {
    pub storage_id: u32,
    pub object_format: ObjectFormatCode,
    pub protection_status: u16,
    pub object_compressed_size: u32,
    pub thumb_format: ObjectFormatCode,
    pub thumb_compressed_size: u32,
    pub thumb_pix_width: u32,
    pub thumb_pix_height: u32,
    pub image_pix_width: u32,
    pub image_pix_height: u32,
    pub image_bit_depth: u32,
    pub parent_object: u32,
    pub association_type: AssociationCode,
    pub association_desc: u32,
    pub sequence_number: u32,
    pub filename: String,
    pub capture_date: String,
    pub modification_date: String,
    pub keywords: String,
}

impl ObjectInfo {
    pub fn decode(buf: &[u8]) -> Result<ObjectInfo, Error> {
        let mut cur = Cursor::new(buf);

        Ok(ObjectInfo {
            storage_id: cur.read_ptp_u32()?,
            object_format: ObjectFormatCode::from_u16(cur.read_ptp_u16()?)
                .ok_or(Error::BadObjectFormat)?,
            protection_status: cur.read_ptp_u16()?,
            object_compressed_size: cur.read_ptp_u32()?,
            thumb_format: ObjectFormatCode::from_u16(cur.read_ptp_u16()?)
                .ok_or(Error::BadObjectFormat)?,
            thumb_compressed_size: cur.read_ptp_u32()?,
            thumb_pix_width: cur.read_ptp_u32()?,
            thumb_pix_height: cur.read_ptp_u32()?,
            image_pix_width: cur.read_ptp_u32()?,
            image_pix_height: cur.read_ptp_u32()?,
            image_bit_depth: cur.read_ptp_u32()?,
            parent_object: cur.read_ptp_u32()?,
            association_type: AssociationCode::from_u16(cur.read_ptp_u16()?)
                .ok_or(Error::BadAssociationCode)?,
            association_desc: cur.read_ptp_u32()?,
            sequence_number: cur.read_ptp_u32()?,
            filename: cur.read_ptp_str()?,
            capture_date: cur.read_ptp_str()?,
            modification_date: cur.read_ptp_str()?,
            keywords: cur.read_ptp_str()?,
        })
    }

    pub fn encode<W: PtpWrite>(&self, mut w: W) -> Result<(), Error> {
        w.write_ptp_u32(self.storage_id)?;
        w.write_ptp_u16(self.object_format.to_u16().unwrap())?;
        w.write_ptp_u16(self.protection_status)?;
        w.write_ptp_u32(self.object_compressed_size)?;
        w.write_ptp_u16(self.thumb_format.to_u16().unwrap())?;
        w.write_ptp_u32(self.thumb_compressed_size)?;
        w.write_ptp_u32(self.thumb_pix_width)?;
        w.write_ptp_u32(self.thumb_pix_height)?;
        w.write_ptp_u32(self.image_pix_width)?;
        w.write_ptp_u32(self.image_pix_height)?;
        w.write_ptp_u32(self.image_bit_depth)?;
        w.write_ptp_u32(self.parent_object)?;
        w.write_ptp_u16(self.association_type.to_u16().unwrap())?;
        w.write_ptp_u32(self.association_desc)?;
        w.write_ptp_u32(self.sequence_number)?;
        w.write_ptp_str(&self.filename)?;
        w.write_ptp_str(&self.capture_date)?;
        w.write_ptp_str(&self.modification_date)?;
        w.write_ptp_str(&self.keywords)?;
        Ok(())
    }

    pub fn is_association(&self) -> bool {
        self.object_format.is_association()
    }

    /// Best-effort parse of `modification_date`. `None` if the device left
    /// the field blank or sent something that doesn't match
    /// `YYYYMMDDThhmmss`; callers fall back to the node's own access time.
    pub fn modification_timestamp(&self) -> Option<SystemTime> {
        let (year, month, day, hour, minute, second) = parse_ptp_date(&self.modification_date)?;
        days_and_seconds_since_epoch(year, month, day, hour, minute, second)
            .map(|secs| SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(secs))
    }
}

/// Converts a UTC calendar date/time to seconds since the Unix epoch using
/// a plain civil-calendar algorithm (no external date dependency, matching
/// the minimal, no-chrono footprint the rest of this crate keeps).
fn days_and_seconds_since_epoch(
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
) -> Option<u64> {
    if month == 0 || month > 12 || day == 0 || day > 31 {
        return None;
    }

    // Howard Hinnant's days_from_civil algorithm.
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as i64;
    let mp = (month as i64 + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    let days = era as i64 * 146097 + doe - 719468;

    let secs = days * 86400 + hour as i64 * 3600 + minute as i64 * 60 + second as i64;
    if secs < 0 {
        None
    } else {
        Some(secs as u64)
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct StorageInfo {
    pub storage_type: StorageType,
    pub filesystem_type: FilesystemType,
    pub access_capability: AccessType,
    pub max_capacity: u64,
    pub free_space_in_bytes: u64,
    pub free_space_in_images: u32,
    pub storage_description: String,
    pub volume_label: String,
}

impl StorageInfo {
    pub fn decode<T: PtpRead>(cur: &mut T) -> Result<StorageInfo, Error> {
        Ok(StorageInfo {
            storage_type: StorageType::from_u16(cur.read_ptp_u16()?).unwrap_or(StorageType::Undefined),
            filesystem_type: FilesystemType::from_u16(cur.read_ptp_u16()?)
                .unwrap_or(FilesystemType::Undefined),
            access_capability: AccessType::from_u16(cur.read_ptp_u16()?)
                .unwrap_or(AccessType::ReadWrite),
            max_capacity: cur.read_ptp_u64()?,
            free_space_in_bytes: cur.read_ptp_u64()?,
            free_space_in_images: cur.read_ptp_u32()?,
            storage_description: cur.read_ptp_str()?,
            volume_label: cur.read_ptp_str()?,
        })
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum FormData {
    None,
    Range {
        min_value: PtpData,
        max_value: PtpData,
        step: PtpData,
    },
    Enumeration {
        array: Vec<PtpData>,
    },
}

/// A typed property descriptor, either a device property (`GetDevicePropDesc`)
/// or an object property (`GetObjectPropDesc`) — the wire layout is shared.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct MtpProperty {
    pub property_code: u16,
    pub data_type: u16,
    pub get_set: u8,
    pub is_enable: u8,
    pub factory_default: PtpData,
    pub current: PtpData,
    pub form: FormData,
}

impl MtpProperty {
    pub fn decode<T: PtpRead>(cur: &mut T) -> Result<MtpProperty, Error> {
        let property_code = cur.read_u16::<LittleEndian>()?;
        let data_type = cur.read_u16::<LittleEndian>()?;
        let get_set = cur.read_u8()?;
        let is_enable = cur.read_u8()?;
        let factory_default = PtpData::read_type(data_type, cur)?;
        let current = PtpData::read_type(data_type, cur)?;
        let form = match cur.read_u8()? {
            0x01 => FormData::Range {
                min_value: PtpData::read_type(data_type, cur)?,
                max_value: PtpData::read_type(data_type, cur)?,
                step: PtpData::read_type(data_type, cur)?,
            },
            0x02 => {
                let len = cur.read_u16::<LittleEndian>()? as usize;
                let mut arr = Vec::with_capacity(len);
                for _ in 0..len {
                    arr.push(PtpData::read_type(data_type, cur)?);
                }
                FormData::Enumeration { array: arr }
            }
            _ => FormData::None,
        };

        Ok(MtpProperty {
            property_code,
            data_type,
            get_set,
            is_enable,
            factory_default,
            current,
            form,
        })
    }
}

/// Object property code for the "Name" property, used by the filesystem
/// view's `rename` handler (`SetObjectPropValue(0xDC07, STR)`).
pub const OBJECT_PROP_NAME: u16 = 0xDC07;
