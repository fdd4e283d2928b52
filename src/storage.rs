use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use std::fmt::Display;

/// Identifies an MTP object (file, folder, playlist, ...) on a device.
///
/// `0xFFFFFFFF` is the protocol's `MTP_PARENT_ROOT` sentinel: passed as a
/// parent handle it means "the top level of a storage", and `root()`
/// constructs exactly that value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectHandle(pub(crate) u32);

impl ObjectHandle {
    /// Returns an ObjectHandle that represents the "root" of a storage
    /// (the wire sentinel `MTP_PARENT_ROOT`, `0xFFFFFFFF`).
    pub fn root() -> ObjectHandle {
        Self::root_const()
    }

    pub const fn root_const() -> ObjectHandle {
        ObjectHandle(0xFFFFFFFF)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub(crate) fn from_raw(v: u32) -> ObjectHandle {
        ObjectHandle(v)
    }

    pub(crate) const fn from_raw_const(v: u32) -> ObjectHandle {
        ObjectHandle(v)
    }
}

impl Display for ObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectHandle(0x{:08x})", self.0)
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, FromPrimitive, ToPrimitive, Ord, PartialOrd, Eq)]
pub enum StandardObjectFormatCode {
    UndefinedNonImage = 0x3000,
    Association,
    Script,
    Executable,
    Text,
    Html,
    Dpof,
    Aiff,
    Wav,
    Mp3,
    Avi,
    Mpeg,
    Asf,
    UndefinedImage = 0x3800,
    ExifJpeg,
    TiffEp,
    FlashPix,
    Bmp,
    Ciff,
    UndefinedReserved,
    Gif,
    Jfif,
    Pcd,
    Pict,
    Png,
    UndefinedReserved2,
    Tiff,
    TiffIt,
    Jp2,
    Jpx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectFormatCode {
    Standard(StandardObjectFormatCode),
    Reserved(u16),
    Vendor(u16),
    ImageOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectFormatCategory {
    Ancillary,
    Image,
    Unknown,
}

impl ObjectFormatCode {
    /// True when this format marks a folder (`0x3001`, `ASSOCIATION`).
    pub fn is_association(&self) -> bool {
        matches!(
            self,
            ObjectFormatCode::Standard(StandardObjectFormatCode::Association)
        )
    }

    pub fn category(&self) -> ObjectFormatCategory {
        match self {
            ObjectFormatCode::Standard(sofc) => match sofc {
                StandardObjectFormatCode::UndefinedNonImage
                | StandardObjectFormatCode::Association
                | StandardObjectFormatCode::Script
                | StandardObjectFormatCode::Executable
                | StandardObjectFormatCode::Text
                | StandardObjectFormatCode::Html
                | StandardObjectFormatCode::Dpof
                | StandardObjectFormatCode::Aiff
                | StandardObjectFormatCode::Wav
                | StandardObjectFormatCode::Mp3
                | StandardObjectFormatCode::Avi
                | StandardObjectFormatCode::Mpeg
                | StandardObjectFormatCode::Asf => ObjectFormatCategory::Ancillary,
                StandardObjectFormatCode::UndefinedImage
                | StandardObjectFormatCode::ExifJpeg
                | StandardObjectFormatCode::TiffEp
                | StandardObjectFormatCode::FlashPix
                | StandardObjectFormatCode::Bmp
                | StandardObjectFormatCode::Ciff
                | StandardObjectFormatCode::UndefinedReserved
                | StandardObjectFormatCode::Gif
                | StandardObjectFormatCode::Jfif
                | StandardObjectFormatCode::Pcd
                | StandardObjectFormatCode::Pict
                | StandardObjectFormatCode::Png
                | StandardObjectFormatCode::UndefinedReserved2
                | StandardObjectFormatCode::Tiff
                | StandardObjectFormatCode::TiffIt
                | StandardObjectFormatCode::Jp2
                | StandardObjectFormatCode::Jpx => ObjectFormatCategory::Image,
                _ => ObjectFormatCategory::Unknown,
            },
            ObjectFormatCode::ImageOnly => ObjectFormatCategory::Image,
            _ => ObjectFormatCategory::Unknown,
        }
    }
}

impl FromPrimitive for ObjectFormatCode {
    fn from_i64(_: i64) -> Option<Self> {
        None
    }

    fn from_u64(n: u64) -> Option<Self> {
        let n = n as u16;

        const MSN_MASK: u16 = 0b1111_0000_0000_0000;
        const RESERVED_MSN: u16 = 0b0011;
        const VENDOR_MSN: u16 = 0b1011;

        if let Some(ofc) = StandardObjectFormatCode::from_u16(n) {
            return Some(ObjectFormatCode::Standard(ofc));
        }

        if n == 0xFFFF {
            return Some(ObjectFormatCode::ImageOnly);
        }

        let msn = (n & MSN_MASK) >> 12;

        if msn == VENDOR_MSN {
            return Some(ObjectFormatCode::Vendor(n));
        }

        if msn == RESERVED_MSN {
            return Some(ObjectFormatCode::Reserved(n));
        }

        None
    }
}

impl ToPrimitive for ObjectFormatCode {
    fn to_i64(&self) -> Option<i64> {
        None
    }

    fn to_u64(&self) -> Option<u64> {
        match self {
            ObjectFormatCode::Standard(ofc) => ofc.to_u64(),
            ObjectFormatCode::Reserved(n) | ObjectFormatCode::Vendor(n) => Some(*n as u64),
            ObjectFormatCode::ImageOnly => Some(0xFFFFFFFF),
        }
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, FromPrimitive, ToPrimitive, Ord, PartialOrd, Eq)]
pub enum StandardAssociationCode {
    Undefined = 0x0000,
    GenericFolder,
    Album,
    TimeSequence,
    PanoramicHorizontal,
    PanoramicVertical,
    Panoramic2D,
    AncillaryData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationCode {
    Standard(StandardAssociationCode),
    Reserved(u16),
    Vendor(u16),
}

impl FromPrimitive for AssociationCode {
    fn from_i64(_: i64) -> Option<Self> {
        None
    }

    fn from_u64(n: u64) -> Option<Self> {
        let n = n as u16;

        if let Some(ac) = StandardAssociationCode::from_u16(n) {
            return Some(AssociationCode::Standard(ac));
        }

        if (n >> 15) & 1 == 1 {
            return Some(AssociationCode::Vendor(n));
        }

        Some(AssociationCode::Reserved(n))
    }
}

impl ToPrimitive for AssociationCode {
    fn to_i64(&self) -> Option<i64> {
        None
    }

    fn to_u64(&self) -> Option<u64> {
        match self {
            AssociationCode::Standard(ac) => ac.to_u64(),
            AssociationCode::Reserved(n) | AssociationCode::Vendor(n) => Some(*n as u64),
        }
    }
}

/// Identifies a logical storage (internal memory, SD card, ...) on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorageId(pub(crate) u32);

impl StorageId {
    /// The sentinel used by `GetNumObjects` to mean "every store combined".
    pub fn all() -> StorageId {
        StorageId(0xFFFFFFFF)
    }

    /// The sentinel used by `GetObjectHandles` to mean "every storage".
    /// PTP/MTP operations are not consistent about which "all" value they
    /// expect; this is the one `GetObjectHandles` wants.
    pub fn all_for_handles() -> StorageId {
        StorageId(0)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub(crate) fn from_raw(v: u32) -> StorageId {
        StorageId(v)
    }

    pub(crate) const fn from_raw_const(v: u32) -> StorageId {
        StorageId(v)
    }
}

impl Display for StorageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageId(0x{:08x})", self.0)
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum StorageType {
    Undefined = 0x0000,
    FixedRom = 0x0001,
    RemovableRom = 0x0002,
    FixedRam = 0x0003,
    RemovableRam = 0x0004,
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum FilesystemType {
    Undefined = 0x0000,
    GenericFlat = 0x0001,
    GenericHierarchical = 0x0002,
    Dcf = 0x0003,
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum AccessType {
    ReadWrite = 0x0000,
    ReadOnlyWithoutDelete = 0x0001,
    ReadOnlyWithDelete = 0x0002,
}
