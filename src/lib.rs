//! User-space FAT32 filesystem core: on-disk codecs, cluster allocation and
//! directory traversal over an external block device.

pub mod bpb;
pub mod cache;
pub mod device;
pub mod dir;
pub mod entry;
pub mod fat;
pub mod fs;
pub mod path;

use crate::device::DeviceErr;
use crate::dir::DirError;
use crate::fat::FatError;
use crate::path::PathError;

use std::fmt;

pub const LEAD_SIGNATURE: u32 = 0x41615252;
pub const STRUCT_SIGNATURE: u32 = 0x61417272;
pub const TRAIL_SIGNATURE: u32 = 0xAA550000;

pub const FREE_CLUSTER: u32 = 0x00000000;
pub const END_CLUSTER: u32 = 0x0FFFFFF8;
pub const BAD_CLUSTER: u32 = 0x0FFFFFF7;
/// EOC: End of Cluster Chain
/// note that we still USE this cluster and this clsuter id is not EOC,
/// but in FAT table, the value of this cluster is EOC
//
//  在创建新簇时将其在 FAT 表中的值设置为 EOC
//  这样在 next() 中也判断是否为 EOC
pub const END_OF_CLUSTER: u32 = 0x0FFFFFFF;

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
pub const ATTR_LONG_NAME: u8 = ATTR_READ_ONLY | ATTR_HIDDEN | ATTR_SYSTEM | ATTR_VOLUME_ID;

pub const DIRENT_SIZE: usize = 32;

pub const BLOCK_CACHE_LIMIT: usize = 64;

// Charactor
pub const SPACE: u8 = 0x20;
pub const DOT: u8 = 0x2E;

/// Sole supported sector size.
pub const BLOCK_SIZE: usize = 512;

pub const SHORT_NAME_LEN: usize = 8;
pub const SHORT_EXT_LEN: usize = 3;
pub const SHORT_DIR_ENT_NAME_CAPACITY: usize = SHORT_NAME_LEN + SHORT_EXT_LEN;

/// Default size of a freshly created backing image, in bytes.
pub const DEFAULT_DISK_SIZE: u64 = 20 * 1024 * 1024;

/// First byte of a short name that marks the slot as never-used. Only the
/// listing path (`dir::list_dir`) stops a scan here; lookup and free-slot
/// scans treat it the same as [`DIR_ENTRY_UNUSED`] and continue past it.
pub const DIR_ENTRY_LAST_AND_UNUSED: u8 = 0x00;
/// First byte of a short name that marks the slot as deleted.
pub const DIR_ENTRY_UNUSED: u8 = 0xE5;

/// Crate-wide error type composing each module's own error enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    Device(DeviceErr),
    Fat(FatError),
    Dir(DirError),
    Path(PathError),
    NotFormatted,
    CorruptFormat,
    InvalidArgument,
    AlreadyExists,
    OutOfSpace,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Device(e) => write!(f, "device error: {e:?}"),
            Error::Fat(e) => write!(f, "FAT error: {e:?}"),
            Error::Dir(e) => write!(f, "directory error: {e:?}"),
            Error::Path(e) => write!(f, "path error: {e:?}"),
            Error::NotFormatted => write!(f, "Unknown disk format"),
            Error::CorruptFormat => write!(f, "volume failed FAT32 validation"),
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::AlreadyExists => write!(f, "entry already exists"),
            Error::OutOfSpace => write!(f, "no free cluster available"),
        }
    }
}

impl std::error::Error for Error {}

impl From<DeviceErr> for Error {
    fn from(e: DeviceErr) -> Self {
        Error::Device(e)
    }
}

impl From<FatError> for Error {
    fn from(e: FatError) -> Self {
        Error::Fat(e)
    }
}

impl From<DirError> for Error {
    fn from(e: DirError) -> Self {
        Error::Dir(e)
    }
}

impl From<PathError> for Error {
    fn from(e: PathError) -> Self {
        Error::Path(e)
    }
}

pub(crate) fn read_le_u16(input: &[u8]) -> u16 {
    u16::from_le_bytes([input[0], input[1]])
}

pub(crate) fn read_le_u32(input: &[u8]) -> u32 {
    u32::from_le_bytes([input[0], input[1], input[2], input[3]])
}
