use std::{
    fs::{self, File},
    io::{self, Read},
    path::Path,
};

use log::{trace, warn};
use thiserror::Error;

use crate::{
    constants::{PLF_EXTENSION, STAGING_PREFIX},
    version::PlfVersion,
};

// A PLF image starts with a fixed header made of 14 little endian u32 fields.
//
// | Offset | Description                         |
// |--------|-------------------------------------|
// | 0      | Magic ("PLF!")                      |
// | 4      | Header format version               |
// | 8      | Header size                         |
// | 12     | Section header size                 |
// | 16     | File type                           |
// | 20     | Entry point                         |
// | 24     | Target platform                     |
// | 28     | Target application                  |
// | 32     | Hardware compatibility              |
// | 36     | Version major                       |
// | 40     | Version minor                       |
// | 44     | Version extra                       |
// | 48     | Language zone                       |
// | 52     | File size                           |

pub const PLF_MAGIC: u32 = 0x2146_4c50;
pub const HEADER_SIZE: usize = 14 * 4;

#[derive(Debug, Error)]
pub enum PlfError {
    #[error("Could not read PLF file: {0}")]
    Io(#[from] io::Error),
    #[error("PLF file is too small to hold a header ({0} bytes)")]
    TooShort(usize),
    #[error("Bad PLF magic: {0:08X}")]
    BadMagic(u32),
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PlfHeader {
    pub header_version: u32,
    pub header_size: u32,
    pub section_header_size: u32,
    pub file_type: u32,
    pub entry_point: u32,
    pub target_platform: u32,
    pub target_application: u32,
    pub hardware_compat: u32,
    pub version: PlfVersion,
    pub language_zone: u32,
    pub file_size: u32,
}

impl PlfHeader {
    pub fn parse(data: &[u8]) -> Result<Self, PlfError> {
        if data.len() < HEADER_SIZE {
            return Err(PlfError::TooShort(data.len()));
        }

        // Cannot panic: the slice is always 4 bytes
        let field = |i: usize| u32::from_le_bytes(data[i * 4..i * 4 + 4].try_into().unwrap());

        let magic = field(0);
        if magic != PLF_MAGIC {
            return Err(PlfError::BadMagic(magic));
        }

        Ok(Self {
            header_version: field(1),
            header_size: field(2),
            section_header_size: field(3),
            file_type: field(4),
            entry_point: field(5),
            target_platform: field(6),
            target_application: field(7),
            hardware_compat: field(8),
            version: PlfVersion::new(field(9), field(10), field(11)),
            language_zone: field(12),
            file_size: field(13),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let fields = [
            PLF_MAGIC,
            self.header_version,
            self.header_size,
            self.section_header_size,
            self.file_type,
            self.entry_point,
            self.target_platform,
            self.target_application,
            self.hardware_compat,
            self.version.major,
            self.version.minor,
            self.version.extra,
            self.language_zone,
            self.file_size,
        ];

        let mut buf = [0u8; HEADER_SIZE];
        for (chunk, value) in buf.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        buf
    }
}

/// Read the header of a PLF image.
pub fn read_header(path: &Path) -> Result<PlfHeader, PlfError> {
    let mut buf = Vec::with_capacity(HEADER_SIZE);
    File::open(path)?
        .take(HEADER_SIZE as u64)
        .read_to_end(&mut buf)?;

    PlfHeader::parse(&buf)
}

/// Read the firmware version stored in the header of a PLF image.
pub fn read_version(path: &Path) -> Result<PlfVersion, PlfError> {
    let header = read_header(path)?;
    trace!("PLF header of {:?}: {:?}", path, header);
    Ok(header.version)
}

/// Whether a file name denotes an installed (canonical) image. Staging files
/// share the directory but never count.
pub fn is_canonical_name(name: &str) -> bool {
    !name.starts_with(STAGING_PREFIX)
        && Path::new(name)
            .extension()
            .map_or(false, |e| e.eq_ignore_ascii_case(PLF_EXTENSION))
}

/// Find the installed image in a product directory. A missing directory is
/// not an error. If several images are present, which should not happen, the
/// first one by name wins.
pub fn find_plf_in_folder(dir: &Path) -> io::Result<Option<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut candidates = vec![];

    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if is_canonical_name(name) {
                candidates.push(name.to_owned());
            }
        }
    }

    candidates.sort();
    if candidates.len() > 1 {
        warn!("Found {} PLF files in {:?}, using {:?}", candidates.len(), dir, candidates[0]);
    }

    Ok(candidates.into_iter().next())
}
