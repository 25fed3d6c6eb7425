//! UniFS: a flat, read-only, in-memory filesystem.
//!
//! Image layout: a 16-byte header (`"UNIFS v1"` magic + little-endian u64
//! file count), then one 80-byte entry per file (64-byte NUL-terminated name,
//! u64 offset from the image base, u64 size), then the concatenated file
//! bytes. The image is immutable after mount, so handles are plain borrows
//! and no locking is needed on the read path.

use log::{info, warn};
use spinning_top::RwSpinlock;

use super::FsError;

/// Magic bytes at the start of every image.
pub const MAGIC: &[u8; 8] = b"UNIFS v1";

const HEADER_SIZE: usize = 16;
const ENTRY_SIZE: usize = 80;
const NAME_SIZE: usize = 64;

static FILESYSTEM: RwSpinlock<Option<FileSystem>> = RwSpinlock::new(None);

/// Coarse content classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Elf,
    Text,
    Binary,
}

/// A borrowed view of one file inside the mounted image.
#[derive(Debug, Clone, Copy)]
pub struct FileHandle {
    pub name: &'static str,
    pub data: &'static [u8],
}

impl FileHandle {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// A mounted UniFS image.
pub struct FileSystem {
    image: &'static [u8],
    count: usize,
}

impl FileSystem {
    /// Validate and wrap an image.
    ///
    /// Every entry must name a `(offset, offset + size)` range inside the
    /// image; a violation rejects the whole image rather than serving
    /// out-of-bounds borrows later.
    pub fn mount(image: &'static [u8]) -> Result<Self, FsError> {
        if image.len() < HEADER_SIZE || image[..8] != *MAGIC {
            return Err(FsError::Corrupt);
        }
        let count = u64::from_le_bytes(image[8..16].try_into().unwrap()) as usize;
        let table_end = count
            .checked_mul(ENTRY_SIZE)
            .and_then(|n| n.checked_add(HEADER_SIZE))
            .ok_or(FsError::Corrupt)?;
        if table_end > image.len() {
            return Err(FsError::Corrupt);
        }

        let fs = Self { image, count };
        for index in 0..count {
            let (_, offset, size) = fs.raw_entry(index);
            let end = offset.checked_add(size).ok_or(FsError::Corrupt)?;
            if end > image.len() as u64 {
                return Err(FsError::Corrupt);
            }
        }
        Ok(fs)
    }

    fn raw_entry(&self, index: usize) -> (&'static [u8], u64, u64) {
        let image: &'static [u8] = self.image;
        let base = HEADER_SIZE + index * ENTRY_SIZE;
        let entry = &image[base..base + ENTRY_SIZE];
        let name = &entry[..NAME_SIZE];
        let offset = u64::from_le_bytes(entry[NAME_SIZE..NAME_SIZE + 8].try_into().unwrap());
        let size = u64::from_le_bytes(entry[NAME_SIZE + 8..NAME_SIZE + 16].try_into().unwrap());
        (name, offset, size)
    }

    fn entry_name(&self, index: usize) -> Option<&'static str> {
        let (name, _, _) = self.raw_entry(index);
        let len = name.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE);
        core::str::from_utf8(&name[..len]).ok()
    }

    fn handle(&self, index: usize) -> Option<FileHandle> {
        let image: &'static [u8] = self.image;
        let (_, offset, size) = self.raw_entry(index);
        Some(FileHandle {
            name: self.entry_name(index)?,
            data: &image[offset as usize..(offset + size) as usize],
        })
    }

    /// Linear scan by name.
    pub fn lookup(&self, name: &str) -> Result<FileHandle, FsError> {
        (0..self.count)
            .filter(|&i| self.entry_name(i) == Some(name))
            .find_map(|i| self.handle(i))
            .ok_or(FsError::NotFound)
    }

    pub fn open(&self, name: &str) -> Option<FileHandle> {
        self.lookup(name).ok()
    }

    pub fn file_exists(&self, name: &str) -> bool {
        self.open(name).is_some()
    }

    pub fn file_size(&self, name: &str) -> u64 {
        self.open(name).map_or(0, |f| f.size())
    }

    pub fn file_type(&self, name: &str) -> Option<FileType> {
        self.open(name).map(|f| classify(f.data))
    }

    pub fn file_count(&self) -> usize {
        self.count
    }

    pub fn file_name(&self, index: usize) -> Option<&'static str> {
        if index >= self.count {
            return None;
        }
        self.entry_name(index)
    }

    pub fn file_size_by_index(&self, index: usize) -> u64 {
        if index >= self.count {
            return 0;
        }
        let (_, _, size) = self.raw_entry(index);
        size
    }
}

/// ELF if it starts with the ELF magic; text if the first 256 bytes are
/// printable ASCII, tab, LF or CR; binary otherwise.
fn classify(data: &[u8]) -> FileType {
    if data.len() >= 4 && data[..4] == [0x7f, b'E', b'L', b'F'] {
        return FileType::Elf;
    }
    let probe = &data[..data.len().min(256)];
    if probe
        .iter()
        .all(|&b| matches!(b, 9 | 10 | 13 | 32..=126))
    {
        FileType::Text
    } else {
        FileType::Binary
    }
}

/// Mount the boot module as the global filesystem.
pub fn mount(image: &'static [u8]) {
    match FileSystem::mount(image) {
        Ok(fs) => {
            info!("unifs: mounted {} files ({} bytes)", fs.count, image.len());
            *FILESYSTEM.write() = Some(fs);
        }
        Err(err) => warn!("unifs: mount failed: {:?}", err),
    }
}

pub fn is_mounted() -> bool {
    FILESYSTEM.read().is_some()
}

/// Look up a file in the mounted filesystem. A miss (or no mounted image)
/// is [`FsError::NotFound`].
pub fn lookup(name: &str) -> Result<FileHandle, FsError> {
    FILESYSTEM
        .read()
        .as_ref()
        .ok_or(FsError::NotFound)?
        .lookup(name)
}

/// Option-shaped variant of [`lookup`].
pub fn open(name: &str) -> Option<FileHandle> {
    lookup(name).ok()
}

/// Copy-out lookup: fills caller-provided storage so the result stays valid
/// even if the caller is preempted between lookup and use.
pub fn open_into(name: &str, out: &mut FileHandle) -> bool {
    match lookup(name) {
        Ok(handle) => {
            *out = handle;
            true
        }
        Err(_) => false,
    }
}

pub fn file_exists(name: &str) -> bool {
    FILESYSTEM.read().as_ref().is_some_and(|fs| fs.file_exists(name))
}

pub fn file_size(name: &str) -> u64 {
    FILESYSTEM.read().as_ref().map_or(0, |fs| fs.file_size(name))
}

pub fn file_type(name: &str) -> Option<FileType> {
    FILESYSTEM.read().as_ref()?.file_type(name)
}

pub fn file_count() -> usize {
    FILESYSTEM.read().as_ref().map_or(0, FileSystem::file_count)
}

pub fn file_name(index: usize) -> Option<&'static str> {
    FILESYSTEM.read().as_ref()?.file_name(index)
}

pub fn file_size_by_index(index: usize) -> u64 {
    FILESYSTEM
        .read()
        .as_ref()
        .map_or(0, |fs| fs.file_size_by_index(index))
}
