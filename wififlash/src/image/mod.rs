//! Firmware image sources.
//!
//! An upload reads its image block by block through [`ImageSource`], so the
//! whole file never has to sit in memory. [`FileImage`] reads from disk and
//! [`MemoryImage`] wraps a buffer.
//!
//! ## ESP8266 image header
//!
//! ```text
//! +-------+----------+------------+----------------+-------------+
//! | Magic | Segments | Flash mode | Size/frequency | Entry point |
//! +-------+----------+------------+----------------+-------------+
//! | 0xE9  |    1     |     1      |       1        |   4 (LE)    |
//! +-------+----------+------------+----------------+-------------+
//! ```
//!
//! Web file-system images carry no such header.

use {
    crate::{
        error::{Error, Result},
        target::esp8266::flash::{IMAGE_MAGIC, block_count, erase_size},
    },
    byteorder::{ByteOrder, LittleEndian},
    std::{
        fs::File,
        io::{Read, Seek, SeekFrom},
        path::{Path, PathBuf},
    },
};

/// Random-access, length-known image.
pub trait ImageSource {
    /// Total length in bytes.
    fn size(&self) -> u32;

    /// Fill `buf` from `offset`, returning how many bytes were read. Fewer
    /// than `buf.len()` bytes are returned only at the end of the image.
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<usize>;
}

/// Image held in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryImage {
    data: Vec<u8>,
}

impl MemoryImage {
    /// Wrap `data`.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Image bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for MemoryImage {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl ImageSource for MemoryImage {
    fn size(&self) -> u32 {
        u32::try_from(self.data.len()).unwrap_or(u32::MAX)
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<usize> {
        let start = (offset as usize).min(self.data.len());
        let end = (start + buf.len()).min(self.data.len());
        let n = end - start;
        buf[..n].copy_from_slice(&self.data[start..end]);
        Ok(n)
    }
}

/// Image read from a file on demand.
#[derive(Debug)]
pub struct FileImage {
    file: File,
    path: PathBuf,
    size: u32,
}

impl FileImage {
    /// Open `path` and record its length.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| Error::FileRead(format!("{}: {e}", path.display())))?;
        let len = file
            .metadata()
            .map_err(|e| Error::FileRead(format!("{}: {e}", path.display())))?
            .len();
        let size = u32::try_from(len).map_err(|_| {
            Error::FileRead(format!(
                "{}: {len} bytes does not fit the flash address space",
                path.display()
            ))
        })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            size,
        })
    }

    /// Path the image was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ImageSource for FileImage {
    fn size(&self) -> u32 {
        self.size
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<usize> {
        let map = |e: std::io::Error| {
            Error::FileRead(format!("{} at offset {offset}: {e}", self.path.display()))
        };
        self.file.seek(SeekFrom::Start(u64::from(offset))).map_err(map)?;

        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(map(e)),
            }
        }
        Ok(filled)
    }
}

/// Summary of an image and the flash layout an upload would use.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ImageInfo {
    /// Image length in bytes.
    pub size: u32,
    /// Flash address the image is written to.
    pub address: u32,
    /// 1 KiB blocks that will be written.
    pub blocks: u32,
    /// Erase length announced to the bootloader.
    pub erase_size: u32,
    /// Whether the image starts with the bootable image magic.
    pub bootable: bool,
    /// Segment count from the image header.
    pub segments: Option<u8>,
    /// Flash mode byte from the image header.
    pub flash_mode: Option<u8>,
    /// Flash size/frequency byte from the image header.
    pub flash_size_freq: Option<u8>,
    /// Entry point from the image header.
    pub entry_point: Option<u32>,
}

impl ImageInfo {
    /// Inspect `image` as if it were to be written at `address`.
    pub fn inspect<I: ImageSource + ?Sized>(image: &mut I, address: u32) -> Result<Self> {
        let size = image.size();
        let mut header = [0u8; 8];
        let n = image.read(0, &mut header)?;
        let bootable = n == header.len() && header[0] == IMAGE_MAGIC;
        let field = |value| bootable.then_some(value);

        Ok(Self {
            size,
            address,
            blocks: block_count(size),
            erase_size: erase_size(size, address),
            bootable,
            segments: field(header[1]),
            flash_mode: field(header[2]),
            flash_size_freq: field(header[3]),
            entry_point: bootable.then(|| LittleEndian::read_u32(&header[4..8])),
        })
    }
}
