//! In-place-mutable binary image with absolute-address translation.
//!
//! The rest of the engine only ever speaks absolute addresses; this module
//! owns the single mutable byte buffer and translates every access through
//! `load_address` with a bounds check. Any address outside
//! `[load_address, load_address + len)` is a fatal error.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::{Address, Endianness, RewriteError, INSN_WIDTH};

/// A loaded memory image: owned bytes, the address its first byte maps to,
/// and the byte order its instruction words are stored in.
#[derive(Debug, Clone)]
pub struct BinaryImage {
    bytes: Vec<u8>,
    load_address: Address,
    endian: Endianness,
    path: Option<PathBuf>,
}

impl BinaryImage {
    /// Read an image from disk.
    pub fn open<P: AsRef<Path>>(
        path: P,
        load_address: Address,
        endian: Endianness,
    ) -> Result<Self, RewriteError> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        info!(
            "loaded {} ({} bytes) at 0x{:08x}, {}-endian",
            path.display(),
            bytes.len(),
            load_address,
            endian
        );
        Ok(Self {
            bytes,
            load_address,
            endian,
            path: Some(path.to_path_buf()),
        })
    }

    /// Wrap an in-memory buffer (used by tests and embedders).
    pub fn from_bytes(bytes: Vec<u8>, load_address: Address, endian: Endianness) -> Self {
        Self {
            bytes,
            load_address,
            endian,
            path: None,
        }
    }

    /// The absolute address of the first byte.
    pub fn load_address(&self) -> Address {
        self.load_address
    }

    /// One past the absolute address of the last byte.
    pub fn end_address(&self) -> Address {
        self.load_address + self.bytes.len() as Address
    }

    /// Image length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True if the image holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Byte order of the image.
    pub fn endianness(&self) -> Endianness {
        self.endian
    }

    /// Raw view of the whole buffer.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Translate an absolute address to a buffer offset, bounds-checked.
    pub fn offset_of(&self, addr: Address) -> Result<usize, RewriteError> {
        if addr < self.load_address || addr >= self.end_address() {
            return Err(RewriteError::AddressOutOfRange(addr));
        }
        Ok((addr - self.load_address) as usize)
    }

    /// All bytes from `addr` to the end of the image.
    pub fn window(&self, addr: Address) -> Result<&[u8], RewriteError> {
        let offset = self.offset_of(addr)?;
        Ok(&self.bytes[offset..])
    }

    /// Read the 4-byte instruction word at `addr`.
    pub fn read_word(&self, addr: Address) -> Result<u32, RewriteError> {
        let offset = self.offset_of(addr)?;
        if offset + INSN_WIDTH > self.bytes.len() {
            return Err(RewriteError::AddressOutOfRange(addr));
        }
        let raw: [u8; 4] = self.bytes[offset..offset + INSN_WIDTH]
            .try_into()
            .expect("slice length checked above");
        Ok(match self.endian {
            Endianness::Little => u32::from_le_bytes(raw),
            Endianness::Big => u32::from_be_bytes(raw),
        })
    }

    /// Overwrite the 4-byte instruction word at `addr` in image byte order.
    pub fn write_word(&mut self, addr: Address, word: u32) -> Result<(), RewriteError> {
        let offset = self.offset_of(addr)?;
        if offset + INSN_WIDTH > self.bytes.len() {
            return Err(RewriteError::AddressOutOfRange(addr));
        }
        let raw = match self.endian {
            Endianness::Little => word.to_le_bytes(),
            Endianness::Big => word.to_be_bytes(),
        };
        debug!("patching 0x{:08x} <- 0x{:08x}", addr, word);
        self.bytes[offset..offset + INSN_WIDTH].copy_from_slice(&raw);
        Ok(())
    }

    /// Flush the (possibly patched) buffer back to `path`, or to the path the
    /// image was opened from when `path` is `None`.
    pub fn save<P: AsRef<Path>>(&self, path: Option<P>) -> Result<(), RewriteError> {
        let target = match (&path, &self.path) {
            (Some(p), _) => p.as_ref().to_path_buf(),
            (None, Some(p)) => p.clone(),
            (None, None) => {
                return Err(RewriteError::Generic(
                    "no output path for in-memory image".into(),
                ))
            }
        };
        fs::write(&target, &self.bytes)?;
        info!("wrote {} bytes to {}", self.bytes.len(), target.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BinaryImage {
        BinaryImage::from_bytes(
            vec![0x06, 0x00, 0x00, 0xea, 0x00, 0x88, 0xbd, 0xe8],
            0x8000,
            Endianness::Little,
        )
    }

    #[test]
    fn test_offset_translation() {
        let img = sample();
        assert_eq!(img.offset_of(0x8000).unwrap(), 0);
        assert_eq!(img.offset_of(0x8004).unwrap(), 4);
        assert!(img.offset_of(0x7fff).is_err());
        assert!(img.offset_of(0x8008).is_err());
    }

    #[test]
    fn test_read_write_word_little_endian() {
        let mut img = sample();
        assert_eq!(img.read_word(0x8000).unwrap(), 0xea000006);
        img.write_word(0x8000, 0xeb0023fe).unwrap();
        assert_eq!(img.read_word(0x8000).unwrap(), 0xeb0023fe);
        assert_eq!(&img.as_slice()[..4], &[0xfe, 0x23, 0x00, 0xeb]);
    }

    #[test]
    fn test_read_write_word_big_endian() {
        let mut img = BinaryImage::from_bytes(
            vec![0xea, 0x00, 0x00, 0x06],
            0x0,
            Endianness::Big,
        );
        assert_eq!(img.read_word(0x0).unwrap(), 0xea000006);
        img.write_word(0x0, 0xeb000001).unwrap();
        assert_eq!(&img.as_slice()[..4], &[0xeb, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_word_access_straddling_end_is_rejected() {
        let mut img = sample();
        assert!(img.read_word(0x8006).is_err());
        assert!(img.write_word(0x8006, 0).is_err());
    }

    #[test]
    fn test_window() {
        let img = sample();
        assert_eq!(img.window(0x8004).unwrap().len(), 4);
        assert!(img.window(0x8008).is_err());
    }

    #[test]
    fn test_open_and_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.bin");
        fs::write(&path, [0u8; 8]).unwrap();

        let mut img = BinaryImage::open(&path, 0x0, Endianness::Little).unwrap();
        img.write_word(0x0, 0xeb000001).unwrap();
        img.save(None::<&Path>).unwrap();

        let back = fs::read(&path).unwrap();
        assert_eq!(&back[..4], &[0x01, 0x00, 0x00, 0xeb]);
        assert_eq!(&back[4..], &[0u8; 4]);
    }
}
