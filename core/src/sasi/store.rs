//! Flat block-addressable backing store for disk targets
//!
//! The store sits on any seekable byte stream: a raw image file in the
//! emulator, an in-memory cursor in tests. Access is always whole blocks
//! at `lba * block_size`.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};

/// Media a block store can sit on
pub trait BlockMedia: Read + Write + Seek + Send {}
impl<T: Read + Write + Seek + Send> BlockMedia for T {}

pub struct BlockStore {
    media: Box<dyn BlockMedia>,
    block_size: usize,
    blocks: usize,
}

impl BlockStore {
    pub fn new(mut media: Box<dyn BlockMedia>, block_size: usize) -> Result<Self> {
        if block_size == 0 {
            bail!("Block size cannot be zero");
        }
        let size = media.seek(SeekFrom::End(0))? as usize;
        media.rewind()?;
        if size == 0 || !size.is_multiple_of(block_size) {
            bail!(
                "Media size {} is not a positive multiple of block size {}",
                size,
                block_size
            );
        }
        Ok(Self {
            media,
            block_size,
            blocks: size / block_size,
        })
    }

    /// Opens an image file for use as a backing store
    pub fn open(filename: &Path, block_size: usize) -> Result<Self> {
        if !filename.exists() {
            bail!("File not found: {}", filename.display());
        }
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(filename)
            .with_context(|| format!("Failed to open {}", filename.display()))?;
        Self::new(Box::new(f), block_size)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn blocks(&self) -> usize {
        self.blocks
    }

    fn seek_block(&mut self, lba: u32) -> Result<()> {
        if lba as usize >= self.blocks {
            bail!("Block {} beyond media end", lba);
        }
        self.media
            .seek(SeekFrom::Start(u64::from(lba) * self.block_size as u64))?;
        Ok(())
    }

    /// Reads one block into the start of `buf`
    pub fn read_block(&mut self, lba: u32, buf: &mut [u8]) -> Result<()> {
        self.seek_block(lba)?;
        self.media
            .read_exact(&mut buf[..self.block_size])
            .with_context(|| format!("Read failed at block {}", lba))?;
        Ok(())
    }

    /// Writes one block from the start of `buf`
    pub fn write_block(&mut self, lba: u32, buf: &[u8]) -> Result<()> {
        self.seek_block(lba)?;
        self.media
            .write_all(&buf[..self.block_size])
            .with_context(|| format!("Write failed at block {}", lba))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn store(blocks: usize, block_size: usize) -> BlockStore {
        BlockStore::new(
            Box::new(Cursor::new(vec![0u8; blocks * block_size])),
            block_size,
        )
        .unwrap()
    }

    #[test]
    fn sizes_from_media() {
        let s = store(16, 256);
        assert_eq!(s.blocks(), 16);
        assert_eq!(s.block_size(), 256);
    }

    #[test]
    fn rejects_partial_block_media() {
        let media = Cursor::new(vec![0u8; 700]);
        assert!(BlockStore::new(Box::new(media), 512).is_err());
    }

    #[test]
    fn rejects_empty_media() {
        let media = Cursor::new(vec![]);
        assert!(BlockStore::new(Box::new(media), 512).is_err());
    }

    #[test]
    fn block_roundtrip() {
        let mut s = store(4, 512);
        let data = [0xA5u8; 512];
        s.write_block(2, &data).unwrap();

        let mut back = [0u8; 512];
        s.read_block(2, &mut back).unwrap();
        assert_eq!(back, data);

        s.read_block(1, &mut back).unwrap();
        assert_eq!(back, [0u8; 512]);
    }

    #[test]
    fn rejects_out_of_range_block() {
        let mut s = store(4, 512);
        let mut buf = [0u8; 512];
        assert!(s.read_block(4, &mut buf).is_err());
        assert!(s.write_block(100, &buf).is_err());
    }
}
