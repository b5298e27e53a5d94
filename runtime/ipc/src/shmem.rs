// Licensed under the Apache-2.0 license

//! Shared memory block visible to both the AP and the hub.
//!
//! Memory is held as 32-bit atomic words so both endpoints may touch it
//! from different threads. Index words are written with release stores and
//! read with acquire loads; payload bytes use relaxed accesses and are
//! published by the index store that follows them.

use crate::error::MemError;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use zerocopy::{FromBytes, Immutable, IntoBytes};

#[derive(Clone)]
pub struct SharedMemory {
    words: Arc<[AtomicU32]>,
}

impl SharedMemory {
    pub fn new(size: usize) -> Self {
        let words: Vec<AtomicU32> = (0..size.div_ceil(4)).map(|_| AtomicU32::new(0)).collect();
        SharedMemory {
            words: words.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.words.len() * 4
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Bounds-checked view of `size` bytes starting at `base`.
    pub fn region(&self, base: usize, size: usize) -> Result<MemRegion, MemError> {
        check_range(base, size, self.len())?;
        Ok(MemRegion {
            mem: self.clone(),
            base,
            size,
        })
    }

    pub fn whole(&self) -> MemRegion {
        MemRegion {
            mem: self.clone(),
            base: 0,
            size: self.len(),
        }
    }

    /// Copy of the whole block, used for postmortem dumps.
    pub fn snapshot(&self) -> Vec<u8> {
        self.words
            .iter()
            .flat_map(|w| w.load(Ordering::Relaxed).to_le_bytes())
            .collect()
    }

    fn word(&self, offset: usize) -> &AtomicU32 {
        &self.words[offset / 4]
    }
}

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemory")
            .field("len", &self.len())
            .finish()
    }
}

fn check_range(offset: usize, len: usize, size: usize) -> Result<(), MemError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(MemError::OutOfBounds { offset, len, size }),
    }
}

/// A sub-view of [`SharedMemory`]. All offsets are relative to the view.
#[derive(Clone, Debug)]
pub struct MemRegion {
    mem: SharedMemory,
    base: usize,
    size: usize,
}

impl MemRegion {
    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn sub(&self, offset: usize, size: usize) -> Result<MemRegion, MemError> {
        check_range(offset, size, self.size)?;
        Ok(MemRegion {
            mem: self.mem.clone(),
            base: self.base + offset,
            size,
        })
    }

    fn word_at(&self, offset: usize) -> Result<&AtomicU32, MemError> {
        check_range(offset, 4, self.size)?;
        let abs = self.base + offset;
        if abs % 4 != 0 {
            return Err(MemError::Unaligned(abs));
        }
        Ok(self.mem.word(abs))
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32, MemError> {
        Ok(self.word_at(offset)?.load(Ordering::Acquire))
    }

    pub fn write_u32(&self, offset: usize, value: u32) -> Result<(), MemError> {
        self.word_at(offset)?.store(value, Ordering::Release);
        Ok(())
    }

    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<(), MemError> {
        check_range(offset, buf.len(), self.size)?;
        let mut pos = 0;
        while pos < buf.len() {
            let abs = self.base + offset + pos;
            let lane = abs % 4;
            let n = (4 - lane).min(buf.len() - pos);
            let bytes = self.mem.word(abs).load(Ordering::Relaxed).to_le_bytes();
            buf[pos..pos + n].copy_from_slice(&bytes[lane..lane + n]);
            pos += n;
        }
        Ok(())
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<(), MemError> {
        check_range(offset, data.len(), self.size)?;
        let mut pos = 0;
        while pos < data.len() {
            let abs = self.base + offset + pos;
            let lane = abs % 4;
            let n = (4 - lane).min(data.len() - pos);
            let word = self.mem.word(abs);
            if n == 4 {
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(&data[pos..pos + 4]);
                word.store(u32::from_le_bytes(bytes), Ordering::Relaxed);
            } else {
                let chunk = &data[pos..pos + n];
                // The closure never returns None, so the update cannot fail.
                let _ = word.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |w| {
                    let mut bytes = w.to_le_bytes();
                    bytes[lane..lane + n].copy_from_slice(chunk);
                    Some(u32::from_le_bytes(bytes))
                });
            }
            pos += n;
        }
        Ok(())
    }

    pub fn fill(&self, offset: usize, len: usize, value: u8) -> Result<(), MemError> {
        self.write_bytes(offset, &vec![value; len])
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.size];
        // The view is bounds checked at construction.
        let _ = self.read_bytes(0, &mut buf);
        buf
    }

    pub fn read_obj<T: FromBytes>(&self, offset: usize) -> Result<T, MemError> {
        let len = core::mem::size_of::<T>();
        let mut buf = vec![0u8; len];
        self.read_bytes(offset, &mut buf)?;
        T::read_from_bytes(&buf).map_err(|_| MemError::OutOfBounds {
            offset,
            len,
            size: self.size,
        })
    }

    pub fn write_obj<T: IntoBytes + Immutable>(&self, offset: usize, obj: &T) -> Result<(), MemError> {
        self.write_bytes(offset, obj.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unaligned_bytes() {
        let mem = SharedMemory::new(64);
        let region = mem.region(8, 32).unwrap();
        region.write_bytes(3, b"hello, world").unwrap();
        let mut buf = [0u8; 12];
        region.read_bytes(3, &mut buf).unwrap();
        assert_eq!(&buf, b"hello, world");
        // Bytes around the write are untouched.
        assert_eq!(region.read_u32(0).unwrap() & 0x00ff_ffff, 0);
    }

    #[test]
    fn test_bounds() {
        let mem = SharedMemory::new(64);
        assert_eq!(
            mem.region(60, 8).unwrap_err(),
            MemError::OutOfBounds {
                offset: 60,
                len: 8,
                size: 64
            }
        );
        let region = mem.region(16, 16).unwrap();
        assert!(region.write_u32(16, 1).is_err());
        assert_eq!(region.read_u32(2).unwrap_err(), MemError::Unaligned(18));
        assert!(region.sub(8, 16).is_err());
    }

    #[test]
    fn test_views_share_memory() {
        let mem = SharedMemory::new(32);
        let a = mem.region(0, 32).unwrap();
        let b = a.sub(16, 16).unwrap();
        b.write_u32(4, 0xdead_beef).unwrap();
        assert_eq!(a.read_u32(20).unwrap(), 0xdead_beef);
        assert_eq!(&mem.snapshot()[20..24], &0xdead_beefu32.to_le_bytes());
    }
}
