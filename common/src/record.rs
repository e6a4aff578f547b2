use std::marker::PhantomData;

use crc::{Crc, CRC_32_ISO_HDLC};
use thiserror::Error;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub const CHECKSUM_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("access at {offset}+{len} exceeds region capacity {capacity}")]
    OutOfRange {
        offset: usize,
        len: usize,
        capacity: usize,
    },
    #[error("storage i/o failed: {0}")]
    Io(String),
}

pub trait PersistentRegion: Send {
    fn capacity(&self) -> usize;
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError>;
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StorageError>;
    fn flush(&mut self) -> Result<(), StorageError>;
}

pub(crate) fn check_range(offset: usize, len: usize, capacity: usize) -> Result<(), StorageError> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(StorageError::OutOfRange {
            offset,
            len,
            capacity,
        }),
    }
}

#[derive(Debug, Clone)]
pub struct MemoryRegion {
    bytes: Vec<u8>,
    flushes: usize,
}

impl MemoryRegion {
    pub fn new(capacity: usize) -> Self {
        Self::from_image(vec![0; capacity])
    }

    pub fn from_image(bytes: Vec<u8>) -> Self {
        Self { bytes, flushes: 0 }
    }

    pub fn image(&self) -> &[u8] {
        &self.bytes
    }

    pub fn image_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn flush_count(&self) -> usize {
        self.flushes
    }
}

impl PersistentRegion for MemoryRegion {
    fn capacity(&self) -> usize {
        self.bytes.len()
    }

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        check_range(offset, buf.len(), self.bytes.len())?;
        buf.copy_from_slice(&self.bytes[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StorageError> {
        check_range(offset, data.len(), self.bytes.len())?;
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        self.flushes += 1;
        Ok(())
    }
}

/// Fixed-width binary layout of a record payload.
pub trait RecordCodec: Sized {
    const SIZE: usize;

    fn encode(&self, out: &mut [u8]);
    fn decode(bytes: &[u8]) -> Self;
}

#[derive(Debug, Clone)]
pub struct PersistentRecord<T> {
    offset: usize,
    payload: Vec<u8>,
    stored_checksum: u32,
    _marker: PhantomData<T>,
}

impl<T: RecordCodec> PersistentRecord<T> {
    pub const STORED_SIZE: usize = T::SIZE + CHECKSUM_SIZE;

    pub fn new(offset: usize) -> Self {
        Self {
            offset,
            payload: vec![0; T::SIZE],
            stored_checksum: 0,
            _marker: PhantomData,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn load(&mut self, region: &mut dyn PersistentRegion) -> Result<(), StorageError> {
        let mut raw = vec![0; Self::STORED_SIZE];
        region.read(self.offset, &mut raw)?;
        let (payload, checksum) = raw.split_at(T::SIZE);
        self.payload.copy_from_slice(payload);
        let mut stored = [0; CHECKSUM_SIZE];
        stored.copy_from_slice(checksum);
        self.stored_checksum = u32::from_le_bytes(stored);
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        CRC32.checksum(&self.payload) == self.stored_checksum
    }

    /// The decoded record, only if its checksum holds.
    pub fn get(&self) -> Option<T> {
        self.is_valid().then(|| T::decode(&self.payload))
    }

    pub fn set(&mut self, value: &T) {
        self.payload.fill(0);
        value.encode(&mut self.payload);
    }

    pub fn write(&mut self, region: &mut dyn PersistentRegion) -> Result<(), StorageError> {
        self.stored_checksum = CRC32.checksum(&self.payload);
        region.write(self.offset, &self.payload)?;
        region.write(self.offset + T::SIZE, &self.stored_checksum.to_le_bytes())?;
        region.flush()
    }

    pub fn store(
        &mut self,
        region: &mut dyn PersistentRegion,
        value: &T,
    ) -> Result<(), StorageError> {
        self.set(value);
        self.write(region)
    }

    pub fn erase(&mut self, region: &mut dyn PersistentRegion) -> Result<(), StorageError> {
        self.payload.fill(0);
        self.stored_checksum = 0;
        region.write(self.offset, &vec![0; Self::STORED_SIZE])?;
        region.flush()
    }
}

pub struct FieldWriter<'a> {
    out: &'a mut [u8],
    pos: usize,
}

impl<'a> FieldWriter<'a> {
    pub fn new(out: &'a mut [u8]) -> Self {
        Self { out, pos: 0 }
    }

    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        self.out[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
        self
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.bytes(&[value])
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }

    pub fn f32(&mut self, value: f32) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }

    /// NUL-padded string in a `width`-byte field, cut at a char boundary.
    pub fn str(&mut self, value: &str, width: usize) -> &mut Self {
        let mut end = value.len().min(width);
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        self.out[self.pos..self.pos + end].copy_from_slice(&value.as_bytes()[..end]);
        self.pos += width;
        self
    }
}

pub struct FieldReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0; N];
        out.copy_from_slice(&self.bytes[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    pub fn u8(&mut self) -> u8 {
        self.array::<1>()[0]
    }

    pub fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.array())
    }

    pub fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.array())
    }

    pub fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.array())
    }

    pub fn f32(&mut self) -> f32 {
        f32::from_le_bytes(self.array())
    }

    pub fn str(&mut self, width: usize) -> String {
        let field = &self.bytes[self.pos..self.pos + width];
        self.pos += width;
        let end = field.iter().position(|b| *b == 0).unwrap_or(width);
        String::from_utf8_lossy(&field[..end]).into_owned()
    }
}
