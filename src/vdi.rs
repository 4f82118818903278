use tracing::debug;

use crate::util::check_disk_range;
use crate::{DiskError, Result, StorageBackend, VirtualDisk};

/// Size of the v1.1 header, including the 72-byte pre-header.
pub const VDI_HEADER_SIZE: usize = 400;

pub(crate) const VDI_MAGIC: u32 = 0xBEDA_107F;
const VDI_TYPE_NORMAL: u32 = 1;
const VDI_TYPE_FIXED: u32 = 2;

/// Block map sentinel: the block has no backing in the image file.
const BLOCK_UNALLOCATED: u32 = 0xFFFF_FFFF;
/// Block map sentinel: the block is all zeros and has no backing.
const BLOCK_ZERO: u32 = 0xFFFF_FFFE;

// Hard cap to avoid absurd allocations when parsing untrusted images.
const MAX_BLOCK_MAP_BYTES: u64 = 128 * 1024 * 1024; // 128 MiB

/// Fields of a VirtualBox VDI v1.1 header this crate cares about.
///
/// The on-disk structure is little-endian and starts with a 64-byte
/// descriptive text field followed by the magic; the UUIDs and geometry
/// after the block counts are ignored.
#[derive(Debug, Clone)]
pub struct VdiHeader {
    pub file_type: u32,
    pub block_data_offset: u32,
    pub image_data_offset: u32,
    pub disk_size: u64,
    pub image_block_size: u32,
    pub image_block_extra_size: u32,
    pub number_blocks: u32,
    pub number_blocks_allocated: u32,
}

impl VdiHeader {
    pub fn decode(bytes: &[u8; VDI_HEADER_SIZE]) -> Result<Self> {
        if le_u32(&bytes[64..68]) != VDI_MAGIC {
            return Err(DiskError::BadFormat("vdi magic mismatch"));
        }
        let version_minor = le_u16(&bytes[68..70]);
        let version_major = le_u16(&bytes[70..72]);
        if version_major != 1 || version_minor != 1 {
            return Err(DiskError::BadFormat("unsupported vdi version"));
        }

        let header = Self {
            file_type: le_u32(&bytes[76..80]),
            block_data_offset: le_u32(&bytes[340..344]),
            image_data_offset: le_u32(&bytes[344..348]),
            disk_size: le_u64(&bytes[368..376]),
            image_block_size: le_u32(&bytes[376..380]),
            image_block_extra_size: le_u32(&bytes[380..384]),
            number_blocks: le_u32(&bytes[384..388]),
            number_blocks_allocated: le_u32(&bytes[388..392]),
        };

        if header.file_type != VDI_TYPE_NORMAL && header.file_type != VDI_TYPE_FIXED {
            return Err(DiskError::BadFormat("unsupported vdi image type"));
        }
        if header.image_block_extra_size != 0 {
            return Err(DiskError::BadFormat("vdi per-block extra data unsupported"));
        }
        if header.image_block_size == 0 {
            return Err(DiskError::BadFormat("vdi block size is zero"));
        }
        let covered = u64::from(header.number_blocks)
            .checked_mul(u64::from(header.image_block_size))
            .ok_or(DiskError::OffsetOverflow)?;
        if header.disk_size > covered {
            return Err(DiskError::BadFormat("vdi disk size exceeds block count"));
        }

        Ok(header)
    }
}

/// A VirtualBox VDI v1.1 disk image. Read-only.
///
/// The block map is held resident for the lifetime of the handle; entry `i`
/// maps logical block `i` to a physical block index within the data region.
#[derive(Debug)]
pub struct VdiDisk<B> {
    backend: B,
    header: VdiHeader,
    block_map: Vec<u32>,
}

impl<B: StorageBackend> VdiDisk<B> {
    pub fn open(mut backend: B) -> Result<Self> {
        let (header, block_map) = Self::parse(&mut backend)?;
        Ok(Self::from_parts(backend, header, block_map))
    }

    /// Parse and validate the header and block map without taking ownership
    /// of the backend. Reads only; never modifies the file.
    pub(crate) fn parse(backend: &mut B) -> Result<(VdiHeader, Vec<u32>)> {
        let mut raw = [0u8; VDI_HEADER_SIZE];
        backend.read_at(0, &mut raw).map_err(|e| match e {
            DiskError::OutOfBounds { .. } => DiskError::BadFormat("vdi header truncated"),
            other => other,
        })?;
        let header = VdiHeader::decode(&raw)?;

        let entries = header.number_blocks_allocated as usize;
        let map_bytes = (entries as u64)
            .checked_mul(4)
            .ok_or(DiskError::OffsetOverflow)?;
        if map_bytes > MAX_BLOCK_MAP_BYTES {
            return Err(DiskError::BadFormat("vdi block map too large"));
        }

        let mut block_map = Vec::new();
        block_map
            .try_reserve_exact(entries)
            .map_err(|_| DiskError::BadFormat("vdi block map too large"))?;

        let mut buf = vec![0u8; 64 * 1024];
        let mut offset = u64::from(header.block_data_offset);
        let mut remaining = map_bytes as usize;
        while remaining > 0 {
            let read_len = remaining.min(buf.len());
            backend
                .read_at(offset, &mut buf[..read_len])
                .map_err(|e| match e {
                    DiskError::OutOfBounds { .. } => DiskError::BadFormat("vdi block map truncated"),
                    other => other,
                })?;
            for chunk in buf[..read_len].chunks_exact(4) {
                block_map.push(le_u32(chunk));
            }
            offset = offset
                .checked_add(read_len as u64)
                .ok_or(DiskError::OffsetOverflow)?;
            remaining -= read_len;
        }

        Ok((header, block_map))
    }

    pub(crate) fn from_parts(backend: B, header: VdiHeader, block_map: Vec<u32>) -> Self {
        debug!(
            disk_size = header.disk_size,
            blocks = header.number_blocks,
            allocated = header.number_blocks_allocated,
            "opened vdi image"
        );
        Self {
            backend,
            header,
            block_map,
        }
    }

    pub fn header(&self) -> &VdiHeader {
        &self.header
    }

    pub fn into_backend(self) -> B {
        self.backend
    }
}

impl<B: StorageBackend> VirtualDisk for VdiDisk<B> {
    fn length(&self) -> u64 {
        self.header.disk_size
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_disk_range(offset, buf.len(), self.length())?;

        let block_size = u64::from(self.header.image_block_size);
        let block_size_usize = self.header.image_block_size as usize;
        let data_offset = u64::from(self.header.image_data_offset);

        let mut pos = 0usize;
        while pos < buf.len() {
            let abs = offset
                .checked_add(pos as u64)
                .ok_or(DiskError::OffsetOverflow)?;
            let block = abs / block_size;
            let within = (abs % block_size) as usize;
            let remaining = buf.len() - pos;
            let chunk_len = (block_size_usize - within).min(remaining);

            let block_usize: usize = block.try_into().map_err(|_| DiskError::OutOfRange {
                offset: abs,
                len: remaining,
                capacity: self.length(),
            })?;
            let entry = *self
                .block_map
                .get(block_usize)
                .ok_or(DiskError::OutOfRange {
                    offset: abs,
                    len: remaining,
                    capacity: self.length(),
                })?;

            // Sparse blocks fail the read; they are not zero-filled.
            if entry == BLOCK_UNALLOCATED || entry == BLOCK_ZERO {
                return Err(DiskError::UnallocatedBlock { block });
            }

            let phys = u64::from(entry)
                .checked_mul(block_size)
                .and_then(|v| v.checked_add(within as u64))
                .and_then(|v| v.checked_add(data_offset))
                .ok_or(DiskError::OffsetOverflow)?;
            self.backend.read_at(phys, &mut buf[pos..pos + chunk_len])?;

            pos += chunk_len;
        }

        Ok(())
    }

    fn write_at(&mut self, _offset: u64, _buf: &[u8]) -> Result<()> {
        Err(DiskError::NotImplemented("vdi write"))
    }

    fn flush(&mut self) -> Result<()> {
        self.backend.flush()
    }
}

fn le_u16(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn le_u64(bytes: &[u8]) -> u64 {
    u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_header() -> [u8; VDI_HEADER_SIZE] {
        let mut raw = [0u8; VDI_HEADER_SIZE];
        raw[64..68].copy_from_slice(&VDI_MAGIC.to_le_bytes());
        raw[68..70].copy_from_slice(&1u16.to_le_bytes()); // version minor
        raw[70..72].copy_from_slice(&1u16.to_le_bytes()); // version major
        raw[76..80].copy_from_slice(&VDI_TYPE_NORMAL.to_le_bytes());
        raw[368..376].copy_from_slice(&(1024 * 1024u64).to_le_bytes()); // disk_size
        raw[376..380].copy_from_slice(&(1024 * 1024u32).to_le_bytes()); // block size
        raw[384..388].copy_from_slice(&1u32.to_le_bytes()); // number_blocks
        raw[388..392].copy_from_slice(&1u32.to_le_bytes()); // allocated
        raw
    }

    #[test]
    fn decode_accepts_minimal_header() {
        let header = VdiHeader::decode(&minimal_header()).unwrap();
        assert_eq!(header.disk_size, 1024 * 1024);
        assert_eq!(header.number_blocks_allocated, 1);
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut raw = minimal_header();
        raw[64] ^= 0xFF;
        assert!(matches!(
            VdiHeader::decode(&raw).unwrap_err(),
            DiskError::BadFormat("vdi magic mismatch")
        ));
    }

    #[test]
    fn decode_rejects_unsupported_version() {
        let mut raw = minimal_header();
        raw[70..72].copy_from_slice(&2u16.to_le_bytes());
        assert!(matches!(
            VdiHeader::decode(&raw).unwrap_err(),
            DiskError::BadFormat("unsupported vdi version")
        ));
    }

    #[test]
    fn decode_rejects_block_extra_data() {
        let mut raw = minimal_header();
        raw[380..384].copy_from_slice(&512u32.to_le_bytes());
        assert!(matches!(
            VdiHeader::decode(&raw).unwrap_err(),
            DiskError::BadFormat("vdi per-block extra data unsupported")
        ));
    }

    #[test]
    fn decode_rejects_disk_size_exceeding_blocks() {
        let mut raw = minimal_header();
        raw[368..376].copy_from_slice(&(2 * 1024 * 1024u64).to_le_bytes());
        assert!(matches!(
            VdiHeader::decode(&raw).unwrap_err(),
            DiskError::BadFormat("vdi disk size exceeds block count")
        ));
    }
}
