use tracing::debug;

use crate::util::{check_disk_range, round_up_to_sector};
use crate::{DiskError, Result, StorageBackend, VirtualDisk, SECTOR_SIZE};

pub(crate) const FOOTER_SIZE: usize = 512;
const DYNAMIC_HEADER_SIZE: usize = 1024;

pub(crate) const VHD_COOKIE: &[u8; 8] = b"conectix";
const VHD_DYNAMIC_COOKIE: &[u8; 8] = b"cxsparse";
const VHD_VERSION: u32 = 0x0001_0000;
// The footer features field carries a single always-set reserved bit.
const VHD_FEATURES_RESERVED: u32 = 2;

const DISK_TYPE_FIXED: u32 = 2;
const DISK_TYPE_DYNAMIC: u32 = 3;

/// BAT sentinel: the block has not been allocated in the image file.
const BAT_UNALLOCATED: u32 = 0xFFFF_FFFF;

// Hard cap to avoid absurd allocations when parsing untrusted images.
const MAX_BAT_BYTES: u64 = 128 * 1024 * 1024; // 128 MiB

/// Checksum algorithm applied to footers this crate rewrites.
///
/// The VHD specification computes the footer checksum as the one's complement
/// of the unsigned 32-bit sum of the footer bytes ([`Standard`]). Some
/// writers instead accumulate the sum in a single signed byte and complement
/// that, widening the result into the 32-bit field ([`Legacy8Bit`]); images
/// produced by such tools carry checksums the 32-bit algorithm would reject.
/// The default is [`Legacy8Bit`] so rewritten footers stay byte-compatible
/// with those images.
///
/// [`Standard`]: FooterChecksum::Standard
/// [`Legacy8Bit`]: FooterChecksum::Legacy8Bit
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum FooterChecksum {
    Standard,
    #[default]
    Legacy8Bit,
}

/// The 512-byte footer stored at end-of-file (big-endian integer fields).
///
/// The raw bytes are retained so rewriting the footer preserves fields this
/// crate does not interpret (timestamp, creator strings, geometry, UUID).
#[derive(Clone, Debug)]
pub(crate) struct VhdFooter {
    raw: [u8; FOOTER_SIZE],
}

impl VhdFooter {
    fn decode(raw: [u8; FOOTER_SIZE]) -> Result<Self> {
        if &raw[0..8] != VHD_COOKIE {
            return Err(DiskError::BadFormat("vhd footer cookie mismatch"));
        }
        let footer = Self { raw };
        if footer.format_version() != VHD_VERSION {
            return Err(DiskError::BadFormat("unsupported vhd version"));
        }
        if footer.features() != VHD_FEATURES_RESERVED {
            return Err(DiskError::BadFormat("unsupported vhd feature flags"));
        }
        Ok(footer)
    }

    fn features(&self) -> u32 {
        be_u32(&self.raw[8..12])
    }

    fn format_version(&self) -> u32 {
        be_u32(&self.raw[12..16])
    }

    fn data_offset(&self) -> u64 {
        be_u64(&self.raw[16..24])
    }

    fn current_size(&self) -> u64 {
        be_u64(&self.raw[48..56])
    }

    fn disk_type(&self) -> u32 {
        be_u32(&self.raw[60..64])
    }

    fn set_current_size(&mut self, size: u64) {
        self.raw[48..56].copy_from_slice(&size.to_be_bytes());
    }

    fn update_checksum(&mut self, style: FooterChecksum) {
        self.raw[64..68].fill(0);
        let checksum = footer_checksum(&self.raw, style);
        self.raw[64..68].copy_from_slice(&checksum.to_be_bytes());
    }

    fn as_bytes(&self) -> &[u8; FOOTER_SIZE] {
        &self.raw
    }
}

fn footer_checksum(raw: &[u8; FOOTER_SIZE], style: FooterChecksum) -> u32 {
    match style {
        FooterChecksum::Standard => {
            let sum = raw
                .iter()
                .fold(0u32, |acc, b| acc.wrapping_add(u32::from(*b)));
            !sum
        }
        FooterChecksum::Legacy8Bit => {
            // Sum in a signed byte, then complement after integer promotion,
            // exactly as `~sum` behaves when `sum` is a C `int8_t`.
            let sum = raw.iter().fold(0i8, |acc, b| acc.wrapping_add(*b as i8));
            !(i32::from(sum)) as u32
        }
    }
}

/// The 1024-byte dynamic-disk header (big-endian integer fields).
#[derive(Debug, Clone)]
struct VhdDynamicHeader {
    table_offset: u64,
    max_table_entries: u32,
    block_size: u32,
}

impl VhdDynamicHeader {
    fn decode(raw: &[u8; DYNAMIC_HEADER_SIZE]) -> Result<Self> {
        if &raw[0..8] != VHD_DYNAMIC_COOKIE {
            return Err(DiskError::BadFormat("vhd dynamic header cookie mismatch"));
        }
        if be_u64(&raw[8..16]) != u64::MAX {
            return Err(DiskError::BadFormat("vhd dynamic header data offset"));
        }
        if be_u32(&raw[24..28]) != VHD_VERSION {
            return Err(DiskError::BadFormat("unsupported vhd dynamic header version"));
        }
        Ok(Self {
            table_offset: be_u64(&raw[16..24]),
            max_table_entries: be_u32(&raw[28..32]),
            block_size: be_u32(&raw[32..36]),
        })
    }
}

/// Per-format state for an open VHD image.
#[derive(Debug)]
pub(crate) enum VhdKind {
    Fixed,
    Dynamic(DynamicState),
}

#[derive(Debug)]
pub(crate) struct DynamicState {
    table_offset: u64,
    block_size: u64,
    /// Length of the per-block sector bitmap, padded to a 512-byte boundary.
    bitmap_bytes: u64,
    bat: Vec<u32>,
    /// Count of allocated blocks; advances monotonically, one per allocating
    /// write. BAT entries only ever transition sentinel -> physical index.
    allocated_blocks: u64,
}

/// A Microsoft VHD disk image, fixed or dynamic.
///
/// Fixed images map logical bytes directly to the start of the file. Dynamic
/// images translate through a resident Block Allocation Table and grow the
/// file a block at a time on first write to an unallocated block; each
/// growth relocates the trailing footer and mirrors it at offset 0.
#[derive(Debug)]
pub struct VhdDisk<B> {
    backend: B,
    footer: VhdFooter,
    kind: VhdKind,
    checksum_style: FooterChecksum,
}

impl<B: StorageBackend> VhdDisk<B> {
    pub fn open(backend: B) -> Result<Self> {
        Self::open_with_checksum(backend, FooterChecksum::default())
    }

    /// Open with an explicit checksum style for rewritten footers.
    pub fn open_with_checksum(mut backend: B, checksum_style: FooterChecksum) -> Result<Self> {
        let (footer, kind) = Self::parse(&mut backend)?;
        Ok(Self::from_parts(backend, footer, kind, checksum_style))
    }

    /// Parse and validate the footer (and, for dynamic disks, the dynamic
    /// header and BAT) without taking ownership of the backend. Reads only;
    /// never modifies the file.
    pub(crate) fn parse(backend: &mut B) -> Result<(VhdFooter, VhdKind)> {
        let file_len = backend.len()?;
        if file_len < FOOTER_SIZE as u64 {
            return Err(DiskError::BadFormat("vhd file too small"));
        }

        let mut raw = [0u8; FOOTER_SIZE];
        backend.read_at(file_len - FOOTER_SIZE as u64, &mut raw)?;
        let footer = VhdFooter::decode(raw)?;

        let kind = match footer.disk_type() {
            DISK_TYPE_FIXED => {
                if footer.data_offset() != u64::MAX {
                    return Err(DiskError::BadFormat("vhd fixed disk has a data offset"));
                }
                if footer.current_size() > file_len - FOOTER_SIZE as u64 {
                    return Err(DiskError::BadFormat("vhd disk size exceeds file"));
                }
                VhdKind::Fixed
            }
            DISK_TYPE_DYNAMIC => {
                let mut raw = [0u8; DYNAMIC_HEADER_SIZE];
                backend
                    .read_at(footer.data_offset(), &mut raw)
                    .map_err(|e| match e {
                        DiskError::OutOfBounds { .. } | DiskError::OffsetOverflow => {
                            DiskError::BadFormat("vhd dynamic header truncated")
                        }
                        other => other,
                    })?;
                let header = VhdDynamicHeader::decode(&raw)?;
                VhdKind::Dynamic(Self::parse_dynamic(backend, &header, file_len)?)
            }
            _ => return Err(DiskError::BadFormat("unsupported vhd disk type")),
        };

        Ok((footer, kind))
    }

    fn parse_dynamic(
        backend: &mut B,
        header: &VhdDynamicHeader,
        file_len: u64,
    ) -> Result<DynamicState> {
        let block_size = u64::from(header.block_size);
        if block_size == 0 || !block_size.is_multiple_of(SECTOR_SIZE as u64) {
            return Err(DiskError::BadFormat("vhd block size not sector aligned"));
        }

        let entries = header.max_table_entries as usize;
        let bat_bytes = (entries as u64)
            .checked_mul(4)
            .ok_or(DiskError::OffsetOverflow)?;
        if bat_bytes > MAX_BAT_BYTES {
            return Err(DiskError::BadFormat("vhd allocation table too large"));
        }
        let bat_end = header
            .table_offset
            .checked_add(bat_bytes)
            .ok_or(DiskError::OffsetOverflow)?;
        if bat_end > file_len {
            return Err(DiskError::BadFormat("vhd allocation table truncated"));
        }

        // Sectors per block, then one valid-bit per sector, padded out to
        // whole 512-byte sectors.
        let sectors_per_block = block_size.div_ceil(SECTOR_SIZE as u64);
        let bitmap_bytes = round_up_to_sector(sectors_per_block.div_ceil(8))?;

        let mut bat = Vec::new();
        bat.try_reserve_exact(entries)
            .map_err(|_| DiskError::BadFormat("vhd allocation table too large"))?;

        let mut buf = vec![0u8; 64 * 1024];
        let mut offset = header.table_offset;
        let mut remaining = bat_bytes as usize;
        while remaining > 0 {
            let read_len = remaining.min(buf.len());
            backend.read_at(offset, &mut buf[..read_len])?;
            for chunk in buf[..read_len].chunks_exact(4) {
                bat.push(be_u32(chunk));
            }
            offset = offset
                .checked_add(read_len as u64)
                .ok_or(DiskError::OffsetOverflow)?;
            remaining -= read_len;
        }

        // Every allocated block (bitmap + data) must lie inside the file.
        let mut allocated_blocks = 0u64;
        for &entry in &bat {
            if entry == BAT_UNALLOCATED {
                continue;
            }
            allocated_blocks += 1;
            let data_end = u64::from(entry)
                .checked_mul(SECTOR_SIZE as u64)
                .and_then(|v| v.checked_add(bitmap_bytes))
                .and_then(|v| v.checked_add(block_size))
                .ok_or(DiskError::OffsetOverflow)?;
            if data_end > file_len {
                return Err(DiskError::BadFormat("vhd allocated block outside file"));
            }
        }

        Ok(DynamicState {
            table_offset: header.table_offset,
            block_size,
            bitmap_bytes,
            bat,
            allocated_blocks,
        })
    }

    pub(crate) fn from_parts(
        backend: B,
        footer: VhdFooter,
        kind: VhdKind,
        checksum_style: FooterChecksum,
    ) -> Self {
        match &kind {
            VhdKind::Fixed => {
                debug!(current_size = footer.current_size(), "opened fixed vhd image");
            }
            VhdKind::Dynamic(state) => {
                debug!(
                    current_size = footer.current_size(),
                    block_size = state.block_size,
                    table_entries = state.bat.len(),
                    allocated = state.allocated_blocks,
                    "opened dynamic vhd image"
                );
            }
        }
        Self {
            backend,
            footer,
            kind,
            checksum_style,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.kind, VhdKind::Dynamic(_))
    }

    /// Number of allocated blocks in a dynamic image; 0 for fixed images.
    pub fn allocated_blocks(&self) -> u64 {
        match &self.kind {
            VhdKind::Fixed => 0,
            VhdKind::Dynamic(state) => state.allocated_blocks,
        }
    }

    pub fn into_backend(self) -> B {
        self.backend
    }
}

/// Grow the file by one block and point BAT entry `block` at it.
///
/// The new block (bitmap + data) is appended after the current end of file;
/// the footer is rewritten with the grown size at the new end-of-file minus
/// 512 and mirrored at offset 0, and the block's bitmap is filled with ones
/// so every sector reads as valid.
fn allocate_block<B: StorageBackend>(
    backend: &mut B,
    footer: &mut VhdFooter,
    checksum_style: FooterChecksum,
    state: &mut DynamicState,
    block: usize,
) -> Result<()> {
    let end_of_file = backend.len()?;
    if !end_of_file.is_multiple_of(SECTOR_SIZE as u64) {
        return Err(DiskError::Corrupt("vhd file length not sector aligned"));
    }

    let grow = state
        .block_size
        .checked_add(state.bitmap_bytes)
        .ok_or(DiskError::OffsetOverflow)?;
    let new_len = end_of_file.checked_add(grow).ok_or(DiskError::OffsetOverflow)?;

    // Append real zero bytes; seeking past the end without writing does not
    // reliably grow a file.
    backend.set_len(new_len)?;

    footer.set_current_size(new_len);
    footer.update_checksum(checksum_style);
    backend.write_at(new_len - FOOTER_SIZE as u64, footer.as_bytes())?;
    backend.write_at(0, footer.as_bytes())?;

    // Mark every sector of the new block valid.
    let mut bitmap_remaining = state.bitmap_bytes;
    let mut bitmap_offset = end_of_file;
    let ones = [0xFFu8; 512];
    while bitmap_remaining > 0 {
        let chunk = bitmap_remaining.min(ones.len() as u64) as usize;
        backend.write_at(bitmap_offset, &ones[..chunk])?;
        bitmap_offset += chunk as u64;
        bitmap_remaining -= chunk as u64;
    }

    let sector = end_of_file / SECTOR_SIZE as u64;
    let entry: u32 = sector
        .try_into()
        .map_err(|_| DiskError::Corrupt("vhd block sector index overflows table entry"))?;
    if entry == BAT_UNALLOCATED {
        return Err(DiskError::Corrupt("vhd block sector index overflows table entry"));
    }
    state.bat[block] = entry;
    let entry_offset = state
        .table_offset
        .checked_add(4 * block as u64)
        .ok_or(DiskError::OffsetOverflow)?;
    backend.write_at(entry_offset, &entry.to_be_bytes())?;

    state.allocated_blocks += 1;
    debug!(block, sector = entry, new_len, "allocated vhd block");
    Ok(())
}

impl<B: StorageBackend> VirtualDisk for VhdDisk<B> {
    fn length(&self) -> u64 {
        self.footer.current_size()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match &self.kind {
            VhdKind::Fixed => {
                check_disk_range(offset, buf.len(), self.footer.current_size())?;
                self.backend.read_at(offset, buf)
            }
            VhdKind::Dynamic(state) => {
                let block_size = state.block_size;
                let mut pos = 0usize;
                while pos < buf.len() {
                    let abs = offset
                        .checked_add(pos as u64)
                        .ok_or(DiskError::OffsetOverflow)?;
                    let block = abs / block_size;
                    let within = abs % block_size;
                    let remaining = buf.len() - pos;
                    let chunk_len = ((block_size - within) as usize).min(remaining);

                    let entry = bat_entry(state, block, abs, remaining)?;
                    if entry == BAT_UNALLOCATED {
                        buf[pos..pos + chunk_len].fill(0);
                    } else {
                        let phys = block_data_offset(state, entry, within)?;
                        self.backend.read_at(phys, &mut buf[pos..pos + chunk_len])?;
                    }

                    pos += chunk_len;
                }
                Ok(())
            }
        }
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let VhdDisk {
            backend,
            footer,
            kind,
            checksum_style,
        } = self;
        match kind {
            VhdKind::Fixed => {
                check_disk_range(offset, buf.len(), footer.current_size())?;
                backend.write_at(offset, buf)
            }
            VhdKind::Dynamic(state) => {
                let block_size = state.block_size;
                let mut pos = 0usize;
                while pos < buf.len() {
                    let abs = offset
                        .checked_add(pos as u64)
                        .ok_or(DiskError::OffsetOverflow)?;
                    let block = abs / block_size;
                    let within = abs % block_size;
                    let remaining = buf.len() - pos;
                    let chunk_len = ((block_size - within) as usize).min(remaining);

                    if bat_entry(state, block, abs, remaining)? == BAT_UNALLOCATED {
                        allocate_block(backend, footer, *checksum_style, state, block as usize)?;
                    }
                    let entry = state.bat[block as usize];
                    let phys = block_data_offset(state, entry, within)?;
                    backend.write_at(phys, &buf[pos..pos + chunk_len])?;

                    pos += chunk_len;
                }
                Ok(())
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        self.backend.flush()
    }
}

fn bat_entry(state: &DynamicState, block: u64, abs: u64, remaining: usize) -> Result<u32> {
    let block_usize: usize = block.try_into().map_err(|_| DiskError::OffsetOverflow)?;
    state
        .bat
        .get(block_usize)
        .copied()
        .ok_or(DiskError::OutOfRange {
            offset: abs,
            len: remaining,
            capacity: state.bat.len() as u64 * state.block_size,
        })
}

fn block_data_offset(state: &DynamicState, entry: u32, within: u64) -> Result<u64> {
    u64::from(entry)
        .checked_mul(SECTOR_SIZE as u64)
        .and_then(|v| v.checked_add(state.bitmap_bytes))
        .and_then(|v| v.checked_add(within))
        .ok_or(DiskError::OffsetOverflow)
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn be_u64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_checksum_complements_u32_sum() {
        let mut raw = [0u8; FOOTER_SIZE];
        raw[0] = 1;
        raw[1] = 2;
        raw[511] = 0xFF;
        assert_eq!(footer_checksum(&raw, FooterChecksum::Standard), !(1 + 2 + 0xFFu32));
    }

    #[test]
    fn legacy_checksum_complements_signed_byte_sum() {
        let mut raw = [0u8; FOOTER_SIZE];
        raw[0] = 3;
        // sum = 3 -> ~3 = -4 -> 0xFFFF_FFFC
        assert_eq!(footer_checksum(&raw, FooterChecksum::Legacy8Bit), 0xFFFF_FFFC);

        raw[1] = 0xF9; // sum = 3 + (-7) = -4 -> ~(-4) = 3
        assert_eq!(footer_checksum(&raw, FooterChecksum::Legacy8Bit), 3);
    }

    #[test]
    fn legacy_checksum_wraps_the_byte_sum() {
        let mut raw = [0u8; FOOTER_SIZE];
        raw[..4].copy_from_slice(&[0x7F, 0x7F, 0x7F, 0x7F]); // wraps in 8 bits
        let sum = 0x7Fi8
            .wrapping_add(0x7F)
            .wrapping_add(0x7F)
            .wrapping_add(0x7F);
        assert_eq!(
            footer_checksum(&raw, FooterChecksum::Legacy8Bit),
            !(i32::from(sum)) as u32
        );
    }

    #[test]
    fn bitmap_bytes_rounds_up_to_sectors() {
        let bitmap = |block_size: u64| {
            round_up_to_sector(block_size.div_ceil(512).div_ceil(8)).unwrap()
        };
        // 2 MiB block: 4096 sectors -> 512 bitmap bytes -> already aligned.
        assert_eq!(bitmap(2 * 1024 * 1024), 512);
        // 16 KiB block: 32 sectors -> 4 bitmap bytes -> padded to 512.
        assert_eq!(bitmap(16 * 1024), 512);
        // 16 MiB block: 32768 sectors -> 4096 bitmap bytes -> already aligned.
        assert_eq!(bitmap(16 * 1024 * 1024), 4096);
    }
}
