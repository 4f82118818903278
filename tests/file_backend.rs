use tempfile::tempdir;
use vmdisk::{
    DiskError, DiskFormat, DiskImage, FileBackend, MemBackend, StorageBackend, VirtualDisk,
};

fn write_le_u16(buf: &mut [u8], offset: usize, val: u16) {
    buf[offset..offset + 2].copy_from_slice(&val.to_le_bytes());
}

fn write_le_u32(buf: &mut [u8], offset: usize, val: u32) {
    buf[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
}

fn write_le_u64(buf: &mut [u8], offset: usize, val: u64) {
    buf[offset..offset + 8].copy_from_slice(&val.to_le_bytes());
}

fn write_be_u32(buf: &mut [u8], offset: usize, val: u32) {
    buf[offset..offset + 4].copy_from_slice(&val.to_be_bytes());
}

fn write_be_u64(buf: &mut [u8], offset: usize, val: u64) {
    buf[offset..offset + 8].copy_from_slice(&val.to_be_bytes());
}

/// One-block VDI image, 4 KiB logical, block filled with `fill`.
fn make_vdi_bytes(fill: u8) -> Vec<u8> {
    let mut image = vec![0u8; 1024 + 4096];
    write_le_u32(&mut image, 64, 0xBEDA_107F);
    write_le_u16(&mut image, 68, 1); // version minor
    write_le_u16(&mut image, 70, 1); // version major
    write_le_u32(&mut image, 76, 1); // file type: normal
    write_le_u32(&mut image, 340, 512); // block map offset
    write_le_u32(&mut image, 344, 1024); // data offset
    write_le_u64(&mut image, 368, 4096); // disk size
    write_le_u32(&mut image, 376, 4096); // block size
    write_le_u32(&mut image, 384, 1); // number of blocks
    write_le_u32(&mut image, 388, 1); // blocks allocated
    write_le_u32(&mut image, 512, 0); // block 0 -> physical 0
    image[1024..].fill(fill);
    image
}

fn vhd_footer_checksum(raw: &[u8; 512]) -> u32 {
    let mut sum: u32 = 0;
    for (i, b) in raw.iter().enumerate() {
        if (64..68).contains(&i) {
            continue;
        }
        sum = sum.wrapping_add(*b as u32);
    }
    !sum
}

/// Empty dynamic VHD: footer copy, dynamic header, all-unallocated BAT,
/// trailing footer.
fn make_vhd_dynamic_bytes(virtual_size: u64, block_size: u32) -> Vec<u8> {
    let table_offset = 512 + 1024u64;
    let max_table_entries = virtual_size.div_ceil(u64::from(block_size)) as u32;
    let bat_size = (u64::from(max_table_entries) * 4).div_ceil(512) * 512;
    let file_len = 512 + 1024 + bat_size + 512;

    let mut footer = [0u8; 512];
    footer[0..8].copy_from_slice(b"conectix");
    write_be_u32(&mut footer, 8, 2);
    write_be_u32(&mut footer, 12, 0x0001_0000);
    write_be_u64(&mut footer, 16, 512);
    write_be_u64(&mut footer, 40, virtual_size);
    write_be_u64(&mut footer, 48, virtual_size);
    write_be_u32(&mut footer, 60, 3);
    let checksum = vhd_footer_checksum(&footer);
    write_be_u32(&mut footer, 64, checksum);

    let mut image = vec![0u8; file_len as usize];
    image[..512].copy_from_slice(&footer);
    image[file_len as usize - 512..].copy_from_slice(&footer);

    let mut dyn_header = [0u8; 1024];
    dyn_header[0..8].copy_from_slice(b"cxsparse");
    write_be_u64(&mut dyn_header, 8, u64::MAX);
    write_be_u64(&mut dyn_header, 16, table_offset);
    write_be_u32(&mut dyn_header, 24, 0x0001_0000);
    write_be_u32(&mut dyn_header, 28, max_table_entries);
    write_be_u32(&mut dyn_header, 32, block_size);
    image[512..1536].copy_from_slice(&dyn_header);

    image[1536..(1536 + bat_size) as usize].fill(0xFF);
    image
}

#[test]
fn file_backend_round_trips_reads_and_writes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("disk.img");

    let mut backend = FileBackend::create(&path, 16).unwrap();
    assert_eq!(backend.len().unwrap(), 16);
    backend.write_at(0, b"hello world").unwrap();
    backend.write_at(6, b"WORLD").unwrap();

    let mut buf = [0u8; 11];
    backend.read_at(0, &mut buf).unwrap();
    assert_eq!(&buf, b"hello WORLD");
}

#[test]
fn file_backend_write_extends_and_zero_fills_gap() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("disk.img");

    let mut backend = FileBackend::create(&path, 4).unwrap();
    backend.write_at(6, &[0xAA, 0xBB]).unwrap();
    assert_eq!(backend.len().unwrap(), 8);

    let mut gap = [0xFFu8; 2];
    backend.read_at(4, &mut gap).unwrap();
    assert_eq!(gap, [0, 0]);
}

#[test]
fn file_backend_read_past_eof_is_out_of_bounds() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("disk.img");

    let mut backend = FileBackend::create(&path, 1024).unwrap();
    let mut buf = [0u8; 200];
    let err = backend.read_at(900, &mut buf).unwrap_err();
    assert!(matches!(err, DiskError::OutOfBounds { .. }));
}

#[test]
fn file_backend_read_only_rejects_writes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("disk.img");

    FileBackend::create(&path, 64).unwrap();
    let mut backend = FileBackend::open_read_only(&path).unwrap();

    let mut buf = [0u8; 8];
    backend.read_at(0, &mut buf).unwrap();

    assert!(matches!(
        backend.write_at(0, &[1]).unwrap_err(),
        DiskError::ReadOnly
    ));
    assert!(matches!(
        backend.set_len(128).unwrap_err(),
        DiskError::ReadOnly
    ));
}

#[test]
fn open_path_reads_a_vdi_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("disk.vdi");
    std::fs::write(&path, make_vdi_bytes(0x5C)).unwrap();

    let mut disk = DiskImage::open_path(&path).unwrap();
    assert_eq!(disk.format(), DiskFormat::Vdi);
    assert_eq!(disk.length(), 4096);

    let mut buf = [0u8; 32];
    disk.read(&mut buf, 64, 32).unwrap();
    assert_eq!(buf, [0x5C; 32]);
}

#[test]
fn open_path_vhd_dynamic_write_persists_on_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("disk.vhd");
    std::fs::write(&path, make_vhd_dynamic_bytes(64 * 1024, 16 * 1024)).unwrap();

    let data = vec![0xA7u8; 1024];
    {
        let mut disk = DiskImage::open_path(&path).unwrap();
        assert_eq!(disk.format(), DiskFormat::Vhd);
        disk.write(&data, 2048, data.len() as u64).unwrap();
        disk.flush().unwrap();
    }

    // Reopen from scratch and verify the write and the container invariants.
    let mut disk = DiskImage::open_path(&path).unwrap();
    let mut back = vec![0u8; 1024];
    let back_len = back.len() as u64;
    disk.read(&mut back, 2048, back_len).unwrap();
    assert_eq!(back, data);
    drop(disk);

    let raw = std::fs::read(&path).unwrap();
    assert_eq!(raw.len() % 512, 0);
    assert_eq!(&raw[..512], &raw[raw.len() - 512..]);
}

#[test]
fn open_path_unknown_format_fails() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    std::fs::write(&path, vec![0x33u8; 2048]).unwrap();

    let err = DiskImage::open_path(&path).unwrap_err();
    assert!(matches!(err, DiskError::UnknownFormat));
}

#[test]
fn open_path_missing_file_is_io() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("missing.img");

    let err = DiskImage::open_path(&path).unwrap_err();
    assert!(matches!(err, DiskError::Io(_)));
}

#[test]
fn mem_and_file_backends_agree_on_an_image() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("disk.vhd");
    let image = make_vhd_dynamic_bytes(64 * 1024, 16 * 1024);
    std::fs::write(&path, &image).unwrap();

    let mut mem = MemBackend::default();
    mem.write_at(0, &image).unwrap();
    let mut mem_disk = DiskImage::open_auto(mem).unwrap();
    let mut file_disk = DiskImage::open_path(&path).unwrap();

    let data = vec![0x3Eu8; 600];
    mem_disk.write(&data, 500, 600).unwrap();
    file_disk.write(&data, 500, 600).unwrap();

    let mut a = vec![0u8; 600];
    let mut b = vec![0u8; 600];
    mem_disk.read(&mut a, 500, 600).unwrap();
    file_disk.read(&mut b, 500, 600).unwrap();
    assert_eq!(a, b);

    assert_eq!(mem_disk.length(), file_disk.length());
}
