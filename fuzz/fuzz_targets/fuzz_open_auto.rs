#![no_main]

use arbitrary::Unstructured;
use libfuzzer_sys::fuzz_target;
use vmdisk::{detect_format, DiskFormat, DiskImage, MemBackend, StorageBackend, VirtualDisk};

const MAX_IMAGE_BYTES: usize = 1024 * 1024; // 1 MiB
// How much of the input is peeled off the tail to script disk operations.
const SCRIPT_BYTES: usize = 64;
// Sparse formats can claim enormous virtual sizes; confine operations to a
// window at the front of the disk so they hit the translation logic.
const OP_WINDOW_BYTES: u64 = 4 * 1024 * 1024; // 4 MiB
const SCRATCH_BYTES: usize = 2048;

fn image_backend(image: &[u8]) -> MemBackend {
    let mut backend = MemBackend::default();
    backend
        .write_at(0, image)
        .expect("in-memory image write cannot fail");
    backend
}

fuzz_target!(|data: &[u8]| {
    if data.len() > MAX_IMAGE_BYTES {
        return;
    }

    let script_len = data.len().min(SCRIPT_BYTES);
    let (image, script) = data.split_at(data.len() - script_len);

    // The magic probe must never panic, whatever the bytes look like.
    let mut backend = image_backend(image);
    let _ = detect_format(&mut backend);

    let mut disk = match DiskImage::open_auto(backend) {
        Ok(disk) => disk,
        Err(_) => {
            // When dispatch rejects the image, forcing each format must fail
            // with a structured error rather than a panic.
            for format in [DiskFormat::Vdi, DiskFormat::Vhd] {
                let _ = DiskImage::open_with_format(format, image_backend(image));
            }
            return;
        }
    };

    let image_was_sector_aligned = image.len() % 512 == 0;
    let window = disk.length().min(OP_WINDOW_BYTES);
    let mut scratch = [0u8; SCRATCH_BYTES];

    let mut u = Unstructured::new(script);
    while !u.is_empty() && window > 0 {
        let op: u8 = u.arbitrary().unwrap_or(0);
        let raw_off: u32 = u.arbitrary().unwrap_or(0);
        let offset = u64::from(raw_off) % window;
        let len = usize::from(u.arbitrary::<u8>().unwrap_or(0)).clamp(1, SCRATCH_BYTES);

        match op % 4 {
            0 => {
                let _ = disk.read_at(offset, &mut scratch[..len]);
            }
            1 => {
                // Clamped transfer: ask for more than the buffer holds.
                let _ = disk.read(&mut scratch[..len], offset, u64::from(raw_off));
            }
            2 => {
                let _ = disk.write_at(offset, &scratch[..len]);
            }
            _ => {
                let _ = disk.write(&scratch[..len], offset, u64::from(raw_off));
            }
        }
    }

    let _ = disk.flush();

    // Growth only ever appends whole blocks plus their sector-padded bitmaps,
    // so a sector-aligned VHD image must stay sector-aligned no matter what
    // was written.
    if disk.format() == DiskFormat::Vhd && image_was_sector_aligned {
        let mut backend = disk.into_backend();
        if let Ok(len) = backend.len() {
            assert!(len % 512 == 0, "vhd image length lost sector alignment");
        }
    }
});
