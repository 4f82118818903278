use std::path::Path;

use crate::vdi::{VdiDisk, VDI_MAGIC};
use crate::vhd::{FooterChecksum, VhdDisk, VHD_COOKIE};
use crate::{DiskError, FileBackend, Result, StorageBackend, VirtualDisk};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DiskFormat {
    Vdi,
    Vhd,
}

/// Detect the container format from magic values, without constructing an
/// accessor.
///
/// This is a cheap, conservative probe: a positive result only means the
/// file carries the format's magic, not that it will open successfully.
/// Candidates are checked in the same fixed order `open_auto` uses.
pub fn detect_format<B: StorageBackend>(backend: &mut B) -> Result<Option<DiskFormat>> {
    let len = backend.len()?;

    if len >= 68 {
        let mut magic = [0u8; 4];
        backend.read_at(64, &mut magic)?;
        if magic == VDI_MAGIC.to_le_bytes() {
            return Ok(Some(DiskFormat::Vdi));
        }
    }

    // Fixed VHDs have only a footer at the end; dynamic VHDs also mirror it
    // at offset 0. Check both.
    if len >= 512 {
        let mut cookie = [0u8; 8];
        backend.read_at(len - 512, &mut cookie)?;
        if &cookie == VHD_COOKIE {
            return Ok(Some(DiskFormat::Vhd));
        }
        backend.read_at(0, &mut cookie)?;
        if &cookie == VHD_COOKIE {
            return Ok(Some(DiskFormat::Vhd));
        }
    }

    Ok(None)
}

/// An open disk image of any supported container format.
#[derive(Debug)]
pub enum DiskImage<B> {
    Vdi(VdiDisk<B>),
    Vhd(Box<VhdDisk<B>>),
}

impl DiskImage<FileBackend> {
    /// Open a disk image file, probing each supported format in order.
    ///
    /// The file is opened read-write; a failure to open it at all surfaces
    /// as [`DiskError::Io`] rather than [`DiskError::UnknownFormat`].
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let backend = FileBackend::open_rw(path)?;
        Self::open_auto(backend)
    }
}

impl<B: StorageBackend> DiskImage<B> {
    pub fn format(&self) -> DiskFormat {
        match self {
            Self::Vdi(_) => DiskFormat::Vdi,
            Self::Vhd(_) => DiskFormat::Vhd,
        }
    }

    pub fn open_with_format(format: DiskFormat, backend: B) -> Result<Self> {
        match format {
            DiskFormat::Vdi => Ok(Self::Vdi(VdiDisk::open(backend)?)),
            DiskFormat::Vhd => Ok(Self::Vhd(Box::new(VhdDisk::open(backend)?))),
        }
    }

    /// Probe the backend against each supported format, VDI first, then VHD.
    ///
    /// The first candidate whose parser accepts the image wins. A candidate
    /// that fails validation (or whose probe reads fail) is skipped in favor
    /// of the next; if no candidate accepts, the result is
    /// [`DiskError::UnknownFormat`]. Probing never modifies the file.
    pub fn open_auto(mut backend: B) -> Result<Self> {
        if let Ok((header, block_map)) = VdiDisk::parse(&mut backend) {
            return Ok(Self::Vdi(VdiDisk::from_parts(backend, header, block_map)));
        }

        if let Ok((footer, kind)) = VhdDisk::parse(&mut backend) {
            return Ok(Self::Vhd(Box::new(VhdDisk::from_parts(
                backend,
                footer,
                kind,
                FooterChecksum::default(),
            ))));
        }

        Err(DiskError::UnknownFormat)
    }

    pub fn into_backend(self) -> B {
        match self {
            Self::Vdi(d) => d.into_backend(),
            Self::Vhd(d) => d.into_backend(),
        }
    }
}

impl<B: StorageBackend> VirtualDisk for DiskImage<B> {
    fn length(&self) -> u64 {
        match self {
            Self::Vdi(d) => d.length(),
            Self::Vhd(d) => d.length(),
        }
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            Self::Vdi(d) => d.read_at(offset, buf),
            Self::Vhd(d) => d.read_at(offset, buf),
        }
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        match self {
            Self::Vdi(d) => d.write_at(offset, buf),
            Self::Vhd(d) => d.write_at(offset, buf),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match self {
            Self::Vdi(d) => d.flush(),
            Self::Vhd(d) => d.flush(),
        }
    }
}
