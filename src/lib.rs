//! Virtual-machine disk image containers exposed as flat block devices.
//!
//! A disk image file stores the contents of a guest disk inside a container
//! format with its own headers and layout. This crate parses two such
//! containers and serves the logical disk bytes through a uniform
//! byte-addressed interface:
//!
//! - [`VdiDisk`]: Oracle VirtualBox VDI v1.1 (read-only)
//! - [`VhdDisk`]: Microsoft VHD, fixed and dynamic; dynamic images grow on
//!   demand as unallocated blocks are written
//! - [`DiskImage`]: format dispatch — probes a file against each supported
//!   container and returns the first accessor that accepts it
//!
//! Accessors are generic over a [`StorageBackend`], so images can live in a
//! real file ([`FileBackend`]) or in memory ([`MemBackend`]) for tests. The
//! logical bytes are served verbatim; this crate never interprets what they
//! mean.

mod backend;
mod disk;
mod error;
mod formats;
mod util;
mod vdi;
mod vhd;

pub use backend::{FileBackend, MemBackend, StorageBackend};
pub use disk::{VirtualDisk, SECTOR_SIZE};
pub use error::{DiskError, Result};
pub use formats::{detect_format, DiskFormat, DiskImage};
pub use vdi::{VdiDisk, VdiHeader};
pub use vhd::{FooterChecksum, VhdDisk};
