use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiskError>;

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A container header was present but failed validation.
    #[error("bad image format: {0}")]
    BadFormat(&'static str),

    /// No supported container format matched the file.
    #[error("file does not match any known disk image format")]
    UnknownFormat,

    /// A logical byte range or block index outside the disk.
    #[error("out of range: offset={offset} len={len} disk length={capacity}")]
    OutOfRange {
        offset: u64,
        len: usize,
        capacity: u64,
    },

    /// A backend access outside the current backing length.
    #[error("out of bounds: offset={offset} len={len} backing length={capacity}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        capacity: u64,
    },

    /// A VDI read touched a block with no backing in the image file.
    #[error("read from unallocated block {block}")]
    UnallocatedBlock { block: u64 },

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// A structural failure detected while mutating a VHD image.
    #[error("corrupt image: {0}")]
    Corrupt(&'static str),

    #[error("backend is read-only")]
    ReadOnly,

    #[error("integer overflow while computing byte offsets")]
    OffsetOverflow,
}
