use std::io;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Target path exists and is not a directory")]
    DirNameConflict,
    #[error("Directory holds no configuration")]
    EmptyDir,
    #[error("Persisted settings differ from the requested settings")]
    SettingMismatch,
    #[error("Index header does not match the requested settings")]
    ConfigIndexMismatch,
    /// Capacity-shaped configuration violation, at the settings level or in a
    /// storage file's own header.
    #[error("Storage capacity violates the configuration")]
    ConfigC,
    /// Block-size-shaped configuration violation, at the settings level or in
    /// a storage file's own header.
    #[error("Storage block size violates the configuration")]
    ConfigD,
    #[error("Key already exists")]
    DataConflict,
    /// Carries exactly the keys of a batch that are already present.
    #[error("{} keys of the batch already exist", .0.len())]
    Conflict(Vec<[u8; 32]>),
    #[error("Index range is full")]
    RangeFull,
    #[error("Data region is full")]
    DataOverflow,
    #[error("Key not found")]
    NotFound,
    #[error("Buffer length does not match the block size")]
    InvalidBlockSize,
    #[error("Batch size is too big")]
    BatchTooLarge,
    #[error("Engine is closed")]
    Closed,
    #[error("IO: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = core::result::Result<T, Error>;
