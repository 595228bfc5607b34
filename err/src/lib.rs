#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("SD: {0}")]
    Sd(#[from] SdError),
    #[error("Volume: {0}")]
    Volume(#[from] VolumeError),
    #[error("File: {0}")]
    File(#[from] FileError),
}

/// Card-level failures. Each command kind keeps its own variant so the last
/// failure is queryable from the block device after the fact.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdError {
    #[error("CMD0 timeout")]
    Cmd0,
    #[error("CMD8 rejected")]
    Cmd8,
    #[error("CMD17 rejected")]
    Cmd17,
    #[error("CMD24 rejected")]
    Cmd24,
    #[error("CMD58 rejected")]
    Cmd58,
    #[error("ACMD23 rejected")]
    Acmd23,
    #[error("ACMD41 timeout")]
    Acmd41,
    #[error("Bad CSD")]
    BadCsd,
    #[error("Read error token")]
    Read,
    #[error("Read timeout")]
    ReadTimeout,
    #[error("Out-of-range read")]
    ReadRange,
    #[error("Write not accepted")]
    Write,
    #[error("Write timeout")]
    WriteTimeout,
    #[error("Write programming error")]
    WriteProgramming,
    #[error("Write to protected block zero")]
    WriteBlockZero,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeError {
    #[error("Invalid partition")]
    InvalidPartition,
    #[error("Invalid boot sector")]
    InvalidBootSector,
    #[error("Unsupported FAT type")]
    UnsupportedFatType,
    #[error("Cluster out of range")]
    BadCluster,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileError {
    #[error("Already open")]
    AlreadyOpen,
    #[error("Not open")]
    NotOpen,
    #[error("Not readable")]
    NonReadable,
    #[error("Not writable")]
    NonWritable,
    #[error("Illegal 8.3 name")]
    IllegalName,
    #[error("Not found")]
    NotFound,
    #[error("Already exists")]
    Exists,
    #[error("Not a file or subdirectory")]
    NotFileOrSubdir,
    #[error("Not a directory")]
    NotADirectory,
    #[error("Seek past end of file")]
    SeekPastEnd,
    #[error("Truncate past end of file")]
    TruncatePastEnd,
    #[error("Directory full")]
    DirFull,
    #[error("No free clusters")]
    NoFreeClusters,
}

pub type Result<T> = core::result::Result<T, Error>;
