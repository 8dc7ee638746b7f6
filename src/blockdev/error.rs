use core::convert::TryFrom;

/// Error codes understood by the filesystem consumer.
///
/// The discriminants are the conventional negative littlefs codes, so a
/// consumer written against the C vocabulary can exchange raw values via
/// `code()` and `check()`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[derive(num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[repr(i32)]
pub enum FsError {
    #[error("I/O error")]
    Io = -5,
    #[error("Corrupted")]
    Corrupt = -84,
    #[error("No directory entry")]
    NotFound = -2,
    #[error("Entry already exists")]
    AlreadyExists = -17,
    #[error("Entry is not a directory")]
    NotADirectory = -20,
    #[error("Entry is a directory")]
    IsADirectory = -21,
    #[error("Directory is not empty")]
    DirectoryNotEmpty = -39,
    #[error("Bad file number")]
    BadFileDescriptor = -9,
    #[error("File too large")]
    FileTooBig = -27,
    #[error("Invalid parameter")]
    InvalidArgument = -22,
    #[error("No space left on device")]
    OutOfSpace = -28,
    #[error("No more memory available")]
    OutOfMemory = -12,
    #[error("No data/attr available")]
    NoSuchAttribute = -61,
    #[error("File name too long")]
    NameTooLong = -36,
}

impl FsError {
    pub fn code(self) -> i32 {
        self.into()
    }

    /// Interpret a raw consumer return value.
    ///
    /// Non-negative values are success. Negative values outside the known
    /// vocabulary are reported as `Io` rather than passed through.
    pub fn check(code: i32) -> core::result::Result<i32, FsError> {
        if code >= 0 {
            Ok(code)
        } else {
            Err(FsError::try_from(code).unwrap_or(FsError::Io))
        }
    }
}

impl From<crate::Error> for FsError {
    fn from(err: crate::Error) -> Self {
        match err {
            crate::Error::Unaligned { .. } => FsError::InvalidArgument,
            _ => FsError::Io,
        }
    }
}

/// Errors from instance lifecycle operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Instance has not been initialised.")]
    NotInitialized,
    #[error("Instance is already initialised.")]
    AlreadyInitialized,
    #[error("Filesystem is not mounted.")]
    NotMounted,
    #[error("Not allowed while the filesystem is mounted.")]
    Mounted,
    #[error("Invalid configuration: {0}.")]
    InvalidConfig(&'static str),
    #[error("Flash error: {0}")]
    Flash(#[from] crate::Error),
    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),
}

pub type Result<T> = std::result::Result<T, Error>;
