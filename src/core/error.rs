use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlashError {
    #[error("Device is not formatted: {0}")]
    NotFormatted(String),

    #[error("Disk full: no reclaimable clusters left")]
    DiskFull,

    #[error("File is in use: {0}")]
    FileInUse(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("File already exists: {0}")]
    FileAlreadyExists(String),

    #[error("Position {position} is outside the file (length {length})")]
    OutOfBounds { position: u64, length: u64 },

    #[error("Cannot write at position {position} past the end of the file (length {length})")]
    WritePastEnd { position: u64, length: u64 },

    #[error("File system is not mounted")]
    NotMounted,

    #[error("Invalid file name: {0}")]
    InvalidFileName(String),

    #[error("Invalid device geometry: {0}")]
    InvalidGeometry(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("File exceeds the maximum number of blocks")]
    FileTooLarge,

    #[error("Too many open handles: {0}")]
    TooManyHandles(String),

    #[error("Tail cluster {0} is not erased")]
    TailNotErased(u32),

    #[error("Block device error: {0}")]
    Device(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration parse error: {0}")]
    Config(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, FlashError>;

impl From<FlashError> for std::io::Error {
    fn from(err: FlashError) -> Self {
        use std::io::ErrorKind;

        let kind = match &err {
            FlashError::Io(inner) => inner.kind(),
            FlashError::FileNotFound(_) => ErrorKind::NotFound,
            FlashError::FileAlreadyExists(_) => ErrorKind::AlreadyExists,
            FlashError::OutOfBounds { .. }
            | FlashError::WritePastEnd { .. }
            | FlashError::InvalidFileName(_) => ErrorKind::InvalidInput,
            _ => ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_kinds() {
        let err: std::io::Error = FlashError::FileNotFound("A".into()).into();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);

        let err: std::io::Error = FlashError::WritePastEnd {
            position: 10,
            length: 4,
        }
        .into();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);

        let err: std::io::Error = FlashError::NotMounted.into();
        assert_eq!(err.kind(), std::io::ErrorKind::Other);
    }

    #[test]
    fn test_display_messages() {
        let err = FlashError::OutOfBounds {
            position: 7,
            length: 3,
        };
        assert_eq!(
            err.to_string(),
            "Position 7 is outside the file (length 3)"
        );
        assert_eq!(
            FlashError::DiskFull.to_string(),
            "Disk full: no reclaimable clusters left"
        );
    }
}
