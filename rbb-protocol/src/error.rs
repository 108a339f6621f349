use std::{error::Error, fmt::Display, io};

/// Errors that may occur when reading commands or responses from a stream.
#[derive(Debug)]
pub enum ReadError {
    IoError(io::Error),
    /// The byte is not part of the command vocabulary
    UnknownCommand(u8),
    /// A response byte other than `'0'` or `'1'`
    InvalidSample(u8),
}

impl From<io::Error> for ReadError {
    fn from(value: io::Error) -> Self {
        ReadError::IoError(value)
    }
}

impl Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadError::IoError(error) => write!(f, "{}", error),
            ReadError::UnknownCommand(byte) => {
                write!(f, "Received unknown command byte 0x{:02x}", byte)
            }
            ReadError::InvalidSample(byte) => {
                write!(f, "Received invalid sample byte 0x{:02x}", byte)
            }
        }
    }
}

impl Error for ReadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ReadError::IoError(error) => Some(error),
            _ => None,
        }
    }
}
