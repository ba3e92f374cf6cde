//! Error types and the related `Result<T>`

use std::io;
use std::sync::Arc;

use thiserror::Error;

pub type PlanetResult<T> = Result<T, PlanetError>;

/// Everything that can go wrong while framing, decoding, or downloading
/// a planet file.
///
/// The enum is `Clone`: the blob framer and the wire reader are sticky
/// (after a failure they keep returning the error that killed them), and a
/// downloader hands its first error to every reader tailing the file. I/O
/// causes sit behind an `Arc` to keep cloning cheap.
#[derive(Debug, Clone, Error)]
pub enum PlanetError {
    /// The input ran out mid-frame, mid-field, or mid-download.
    #[error("unexpected end of input")]
    UnexpectedEnd,

    /// A malformed varint or field header.
    #[error("invalid wire data")]
    InvalidWire,

    /// A wire type other than varint, fixed64, length-delimited, or fixed32.
    #[error("bad wire type {0}")]
    BadWireType(u8),

    /// An inflated payload didn't match the size its blob declared.
    #[error("inflated {actual} bytes, blob declared {expected}")]
    SizeMismatch { expected: usize, actual: usize },

    /// The blob is compressed with a format we don't read.
    #[error("unsupported compression: {0}")]
    UnsupportedCompression(&'static str),

    /// The file uses a format feature we don't read.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(&'static str),

    /// An unknown field number in a message parsed strictly.
    #[error("unsupported field: {0}")]
    UnsupportedField(u64),

    /// A string table entry wasn't valid UTF-8.
    #[error("invalid UTF-8 in string table")]
    Encoding(#[from] std::str::Utf8Error),

    /// More data on disk or on the wire than the declared total size.
    #[error("corrupt: too much data written")]
    CorruptTooLarge,

    /// A non-OK response to a HEAD or GET.
    #[error("http status {0}")]
    HttpStatus(u16),

    /// The download was stopped by the caller.
    #[error("stopped")]
    Stopped,

    /// An index past the end of a block's entities or strings.
    #[error("index out of bounds")]
    OutOfBounds,

    /// The primary server's index page listed no planet files.
    #[error("no names found")]
    NoNames,

    /// No mirror is currently hosting the requested file.
    #[error("no mirrors found")]
    NoMirrors,

    /// An error from underlying I/O.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for PlanetError {
    fn from(err: io::Error) -> Self {
        PlanetError::Io(Arc::new(err))
    }
}

impl From<reqwest::Error> for PlanetError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => PlanetError::HttpStatus(status.as_u16()),
            None => PlanetError::Io(Arc::new(io::Error::other(err))),
        }
    }
}
