//! Reading framed blobs out of a planet stream.
//!
//! A planet file is a sequence of `[big-endian u32 header length |
//! BlobHeader | Blob]` frames. [`BlockReader`] walks those frames over any
//! [`Read`] source — a file, or a download still in flight — inflates the
//! OSMData blobs, and hands back decoded [`Block`]s.

use std::borrow::Cow;
use std::io::{ErrorKind, Read};

use flate2::read::ZlibDecoder;
use log::trace;

use crate::block::{Block, What};
use crate::result::*;
use crate::wire::{for_each_field, Scan};

/// One framed blob: its declared type and raw (possibly compressed) payload.
#[derive(Debug)]
struct RawBlock {
    block_type: String,
    data: Vec<u8>,
}

/// Fills `buf` from `reader`. `Ok(false)` means the stream ended cleanly
/// before the first byte; running dry mid-buffer is [`PlanetError::UnexpectedEnd`].
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> PlanetResult<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(PlanetError::UnexpectedEnd);
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(true)
}

/// Frames raw blobs off a byte stream, tracking the cumulative position.
///
/// Sticky: any failure kills the reader, and later calls return the same
/// error.
struct RawBlockReader<R> {
    inner: R,
    err: Option<PlanetError>,
    pos: u64,
}

impl<R: Read> RawBlockReader<R> {
    fn new(inner: R) -> Self {
        RawBlockReader {
            inner,
            err: None,
            pos: 0,
        }
    }

    /// The next blob and the bytes consumed for it, or `None` at a clean
    /// end of the stream.
    fn read_block(&mut self) -> PlanetResult<Option<(u64, RawBlock)>> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        match self.next_block() {
            Ok(block) => Ok(block),
            Err(err) => {
                self.err = Some(err.clone());
                Err(err)
            }
        }
    }

    fn next_block(&mut self) -> PlanetResult<Option<(u64, RawBlock)>> {
        let start = self.pos;
        let mut len_buf = [0u8; 4];
        if !fill(&mut self.inner, &mut len_buf)? {
            return Ok(None);
        }
        self.pos += 4;
        let header_len = u32::from_be_bytes(len_buf) as usize;

        let mut header = vec![0u8; header_len];
        if !fill(&mut self.inner, &mut header)? {
            return Err(PlanetError::UnexpectedEnd);
        }
        self.pos += header_len as u64;

        let mut block_type = String::new();
        let mut data_size = 0usize;
        for_each_field(&header, |field| {
            match field.num() {
                1 => block_type = String::from_utf8_lossy(field.bytes()).into_owned(),
                3 => data_size = field.as_u64() as usize,
                _ => {} // indexdata and anything else
            }
            Ok(Scan::Continue)
        })?;
        trace!("blob at {start}: type={block_type:?} datasize={data_size}");

        let mut data = vec![0u8; data_size];
        if !fill(&mut self.inner, &mut data)? {
            return Err(PlanetError::UnexpectedEnd);
        }
        self.pos += data_size as u64;

        Ok(Some((self.pos - start, RawBlock { block_type, data })))
    }
}

/// Decodes a blob's payload: passed through for `raw`, inflated for
/// `zlib_data` (whose inflated length must match the declared `raw_size`).
/// The lzma and legacy bzip2 slots are rejected.
fn inflate(blob: &[u8]) -> PlanetResult<Cow<'_, [u8]>> {
    let mut raw_size = 0usize;
    let mut data: Option<Cow<'_, [u8]>> = None;
    let mut rejected: Option<&'static str> = None;
    for_each_field(blob, |field| {
        match field.num() {
            1 => data = Some(Cow::Borrowed(field.bytes())),
            2 => raw_size = field.as_u64() as usize,
            3 => data = Some(Cow::Owned(zlib_inflate(field.bytes(), raw_size)?)),
            4 => rejected = Some("lzma"),
            5 => rejected = Some("bzip2"),
            _ => {}
        }
        Ok(Scan::Continue)
    })?;
    match data {
        Some(data) => Ok(data),
        None => Err(match rejected {
            Some(format) => PlanetError::UnsupportedCompression(format),
            None => PlanetError::UnexpectedEnd,
        }),
    }
}

fn zlib_inflate(data: &[u8], expected: usize) -> PlanetResult<Vec<u8>> {
    let mut out = Vec::with_capacity(expected);
    ZlibDecoder::new(data).read_to_end(&mut out)?;
    if out.len() != expected {
        return Err(PlanetError::SizeMismatch {
            expected,
            actual: out.len(),
        });
    }
    Ok(out)
}

/// Reads decoded OSMData blocks from an OSM planet stream.
pub struct BlockReader<R> {
    raw: RawBlockReader<R>,
}

impl<R: Read> BlockReader<R> {
    pub fn new(inner: R) -> Self {
        BlockReader {
            raw: RawBlockReader::new(inner),
        }
    }

    /// Reads the next OSMData block, silently skipping other blob types
    /// (the leading OSMHeader in practice).
    ///
    /// Returns the bytes consumed — including any skipped blobs — and the
    /// decoded block, or `None` at the end of the stream.
    pub fn read_block(&mut self) -> PlanetResult<Option<(u64, Block)>> {
        let mut consumed = 0;
        loop {
            let Some((n, raw)) = self.raw.read_block()? else {
                return Ok(None);
            };
            consumed += n;
            if raw.block_type != "OSMData" {
                continue;
            }
            let data = inflate(&raw.data)?;
            let block = Block::decode(What::Everything, &data)?;
            return Ok(Some((consumed, block)));
        }
    }

    /// Skips over the next OSMData block. Like [`BlockReader::read_block`]
    /// but without inflating or decoding, so much faster.
    pub fn skip_block(&mut self) -> PlanetResult<Option<u64>> {
        let mut consumed = 0;
        loop {
            let Some((n, raw)) = self.raw.read_block()? else {
                return Ok(None);
            };
            consumed += n;
            if raw.block_type == "OSMData" {
                return Ok(Some(consumed));
            }
        }
    }
}
