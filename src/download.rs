//! Resumable planet downloads that can be parsed while still in flight.
//!
//! [`download`] spawns one producer thread that range-GETs the remote file
//! into the target path, picking up wherever an earlier attempt left off.
//! Any number of readers from [`Downloader::reader`] can follow the growing
//! file concurrently; a reader that catches up with the producer blocks on
//! a condition variable until more bytes land or the download terminates.
//! The shared status record is the only mutable state the two sides touch,
//! always under its mutex.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use camino::{Utf8Path, Utf8PathBuf};
use log::debug;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_LENGTH, RANGE};

use crate::mirrors::PRIMARY_URL;
use crate::result::*;

const CHUNK_SIZE: usize = 4096;

/// A point-in-time snapshot of a download's progress.
///
/// `size` and `downloaded` only ever grow, and once `done` is true nothing
/// changes again. `path` is `None` until the producer has resolved the
/// remote size and opened the target file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadStatus {
    pub done: bool,
    pub path: Option<Utf8PathBuf>,
    pub downloaded: u64,
    pub size: u64,
}

#[derive(Debug, Default)]
struct State {
    done: bool,
    path: Option<Utf8PathBuf>,
    err: Option<PlanetError>,
    downloaded: u64,
    size: u64,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

/// Handle to an in-flight (or finished) download.
pub struct Downloader {
    shared: Arc<Shared>,
}

/// Starts downloading `url` into the file at `path` on a background thread.
///
/// If the file already holds a prefix of the remote data, the download
/// resumes from that offset with an HTTP range request. The authoritative
/// total size of `planet-*` files is taken from the canonical server
/// ([`PRIMARY_URL`]) rather than the mirror being downloaded from.
pub fn download(url: &str, path: impl AsRef<Utf8Path>) -> Downloader {
    download_from(url, path, PRIMARY_URL)
}

/// Like [`download`], but resolving authoritative sizes against `primary`.
pub fn download_from(url: &str, path: impl AsRef<Utf8Path>, primary: &str) -> Downloader {
    let shared = Arc::new(Shared::default());
    let worker = Arc::clone(&shared);
    let url = url.to_owned();
    let path = path.as_ref().to_owned();
    let primary = primary.to_owned();
    thread::spawn(move || {
        let result = run_download(&url, &path, &primary, &worker);
        let mut state = worker.lock();
        if let Err(err) = result {
            debug!("download of {url} failed: {err}");
            if state.err.is_none() {
                state.err = Some(err);
            }
        }
        // done is the final word, published success or failure.
        state.done = true;
        worker.cond.notify_all();
    });
    Downloader { shared }
}

impl Downloader {
    pub fn status(&self) -> DownloadStatus {
        let state = self.shared.lock();
        DownloadStatus {
            done: state.done,
            path: state.path.clone(),
            downloaded: state.downloaded,
            size: state.size,
        }
    }

    /// Stops the download: the producer aborts at its next chunk boundary
    /// and every blocked reader wakes with [`PlanetError::Stopped`].
    /// Idempotent, and a no-op once the download is terminal.
    pub fn stop(&self) {
        let mut state = self.shared.lock();
        if state.done || state.err.is_some() {
            return;
        }
        state.err = Some(PlanetError::Stopped);
        self.shared.cond.notify_all();
    }

    /// Blocks until the download finishes and returns its error, if any.
    pub fn error(&self) -> Option<PlanetError> {
        let mut state = self.shared.lock();
        while !state.done {
            state = self.shared.cond.wait(state).unwrap();
        }
        state.err.clone()
    }

    /// Returns a reader over the download's target file, blocking until the
    /// producer has published a path (or failed trying).
    ///
    /// While the download is in flight the reader tails the growing file:
    /// instead of reporting EOF at the current end it waits for more bytes.
    /// EOF is only reported once every expected byte has been read. Each
    /// reader holds its own file handle, so concurrent readers don't
    /// interfere.
    pub fn reader(&self) -> DownloadReader {
        let mut state = self.shared.lock();
        loop {
            if let Some(err) = &state.err {
                return DownloadReader {
                    inner: ReaderKind::Failed(err.clone()),
                };
            }
            let Some(path) = &state.path else {
                state = self.shared.cond.wait(state).unwrap();
                continue;
            };
            let inner = match File::open(path) {
                Err(err) => ReaderKind::Failed(err.into()),
                Ok(file) if state.done => ReaderKind::Plain(file),
                Ok(file) => ReaderKind::Tail(TailReader {
                    file,
                    shared: Arc::clone(&self.shared),
                    read: 0,
                }),
            };
            return DownloadReader { inner };
        }
    }
}

/// A reader over a download's target file. See [`Downloader::reader`].
pub struct DownloadReader {
    inner: ReaderKind,
}

enum ReaderKind {
    /// The download failed before a path was available; every read reports
    /// that error.
    Failed(PlanetError),
    /// The download had already finished; plain file reads.
    Plain(File),
    /// The download is in flight; reads wait for bytes to land.
    Tail(TailReader),
}

impl Read for DownloadReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            ReaderKind::Failed(err) => Err(io::Error::other(err.clone())),
            ReaderKind::Plain(file) => file.read(buf),
            ReaderKind::Tail(tail) => tail.read(buf),
        }
    }
}

struct TailReader {
    file: File,
    shared: Arc<Shared>,
    read: u64,
}

impl Read for TailReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = self.file.read(buf)?;
            if n > 0 {
                // Any recorded downloader error surfaces once the bytes
                // already on disk have been handed out.
                self.read += n as u64;
                return Ok(n);
            }
            if buf.is_empty() {
                return Ok(0);
            }
            // At the file's current end: decide between a real EOF, a
            // failure, and waiting for the producer.
            let mut state = self.shared.lock();
            loop {
                if let Some(err) = &state.err {
                    return Err(io::Error::other(err.clone()));
                }
                if self.read > state.size {
                    return Err(io::Error::other(PlanetError::CorruptTooLarge));
                }
                if self.read == state.size {
                    return Ok(0);
                }
                if state.downloaded > self.read {
                    break; // more bytes on disk; retry the file read
                }
                state = self.shared.cond.wait(state).unwrap();
            }
        }
    }
}

fn run_download(
    url: &str,
    path: &Utf8Path,
    primary: &str,
    shared: &Shared,
) -> PlanetResult<()> {
    let client = Client::new();

    // Mirrors can disagree with the canonical server while a new planet
    // file is syncing; for planet files the primary's size is the truth.
    let base_name = url.rsplit('/').next().unwrap_or(url);
    let head_url = if base_name.starts_with("planet-") {
        format!("{primary}{base_name}")
    } else {
        url.to_owned()
    };
    let head = client.head(&head_url).send()?;
    if head.status().as_u16() != 200 {
        return Err(PlanetError::HttpStatus(head.status().as_u16()));
    }
    let size = content_length(&head)?;

    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)?;
    let start = file.seek(SeekFrom::End(0))?;
    if start > size {
        return Err(PlanetError::CorruptTooLarge);
    }
    debug!("downloading {url} to {path}: {start}/{size} bytes already on disk");

    {
        let mut state = shared.lock();
        state.path = Some(path.to_owned());
        state.size = size;
        state.downloaded = start;
        shared.cond.notify_all();
    }
    if start == size {
        return Ok(()); // nothing left to fetch
    }

    let mut body = client
        .get(url)
        .header(RANGE, format!("bytes={}-{}", start, size - 1))
        .send()?;
    let status = body.status().as_u16();
    if status != 200 && status != 206 {
        return Err(PlanetError::HttpStatus(status));
    }

    let mut chunk = [0u8; CHUNK_SIZE];
    let mut written = start;
    loop {
        let n = body.read(&mut chunk)?;
        if n == 0 {
            if written != size {
                return Err(PlanetError::UnexpectedEnd);
            }
            break;
        }
        written += n as u64;
        if written > size {
            return Err(PlanetError::CorruptTooLarge);
        }
        let mut state = shared.lock();
        if let Some(err) = &state.err {
            return Err(err.clone());
        }
        file.write_all(&chunk[..n])?;
        state.downloaded = written;
        shared.cond.notify_all();
    }
    file.sync_all()?;
    Ok(())
}

fn content_length(response: &reqwest::blocking::Response) -> PlanetResult<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "missing or invalid Content-Length").into()
        })
}
