//! Archive builder
//!
//! Writes entries into a ZIP incrementally, one entry at a time and in the
//! order given, copying through a fixed-size buffer. Modification times are
//! pinned to the ZIP epoch so identical input produces identical bytes.

use std::io::{self, Read, Seek, Write};
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use zip::CompressionMethod;
use zip::result::ZipError;
use zip::write::{FileOptions, ZipWriter};

use crate::error::{DownloadError, DownloadErrorKind, PipelineError};
use crate::types::CompressionLevel;

/// One entry to write: its name inside the archive and where to read it from
pub struct ArchiveEntry<R> {
    /// Entry name inside the archive
    pub name: String,
    /// Source of the entry contents
    pub reader: R,
}

/// A finished archive on local disk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuiltArchive {
    /// Archive file
    pub path: PathBuf,
    /// Archive size in bytes
    pub size_bytes: u64,
    /// Number of entries written
    pub entry_count: usize,
}

/// Write `entries` into a ZIP archive on `sink`
///
/// Returns the sink and the number of entries written. A failing entry source
/// aborts the archive with `compression_error`; cancellation is honoured
/// between entries.
pub fn write_archive<W, R, I>(
    sink: W,
    entries: I,
    level: CompressionLevel,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> Result<(W, usize), PipelineError>
where
    W: Write + Seek,
    R: Read,
    I: IntoIterator<Item = io::Result<ArchiveEntry<R>>>,
{
    let mut zip = ZipWriter::new(sink);
    let options = entry_options(level);
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut count = 0;

    for entry in entries {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let ArchiveEntry { name, mut reader } = entry.map_err(|e| {
            DownloadError::from_io(DownloadErrorKind::Compression, "opening entry source", &e)
        })?;

        zip.start_file(name.as_str(), options)
            .map_err(|e| zip_error(&name, e))?;

        loop {
            let read = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(DownloadError::from_io(
                        DownloadErrorKind::Compression,
                        &format!("reading entry {name}"),
                        &e,
                    )
                    .into());
                }
            };
            zip.write_all(&buffer[..read]).map_err(|e| {
                DownloadError::from_io(
                    DownloadErrorKind::Compression,
                    &format!("writing entry {name}"),
                    &e,
                )
            })?;
        }

        count += 1;
        tracing::trace!(entry = %name, "Archive entry written");
    }

    let sink = zip.finish().map_err(|e| zip_error("central directory", e))?;
    Ok((sink, count))
}

/// Build an archive file at `dest` from spooled entries on the blocking pool
pub async fn build_archive_file(
    entries: Vec<(String, PathBuf)>,
    dest: PathBuf,
    level: CompressionLevel,
    chunk_size: usize,
    cancel: CancellationToken,
) -> Result<BuiltArchive, PipelineError> {
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::create(&dest).map_err(|e| {
            DownloadError::from_io(DownloadErrorKind::Compression, "creating archive file", &e)
        })?;
        let sink = io::BufWriter::with_capacity(chunk_size.max(1), file);

        let sources = entries.into_iter().map(|(name, path)| {
            match std::fs::File::open(&path) {
                Ok(reader) => Ok(ArchiveEntry { name, reader }),
                Err(e) => Err(io::Error::new(e.kind(), format!("{name}: {e}"))),
            }
        });

        let (sink, entry_count) = write_archive(sink, sources, level, chunk_size, &cancel)?;
        let file = sink.into_inner().map_err(|e| {
            DownloadError::from_io(DownloadErrorKind::Compression, "flushing archive", e.error())
        })?;
        let size_bytes = file
            .metadata()
            .map_err(|e| {
                DownloadError::from_io(DownloadErrorKind::Compression, "reading archive size", &e)
            })?
            .len();

        Ok(BuiltArchive {
            path: dest,
            size_bytes,
            entry_count,
        })
    })
    .await
    .map_err(|e| PipelineError::Failed(DownloadError::compression(format!("archive task failed: {e}"))))?
}

fn entry_options(level: CompressionLevel) -> FileOptions {
    let options = FileOptions::default()
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644);

    if level.is_stored() {
        options.compression_method(CompressionMethod::Stored)
    } else {
        options
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(i32::from(level.get())))
    }
}

fn zip_error(entry: &str, err: ZipError) -> PipelineError {
    let err = match err {
        ZipError::Io(io) => {
            DownloadError::from_io(DownloadErrorKind::Compression, &format!("writing {entry}"), &io)
        }
        other => DownloadError::compression(format!("writing {entry}: {other}")),
    };
    PipelineError::Failed(err)
}
