//! Artifact files and their locations next to a log file.
//!
//! Synchronous signing keeps everything in one `<log>.logsig` file.
//! Asynchronous signing splits block data and signatures into
//! `<log>.logsig.parts/blocks.dat` and
//! `<log>.logsig.parts/block-signatures.dat`, because signatures arrive
//! later than the block data they cover. Every artifact starts with an
//! eight byte magic identifying its role.

use std::{
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::error::{Result, TreeError};

const WRITE_BUFFER_SIZE: usize = 4096;

/// Role of an artifact file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Block data with inline signatures.
    SignedLog,
    /// Block data of the split format.
    BlockData,
    /// Signatures of the split format.
    Signatures,
}

impl FileKind {
    /// Magic written at the start of an empty file.
    pub const fn magic(self) -> &'static [u8; 8] {
        match self {
            Self::SignedLog => b"LOGSIG12",
            Self::BlockData => b"LOG12BLK",
            Self::Signatures => b"LOG12SIG",
        }
    }
}

/// Paths of all artifacts belonging to one log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    /// Chain state file.
    pub state: PathBuf,
    /// File receiving block headers, hashes and metadata.
    pub block_file: PathBuf,
    /// Separate signature file, present only for the split format.
    pub signature_file: Option<PathBuf>,
}

impl ArtifactPaths {
    /// Layout used by synchronous signing.
    pub fn single_file(log: &Path) -> Self {
        Self {
            state: with_suffix(log, ".ksistate"),
            block_file: with_suffix(log, ".logsig"),
            signature_file: None,
        }
    }

    /// Layout used by asynchronous signing.
    pub fn split(log: &Path) -> Self {
        Self {
            state: with_suffix(log, ".ksistate"),
            block_file: with_suffix(log, ".logsig.parts/blocks.dat"),
            signature_file: Some(with_suffix(log, ".logsig.parts/block-signatures.dat")),
        }
    }

    /// Role of the block file.
    pub fn block_file_kind(&self) -> FileKind {
        if self.signature_file.is_some() {
            FileKind::BlockData
        } else {
            FileKind::SignedLog
        }
    }
}

fn with_suffix(log: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(log.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Append-only artifact file.
///
/// Opening creates missing parent directories, takes an advisory exclusive
/// lock and writes the magic if the file is empty. Writes are buffered until
/// [`ArtifactFile::flush`] or [`ArtifactFile::close`].
#[derive(Debug)]
pub struct ArtifactFile {
    path: PathBuf,
    kind: FileKind,
    writer: BufWriter<File>,
}

impl ArtifactFile {
    /// Opens or creates the artifact at `path`.
    pub fn open(path: impl Into<PathBuf>, kind: FileKind) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| TreeError::artifact_open(parent, e))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| TreeError::artifact_open(&path, e))?;

        if let Err(e) = fs2::FileExt::try_lock_exclusive(&file) {
            warn!(path = %path.display(), error = %e, "could not lock artifact file");
        }

        let len = file.metadata().map_err(|e| TreeError::artifact_open(&path, e))?.len();
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
        if len == 0 {
            writer
                .write_all(kind.magic())
                .and_then(|()| writer.flush())
                .map_err(|e| TreeError::artifact_open(&path, e))?;
            debug!(path = %path.display(), "created artifact file");
        }

        Ok(Self { path, kind, writer })
    }

    /// Location of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Role of the file.
    pub fn kind(&self) -> FileKind {
        self.kind
    }

    /// Appends raw bytes.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        Ok(())
    }

    /// Pushes buffered bytes to the operating system.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flushes and closes the file, releasing its lock.
    pub fn close(mut self) -> Result<()> {
        self.writer.flush()?;
        debug!(path = %self.path.display(), "closed artifact file");
        Ok(())
    }
}

impl Write for ArtifactFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}
