//! # Backing File
//!
//! Positional I/O on the single serializer file ([`DbFile`]) and the
//! two-phase file opener ([`FilepathFileOpener`]).
//!
//! ## Creation protocol
//!
//! A new store is written into `<path>.create.tmp` first. Only after the
//! static header and the metablock ring are durable is the file renamed to
//! its permanent path and the parent directory fsynced, so a crash during
//! creation never leaves a half-initialized file at the final path.
//!
//! ## Reads during startup
//!
//! Recovery scans the metablock ring and the LBA extents through a
//! read-only memory map ([`DbFile::map_readonly`]); nothing writes to the
//! file until startup has finished.


use std::{
    fs::{self, File, OpenOptions},
    io,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, info};

const TEMPORARY_SUFFIX: &str = ".create.tmp";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by the file opener.
#[derive(Debug, Error)]
pub enum FileError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Operations were issued in an order the protocol does not allow.
    #[error("File opener misuse: {0}")]
    Protocol(String),
}

// ------------------------------------------------------------------------------------------------
// DbFile
// ------------------------------------------------------------------------------------------------

/// The serializer's backing file.
///
/// All access is positional (`pread`/`pwrite`), so one handle can be shared
/// between the commit thread and the I/O workers without a seek lock.
#[derive(Debug)]
pub struct DbFile {
    file: File,
    path: PathBuf,
}

impl DbFile {
    fn new(file: File, path: PathBuf) -> Self {
        Self { file, path }
    }

    /// Reads exactly `len` bytes at `offset`.
    pub fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    /// Writes all of `data` at `offset`.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.write_all_at(data, offset)
    }

    /// Flushes data and metadata to stable storage.
    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    /// Grows (or shrinks) the file to `len` bytes.
    pub fn set_len(&self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    /// Maps the whole file read-only.
    ///
    /// Only used while the serializer is starting up, when no writer exists.
    pub fn map_readonly(&self) -> io::Result<Mmap> {
        // SAFETY: the mapping is created and dropped during startup, before
        // any write to the file is issued by this process, and the store is
        // opened by one process at a time.
        unsafe { Mmap::map(&self.file) }
    }

    /// Path the file was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ------------------------------------------------------------------------------------------------
// File opener
// ------------------------------------------------------------------------------------------------

/// Opens the serializer file following the create-temporary /
/// move-to-permanent protocol.
pub trait SerializerFileOpener {
    /// The final path of the file.
    fn file_name(&self) -> PathBuf;

    /// Creates (truncating) the temporary file and returns it.
    fn open_serializer_file_create_temporary(&mut self) -> Result<DbFile, FileError>;

    /// Atomically renames the temporary file to its final path.
    fn move_serializer_file_to_permanent_location(&mut self) -> Result<(), FileError>;

    /// Opens the existing file: the temporary one if it was created but not
    /// yet moved, the permanent one otherwise.
    fn open_serializer_file_existing(&mut self) -> Result<DbFile, FileError>;

    /// Removes whichever file is current.
    fn unlink_serializer_file(&mut self) -> Result<(), FileError>;
}

/// [`SerializerFileOpener`] for a filesystem path.
#[derive(Debug)]
pub struct FilepathFileOpener {
    path: PathBuf,
    opened_temporary: bool,
}

impl FilepathFileOpener {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            opened_temporary: false,
        }
    }

    fn temporary_file_name(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(TEMPORARY_SUFFIX);
        PathBuf::from(name)
    }

    fn current_file_name(&self) -> PathBuf {
        if self.opened_temporary {
            self.temporary_file_name()
        } else {
            self.path.clone()
        }
    }

    fn open_file(path: &Path, create: bool) -> Result<DbFile, FileError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(create)
            .open(path)?;
        Ok(DbFile::new(file, path.to_path_buf()))
    }

    fn fsync_parent(path: &Path) -> Result<(), FileError> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        File::open(parent)?.sync_all()?;
        Ok(())
    }
}

impl SerializerFileOpener for FilepathFileOpener {
    fn file_name(&self) -> PathBuf {
        self.path.clone()
    }

    fn open_serializer_file_create_temporary(&mut self) -> Result<DbFile, FileError> {
        let tmp = self.temporary_file_name();
        let file = Self::open_file(&tmp, true)?;
        self.opened_temporary = true;
        debug!(path = %tmp.display(), "created temporary serializer file");
        Ok(file)
    }

    fn move_serializer_file_to_permanent_location(&mut self) -> Result<(), FileError> {
        if !self.opened_temporary {
            return Err(FileError::Protocol(
                "no temporary file has been created".into(),
            ));
        }
        fs::rename(self.temporary_file_name(), &self.path)?;
        Self::fsync_parent(&self.path)?;
        self.opened_temporary = false;
        info!(path = %self.path.display(), "serializer file moved to permanent location");
        Ok(())
    }

    fn open_serializer_file_existing(&mut self) -> Result<DbFile, FileError> {
        Self::open_file(&self.current_file_name(), false)
    }

    fn unlink_serializer_file(&mut self) -> Result<(), FileError> {
        fs::remove_file(self.current_file_name())?;
        Ok(())
    }
}
