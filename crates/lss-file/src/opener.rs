//! Database file lifecycle: temporary creation, rename, unlink.
//!
//! A store is created under `<name>.create_temporary` and renamed to
//! its permanent name on the first successful start, so a crash during
//! creation never leaves a half-initialized file under the real name.

use crate::device::{ByteDevice, FileByteDevice, MemoryByteDevice};
use lss_error::{LssError, Result};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const TEMPORARY_SUFFIX: &str = ".create_temporary";

/// Opens, renames, and unlinks the serializer's database file.
pub trait FileOpener: Send + Sync {
    /// Permanent file name, for diagnostics.
    fn file_name(&self) -> String;

    /// Create the temporary file, truncating any stale one.
    fn open_create_temporary(&self) -> Result<Arc<dyn ByteDevice>>;

    /// Open whichever of the temporary or permanent file currently exists.
    fn open_existing(&self) -> Result<Arc<dyn ByteDevice>>;

    /// Whether the opener is still pointing at the temporary file.
    fn opened_temporary(&self) -> bool;

    /// Rename the temporary file to its permanent name.
    ///
    /// # Panics
    /// If no temporary file was created through this opener.
    fn move_to_permanent_location(&self) -> Result<()>;

    /// Remove the temporary file.
    ///
    /// # Panics
    /// If no temporary file was created through this opener.
    fn unlink(&self) -> Result<()>;
}

/// Filesystem-backed opener.
#[derive(Debug)]
pub struct PathFileOpener {
    permanent: PathBuf,
    opened_temporary: Mutex<bool>,
}

impl PathFileOpener {
    #[must_use]
    pub fn new(permanent: impl AsRef<Path>) -> Self {
        Self {
            permanent: permanent.as_ref().to_path_buf(),
            opened_temporary: Mutex::new(false),
        }
    }

    fn temporary_path(&self) -> PathBuf {
        let mut name = self.permanent.as_os_str().to_owned();
        name.push(TEMPORARY_SUFFIX);
        PathBuf::from(name)
    }

    fn current_path(&self) -> PathBuf {
        let mut opened_temporary = self.opened_temporary.lock();
        if !*opened_temporary && !self.permanent.exists() && self.temporary_path().exists() {
            // A create that stopped before the rename left the store
            // under the temporary name only; adopt it so the next
            // successful start can finish the rename.
            debug!(
                target: "lss::file",
                event = "adopted_temporary",
                path = %self.temporary_path().display()
            );
            *opened_temporary = true;
        }
        if *opened_temporary {
            self.temporary_path()
        } else {
            self.permanent.clone()
        }
    }
}

impl FileOpener for PathFileOpener {
    fn file_name(&self) -> String {
        self.permanent.display().to_string()
    }

    fn open_create_temporary(&self) -> Result<Arc<dyn ByteDevice>> {
        let path = self.temporary_path();
        let device = FileByteDevice::open(&path, true)?;
        *self.opened_temporary.lock() = true;
        debug!(target: "lss::file", event = "create_temporary", path = %path.display());
        Ok(Arc::new(device))
    }

    fn open_existing(&self) -> Result<Arc<dyn ByteDevice>> {
        let path = self.current_path();
        let device = FileByteDevice::open(&path, false)?;
        Ok(Arc::new(device))
    }

    fn opened_temporary(&self) -> bool {
        *self.opened_temporary.lock()
    }

    fn move_to_permanent_location(&self) -> Result<()> {
        let mut opened_temporary = self.opened_temporary.lock();
        assert!(
            *opened_temporary,
            "move_to_permanent_location without a temporary file"
        );
        std::fs::rename(self.temporary_path(), &self.permanent)?;
        *opened_temporary = false;
        info!(
            target: "lss::file",
            event = "moved_to_permanent",
            path = %self.permanent.display()
        );
        Ok(())
    }

    fn unlink(&self) -> Result<()> {
        let opened_temporary = self.opened_temporary.lock();
        assert!(*opened_temporary, "unlink without a temporary file");
        std::fs::remove_file(self.temporary_path())?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemFileState {
    NoFile,
    TemporaryFile,
    PermanentFile,
    Unlinked,
}

/// In-memory opener for tests; the backing bytes survive reopen.
#[derive(Debug)]
pub struct MemFileOpener {
    data: MemoryByteDevice,
    state: Mutex<MemFileState>,
}

impl Default for MemFileOpener {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFileOpener {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: MemoryByteDevice::new(),
            state: Mutex::new(MemFileState::NoFile),
        }
    }

    /// Direct handle to the backing bytes (corruption-injection tests).
    #[must_use]
    pub fn raw_device(&self) -> MemoryByteDevice {
        self.data.share()
    }

    fn state(&self) -> MemFileState {
        *self.state.lock()
    }
}

impl FileOpener for MemFileOpener {
    fn file_name(&self) -> String {
        "<memory>".to_owned()
    }

    fn open_create_temporary(&self) -> Result<Arc<dyn ByteDevice>> {
        let cx = asupersync::Cx::for_testing();
        self.data.set_len_bytes(&cx, 0)?;
        *self.state.lock() = MemFileState::TemporaryFile;
        Ok(Arc::new(self.data.share()))
    }

    fn open_existing(&self) -> Result<Arc<dyn ByteDevice>> {
        // Probe the permanent file first, then fall back to a temporary
        // left behind by an interrupted create; the state field tracks
        // which of the two exists.
        match self.state() {
            MemFileState::PermanentFile | MemFileState::TemporaryFile => {
                Ok(Arc::new(self.data.share()))
            }
            MemFileState::NoFile | MemFileState::Unlinked => Err(LssError::Io(
                std::io::Error::new(std::io::ErrorKind::NotFound, "no such in-memory file"),
            )),
        }
    }

    fn opened_temporary(&self) -> bool {
        self.state() == MemFileState::TemporaryFile
    }

    fn move_to_permanent_location(&self) -> Result<()> {
        let mut state = self.state.lock();
        assert_eq!(
            *state,
            MemFileState::TemporaryFile,
            "move_to_permanent_location without a temporary file"
        );
        *state = MemFileState::PermanentFile;
        Ok(())
    }

    fn unlink(&self) -> Result<()> {
        let mut state = self.state.lock();
        assert_eq!(
            *state,
            MemFileState::TemporaryFile,
            "unlink without a temporary file"
        );
        *state = MemFileState::Unlinked;
        Ok(())
    }
}
