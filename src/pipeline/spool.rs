//! On-disk staging for transports that take a file instead of inline bytes.
//!
//! A [`Spool`] owns one temporary directory per run. Each page image is
//! written there just before its upload and removed as soon as the page's
//! calls finish. Whatever is left when the run ends, on any exit path, goes
//! with the directory: explicitly via [`Spool::close`] on the normal path,
//! and through `TempDir`'s `Drop` on errors and panics.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct Spool {
    dir: Mutex<Option<TempDir>>,
    root: PathBuf,
}

impl Spool {
    /// Create a fresh staging directory under the system temp dir.
    pub fn new() -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("invoice-pages-").tempdir()?;
        let root = dir.path().to_path_buf();
        debug!("Created page spool at {}", root.display());
        Ok(Self {
            dir: Mutex::new(Some(dir)),
            root,
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Write one page's PNG bytes and return the file path.
    pub fn write_page(&self, page_index: usize, png: &[u8]) -> io::Result<PathBuf> {
        let path = self.root.join(format!("page_{:04}.png", page_index));
        std::fs::write(&path, png)?;
        Ok(path)
    }

    /// Delete a page file once its calls are done. A missing file is fine.
    pub fn release(&self, path: &Path) {
        match std::fs::remove_file(path) {
            Ok(()) => debug!("Released {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {}: {}", path.display(), e),
        }
    }

    /// Remove the staging directory and everything left in it.
    ///
    /// Safe to call more than once.
    pub fn close(&self) {
        let dir = self
            .dir
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(dir) = dir {
            if let Err(e) = dir.close() {
                warn!("Failed to remove page spool {}: {}", self.root.display(), e);
            } else {
                debug!("Removed page spool {}", self.root.display());
            }
        }
    }
}
