//! Flat-file persistence for directory state.
//!
//! Everything we keep on disk lives directly in the data directory:
//! installed and unverified consensuses, the microdescriptor cache and
//! its journal, and one legacy v2 status document per authority under
//! `cached-status/`.  The data directory is permission-checked with
//! `fs-mistrust`, and whole-file writes replace atomically.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::Path;

use fs_mistrust::{CheckedDir, Mistrust};
use tracing::warn;

use crate::docs::Flavor;
use crate::{Error, Result};

/// Name of the installed ns-flavored consensus file.
const CACHED_NS: &str = "cached-consensus";
/// Name of the installed microdesc-flavored consensus file.
const CACHED_MICRODESC: &str = "cached-microdesc-consensus";
/// Name of the parked (waiting-for-certs) ns-flavored consensus file.
const UNVERIFIED_NS: &str = "unverified-consensus";
/// Name of the parked (waiting-for-certs) microdesc-flavored consensus
/// file.
const UNVERIFIED_MICRODESC: &str = "unverified-microdesc-consensus";

/// Name of the microdescriptor cache's main file.
pub(crate) const MD_CACHE_FNAME: &str = "cached-microdescs";
/// Name of the microdescriptor cache's append journal.
pub(crate) const MD_JOURNAL_FNAME: &str = "cached-microdescs.new";
/// Name of the subdirectory holding v2 status documents.
const V2_DIR_NAME: &str = "cached-status";

/// Return the on-disk filename for a consensus of `flavor`.
pub(crate) fn consensus_fname(flavor: Flavor, unverified: bool) -> &'static str {
    match (flavor, unverified) {
        (Flavor::Ns, false) => CACHED_NS,
        (Flavor::Ns, true) => UNVERIFIED_NS,
        (Flavor::Microdesc, false) => CACHED_MICRODESC,
        (Flavor::Microdesc, true) => UNVERIFIED_MICRODESC,
    }
}

/// Bytes we have loaded or mapped from a cache file.
///
/// When the `mmap` feature is enabled, whole-file loads try to map the
/// file instead of copying it; the microdescriptor cache keeps
/// descriptor bodies in place inside such a mapping.
#[derive(Debug)]
pub(crate) enum LoadedBytes {
    /// Bytes read into memory.
    Owned(Vec<u8>),
    /// Bytes mapped from a file.
    #[cfg(feature = "mmap")]
    Mapped(memmap2::Mmap),
}

impl AsRef<[u8]> for LoadedBytes {
    fn as_ref(&self) -> &[u8] {
        match self {
            LoadedBytes::Owned(v) => &v[..],
            #[cfg(feature = "mmap")]
            LoadedBytes::Mapped(m) => &m[..],
        }
    }
}

impl LoadedBytes {
    /// Load the contents of an open file, mapping it if possible.
    fn from_file(f: std::fs::File) -> std::io::Result<Self> {
        #[cfg(feature = "mmap")]
        {
            let mapping = unsafe {
                // Safety: other processes could in theory mutate the
                // file under us; we accept that for cache files we own.
                memmap2::Mmap::map(&f)
            };
            if let Ok(bytes) = mapping {
                return Ok(LoadedBytes::Mapped(bytes));
            }
        }
        let mut f = std::io::BufReader::new(f);
        let mut result = Vec::new();
        f.read_to_end(&mut result)?;
        Ok(LoadedBytes::Owned(result))
    }
}

/// Handle to the data directory.
pub(crate) struct Store {
    /// The checked data directory itself.
    dir: CheckedDir,
    /// The checked `cached-status` subdirectory.
    v2_dir: CheckedDir,
}

impl Store {
    /// Open (creating if needed) the data directory at `path`,
    /// verifying its permissions against `mistrust`.
    pub(crate) fn open(path: &Path, mistrust: &Mistrust) -> Result<Self> {
        let verifier = mistrust.verifier().permit_readable().check_content();
        let dir = verifier.make_secure_dir(path)?;
        let verifier = mistrust.verifier().permit_readable().check_content();
        let v2_dir = verifier.make_secure_dir(path.join(V2_DIR_NAME))?;
        Ok(Store { dir, v2_dir })
    }

    /// Load `fname` from the data directory, mapping it if possible.
    ///
    /// Returns `Ok(None)` if the file does not exist.
    pub(crate) fn load(&self, fname: &str) -> Result<Option<LoadedBytes>> {
        Self::load_in(&self.dir, fname)
    }

    /// Load a v2 status document by its hex-identity filename.
    pub(crate) fn load_v2(&self, fname: &str) -> Result<Option<LoadedBytes>> {
        Self::load_in(&self.v2_dir, fname)
    }

    /// Helper: load `fname` within `dir`.
    fn load_in(dir: &CheckedDir, fname: &str) -> Result<Option<LoadedBytes>> {
        let file = match dir.open(fname, OpenOptions::new().read(true)) {
            Ok(file) => file,
            Err(fs_mistrust::Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        LoadedBytes::from_file(file)
            .map_err(|e| Error::from_io("loading", fname.into(), e))
            .map(Some)
    }

    /// Atomically replace `fname` with `contents`.
    pub(crate) fn save(&self, fname: &str, contents: &[u8]) -> Result<()> {
        self.dir.write_and_replace(fname, contents)?;
        Ok(())
    }

    /// Atomically replace a v2 status document.
    pub(crate) fn save_v2(&self, fname: &str, contents: &[u8]) -> Result<()> {
        self.v2_dir.write_and_replace(fname, contents)?;
        Ok(())
    }

    /// Remove `fname` from the data directory; missing files are fine.
    pub(crate) fn delete(&self, fname: &str) -> Result<()> {
        Self::delete_in(&self.dir, fname)
    }

    /// Remove a v2 status document; missing files are fine.
    pub(crate) fn delete_v2(&self, fname: &str) -> Result<()> {
        Self::delete_in(&self.v2_dir, fname)
    }

    /// Helper: remove `fname` within `dir`.
    fn delete_in(dir: &CheckedDir, fname: &str) -> Result<()> {
        match dir.remove_file(fname) {
            Ok(()) => Ok(()),
            Err(fs_mistrust::Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Append `contents` to `fname`, creating it if needed, and return
    /// the file's new length.
    pub(crate) fn append(&self, fname: &str, contents: &[u8]) -> Result<u64> {
        let mut file = self
            .dir
            .open(fname, OpenOptions::new().append(true).create(true))?;
        let io_err = |e| Error::from_io("appending to", fname.into(), e);
        file.write_all(contents).map_err(io_err)?;
        let len = file.metadata().map_err(io_err)?.len();
        Ok(len)
    }

    /// Return the length of `fname`, or 0 if it does not exist.
    pub(crate) fn file_len(&self, fname: &str) -> u64 {
        match self.dir.open(fname, OpenOptions::new().read(true)) {
            Ok(f) => f.metadata().map(|m| m.len()).unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// List the filenames present in the v2 status directory.
    pub(crate) fn list_v2(&self) -> Result<Vec<String>> {
        let mut found = Vec::new();
        for ent in self.v2_dir.read_directory(".")?.flatten() {
            match ent.file_name().into_string() {
                Ok(name) => found.push(name),
                Err(os_str) => {
                    // We never create non-UTF-8 names, so don't try to
                    // use this one; just mention it.
                    warn!(
                        "Ignoring bizarre file {:?} in the v2 status directory",
                        os_str.to_string_lossy()
                    );
                }
            }
        }
        found.sort();
        Ok(found)
    }
}
