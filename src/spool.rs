//! Request bodies spooled to disk, and installing an uploaded configuration file.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use log::{debug, info};
use thiserror::Error;

const SPOOL_MODE: u32 = 0o640;

/// Hands out spool files named after a counter so concurrent requests never collide.
#[derive(Debug)]
pub struct Spooler {
    dir: PathBuf,
    next_id: u32,
}

impl Spooler {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            next_id: 1,
        }
    }

    /// Create `<dir>/<8 hex digits>`, truncating any stale file of that name.
    pub fn create(&mut self) -> io::Result<SpoolFile> {
        let path = self.dir.join(format!("{:08x}", self.next_id));
        self.next_id = self.next_id.wrapping_add(1);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(SPOOL_MODE)
            .open(&path)?;
        file.set_permissions(Permissions::from_mode(SPOOL_MODE))?;
        debug!("created spool file {}", path.display());
        Ok(SpoolFile {
            path,
            file: Some(file),
            len: 0,
        })
    }
}

/// A request body on disk. The file is removed when this is dropped.
#[derive(Debug)]
pub struct SpoolFile {
    path: PathBuf,
    file: Option<File>,
    len: u64,
}

impl SpoolFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "spool file already closed"))?;
        file.write_all(data)?;
        self.len += data.len() as u64;
        Ok(())
    }

    /// Stop writing; the contents stay until drop.
    pub fn close(&mut self) {
        self.file = None;
    }

    /// A fresh read handle on the contents, for a child's standard input.
    pub fn open(&self) -> io::Result<File> {
        File::open(&self.path)
    }
}

impl Drop for SpoolFile {
    fn drop(&mut self) {
        self.file = None;
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("removed spool file {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => debug!("unable to remove {}: {}", self.path.display(), e),
        }
    }
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("unable to open request file {}: {}", .path.display(), .source)]
    OpenRequest { path: PathBuf, source: io::Error },
    #[error("unable to create {}: {}", .path.display(), .source)]
    Create { path: PathBuf, source: io::Error },
    #[error("unable to copy to {}: {}", .path.display(), .source)]
    Copy { path: PathBuf, source: io::Error },
    #[error("unable to rename {} to {}: {}", .from.display(), .to.display(), .source)]
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Replace `target` with the uploaded body.
///
/// The body is copied to `<target>.N`, the current file is kept as `<target>.O`, and `.N` is
/// renamed over `target`. On failure `.N` is removed and `target` is left alone.
pub fn install_config(body: &SpoolFile, target: &Path, perm: u32) -> Result<(), InstallError> {
    let staged = with_suffix(target, ".N");
    let result = stage(body, &staged, perm).and_then(|()| {
        if target.exists() {
            let backup = with_suffix(target, ".O");
            fs::rename(target, &backup).map_err(|source| InstallError::Rename {
                from: target.to_path_buf(),
                to: backup,
                source,
            })?;
        }
        fs::rename(&staged, target).map_err(|source| InstallError::Rename {
            from: staged.clone(),
            to: target.to_path_buf(),
            source,
        })
    });
    match result {
        Ok(()) => {
            info!("Installed config file \"{}\"", target.display());
            Ok(())
        }
        Err(e) => {
            fs::remove_file(&staged).ok();
            Err(e)
        }
    }
}

fn stage(body: &SpoolFile, staged: &Path, perm: u32) -> Result<(), InstallError> {
    let mut input = body.open().map_err(|source| InstallError::OpenRequest {
        path: body.path().to_path_buf(),
        source,
    })?;
    let mut output = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(perm)
        .open(staged)
        .map_err(|source| InstallError::Create {
            path: staged.to_path_buf(),
            source,
        })?;
    io::copy(&mut input, &mut output)
        .and_then(|_| output.sync_all())
        .map_err(|source| InstallError::Copy {
            path: staged.to_path_buf(),
            source,
        })
}
