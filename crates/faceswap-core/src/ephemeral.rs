//! Request-scoped temporary files.
//!
//! Every file handed to the swap backend (and the result written back for
//! download) lives in an [`EphemeralFile`]. The guard removes its file on
//! [`release`](EphemeralFile::release) or, failing that, on drop, so no exit
//! path of a request can leak one.

use crate::types::UploadedImage;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const FILE_PREFIX: &str = "faceswap";

/// Directory that ephemeral files are created in.
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The platform temporary directory.
    pub fn system() -> Self {
        Self::new(std::env::temp_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write an upload to a new uniquely named file.
    pub fn stage(&self, image: &UploadedImage) -> io::Result<EphemeralFile> {
        self.write(image.role.as_str(), image.format.extension(), &image.bytes)
    }

    /// Write `bytes` to `faceswap-<label>-<uuid>.<extension>`.
    ///
    /// The file is created with create-new semantics; a partially written
    /// file is removed before the error is returned.
    pub fn write(&self, label: &str, extension: &str, bytes: &[u8]) -> io::Result<EphemeralFile> {
        let name = format!("{FILE_PREFIX}-{label}-{}.{extension}", Uuid::new_v4());
        let path = self.dir.join(name);

        let mut file = OpenOptions::new().read(true).write(true).create_new(true).open(&path)?;
        // Guard first so a failed write still cleans up.
        let mut guard = EphemeralFile::adopt(path);
        file.write_all(bytes)?;
        file.sync_all()?;
        guard.handle = Some(file);

        tracing::debug!(path = %guard.path().display(), len = bytes.len(), "staged ephemeral file");
        Ok(guard)
    }
}

/// Owns one temporary file and deletes it exactly once.
#[derive(Debug)]
pub struct EphemeralFile {
    path: PathBuf,
    /// Handle the file was written through, if this guard created it.
    handle: Option<File>,
    released: bool,
}

impl EphemeralFile {
    /// Take ownership of an existing path.
    pub fn adopt(path: PathBuf) -> Self {
        Self {
            path,
            handle: None,
            released: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the contents back, through the write handle when there is one.
    pub fn read(&self) -> io::Result<Vec<u8>> {
        match &self.handle {
            Some(file) => {
                let mut file: &File = file;
                let mut bytes = Vec::new();
                file.seek(SeekFrom::Start(0))?;
                file.read_to_end(&mut bytes)?;
                Ok(bytes)
            }
            None => fs::read(&self.path),
        }
    }

    /// Delete the file, reporting failure to the caller.
    ///
    /// A file that is already gone counts as released.
    pub fn release(mut self) -> io::Result<()> {
        self.released = true;
        self.handle = None;
        remove_if_exists(&self.path)
    }
}

impl Drop for EphemeralFile {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.handle = None;
        if let Err(err) = remove_if_exists(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to remove ephemeral file");
        }
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FaceRole, ImageFormat};

    fn entries(dir: &Path) -> usize {
        fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_stage_writes_bytes_with_role_and_extension() {
        let tmp = tempfile::tempdir().unwrap();
        let area = StagingArea::new(tmp.path());
        let upload = UploadedImage {
            role: FaceRole::Source,
            format: ImageFormat::Png,
            file_name: None,
            bytes: vec![1, 2, 3],
        };

        let file = area.stage(&upload).unwrap();
        let name = file.path().file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("faceswap-source-"), "{name}");
        assert!(name.ends_with(".png"), "{name}");
        assert_eq!(file.read().unwrap(), vec![1, 2, 3]);

        file.release().unwrap();
        assert_eq!(entries(tmp.path()), 0);
    }

    #[test]
    fn test_names_are_unique() {
        let tmp = tempfile::tempdir().unwrap();
        let area = StagingArea::new(tmp.path());
        let a = area.write("x", "jpg", b"a").unwrap();
        let b = area.write("x", "jpg", b"b").unwrap();
        assert_ne!(a.path(), b.path());
        assert_eq!(entries(tmp.path()), 2);
    }

    #[test]
    fn test_drop_removes_file() {
        let tmp = tempfile::tempdir().unwrap();
        let area = StagingArea::new(tmp.path());
        {
            let _file = area.write("result", "jpg", b"data").unwrap();
            assert_eq!(entries(tmp.path()), 1);
        }
        assert_eq!(entries(tmp.path()), 0);
    }

    #[test]
    fn test_drop_removes_file_on_panic() {
        let tmp = tempfile::tempdir().unwrap();
        let area = StagingArea::new(tmp.path());
        let result = std::panic::catch_unwind(|| {
            let _file = area.write("source", "jpg", b"data").unwrap();
            panic!("boom");
        });
        assert!(result.is_err());
        assert_eq!(entries(tmp.path()), 0);
    }

    #[test]
    fn test_release_of_missing_file_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let area = StagingArea::new(tmp.path());
        let file = area.write("target", "png", b"data").unwrap();
        fs::remove_file(file.path()).unwrap();
        assert!(file.release().is_ok());
    }

    #[test]
    fn test_read_goes_through_write_handle() {
        let tmp = tempfile::tempdir().unwrap();
        let area = StagingArea::new(tmp.path());
        let file = area.write("result", "jpg", b"jpeg").unwrap();
        fs::remove_file(file.path()).unwrap();
        fs::create_dir(file.path()).unwrap();

        assert_eq!(file.read().unwrap(), b"jpeg");
        assert!(file.release().is_err());
    }

    #[test]
    fn test_release_reports_failure() {
        // A directory at the guarded path cannot be removed with remove_file.
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("not-a-file");
        fs::create_dir(&dir).unwrap();
        let guard = EphemeralFile::adopt(dir.clone());
        assert!(guard.release().is_err());
        assert!(dir.exists());
    }

    #[test]
    fn test_write_into_missing_dir_fails_without_leaving_files() {
        let tmp = tempfile::tempdir().unwrap();
        let area = StagingArea::new(tmp.path().join("missing"));
        assert!(area.write("source", "jpg", b"data").is_err());
        assert_eq!(entries(tmp.path()), 0);
    }
}
