use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::Error;

/// File system utilities
pub struct FsUtils;

impl FsUtils {
    /// Ensure the directory exists
    pub async fn ensure_dir_exists<P: AsRef<Path>>(path: P) -> Result<(), Error> {
        fs::create_dir_all(path.as_ref()).await?;
        Ok(())
    }

    /// Replace a file's contents by writing a sibling temp file and renaming it over
    pub async fn write_atomic<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, contents: C) -> Result<(), Error> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            Self::ensure_dir_exists(parent).await?;
        }

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, contents).await?;
        fs::rename(&tmp, path).await?;

        Ok(())
    }

    /// Read a file, returning `None` when it does not exist
    pub async fn read_optional<P: AsRef<Path>>(path: P) -> Result<Option<Vec<u8>>, Error> {
        match fs::read(path.as_ref()).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Delete a file; returns whether it existed
    pub async fn remove_file<P: AsRef<Path>>(path: P) -> Result<bool, Error> {
        match fs::remove_file(path.as_ref()).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// List regular files in a directory with the given extension
    pub async fn list_files<P: AsRef<Path>>(path: P, extension: &str) -> Result<Vec<PathBuf>, Error> {
        let path = path.as_ref();

        let mut entries = match fs::read_dir(path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let entry_path = entry.path();
            if entry.file_type().await?.is_file()
                && entry_path.extension().map_or(false, |ext| ext == extension)
            {
                paths.push(entry_path);
            }
        }
        paths.sort();

        Ok(paths)
    }
}
