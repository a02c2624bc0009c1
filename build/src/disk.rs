//! The filesystem stat primitive, behind a trait so graph and scheduler
//! tests can run against a mock filesystem.

use std::fs;
use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub mtime: SystemTime,
    pub exists: bool,
}

impl FileStat {
    pub fn missing() -> FileStat {
        FileStat {
            mtime: UNIX_EPOCH,
            exists: false,
        }
    }
}

pub trait DiskInterface: Send + Sync {
    /// Stat a target name. Not existing is a normal answer; any other
    /// failure is an error the caller treats as fatal.
    fn stat(&self, name: &str) -> io::Result<FileStat>;
}

#[derive(Debug)]
pub struct SystemDisk;

impl DiskInterface for SystemDisk {
    fn stat(&self, name: &str) -> io::Result<FileStat> {
        match fs::metadata(name) {
            Ok(metadata) => Ok(FileStat {
                mtime: metadata.modified()?,
                exists: true,
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(FileStat::missing()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_missing_file_is_not_an_error() {
        let stat = SystemDisk
            .stat("surely-this-file-does-not-exist.xyz")
            .expect("stat");
        assert!(!stat.exists);
        assert_eq!(stat.mtime, UNIX_EPOCH);
    }

    #[test]
    fn test_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("present");
        std::fs::write(&path, "x").expect("write");
        let stat = SystemDisk
            .stat(path.to_str().expect("utf8 path"))
            .expect("stat");
        assert!(stat.exists);
        assert!(stat.mtime > UNIX_EPOCH);
    }
}
