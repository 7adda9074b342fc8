//-
// Copyright (c) 2026, Jason Lingle
//
// This file is part of Mailidx.
//
// Mailidx is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Mailidx is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mailidx. If not, see <http://www.gnu.org/licenses/>.

//! Miscellaneous functions for working with index files.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

/// Write `data` into the file at `path`, atomically, replacing whatever was
/// there before.
///
/// The file is staged as a temporary file in the same directory as `path` so
/// that the final rename never crosses file systems. If `sync` is true, the
/// data is flushed to disk before the rename.
pub fn spit(
    path: impl AsRef<Path>,
    mode: u32,
    sync: bool,
    data: &[u8],
) -> io::Result<()> {
    let path = path.as_ref();
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tf = tempfile::NamedTempFile::new_in(dir)?;
    tf.as_file_mut().write_all(data)?;
    chmod(tf.path(), mode)?;
    if sync {
        tf.as_file_mut().sync_all()?;
    }
    tf.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub fn chmod(path: impl AsRef<Path>, mode: u32) -> io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

/// Return whether `file` is still the file found at `path`.
///
/// This is false if `path` has been replaced by a rename or deleted.
pub fn is_same_file(file: &fs::File, path: &Path) -> io::Result<bool> {
    let open_md = file.metadata()?;
    match fs::metadata(path) {
        Ok(path_md) => Ok(open_md.dev() == path_md.dev()
            && open_md.ino() == path_md.ino()),
        Err(e) if io::ErrorKind::NotFound == e.kind() => Ok(false),
        Err(e) => Err(e),
    }
}

pub trait IgnoreKinds {
    /// Treat `NotFound` as success.
    fn ignore_not_found(self) -> Self;
}

impl<R: Default> IgnoreKinds for Result<R, io::Error> {
    fn ignore_not_found(self) -> Self {
        match self {
            Ok(r) => Ok(r),
            Err(e) if io::ErrorKind::NotFound == e.kind() => Ok(R::default()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn spit_replaces_atomically() {
        let tmpdir = TempDir::new().unwrap();
        let path = tmpdir.path().join("index");

        spit(&path, 0o600, false, b"first").unwrap();
        let orig = fs::File::open(&path).unwrap();
        assert!(is_same_file(&orig, &path).unwrap());

        spit(&path, 0o600, true, b"second").unwrap();
        assert_eq!(b"second".to_vec(), fs::read(&path).unwrap());
        // The old handle still refers to the replaced inode
        assert!(!is_same_file(&orig, &path).unwrap());

        fs::remove_file(&path).unwrap();
        assert!(!is_same_file(&orig, &path).unwrap());
    }

    #[test]
    fn ignore_not_found_defaults() {
        let tmpdir = TempDir::new().unwrap();
        let r: io::Result<()> = fs::remove_file(tmpdir.path().join("nx"))
            .ignore_not_found();
        assert!(r.is_ok());
    }
}
