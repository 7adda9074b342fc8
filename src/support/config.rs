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

use std::fs;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::support::error::Error;

/// Tunables for a single index.
///
/// This is typically loaded from a `mailidx.toml` file, but every field has a
/// sensible default so an empty file (or `IndexConfig::default()`) works.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct IndexConfig {
    /// The head log file is never rotated while smaller than this many bytes.
    pub log_rotate_min_size: u32,

    /// The head log file is always rotated once it grows beyond this many
    /// bytes, regardless of its age.
    pub log_rotate_max_size: u32,

    /// A head log file between the min and max sizes is only rotated once it
    /// was created at least this many seconds ago.
    pub log_rotate_min_age_secs: u32,

    /// How many bytes of log must accumulate past the snapshot before
    /// `Index::sync()` rewrites the snapshot file.
    pub snapshot_min_log_bytes: u32,

    /// When to call `fsync()`.
    pub fsync: FsyncMode,

    /// How long to wait for a contended lock before giving up.
    pub lock_timeout_secs: u32,

    /// The UNIX mode of files created by the index.
    pub file_mode: u32,

    /// If true, no modification of the index files is permitted.
    pub read_only: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FsyncMode {
    /// Sync after every log append.
    Always,
    /// Sync only when writing snapshots and rotating logs.
    Optimized,
    /// Never sync; rely on the OS.
    Never,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            log_rotate_min_size: 32 * 1024,
            log_rotate_max_size: 1024 * 1024,
            log_rotate_min_age_secs: 300,
            snapshot_min_log_bytes: 8 * 1024,
            fsync: FsyncMode::Optimized,
            lock_timeout_secs: 120,
            file_mode: 0o600,
            read_only: false,
        }
    }
}

impl IndexConfig {
    /// Load the configuration from the TOML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let mut data = Vec::new();
        fs::File::open(path)?.read_to_end(&mut data)?;
        Ok(toml::from_slice(&data)?)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs.into())
    }

    pub fn sync_appends(&self) -> bool {
        FsyncMode::Always == self.fsync
    }

    pub fn sync_files(&self) -> bool {
        FsyncMode::Never != self.fsync
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partial_toml_uses_defaults() {
        let config: IndexConfig = toml::from_str(
            "log_rotate_max_size = 4096\n\
             fsync = \"always\"\n",
        )
        .unwrap();
        assert_eq!(4096, config.log_rotate_max_size);
        assert_eq!(32 * 1024, config.log_rotate_min_size);
        assert_eq!(FsyncMode::Always, config.fsync);
        assert!(config.sync_appends());
        assert!(!config.read_only);
    }
}
