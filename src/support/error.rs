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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Message does not exist")]
    NxMessage,
    #[error("Sequence number out of range")]
    SeqnumOutOfRange,
    #[error("Index is corrupted and must be rebuilt")]
    IndexCorrupted,
    #[error("View is inconsistent with its index and must be reopened")]
    ViewInconsistent,
    #[error("Transaction log files needed by the view have been rotated away")]
    LogFilesLost,
    #[error("Timed out waiting for a lock")]
    LockTimeout,
    #[error("Index is read-only")]
    ReadOnly,
    #[error("No more UIDs can be allocated in this mailbox")]
    UidsExhausted,
    #[error("Too many changes in one transaction")]
    BatchTooBig,
    #[error("Extension is not registered")]
    UnknownExtension,
    #[error("Extension data has the wrong size")]
    ExtensionSizeMismatch,
    #[error("Keyword name is empty or contains NUL")]
    BadKeyword,
    #[error("Header update is out of range")]
    BadHeaderUpdate,
    #[error("Corrupted index: {0}")]
    CorruptIndex(String),
    #[error("Corrupted transaction log: {0}")]
    CorruptLog(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether this error indicates damaged on-disk data, as opposed to
    /// staleness or an I/O failure.
    pub fn is_corruption(&self) -> bool {
        matches!(
            *self,
            Error::IndexCorrupted | Error::CorruptIndex(_) | Error::CorruptLog(_)
        )
    }
}
