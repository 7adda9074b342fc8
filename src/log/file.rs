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

//! A single transaction log file.
//!
//! The whole file is kept in memory. Log files are small (rotation keeps them
//! under `log_rotate_max_size`) and only ever grow at the end, so refreshing
//! is just a matter of reading whatever appeared after the bytes already
//! buffered.

use std::fs;
use std::io::{self, Read, Seek, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use log::{error, warn};

use super::format::{LogFileHeader, TxHeader, TX_HEADER_SIZE};
use crate::model::LogPosition;
use crate::support::config::IndexConfig;
use crate::support::error::Error;
use crate::support::file_ops;
use crate::support::lock::{self, LockKind};

pub struct LogFile {
    log_prefix: String,
    path: Option<PathBuf>,
    file: Option<fs::File>,
    hdr: LogFileHeader,
    buffer: Vec<u8>,
    corrupted: bool,
}

impl LogFile {
    /// Create a brand new log file.
    ///
    /// On disk, the file is fully written under a temporary name and then
    /// renamed into place, so `path` never refers to a partial file. If
    /// `replace` is false and `path` already exists, this fails with
    /// `AlreadyExists` and the caller should open the existing file instead.
    /// If `path` is `None`, the log file only exists in memory.
    pub fn create(
        log_prefix: &str,
        path: Option<&Path>,
        replace: bool,
        hdr: LogFileHeader,
        config: &IndexConfig,
    ) -> Result<Self, Error> {
        let mut buffer = Vec::new();
        hdr.encode(&mut buffer);

        let file = match path {
            None => None,
            Some(path) => {
                let dir = path.parent().unwrap_or_else(|| Path::new("."));
                let mut tf = tempfile::NamedTempFile::new_in(dir)?;
                tf.as_file_mut().write_all(&buffer)?;
                file_ops::chmod(tf.path(), config.file_mode)?;
                if config.sync_files() {
                    tf.as_file_mut().sync_all()?;
                }
                Some(if replace {
                    tf.persist(path).map_err(|e| e.error)?
                } else {
                    tf.persist_noclobber(path).map_err(|e| e.error)?
                })
            }
        };

        Ok(LogFile {
            log_prefix: log_prefix.to_owned(),
            path: path.map(Path::to_owned),
            file,
            hdr,
            buffer,
            corrupted: false,
        })
    }

    /// Open an existing log file and read its full contents.
    pub fn open(
        log_prefix: &str,
        path: &Path,
        read_only: bool,
    ) -> Result<Self, Error> {
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        let mut buffer = Vec::new();
        file.seek(io::SeekFrom::Start(0))?;
        file.read_to_end(&mut buffer)?;

        let hdr = LogFileHeader::decode(&buffer).map_err(|e| {
            error!("{} {}: {}", log_prefix, path.display(), e);
            e
        })?;

        let mut this = LogFile {
            log_prefix: log_prefix.to_owned(),
            path: Some(path.to_owned()),
            file: Some(file),
            hdr,
            buffer,
            corrupted: false,
        };
        this.trim_partial(hdr.hdr_size.into());
        Ok(this)
    }

    pub fn header(&self) -> &LogFileHeader {
        &self.hdr
    }

    pub fn file_seq(&self) -> u32 {
        self.hdr.file_seq
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_in_memory(&self) -> bool {
        self.file.is_none()
    }

    /// The current size of the file, which is also the position at which the
    /// next record will be written.
    pub fn size(&self) -> u32 {
        self.buffer.len() as u32
    }

    /// The position of the first record in the file.
    pub fn start_position(&self) -> LogPosition {
        LogPosition::new(self.hdr.file_seq, self.hdr.hdr_size.into())
    }

    pub fn end_position(&self) -> LogPosition {
        LogPosition::new(self.hdr.file_seq, self.size())
    }

    /// Read whatever has been appended to the file since it was last read.
    ///
    /// Only complete records are taken in; a record still being written (or
    /// left half-written by a writer that died) is read again next time.
    ///
    /// Returns whether anything new was found.
    pub fn refresh(&mut self) -> Result<bool, Error> {
        let file = match self.file.as_mut() {
            Some(f) => f,
            None => return Ok(false),
        };

        let before = self.buffer.len();
        file.seek(io::SeekFrom::Start(before as u64))?;
        file.read_to_end(&mut self.buffer)?;
        self.trim_partial(before);
        Ok(self.buffer.len() != before)
    }

    /// Drop an incomplete record from the end of the buffer, scanning from
    /// `from`, which must be a record boundary.
    ///
    /// Bytes which do not decode as a record header at all are kept, so that
    /// readers see and report the damage.
    fn trim_partial(&mut self, from: usize) {
        let mut offset = from;
        while offset < self.buffer.len() {
            let size = self
                .read_record(offset as u32)
                .map(|r| r.map(|(hdr, _)| hdr.size));
            match size {
                Ok(Some(size)) => offset += size as usize,
                Ok(None) => {
                    self.buffer.truncate(offset);
                    return;
                }
                Err(_) => return,
            }
        }
    }

    /// Cut off whatever a crashed writer left after the last complete
    /// record, so that the next append starts on a record boundary.
    ///
    /// The caller must hold the lock and have refreshed the file since
    /// acquiring it.
    pub fn cut_partial_tail(&mut self) -> Result<(), Error> {
        let file = match self.file.as_ref() {
            Some(f) => f,
            None => return Ok(()),
        };

        let end = self.buffer.len() as u64;
        let on_disk = file.metadata()?.len();
        if on_disk > end {
            warn!(
                "{} Discarding {} bytes of incomplete record at the end of \
                 transaction log seq {}",
                self.log_prefix,
                on_disk - end,
                self.hdr.file_seq
            );
            file.set_len(end)?;
        }
        Ok(())
    }

    /// Whether the path this file was opened from now refers to a different
    /// file, i.e., this file was rotated away or the log was recreated.
    pub fn is_replaced(&self) -> Result<bool, Error> {
        match (self.file.as_ref(), self.path.as_ref()) {
            (Some(file), Some(path)) => {
                Ok(!file_ops::is_same_file(file, path)?)
            }
            _ => Ok(false),
        }
    }

    /// Take the exclusive append lock on this file.
    pub fn lock(&self, config: &IndexConfig) -> Result<(), Error> {
        match self.file.as_ref() {
            Some(file) => {
                lock::lock(file, LockKind::Exclusive, config.lock_timeout())
            }
            None => Ok(()),
        }
    }

    pub fn unlock(&self) -> Result<(), Error> {
        match self.file.as_ref() {
            Some(file) => lock::unlock(file),
            None => Ok(()),
        }
    }

    /// Append `data`, which must consist of whole encoded records, to the
    /// end of the file.
    ///
    /// The caller must hold the lock and have refreshed the file since
    /// acquiring it. Returns the positions before and after the write.
    pub fn append(
        &mut self,
        data: &[u8],
        sync: bool,
    ) -> Result<(LogPosition, LogPosition), Error> {
        let start = self.end_position();
        if u64::from(start.offset) + data.len() as u64 > u64::from(u32::MAX) {
            return Err(Error::BatchTooBig);
        }

        if let Some(file) = self.file.as_mut() {
            file.write_all_at(data, start.offset.into())?;
            if sync {
                file.sync_data()?;
            }
        }

        self.buffer.extend_from_slice(data);
        Ok((start, self.end_position()))
    }

    /// Read the header of the record at `offset`, along with its payload.
    ///
    /// Returns `None` if `offset` is the end of the file or if the record
    /// at `offset` has not been completely written yet.
    pub fn read_record(
        &self,
        offset: u32,
    ) -> Result<Option<(TxHeader, &[u8])>, Error> {
        let offset = offset as usize;
        if offset + TX_HEADER_SIZE as usize > self.buffer.len() {
            return Ok(None);
        }

        let hdr = TxHeader::decode(&self.buffer[offset..])?;
        let end = offset + hdr.size as usize;
        if end > self.buffer.len() {
            return Ok(None);
        }

        Ok(Some((
            hdr,
            &self.buffer[offset + TX_HEADER_SIZE as usize..end],
        )))
    }

    pub fn set_corrupted(&mut self, offset: u32, reason: &str) {
        error!(
            "{} Transaction log {} (seq {}) corrupted at offset {}: {}",
            self.log_prefix,
            self.path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(in-memory)".to_owned()),
            self.hdr.file_seq,
            offset,
            reason
        );
        self.corrupted = true;
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted
    }

    /// The age of the file in seconds relative to `now`.
    pub fn age_secs(&self, now: u32) -> u32 {
        now.saturating_sub(self.hdr.create_stamp)
    }
}
