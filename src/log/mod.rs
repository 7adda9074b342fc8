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

//! The transaction log: the append-only record of every change made to the
//! index.
//!
//! # Files
//!
//! The log is a chain of files, each header naming the sequence number and
//! final size of its predecessor. Only two are kept on disk: `index.log`, the
//! head, which receives all appends, and `index.log.2`, the file it replaced.
//!
//! # Appending
//!
//! Writers take an exclusive `flock()` on the head file and re-read its tail.
//! Any incomplete record left behind by a crashed writer is cut off before a
//! whole batch of records is written with a single write. A writer that
//! wakes up holding a lock on a file which is no longer at `index.log` (it
//! was rotated while the writer waited) drops the lock and tries again with
//! the new head.
//!
//! # Rotation
//!
//! Rotation happens with the head lock held. The old head is hard-linked to
//! `index.log.2` (atomically replacing the older file) and a new, fully
//! written head is then renamed over `index.log`, so there is never a moment
//! where `index.log` is missing. The lock on the new head is taken before the
//! old one is released.

use std::cell::RefCell;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{info, warn};

pub mod file;
pub mod format;
pub mod view;

use self::file::LogFile;
use self::format::LogFileHeader;
use crate::model::LogPosition;
use crate::support::config::IndexConfig;
use crate::support::error::Error;
use crate::support::file_ops::IgnoreKinds;

pub const LOG_FILE_NAME: &str = "index.log";
pub const OLD_LOG_FILE_NAME: &str = "index.log.2";
const OLD_LOG_TMP_NAME: &str = "index.log.2.tmp";

pub type SharedLogFile = Rc<RefCell<LogFile>>;

pub struct TransactionLog {
    log_prefix: String,
    dir: Option<PathBuf>,
    config: IndexConfig,
    /// Every log file currently open, ordered by sequence number. The last
    /// element is the head.
    files: Vec<SharedLogFile>,
}

/// Proof that the append lock is held.
///
/// The lock is released when this is dropped.
pub struct LogLock {
    log_prefix: String,
    files: Vec<SharedLogFile>,
}

impl Drop for LogLock {
    fn drop(&mut self) {
        for file in &self.files {
            if let Err(e) = file.borrow().unlock() {
                warn!(
                    "{} Failed to unlock transaction log: {}",
                    self.log_prefix, e
                );
            }
        }
    }
}

impl TransactionLog {
    /// Open the log in `dir`, or an in-memory log if `dir` is `None`.
    ///
    /// If there is no log yet (or it is in memory), a new one with file
    /// sequence 1 is created for `indexid`.
    pub fn open(
        log_prefix: &str,
        dir: Option<&Path>,
        config: &IndexConfig,
        indexid: u32,
        now: u32,
    ) -> Result<Self, Error> {
        let head = match dir {
            None => LogFile::create(
                log_prefix,
                None,
                false,
                LogFileHeader::new(indexid, 1, 0, 0, now),
                config,
            )?,
            Some(dir) => {
                let path = dir.join(LOG_FILE_NAME);
                loop {
                    match LogFile::open(log_prefix, &path, config.read_only) {
                        Ok(f) => break f,
                        Err(Error::Io(e))
                            if io::ErrorKind::NotFound == e.kind()
                                && !config.read_only => {}
                        Err(e) => return Err(e),
                    }

                    match LogFile::create(
                        log_prefix,
                        Some(&path),
                        false,
                        LogFileHeader::new(indexid, 1, 0, 0, now),
                        config,
                    ) {
                        Ok(f) => {
                            info!(
                                "{} Created new transaction log {}",
                                log_prefix,
                                path.display()
                            );
                            break f;
                        }
                        // Lost a race with another process; open theirs
                        Err(Error::Io(e))
                            if io::ErrorKind::AlreadyExists == e.kind() => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        };

        Ok(TransactionLog {
            log_prefix: log_prefix.to_owned(),
            dir: dir.map(Path::to_owned),
            config: config.clone(),
            files: vec![Rc::new(RefCell::new(head))],
        })
    }

    fn head_path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(LOG_FILE_NAME))
    }

    pub fn head(&self) -> SharedLogFile {
        // files is never empty
        Rc::clone(&self.files[self.files.len() - 1])
    }

    pub fn indexid(&self) -> u32 {
        self.head().borrow().header().indexid
    }

    /// The position just after the last record known to exist.
    pub fn head_position(&self) -> LogPosition {
        self.head().borrow().end_position()
    }

    pub fn is_in_memory(&self) -> bool {
        self.dir.is_none()
    }

    /// Whether `pos` is exactly the point at which the current head file
    /// continued from its predecessor.
    pub fn is_head_prev(&self, pos: LogPosition) -> bool {
        let head = self.head();
        let head = head.borrow();
        let hdr = head.header();
        0 != hdr.prev_file_seq
            && pos.file_seq == hdr.prev_file_seq
            && pos.offset == hdr.prev_file_offset
    }

    /// Bring the in-memory view of the log up to date with the files on disk.
    ///
    /// This reads anything appended to the head and, if the head was rotated
    /// or the log recreated, opens the new head.
    pub fn refresh(&mut self) -> Result<(), Error> {
        loop {
            let head = self.head();
            head.borrow_mut().refresh()?;
            if !head.borrow().is_replaced()? {
                return Ok(());
            }

            let path = match self.head_path() {
                Some(p) => p,
                None => return Ok(()),
            };
            let new_head = LogFile::open(
                &self.log_prefix,
                &path,
                self.config.read_only,
            )?;

            let (old_seq, old_indexid) = {
                let h = head.borrow();
                (h.file_seq(), h.header().indexid)
            };
            let new_hdr = *new_head.header();
            if new_hdr.indexid != old_indexid || new_hdr.file_seq <= old_seq {
                info!(
                    "{} Transaction log was recreated (indexid {} -> {})",
                    self.log_prefix, old_indexid, new_hdr.indexid
                );
                self.files.clear();
            }
            self.files.push(Rc::new(RefCell::new(new_head)));
        }
    }

    /// Find the log file with the given sequence number, opening the old log
    /// file if needed.
    ///
    /// Returns `None` if that file no longer exists or belongs to a different
    /// incarnation of the index.
    pub fn file(&mut self, file_seq: u32) -> Result<Option<SharedLogFile>, Error> {
        if let Some(f) =
            self.files.iter().find(|f| f.borrow().file_seq() == file_seq)
        {
            return Ok(Some(Rc::clone(f)));
        }

        let dir = match self.dir.as_ref() {
            Some(d) => d,
            None => return Ok(None),
        };
        if file_seq >= self.head().borrow().file_seq() {
            return Ok(None);
        }

        let old = match LogFile::open(
            &self.log_prefix,
            &dir.join(OLD_LOG_FILE_NAME),
            true,
        ) {
            Ok(f) => f,
            Err(Error::Io(e)) if io::ErrorKind::NotFound == e.kind() => {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };

        if old.file_seq() != file_seq
            || old.header().indexid != self.indexid()
        {
            return Ok(None);
        }

        let old = Rc::new(RefCell::new(old));
        let pos = self
            .files
            .iter()
            .position(|f| f.borrow().file_seq() > file_seq)
            .unwrap_or(self.files.len());
        self.files.insert(pos, Rc::clone(&old));
        Ok(Some(old))
    }

    /// Return the file (if any) which continues the log from exactly `pos`.
    pub fn file_continuing(&self, pos: LogPosition) -> Option<SharedLogFile> {
        self.files
            .iter()
            .find(|f| {
                let f = f.borrow();
                let hdr = f.header();
                hdr.prev_file_seq == pos.file_seq
                    && hdr.prev_file_offset == pos.offset
            })
            .cloned()
    }

    /// The oldest file this log currently has open.
    pub fn oldest(&self) -> SharedLogFile {
        Rc::clone(&self.files[0])
    }

    /// Acquire the append lock on the current head.
    pub fn lock(&mut self) -> Result<LogLock, Error> {
        if self.config.read_only {
            return Err(Error::ReadOnly);
        }

        loop {
            self.refresh()?;
            let head = self.head();
            head.borrow().lock(&self.config)?;
            if head.borrow().is_replaced()? {
                head.borrow().unlock()?;
                continue;
            }

            head.borrow_mut().refresh()?;
            head.borrow_mut().cut_partial_tail()?;
            return Ok(LogLock {
                log_prefix: self.log_prefix.clone(),
                files: vec![head],
            });
        }
    }

    /// Append encoded records to the head.
    pub fn append(
        &mut self,
        _lock: &LogLock,
        data: &[u8],
    ) -> Result<(LogPosition, LogPosition), Error> {
        let head = self.head();
        let mut head = head.borrow_mut();
        head.append(data, self.config.sync_appends())
    }

    /// Whether the head is due for rotation at time `now`.
    pub fn should_rotate(&self, now: u32) -> bool {
        if self.config.read_only {
            return false;
        }

        let head = self.head();
        let head = head.borrow();
        let size = head.size();
        head.is_corrupted()
            || size > self.config.log_rotate_max_size
            || (size > self.config.log_rotate_min_size
                && head.age_secs(now) >= self.config.log_rotate_min_age_secs)
    }

    /// Replace the head with a new, empty file continuing from it.
    pub fn rotate(&mut self, lock: &mut LogLock, now: u32) -> Result<(), Error> {
        let (indexid, old_end) = {
            let head = self.head();
            let head = head.borrow();
            (head.header().indexid, head.end_position())
        };
        let hdr = LogFileHeader::new(
            indexid,
            old_end.file_seq + 1,
            old_end.file_seq,
            old_end.offset,
            now,
        );
        self.replace_head(lock, hdr)?;
        info!(
            "{} Rotated transaction log to seq {}",
            self.log_prefix, hdr.file_seq
        );
        Ok(())
    }

    /// Start a new log for a recreated index.
    ///
    /// The new head does not link to the old one, so nothing before it can
    /// be replayed any more.
    pub fn reset(
        &mut self,
        lock: &mut LogLock,
        indexid: u32,
        now: u32,
    ) -> Result<(), Error> {
        let seq = self.head().borrow().file_seq() + 1;
        self.replace_head(lock, LogFileHeader::new(indexid, seq, 0, 0, now))?;
        self.files.retain(|f| f.borrow().header().indexid == indexid);
        Ok(())
    }

    fn replace_head(
        &mut self,
        lock: &mut LogLock,
        hdr: LogFileHeader,
    ) -> Result<(), Error> {
        let head_path = self.head_path();
        if let (Some(dir), Some(head_path)) =
            (self.dir.as_ref(), head_path.as_ref())
        {
            let tmp = dir.join(OLD_LOG_TMP_NAME);
            fs::remove_file(&tmp).ignore_not_found()?;
            fs::hard_link(head_path, &tmp)?;
            fs::rename(&tmp, dir.join(OLD_LOG_FILE_NAME))?;
        }

        let new_head = LogFile::create(
            &self.log_prefix,
            head_path.as_deref(),
            true,
            hdr,
            &self.config,
        )?;
        new_head.lock(&self.config)?;
        let new_head = Rc::new(RefCell::new(new_head));
        lock.files.push(Rc::clone(&new_head));
        self.files.push(new_head);
        Ok(())
    }

    /// Forget about non-head files nothing else refers to any more.
    pub fn close_unused(&mut self) {
        let head_ix = self.files.len() - 1;
        let mut ix = 0;
        self.files.retain(|f| {
            let keep = ix == head_ix || Rc::strong_count(f) > 1;
            ix += 1;
            keep
        });
    }

    pub fn log_prefix(&self) -> &str {
        &self.log_prefix
    }
}
