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

//! Windowed iteration over the transaction log.

use std::rc::Rc;

use super::format::TxHeader;
use super::{SharedLogFile, TransactionLog};
use crate::model::LogPosition;
use crate::support::error::Error;

/// The outcome of `LogView::set()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogViewSet {
    /// The whole window is available.
    Ok,
    /// Part of the window lies in files that have been rotated away (or
    /// belong to an older incarnation of the index). The caller cannot catch
    /// up incrementally and must rebuild its state from scratch.
    FilesLost,
}

/// One record read from the log.
#[derive(Clone, Debug)]
pub struct LogRecord {
    /// Where the record starts.
    pub pos: LogPosition,
    pub hdr: TxHeader,
    /// The payload, excluding the 8-byte record header.
    pub payload: Vec<u8>,
}

impl LogRecord {
    /// The position just after this record.
    pub fn end(&self) -> LogPosition {
        LogPosition::new(self.pos.file_seq, self.pos.offset + self.hdr.size)
    }
}

/// A cursor over a contiguous window of the log.
///
/// The window is bounded inclusively by the positions given to `set()`. The
/// view holds references to every file in the window, so rotation does not
/// pull files out from under it.
#[derive(Clone, Default)]
pub struct LogView {
    files: Vec<SharedLogFile>,
    min: LogPosition,
    max: LogPosition,
    /// Index into `files` of the file being read.
    cur: usize,
    cur_offset: u32,
    prev: LogPosition,
    corrupted: bool,
}

impl LogView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Position the view over the window from `min` to `max`.
    ///
    /// A `min` of `LogPosition::ZERO` means "the start of the oldest file
    /// available". A `max` past the end of the log is clamped to the current
    /// end of the log.
    ///
    /// On `FilesLost`, the view is left empty.
    pub fn set(
        &mut self,
        log: &mut TransactionLog,
        min: LogPosition,
        max: LogPosition,
    ) -> Result<LogViewSet, Error> {
        self.files.clear();
        self.corrupted = false;
        self.cur = 0;

        let head_end = log.head_position();
        let max = if head_end.is_before(max) { head_end } else { max };

        let mut min = min;
        if LogPosition::ZERO == min {
            // Walk back to the first file of the log
            let mut file = log.oldest();
            loop {
                let prev = file.borrow().header().prev_file_seq;
                if 0 == prev {
                    break;
                }
                file = match log.file(prev)? {
                    Some(f) => f,
                    None => return Ok(LogViewSet::FilesLost),
                };
            }
            min = file.borrow().start_position();
        }

        if max.is_before(min) {
            return Err(Error::CorruptLog(format!(
                "log view window {}..{} is inverted",
                min, max
            )));
        }

        let mut file = match log.file(min.file_seq)? {
            Some(f) => f,
            // The file is gone, but nothing is lost if `min` is exactly the
            // point another file continues from.
            None => match continuing(log, min)? {
                Some(f) => {
                    min = f.borrow().start_position();
                    f
                }
                None => return Ok(LogViewSet::FilesLost),
            },
        };

        {
            let f = file.borrow();
            if min.offset < u32::from(f.header().hdr_size) {
                min.offset = f.header().hdr_size.into();
            }
            if min.offset > f.size() {
                return Err(Error::CorruptLog(format!(
                    "position {} is beyond the end of the log file ({})",
                    min,
                    f.size()
                )));
            }
        }

        let mut files = vec![Rc::clone(&file)];
        loop {
            let (seq, end) = {
                let f = file.borrow();
                (f.file_seq(), f.end_position())
            };
            if seq >= max.file_seq {
                break;
            }

            file = match continuing(log, end)? {
                Some(f) => f,
                None => return Ok(LogViewSet::FilesLost),
            };
            files.push(Rc::clone(&file));
        }

        self.files = files;
        self.min = min;
        self.max = max;
        self.cur_offset = min.offset;
        self.prev = min;
        Ok(LogViewSet::Ok)
    }

    /// Drop every state except the window bounds.
    pub fn close(&mut self) {
        self.files.clear();
        self.cur = 0;
    }

    /// Read the next record in the window.
    ///
    /// Returns `None` at the end of the window or when the next record has
    /// not been completely written yet.
    pub fn next(&mut self) -> Result<Option<LogRecord>, Error> {
        loop {
            let file = match self.files.get(self.cur) {
                Some(f) => Rc::clone(f),
                None => return Ok(None),
            };
            let file = file.borrow();
            let seq = file.file_seq();
            let here = LogPosition::new(seq, self.cur_offset);
            if !here.is_before(self.max) {
                return Ok(None);
            }

            if self.cur_offset >= file.size() {
                if self.cur + 1 >= self.files.len() {
                    return Ok(None);
                }
                self.cur += 1;
                let next = self.files[self.cur].borrow();
                self.cur_offset = next.header().hdr_size.into();
                continue;
            }

            let read = file
                .read_record(self.cur_offset)
                .map(|r| r.map(|(hdr, payload)| (hdr, payload.to_vec())));
            let more_files = self.cur + 1 < self.files.len();
            drop(file);

            let (hdr, payload) = match read {
                Ok(Some(r)) => r,
                // Only the head can still be being written
                Ok(None) if more_files => {
                    let reason = "truncated record";
                    self.set_corrupted(reason);
                    return Err(Error::CorruptLog(format!(
                        "{} at {}",
                        reason, here
                    )));
                }
                Ok(None) => return Ok(None),
                Err(e) => {
                    self.set_corrupted(&e.to_string());
                    return Err(e);
                }
            };

            let record = LogRecord {
                pos: here,
                hdr,
                payload,
            };
            self.prev = here;
            self.cur_offset += hdr.size;
            return Ok(Some(record));
        }
    }

    /// Move the cursor to `pos`, which must lie within the window.
    pub fn seek(&mut self, pos: LogPosition) -> Result<(), Error> {
        if pos.is_before(self.min) || self.max.is_before(pos) {
            return Err(Error::CorruptLog(format!(
                "seek to {} outside of window {}..{}",
                pos, self.min, self.max
            )));
        }

        let ix = self
            .files
            .iter()
            .position(|f| f.borrow().file_seq() == pos.file_seq)
            .ok_or_else(|| {
                Error::CorruptLog(format!("seek to {} in unknown file", pos))
            })?;
        self.cur = ix;
        self.cur_offset = pos.offset;
        self.prev = pos;
        Ok(())
    }

    /// Release every file older than `oldest_file_seq`.
    ///
    /// The file under the cursor is always retained.
    pub fn clear(&mut self, oldest_file_seq: u32) {
        let cur_seq = match self.files.get(self.cur) {
            Some(f) => f.borrow().file_seq(),
            None => return,
        };
        let keep_from = oldest_file_seq.min(cur_seq);

        let before = self.files.len();
        self.files.retain(|f| f.borrow().file_seq() >= keep_from);
        self.cur -= before - self.files.len();
        if self.min.file_seq < keep_from {
            self.min = self.files[0].borrow().start_position();
        }
    }

    /// Mark the file at the cursor as damaged.
    pub fn set_corrupted(&mut self, reason: &str) {
        self.corrupted = true;
        if let Some(f) = self.files.get(self.cur) {
            f.borrow_mut().set_corrupted(self.cur_offset, reason);
        }
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted || self.files.iter().any(|f| f.borrow().is_corrupted())
    }

    /// Whether the cursor has reached the upper bound of the window.
    pub fn is_last(&self) -> bool {
        !self.position().is_before(self.max)
    }

    /// The position of the record most recently returned by `next()`.
    pub fn prev_position(&self) -> LogPosition {
        self.prev
    }

    /// The position the next record will be read from.
    pub fn position(&self) -> LogPosition {
        match self.files.get(self.cur) {
            Some(f) => {
                let f = f.borrow();
                if self.cur_offset >= f.size() && self.cur + 1 < self.files.len()
                {
                    self.files[self.cur + 1].borrow().start_position()
                } else {
                    LogPosition::new(f.file_seq(), self.cur_offset)
                }
            }
            None => self.max,
        }
    }

    pub fn window(&self) -> (LogPosition, LogPosition) {
        (self.min, self.max)
    }
}

/// Find the file which starts where `end` left off.
fn continuing(
    log: &mut TransactionLog,
    end: LogPosition,
) -> Result<Option<SharedLogFile>, Error> {
    if let Some(f) = log.file_continuing(end) {
        return Ok(Some(f));
    }

    Ok(log.file(end.file_seq + 1)?.filter(|f| {
        let f = f.borrow();
        let hdr = f.header();
        hdr.prev_file_seq == end.file_seq && hdr.prev_file_offset == end.offset
    }))
}
