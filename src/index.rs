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

//! The process-local handle to one mailbox's index.
//!
//! An `Index` owns the transaction log and the head map, i.e., the newest
//! generation this process has built from the log. Every change goes through
//! the log: a commit appends records under the log lock and then brings the
//! head map up to date by replaying them, exactly as another process reading
//! the same log would.
//!
//! The snapshot file is only an optimisation. It lets `open()` start replay
//! from a recent position instead of from the start of the log, and keeps
//! the map recoverable after older log files have been rotated away. Anything
//! suspicious about it (a decode failure, a failed consistency check, the
//! `CORRUPTED` flag, or an indexid which does not match the log) causes it to
//! be discarded and the map to be rebuilt from the log.
//!
//! # Locking
//!
//! There are two locks. The log lock (an exclusive `flock` on the head log
//! file) serialises writers. The head lock (a shared `flock` on `index.lock`)
//! is held by views reading the head map; `reset()` takes it exclusively.
//! Both are `flock` locks, which belong to the open file rather than the
//! process, so this module counts reentrant uses itself.

use std::cell::{Cell, RefCell};
use std::fs;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use chrono::prelude::*;
use log::{debug, error, info, warn};
use rand::{rngs::OsRng, Rng};

use crate::apply::{ApplyState, MapUpdater};
use crate::ext::{ExtId, ExtensionRegistry};
use crate::log::format::{HeaderPatch, Transaction};
use crate::log::view::{LogView, LogViewSet};
use crate::log::{LogLock, TransactionLog};
use crate::map::{
    Generations, HeaderFlags, IndexHeader, IndexMap, HEADER_FLAGS_OFFSET,
};
use crate::model::LogPosition;
use crate::support::config::IndexConfig;
use crate::support::error::Error;
use crate::support::file_ops;
use crate::support::lock::{self, LockKind};

pub const SNAPSHOT_FILE_NAME: &str = "index";
pub const LOCK_FILE_NAME: &str = "index.lock";

/// Offset of `uid_validity` in the base header.
const UID_VALIDITY_OFFSET: u16 = 16;

/// The health of an index. Only ever moves from `Valid` to `Corrupted`,
/// except through `reset()`, which starts an entirely new index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexState {
    Valid,
    Corrupted,
}

fn now() -> u32 {
    Utc::now().timestamp().max(0) as u32
}

fn day_stamp(now: u32) -> u32 {
    now - now % 86400
}

/// Pick a random, non-zero indexid different from `old`.
fn new_indexid(old: u32) -> u32 {
    loop {
        let id: u32 = OsRng.gen();
        if 0 != id && old != id {
            return id;
        }
    }
}

fn empty_map(indexid: u32, now: u32, generations: &Generations) -> IndexMap {
    IndexMap::new(IndexHeader::new(indexid, 0, day_stamp(now)), generations)
}

/// The `index.lock` file and the number of head locks this process holds on
/// it.
struct LockFile {
    log_prefix: String,
    file: Option<fs::File>,
    timeout: Duration,
    shared: Cell<u32>,
}

impl LockFile {
    fn shared(self: &Rc<Self>) -> Result<HeadLock, Error> {
        if 0 == self.shared.get() {
            if let Some(ref file) = self.file {
                lock::lock(file, LockKind::Shared, self.timeout)?;
            }
        }

        self.shared.set(self.shared.get() + 1);
        Ok(HeadLock {
            lock: Rc::clone(self),
        })
    }

    /// Take the lock exclusively, if no head locks are held by this process.
    ///
    /// An `flock` cannot be converted without releasing it first, so if this
    /// process holds head locks, the exclusive lock is skipped.
    fn exclusive(&self) -> Result<Option<ExclusiveLock<'_>>, Error> {
        let file = match self.file {
            Some(ref f) if 0 == self.shared.get() => f,
            _ => {
                debug!(
                    "{} Not taking the index lock exclusively since it is \
                     held by this process",
                    self.log_prefix
                );
                return Ok(None);
            }
        };

        lock::lock(file, LockKind::Exclusive, self.timeout)?;
        Ok(Some(ExclusiveLock {
            log_prefix: &self.log_prefix,
            file,
        }))
    }
}

/// A shared lock on the index, preventing it from being recreated.
///
/// Released when the last `HeadLock` of the process is dropped.
pub struct HeadLock {
    lock: Rc<LockFile>,
}

impl Drop for HeadLock {
    fn drop(&mut self) {
        let count = self.lock.shared.get() - 1;
        self.lock.shared.set(count);
        if 0 == count {
            if let Some(ref file) = self.lock.file {
                if let Err(e) = lock::unlock(file) {
                    warn!(
                        "{} Failed to release index lock: {}",
                        self.lock.log_prefix, e
                    );
                }
            }
        }
    }
}

struct ExclusiveLock<'a> {
    log_prefix: &'a str,
    file: &'a fs::File,
}

impl Drop for ExclusiveLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = lock::unlock(self.file) {
            warn!("{} Failed to release index lock: {}", self.log_prefix, e);
        }
    }
}

/// The log lock held for synchronisation with the backing store.
///
/// While it is held, no other process can append to the log, so the position
/// returned by `position()` is the true end of the log.
pub struct SyncLock {
    _lock: Rc<RefCell<LogLock>>,
    position: LogPosition,
}

impl SyncLock {
    pub fn position(&self) -> LogPosition {
        self.position
    }
}

/// How far a replay got.
enum Replay {
    Done { map: IndexMap, applied: usize },
    FilesLost,
}

/// Handle to one mailbox's index. Clones refer to the same index.
#[derive(Clone)]
pub struct Index(Rc<RefCell<IndexInner>>);

struct IndexInner {
    log_prefix: String,
    dir: Option<PathBuf>,
    config: IndexConfig,
    registry: ExtensionRegistry,
    log: TransactionLog,
    head: Arc<IndexMap>,
    apply_state: ApplyState,
    state: IndexState,
    lock: Rc<LockFile>,
    log_lock: Weak<RefCell<LogLock>>,
    /// Shared with transaction views, whose private maps are generations of
    /// this index too.
    generations: Rc<Generations>,
    /// The position of the newest snapshot known to be on disk.
    snapshot_pos: LogPosition,
}

impl Index {
    /// Open the index in `dir`, creating it if it does not exist yet.
    pub fn open(
        dir: &Path,
        config: &IndexConfig,
        registry: ExtensionRegistry,
    ) -> Result<Self, Error> {
        let log_prefix = dir.display().to_string();
        if !config.read_only {
            fs::create_dir_all(dir)?;
        }

        let lock_file = match fs::OpenOptions::new()
            .read(true)
            .write(!config.read_only)
            .create(!config.read_only)
            .open(dir.join(LOCK_FILE_NAME))
        {
            Ok(f) => Some(f),
            Err(e)
                if io::ErrorKind::NotFound == e.kind() && config.read_only =>
            {
                None
            }
            Err(e) => return Err(e.into()),
        };

        let generations = Rc::new(Generations::default());
        let (snapshot, damaged) =
            load_snapshot(&log_prefix, dir, &generations)?;
        let indexid = snapshot
            .as_ref()
            .map(|m| m.header().indexid)
            .unwrap_or_else(|| new_indexid(0));
        let log =
            TransactionLog::open(&log_prefix, Some(dir), config, indexid, now())?;

        Self::init(
            log_prefix,
            Some(dir.to_owned()),
            config,
            registry,
            log,
            lock_file,
            generations,
            snapshot,
            damaged,
        )
    }

    /// Create an index which lives only in memory.
    pub fn open_in_memory(
        config: &IndexConfig,
        registry: ExtensionRegistry,
    ) -> Result<Self, Error> {
        let log_prefix = "(in-memory)".to_owned();
        let log = TransactionLog::open(
            &log_prefix,
            None,
            config,
            new_indexid(0),
            now(),
        )?;
        Self::init(
            log_prefix,
            None,
            config,
            registry,
            log,
            None,
            Rc::new(Generations::default()),
            None,
            false,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn init(
        log_prefix: String,
        dir: Option<PathBuf>,
        config: &IndexConfig,
        registry: ExtensionRegistry,
        log: TransactionLog,
        lock_file: Option<fs::File>,
        generations: Rc<Generations>,
        snapshot: Option<IndexMap>,
        damaged: bool,
    ) -> Result<Self, Error> {
        let indexid = log.indexid();
        let head = Arc::new(empty_map(indexid, now(), &generations));
        let mut inner = IndexInner {
            lock: Rc::new(LockFile {
                log_prefix: log_prefix.clone(),
                file: lock_file,
                timeout: config.lock_timeout(),
                shared: Cell::new(0),
            }),
            log_prefix,
            dir,
            config: config.clone(),
            registry,
            log,
            head,
            apply_state: ApplyState::default(),
            state: IndexState::Valid,
            log_lock: Weak::new(),
            generations,
            snapshot_pos: LogPosition::ZERO,
        };

        inner.load(snapshot, damaged)?;
        if 0 == inner.head.header().uid_validity && !config.read_only {
            let uid_validity = now().max(1);
            inner.commit(false, |_| {
                Ok((vec![uid_validity_update(uid_validity)], ()))
            })?;
        }

        Ok(Index(Rc::new(RefCell::new(inner))))
    }

    pub fn log_prefix(&self) -> String {
        self.0.borrow().log_prefix.clone()
    }

    pub fn config(&self) -> IndexConfig {
        self.0.borrow().config.clone()
    }

    pub fn registry(&self) -> ExtensionRegistry {
        self.0.borrow().registry.clone()
    }

    /// The name of a registered extension.
    pub fn ext_name(&self, ext: ExtId) -> Result<String, Error> {
        self.0.borrow().registry.name(ext).map(str::to_owned)
    }

    pub fn is_in_memory(&self) -> bool {
        self.0.borrow().dir.is_none()
    }

    pub fn state(&self) -> IndexState {
        self.0.borrow().state
    }

    /// The identity of the index as of the last sync. Changes when the index
    /// is recreated.
    pub fn indexid(&self) -> u32 {
        self.0.borrow().head.header().indexid
    }

    /// The head map, without syncing.
    pub fn head(&self) -> Arc<IndexMap> {
        Arc::clone(&self.0.borrow().head)
    }

    /// Read anything new from the log and return the resulting head map.
    pub fn sync(&self) -> Result<Arc<IndexMap>, Error> {
        let mut inner = self.0.borrow_mut();
        inner.sync_head()?;
        Ok(Arc::clone(&inner.head))
    }

    /// Take the log lock and sync the head map to the end of the log.
    pub fn sync_lock(&self) -> Result<SyncLock, Error> {
        let mut inner = self.0.borrow_mut();
        inner.check_valid()?;
        let lock = inner.acquire_log_lock()?;
        inner.sync_head()?;
        Ok(SyncLock {
            _lock: lock,
            position: inner.log.head_position(),
        })
    }

    /// Whether `pos` is where the current head log file continues from, i.e.,
    /// the end of the file before the last rotation.
    pub fn is_rotation_boundary(&self, pos: LogPosition) -> bool {
        self.0.borrow().log.is_head_prev(pos)
    }

    /// The current end of the log, without refreshing it.
    pub fn log_head_position(&self) -> LogPosition {
        self.0.borrow().log.head_position()
    }

    /// Record that the index is damaged.
    ///
    /// Every further operation on this handle fails with `IndexCorrupted`,
    /// and the snapshot on disk is flagged so that the next `open()` rebuilds
    /// the map.
    pub fn mark_corrupted(&self) {
        self.0.borrow_mut().mark_corrupted();
    }

    /// Sync and write the head map to the snapshot file.
    pub fn write_snapshot(&self) -> Result<(), Error> {
        let mut inner = self.0.borrow_mut();
        inner.check_valid()?;
        let _lock = inner.acquire_log_lock()?;
        inner.sync_head()?;
        inner.write_snapshot()
    }

    /// Recreate the index from scratch under a new indexid.
    ///
    /// All messages are forgotten and the new index gets a new UID validity.
    /// Views open on the old index become inconsistent.
    pub fn reset(&self) -> Result<(), Error> {
        self.0.borrow_mut().reset()
    }

    pub(crate) fn generations(&self) -> Rc<Generations> {
        Rc::clone(&self.0.borrow().generations)
    }

    /// Take a head lock, unless the index only lives in memory.
    pub(crate) fn head_lock(&self) -> Result<Option<HeadLock>, Error> {
        let inner = self.0.borrow();
        if inner.dir.is_none() {
            return Ok(None);
        }
        inner.lock.shared().map(Some)
    }

    pub(crate) fn with_log<R>(
        &self,
        f: impl FnOnce(&mut TransactionLog) -> R,
    ) -> R {
        f(&mut self.0.borrow_mut().log)
    }

    /// Append the transactions produced by `build` to the log and sync.
    ///
    /// `build` is called with the head map after it has been synced under the
    /// log lock, so it sees every change committed before this one.
    pub(crate) fn commit<R>(
        &self,
        external: bool,
        build: impl FnOnce(&IndexMap) -> Result<(Vec<Transaction>, R), Error>,
    ) -> Result<(LogPosition, LogPosition, R), Error> {
        self.0.borrow_mut().commit(external, build)
    }
}

/// Load the snapshot in `dir`.
///
/// Returns the map if it is usable, and whether a snapshot existed but had
/// to be discarded.
fn load_snapshot(
    log_prefix: &str,
    dir: &Path,
    generations: &Generations,
) -> Result<(Option<IndexMap>, bool), Error> {
    let data = match fs::read(dir.join(SNAPSHOT_FILE_NAME)) {
        Ok(d) => d,
        Err(e) if io::ErrorKind::NotFound == e.kind() => {
            return Ok((None, false))
        }
        Err(e) => return Err(e.into()),
    };

    match IndexMap::decode_snapshot(&data, generations).and_then(|map| {
        map.check()?;
        Ok(map)
    }) {
        Ok(map) => Ok((Some(map), false)),
        Err(e) if e.is_corruption() => {
            warn!(
                "{} Discarding index snapshot and rebuilding from the log: {}",
                log_prefix, e
            );
            Ok((None, true))
        }
        Err(e) => Err(e),
    }
}

/// Pick the `uid_validity` for a recreated index.
///
/// This is greater than `old` unless `old` is already `u32::MAX`, in which
/// case the clock is all there is to go on.
fn next_uid_validity(old: u32, now: u32) -> u32 {
    now.max(old.wrapping_add(1)).max(1)
}

fn uid_validity_update(uid_validity: u32) -> Transaction {
    Transaction::HeaderUpdate(vec![HeaderPatch {
        offset: UID_VALIDITY_OFFSET,
        data: uid_validity.to_le_bytes().to_vec(),
    }])
}

impl IndexInner {
    fn check_valid(&self) -> Result<(), Error> {
        match self.state {
            IndexState::Valid => Ok(()),
            IndexState::Corrupted => Err(Error::IndexCorrupted),
        }
    }

    fn acquire_log_lock(&mut self) -> Result<Rc<RefCell<LogLock>>, Error> {
        if let Some(lock) = self.log_lock.upgrade() {
            return Ok(lock);
        }

        let lock = Rc::new(RefCell::new(self.log.lock()?));
        self.log_lock = Rc::downgrade(&lock);
        Ok(lock)
    }

    /// Establish the head map from `snapshot` (if any) and the log.
    ///
    /// `damaged` indicates that a snapshot was present but unusable, so the
    /// rebuilt map is flagged `FSCKD`.
    fn load(
        &mut self,
        snapshot: Option<IndexMap>,
        damaged: bool,
    ) -> Result<(), Error> {
        let indexid = self.log.indexid();
        let (base, mut fsck) = match snapshot {
            Some(map) if map.header().indexid == indexid => (map, false),
            Some(map) => {
                warn!(
                    "{} Index snapshot belongs to indexid {}, but the log to \
                     {}; rebuilding",
                    self.log_prefix,
                    map.header().indexid,
                    indexid
                );
                (empty_map(indexid, now(), &self.generations), true)
            }
            None => {
                (empty_map(indexid, now(), &self.generations), damaged)
            }
        };
        self.snapshot_pos = if fsck || damaged {
            LogPosition::ZERO
        } else {
            base.header().head_position()
        };
        self.apply_state = ApplyState::default();

        let map = match self.replay(&base, true)? {
            Replay::Done { map, .. } => map,
            Replay::FilesLost => {
                let oldest = self.log.oldest().borrow().start_position();
                warn!(
                    "{} Transaction log files needed from {} are gone; \
                     rebuilding from {}",
                    self.log_prefix,
                    base.header().head_position(),
                    oldest
                );
                fsck = true;
                self.snapshot_pos = LogPosition::ZERO;
                self.apply_state = ApplyState::default();

                let mut base = empty_map(indexid, now(), &self.generations);
                let hdr = base.header_mut();
                hdr.log_file_seq = oldest.file_seq;
                hdr.log_file_head_offset = oldest.offset;
                match self.replay(&base, true)? {
                    Replay::Done { map, .. } => map,
                    Replay::FilesLost => return Err(Error::LogFilesLost),
                }
            }
        };

        let mut map = map;
        if fsck {
            let hdr = map.header_mut();
            hdr.flags |= HeaderFlags::FSCKD;
            info!(
                "{} Rebuilt index with {} messages",
                self.log_prefix, hdr.messages_count
            );
        }
        self.head = Arc::new(map);
        Ok(())
    }

    /// Apply the log from the position of `base` to the end of the log.
    ///
    /// If `repair` is set, damaged log records are skipped along with the
    /// rest of the file they are in, and the resulting map is flagged
    /// `FSCKD`. Otherwise, damage is returned as an error.
    fn replay(&mut self, base: &IndexMap, repair: bool) -> Result<Replay, Error> {
        let mut updater = MapUpdater::new(
            &self.log_prefix,
            base,
            &mut self.apply_state,
            &self.generations,
        );
        let mut view = LogView::new();
        let mut from = base.header().head_position();
        let mut applied = 0;

        'files: loop {
            let to = self.log.head_position();
            if LogViewSet::FilesLost == view.set(&mut self.log, from, to)? {
                return Ok(Replay::FilesLost);
            }

            loop {
                let (pos, result) = match view.next() {
                    Ok(None) => break 'files,
                    Ok(Some(record)) => {
                        (record.pos, updater.apply_record(&record).map(|_| ()))
                    }
                    Err(e) => (view.position(), Err(e)),
                };

                match result {
                    Ok(()) => applied += 1,
                    Err(e) if repair && e.is_corruption() => {
                        if !view.is_corrupted() {
                            view.set_corrupted(&e.to_string());
                        }
                        let end = match self.log.file(pos.file_seq)? {
                            Some(f) => f.borrow().end_position(),
                            None => return Ok(Replay::FilesLost),
                        };
                        error!(
                            "{} Skipping damaged transaction log from {} \
                             to {}: {}",
                            self.log_prefix, pos, end, e
                        );
                        updater.skip_to(end);
                        from = end;
                        continue 'files;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(Replay::Done {
            map: updater.finish(),
            applied,
        })
    }

    /// Bring the head map up to date with the log.
    fn sync_head(&mut self) -> Result<(), Error> {
        self.check_valid()?;
        self.log.refresh()?;

        if self.log.indexid() != self.head.header().indexid {
            info!(
                "{} Index was recreated (indexid {} -> {})",
                self.log_prefix,
                self.head.header().indexid,
                self.log.indexid()
            );
            let snapshot = match self.dir.as_ref() {
                Some(dir) => {
                    load_snapshot(&self.log_prefix, dir, &self.generations)?.0
                }
                None => None,
            };
            return self.load(snapshot, false);
        }

        let head = Arc::clone(&self.head);
        match self.replay(&head, false) {
            Ok(Replay::Done { map, applied }) => {
                if applied > 0 {
                    self.head = Arc::new(map);
                }
            }
            Ok(Replay::FilesLost) => {
                warn!(
                    "{} Fell too far behind the transaction log; reloading",
                    self.log_prefix
                );
                let (snapshot, damaged) = match self.dir.as_ref() {
                    Some(dir) => load_snapshot(
                        &self.log_prefix,
                        dir,
                        &self.generations,
                    )?,
                    None => (None, false),
                };
                self.load(snapshot, damaged)?;
            }
            Err(e) if e.is_corruption() => {
                self.mark_corrupted();
                return Err(e);
            }
            Err(e) => return Err(e),
        }

        self.log.close_unused();
        Ok(())
    }

    fn snapshot_is_stale(&self) -> bool {
        let head = self.head.header().head_position();
        head.file_seq != self.snapshot_pos.file_seq
            || head.offset.saturating_sub(self.snapshot_pos.offset)
                >= self.config.snapshot_min_log_bytes
    }

    /// Write the head map to the snapshot file. The caller must hold the log
    /// lock.
    fn write_snapshot(&mut self) -> Result<(), Error> {
        let dir = match self.dir.as_ref() {
            Some(d) => d,
            None => return Ok(()),
        };
        if self.config.read_only {
            return Err(Error::ReadOnly);
        }

        file_ops::spit(
            dir.join(SNAPSHOT_FILE_NAME),
            self.config.file_mode,
            self.config.sync_files(),
            &self.head.encode_snapshot(),
        )?;
        self.snapshot_pos = self.head.header().head_position();
        debug!(
            "{} Wrote index snapshot at {}",
            self.log_prefix, self.snapshot_pos
        );
        Ok(())
    }

    fn commit<R>(
        &mut self,
        external: bool,
        build: impl FnOnce(&IndexMap) -> Result<(Vec<Transaction>, R), Error>,
    ) -> Result<(LogPosition, LogPosition, R), Error> {
        self.check_valid()?;
        let lock = self.acquire_log_lock()?;
        self.sync_head()?;

        let now = now();
        if self.log.should_rotate(now) {
            // The snapshot must not depend on the file that rotation is
            // about to push out
            let head_seq = self.log.head().borrow().file_seq();
            if self.dir.is_some() && self.snapshot_pos.file_seq < head_seq {
                self.write_snapshot()?;
            }
            self.log.rotate(&mut lock.borrow_mut(), now)?;
        }

        let head = Arc::clone(&self.head);
        let (txs, result) = build(&head)?;
        let mut data = Vec::new();
        for tx in &txs {
            tx.encode(external, &mut data);
        }

        let (first, last) = if data.is_empty() {
            let pos = self.log.head_position();
            (pos, pos)
        } else {
            self.log.append(&lock.borrow(), &data)?
        };
        self.sync_head()?;

        if self.dir.is_some() && self.snapshot_is_stale() {
            if let Err(e) = self.write_snapshot() {
                warn!("{} Failed to write index snapshot: {}", self.log_prefix, e);
            }
        }

        Ok((first, last, result))
    }

    fn mark_corrupted(&mut self) {
        if IndexState::Corrupted == self.state {
            return;
        }

        self.state = IndexState::Corrupted;
        error!(
            "{} Index marked as corrupted; it will be rebuilt on next open",
            self.log_prefix
        );

        let dir = match self.dir.as_ref() {
            Some(d) if !self.config.read_only => d,
            _ => return,
        };

        if let Err(e) = flag_snapshot_corrupted(&dir.join(SNAPSHOT_FILE_NAME))
        {
            warn!(
                "{} Failed to flag index snapshot as corrupted: {}",
                self.log_prefix, e
            );
        }
    }

    fn reset(&mut self) -> Result<(), Error> {
        if self.config.read_only {
            return Err(Error::ReadOnly);
        }

        let lock = self.acquire_log_lock()?;
        let lock_file = Rc::clone(&self.lock);
        let _exclusive = lock_file.exclusive()?;

        let now = now();
        let old_indexid = self.log.indexid();
        let indexid = new_indexid(old_indexid);
        let uid_validity =
            next_uid_validity(self.head.header().uid_validity, now);
        self.log.reset(&mut lock.borrow_mut(), indexid, now)?;

        self.state = IndexState::Valid;
        self.apply_state = ApplyState::default();
        self.head = Arc::new(empty_map(indexid, now, &self.generations));
        self.snapshot_pos = LogPosition::ZERO;
        info!(
            "{} Recreated index (indexid {} -> {})",
            self.log_prefix, old_indexid, indexid
        );

        self.commit(false, |_| {
            Ok((vec![uid_validity_update(uid_validity)], ()))
        })?;
        self.write_snapshot()
    }
}

fn flag_snapshot_corrupted(path: &Path) -> io::Result<()> {
    let file = match fs::OpenOptions::new().read(true).write(true).open(path)
    {
        Ok(f) => f,
        // Without a snapshot, the next open rebuilds from the log anyway
        Err(e) if io::ErrorKind::NotFound == e.kind() => return Ok(()),
        Err(e) => return Err(e),
    };

    let mut flags = [0u8; 2];
    file.read_exact_at(&mut flags, HEADER_FLAGS_OFFSET)?;
    let flags = u16::from_le_bytes(flags) | HeaderFlags::CORRUPTED.bits();
    file.write_all_at(&flags.to_le_bytes(), HEADER_FLAGS_OFFSET)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use tempfile::TempDir;

    use super::*;
    use crate::log::format::{AppendRecord, FlagUpdate};
    use crate::log::{LOG_FILE_NAME, OLD_LOG_FILE_NAME};
    use crate::model::{MailFlags, Uid, UidRange};
    use crate::support::file_ops::IgnoreKinds;

    fn append(index: &Index, n: u32) -> (LogPosition, LogPosition) {
        let (first, last, ()) = index
            .commit(false, |head| {
                let next = head.header().next_uid;
                Ok((
                    vec![Transaction::Append(
                        (next..next + n)
                            .map(|uid| AppendRecord {
                                uid: Uid::u(uid),
                                flags: MailFlags::empty(),
                            })
                            .collect(),
                    )],
                    (),
                ))
            })
            .unwrap();
        (first, last)
    }

    fn set_seen(index: &Index, uid: u32) {
        index
            .commit(false, |_| {
                Ok((
                    vec![Transaction::FlagUpdate(vec![FlagUpdate {
                        range: UidRange::single(Uid::u(uid)),
                        add: MailFlags::SEEN,
                        remove: MailFlags::empty(),
                    }])],
                    (),
                ))
            })
            .unwrap();
    }

    fn open(dir: &Path) -> Index {
        Index::open(dir, &IndexConfig::default(), ExtensionRegistry::new())
            .unwrap()
    }

    fn uids(index: &Index) -> Vec<u32> {
        index.head().records().map(|r| r.raw_uid()).collect()
    }

    #[test]
    fn changes_survive_reopen() {
        let tmpdir = TempDir::new().unwrap();
        let index = open(tmpdir.path());
        let uid_validity = index.head().header().uid_validity;
        assert_ne!(0, uid_validity);
        append(&index, 3);
        set_seen(&index, 2);
        index.write_snapshot().unwrap();
        append(&index, 1);
        drop(index);

        assert!(tmpdir.path().join(SNAPSHOT_FILE_NAME).is_file());
        assert!(tmpdir.path().join(LOG_FILE_NAME).is_file());

        let index = open(tmpdir.path());
        assert_eq!(vec![1, 2, 3, 4], uids(&index));
        let head = index.head();
        assert_eq!(uid_validity, head.header().uid_validity);
        assert_eq!(1, head.header().seen_messages_count);
        assert_eq!(index.log_head_position(), head.header().head_position());
        assert!(!head.header().flags.contains(HeaderFlags::FSCKD));
        head.check().unwrap();
    }

    #[test]
    fn other_handles_see_commits_on_sync() {
        let tmpdir = TempDir::new().unwrap();
        let a = open(tmpdir.path());
        let b = open(tmpdir.path());
        assert_eq!(a.indexid(), b.indexid());

        append(&a, 2);
        assert!(uids(&b).is_empty());
        let before = b.head();
        let after = b.sync().unwrap();
        assert_eq!(vec![1, 2], uids(&b));
        assert!(!Arc::ptr_eq(&before, &after));

        // Nothing new means the same generation
        assert!(Arc::ptr_eq(&after, &b.sync().unwrap()));

        // Appends from b continue from a's UIDs
        append(&b, 1);
        a.sync().unwrap();
        assert_eq!(vec![1, 2, 3], uids(&a));
    }

    #[test]
    fn damaged_snapshot_is_rebuilt() {
        let tmpdir = TempDir::new().unwrap();
        let index = open(tmpdir.path());
        append(&index, 5);
        index.write_snapshot().unwrap();
        drop(index);

        fs::write(tmpdir.path().join(SNAPSHOT_FILE_NAME), b"garbage")
            .unwrap();
        let index = open(tmpdir.path());
        assert_eq!(vec![1, 2, 3, 4, 5], uids(&index));
        assert!(index.head().header().flags.contains(HeaderFlags::FSCKD));
    }

    #[test]
    fn corruption_is_sticky_and_repaired_on_open() {
        let tmpdir = TempDir::new().unwrap();
        let index = open(tmpdir.path());
        append(&index, 2);
        index.write_snapshot().unwrap();

        index.mark_corrupted();
        assert_eq!(IndexState::Corrupted, index.state());
        assert_matches!(Err(Error::IndexCorrupted), index.sync());
        assert_matches!(Some(Error::IndexCorrupted), index.sync_lock().err());
        drop(index);

        let index = open(tmpdir.path());
        assert_eq!(IndexState::Valid, index.state());
        assert_eq!(vec![1, 2], uids(&index));
        assert!(index.head().header().flags.contains(HeaderFlags::FSCKD));
    }

    #[test]
    fn damaged_log_record_is_skipped_on_open() {
        let tmpdir = TempDir::new().unwrap();
        let index = open(tmpdir.path());
        append(&index, 1);
        let (bad, _) = append(&index, 1);
        drop(index);
        fs::remove_file(tmpdir.path().join(SNAPSHOT_FILE_NAME))
            .ignore_not_found()
            .unwrap();

        // Clobber the type of the second append
        let log_path = tmpdir.path().join(LOG_FILE_NAME);
        let mut data = fs::read(&log_path).unwrap();
        let off = bad.offset as usize + 4;
        data[off..off + 4].copy_from_slice(&0x8000u32.to_le_bytes());
        fs::write(&log_path, &data).unwrap();

        let index = open(tmpdir.path());
        assert_eq!(vec![1], uids(&index));
        let hdr = *index.head().header();
        assert!(hdr.flags.contains(HeaderFlags::FSCKD));
        assert_eq!(data.len() as u32, hdr.log_file_head_offset);

        // The damaged file is rotated away by the next write
        let (first, _) = append(&index, 1);
        assert_eq!(bad.file_seq + 1, first.file_seq);
        assert_eq!(vec![1, 2], uids(&index));
    }

    #[test]
    fn torn_append_is_discarded_by_next_writer() {
        let tmpdir = TempDir::new().unwrap();
        let a = open(tmpdir.path());
        append(&a, 1);
        let end = a.log_head_position();
        drop(a);

        // A writer died 12 bytes into a 16-byte record
        let mut torn = Vec::new();
        Transaction::Expunge(vec![UidRange::single(Uid::u(1))])
            .encode(false, &mut torn);
        assert_eq!(16, torn.len());
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(tmpdir.path().join(LOG_FILE_NAME))
            .unwrap();
        file.write_all(&torn[..12]).unwrap();
        drop(file);

        let b = open(tmpdir.path());
        assert_eq!(vec![1], uids(&b));
        assert_eq!(end, b.log_head_position());
        let (first, _) = append(&b, 1);
        assert_eq!(end, first);
        assert_eq!(IndexState::Valid, b.state());
        assert_eq!(vec![1, 2], uids(&b));
        drop(b);

        let c = open(tmpdir.path());
        assert_eq!(vec![1, 2], uids(&c));
        assert!(!c.head().header().flags.contains(HeaderFlags::FSCKD));
    }

    #[test]
    fn rotation_and_lost_files() {
        let tmpdir = TempDir::new().unwrap();
        let mut config = IndexConfig::default();
        config.log_rotate_max_size = 64;
        config.snapshot_min_log_bytes = 1 << 30;
        let index = Index::open(
            tmpdir.path(),
            &config,
            ExtensionRegistry::new(),
        )
        .unwrap();

        let mut boundary = None;
        for _ in 0..20 {
            let before = index.log_head_position();
            let (first, _) = append(&index, 1);
            if first.file_seq != before.file_seq {
                boundary = Some(before);
            }
        }
        let boundary = boundary.unwrap();
        assert!(index.is_rotation_boundary(boundary));
        assert!(!index.is_rotation_boundary(LogPosition::new(1, 24)));
        assert!(index.log_head_position().file_seq > 2);
        assert!(tmpdir.path().join(OLD_LOG_FILE_NAME).is_file());
        drop(index);

        // The snapshot written before rotation lets a new handle catch up
        let index = open(tmpdir.path());
        assert_eq!((1..=20).collect::<Vec<_>>(), uids(&index));
        assert!(!index.head().header().flags.contains(HeaderFlags::FSCKD));
        drop(index);

        // Without the snapshot, only what remains of the log can be used
        fs::remove_file(tmpdir.path().join(SNAPSHOT_FILE_NAME)).unwrap();
        let index = open(tmpdir.path());
        let remaining = uids(&index);
        assert!(!remaining.is_empty());
        assert!(remaining.len() < 20);
        assert_eq!(Some(&20), remaining.last());
        assert!(index.head().header().flags.contains(HeaderFlags::FSCKD));
    }

    #[test]
    fn reset_changes_indexid() {
        let tmpdir = TempDir::new().unwrap();
        let a = open(tmpdir.path());
        let b = open(tmpdir.path());
        append(&a, 3);
        b.sync().unwrap();

        let old_id = a.indexid();
        let old_validity = a.head().header().uid_validity;
        a.reset().unwrap();
        assert_ne!(old_id, a.indexid());
        assert!(a.head().header().uid_validity > old_validity);
        assert!(uids(&a).is_empty());

        assert_eq!(old_id, b.indexid());
        b.sync().unwrap();
        assert_eq!(a.indexid(), b.indexid());
        assert!(uids(&b).is_empty());

        append(&b, 1);
        a.sync().unwrap();
        assert_eq!(vec![1], uids(&a));
    }

    #[test]
    fn uid_validity_wraps_on_reset() {
        assert_eq!(1000, next_uid_validity(5, 1000));
        assert_eq!(2001, next_uid_validity(2000, 1000));
        assert_eq!(1000, next_uid_validity(u32::MAX, 1000));
        assert_eq!(1, next_uid_validity(u32::MAX, 0));

        let index = Index::open_in_memory(
            &IndexConfig::default(),
            ExtensionRegistry::new(),
        )
        .unwrap();
        index
            .commit(false, |_| Ok((vec![uid_validity_update(u32::MAX)], ())))
            .unwrap();
        assert_eq!(u32::MAX, index.head().header().uid_validity);
        index.reset().unwrap();
        let uid_validity = index.head().header().uid_validity;
        assert_ne!(0, uid_validity);
        assert_ne!(u32::MAX, uid_validity);
    }

    #[test]
    fn sync_lock_excludes_other_writers() {
        let tmpdir = TempDir::new().unwrap();
        let mut config = IndexConfig::default();
        config.lock_timeout_secs = 0;
        let a =
            Index::open(tmpdir.path(), &config, ExtensionRegistry::new())
                .unwrap();
        let b =
            Index::open(tmpdir.path(), &config, ExtensionRegistry::new())
                .unwrap();

        let lock = a.sync_lock().unwrap();
        assert_eq!(a.log_head_position(), lock.position());
        // Reentrant within the handle
        append(&a, 1);
        assert_matches!(
            Err(Error::LockTimeout),
            b.commit(false, |_| Ok((vec![], ())))
        );
        drop(lock);
        b.commit(false, |_| Ok((vec![], ()))).unwrap();
    }

    #[test]
    fn in_memory_index() {
        let index = Index::open_in_memory(
            &IndexConfig::default(),
            ExtensionRegistry::new(),
        )
        .unwrap();
        assert!(index.is_in_memory());
        assert!(index.head_lock().unwrap().is_none());
        append(&index, 2);
        assert_eq!(vec![1, 2], uids(&index));
        index.write_snapshot().unwrap();
    }

    #[test]
    fn generations_are_counted_per_index() {
        let in_memory = || {
            Index::open_in_memory(
                &IndexConfig::default(),
                ExtensionRegistry::new(),
            )
            .unwrap()
        };
        let a = in_memory();
        let b = in_memory();
        // Nothing is shared between the two, so they count alike
        assert_eq!(a.head().generation(), b.head().generation());

        let before = a.head().generation();
        append(&a, 1);
        assert!(a.head().generation() > before);
        assert_eq!(before, b.head().generation());
    }

    #[test]
    fn head_locks_are_counted() {
        let tmpdir = TempDir::new().unwrap();
        let mut config = IndexConfig::default();
        config.lock_timeout_secs = 0;
        let a =
            Index::open(tmpdir.path(), &config, ExtensionRegistry::new())
                .unwrap();

        let l1 = a.head_lock().unwrap().unwrap();
        let l2 = a.head_lock().unwrap().unwrap();
        drop(l1);

        let other = fs::File::open(tmpdir.path().join(LOCK_FILE_NAME))
            .unwrap();
        let zero = Duration::from_secs(0);
        assert_matches!(
            Err(Error::LockTimeout),
            lock::lock(&other, LockKind::Exclusive, zero)
        );
        drop(l2);
        lock::lock(&other, LockKind::Exclusive, zero).unwrap();
    }
}
