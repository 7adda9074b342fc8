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

//! Read access to one generation of the index.
//!
//! An `IndexView` is bound to one map generation. Sequence numbers are
//! relative to that generation and stay stable until the view is synced, no
//! matter what other handles or processes commit in the meantime.
//!
//! Since a view can lag behind the head, `lookup_full()` prefers the head's
//! copy of a record when the record still exists there, so that callers see
//! current flags and extension data for messages whose sequence numbers they
//! already know. When the record has been expunged from the head, the stale
//! copy is returned instead of failing.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use log::{error, warn};

use crate::ext::ExtId;
use crate::index::{HeadLock, Index};
use crate::log::format::{Transaction, TxDecoder, TxKind};
use crate::log::view::{LogView, LogViewSet};
use crate::map::{HeaderFlags, IndexHeader, IndexMap, Nearest};
use crate::model::{LogPosition, MailFlags, Seqnum, Uid, UidRange};
use crate::support::error::Error;

/// A record as found by a lookup, along with the generation it came from.
///
/// Holding a `MapRecord` keeps its generation alive.
#[derive(Clone, Debug)]
pub struct MapRecord {
    map: Arc<IndexMap>,
    ix: usize,
    uid: Uid,
    flags: MailFlags,
}

impl MapRecord {
    pub(crate) fn new(map: Arc<IndexMap>, ix: usize) -> Result<Self, Error> {
        let rec = map.record(ix).ok_or(Error::SeqnumOutOfRange)?;
        let uid = rec.uid().ok_or_else(|| {
            Error::CorruptIndex(format!("record {} has UID 0", ix + 1))
        })?;
        let flags = rec.flags();
        Ok(MapRecord {
            map,
            ix,
            uid,
            flags,
        })
    }

    pub fn map(&self) -> &Arc<IndexMap> {
        &self.map
    }

    /// The 0-based position of the record within `map()`.
    pub fn index(&self) -> usize {
        self.ix
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn flags(&self) -> MailFlags {
        self.flags
    }

    pub fn keywords(&self) -> Vec<String> {
        self.map
            .record_keywords(self.ix)
            .into_iter()
            .map(str::to_owned)
            .collect()
    }
}

/// Where an extension's data lives within the records of one generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtSlot {
    generation: u64,
    offset: usize,
    size: usize,
}

impl ExtSlot {
    /// Locate the per-record data of the extension called `name` in `map`.
    pub fn resolve(map: &IndexMap, name: &str) -> Option<Self> {
        map.ext_by_name(name)
            .filter(|ext| 0 != ext.record_offset)
            .map(|ext| ExtSlot {
                generation: map.generation(),
                offset: ext.record_offset.into(),
                size: ext.record_size.into(),
            })
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// The result of `View::lookup_ext_full()`.
#[derive(Clone, Debug)]
pub struct ExtLookup {
    record: MapRecord,
    slot: Option<ExtSlot>,
}

impl ExtLookup {
    pub fn record(&self) -> &MapRecord {
        &self.record
    }

    /// The extension data of the record, or `None` if the extension has no
    /// per-record data in the record's generation.
    pub fn data(&self) -> Option<&[u8]> {
        let slot = self
            .slot
            .filter(|s| s.generation == self.record.map.generation())?;
        self.record
            .map
            .record(self.record.ix)?
            .raw()
            .get(slot.offset..slot.offset + slot.size)
    }
}

/// What a view sync found in the log.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ViewSyncChanges {
    /// UIDs which were in the view and are gone now.
    pub expunged: Vec<Uid>,
    /// UIDs which are new to the view.
    pub appended: Vec<Uid>,
    /// UIDs already in the view whose flags or keywords changed.
    pub changed: Vec<Uid>,
    /// The log between the old and new generations was no longer
    /// available; the changes were computed by comparing the generations
    /// directly.
    pub reset: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewState {
    Valid,
    /// The index was recreated or a lock could not be taken. Only reopening
    /// the view recovers from this.
    Inconsistent,
}

/// Read operations common to every kind of view.
pub trait View {
    /// The generation lookups are answered from.
    fn map(&self) -> Arc<IndexMap>;

    fn header(&self) -> IndexHeader {
        *self.map().header()
    }

    fn messages_count(&self) -> u32 {
        self.map().messages_count()
    }

    /// Find the record at `seq`, along with the generation that holds its
    /// most current state.
    fn lookup_full(&self, seq: Seqnum) -> Result<MapRecord, Error>;

    fn lookup_uid(&self, seq: Seqnum) -> Result<Uid, Error> {
        Ok(self.lookup_full(seq)?.uid())
    }

    /// Translate a UID range to the sequence numbers it covers, or `None` if
    /// no message is in the range.
    fn lookup_uid_range(
        &self,
        first: Uid,
        last: Uid,
    ) -> Result<Option<(Seqnum, Seqnum)>, Error> {
        Ok(self.map().lookup_uid_range(first, last))
    }

    /// Find the first message where `flags & mask == want`.
    fn lookup_first(
        &self,
        want: MailFlags,
        mask: MailFlags,
    ) -> Result<Option<Seqnum>, Error> {
        Ok(self.map().lookup_first(want, mask))
    }

    /// Resolve where `ext` keeps its per-record data in `map`.
    fn ext_slot(
        &self,
        map: &IndexMap,
        ext: ExtId,
    ) -> Result<Option<ExtSlot>, Error>;

    fn lookup_ext_full(
        &self,
        seq: Seqnum,
        ext: ExtId,
    ) -> Result<ExtLookup, Error> {
        let record = self.lookup_full(seq)?;
        let slot = self.ext_slot(record.map(), ext)?;
        Ok(ExtLookup { record, slot })
    }

    /// The header data of `ext` in `map`, or in the head if `map` is `None`.
    ///
    /// An extension absent from the map yields `None`.
    fn get_header_ext(
        &self,
        map: Option<&Arc<IndexMap>>,
        ext: ExtId,
    ) -> Result<Option<Vec<u8>>, Error>;

    fn lookup_keywords(&self, seq: Seqnum) -> Result<Vec<String>, Error> {
        Ok(self.lookup_full(seq)?.keywords())
    }
}

/// A view of the index bound to one map generation.
pub struct IndexView {
    index: Index,
    log_prefix: String,
    map: RefCell<Arc<IndexMap>>,
    indexid: u32,
    state: Cell<ViewState>,
    log_view: RefCell<LogView>,
    /// How far the view has read the log.
    log_pos: Cell<LogPosition>,
    lock: RefCell<Option<HeadLock>>,
    transactions: Cell<u32>,
    /// Set when the counters of the map cannot be trusted.
    broken_counters: Cell<bool>,
    recounted: Cell<Option<(u64, IndexHeader)>>,
    ext_slots: RefCell<HashMap<(u64, ExtId), Option<ExtSlot>>>,
}

impl IndexView {
    /// Open a view on the freshly synced head of `index`.
    pub fn open(index: &Index) -> Result<Self, Error> {
        let head = index.sync()?;
        Ok(Self::open_with_map(index, head))
    }

    /// Open a view on a specific generation of `index`.
    pub fn open_with_map(index: &Index, map: Arc<IndexMap>) -> Self {
        let log_pos = map.header().head_position();
        let broken = map.header().flags.contains(HeaderFlags::FSCKD);
        IndexView {
            index: index.clone(),
            log_prefix: index.log_prefix(),
            map: RefCell::new(map),
            indexid: index.indexid(),
            state: Cell::new(ViewState::Valid),
            log_view: RefCell::new(LogView::new()),
            log_pos: Cell::new(log_pos),
            lock: RefCell::new(None),
            transactions: Cell::new(0),
            broken_counters: Cell::new(broken),
            recounted: Cell::new(None),
            ext_slots: RefCell::new(HashMap::new()),
        }
    }

    /// Make an independent view over the same generation.
    ///
    /// The clone does not share locks or transactions with `self`.
    pub fn clone_view(&self) -> Self {
        IndexView {
            index: self.index.clone(),
            log_prefix: self.log_prefix.clone(),
            map: RefCell::new(self.map()),
            indexid: self.indexid,
            state: Cell::new(self.state.get()),
            log_view: RefCell::new(self.log_view.borrow().clone()),
            log_pos: Cell::new(self.log_pos.get()),
            lock: RefCell::new(None),
            transactions: Cell::new(0),
            broken_counters: Cell::new(self.broken_counters.get()),
            recounted: Cell::new(self.recounted.get()),
            ext_slots: RefCell::new(self.ext_slots.borrow().clone()),
        }
    }

    /// Close the view, releasing any lock it holds.
    pub fn close(self) {}

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn state(&self) -> ViewState {
        if self.is_inconsistent() {
            ViewState::Inconsistent
        } else {
            ViewState::Valid
        }
    }

    /// Whether the view's generation is the head of the index.
    pub fn is_head(&self) -> bool {
        Arc::ptr_eq(&self.map.borrow(), &self.index.head())
    }

    /// The log position up to which the view has seen changes.
    pub fn log_position(&self) -> LogPosition {
        self.log_pos.get()
    }

    /// Whether the view can no longer be used.
    ///
    /// This becomes true once the index is recreated, and then stays true.
    pub fn is_inconsistent(&self) -> bool {
        if ViewState::Inconsistent == self.state.get() {
            return true;
        }

        if self.index.indexid() != self.indexid {
            warn!(
                "{} Index was recreated under an open view",
                self.log_prefix
            );
            self.state.set(ViewState::Inconsistent);
            return true;
        }

        false
    }

    fn check_consistent(&self) -> Result<(), Error> {
        if self.is_inconsistent() {
            Err(Error::ViewInconsistent)
        } else {
            Ok(())
        }
    }

    fn head_lock(&self) -> Result<Option<HeadLock>, Error> {
        self.index.head_lock().map_err(|e| {
            error!("{} Failed to lock index: {}", self.log_prefix, e);
            self.state.set(ViewState::Inconsistent);
            e
        })
    }

    /// Lock the index if the view is bound to the head.
    ///
    /// Older generations never change, so there is nothing to lock for them.
    /// Failure leaves the view inconsistent.
    pub fn lock_head(&self) -> Result<(), Error> {
        if self.lock.borrow().is_some()
            || self.index.is_in_memory()
            || !self.is_head()
        {
            return Ok(());
        }

        let lock = self.head_lock()?;
        *self.lock.borrow_mut() = lock;
        Ok(())
    }

    /// Like `lock_head()`, but fails immediately on an inconsistent view.
    pub fn lock(&self) -> Result<(), Error> {
        self.check_consistent()?;
        self.lock_head()
    }

    /// Release the lock, unless a transaction is still using the view.
    pub fn unlock(&self) {
        if 0 == self.transactions.get() {
            self.lock.borrow_mut().take();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.borrow().is_some()
    }

    pub(crate) fn begin_transaction(&self) {
        self.transactions.set(self.transactions.get() + 1);
    }

    pub(crate) fn end_transaction(&self) {
        self.transactions.set(self.transactions.get().saturating_sub(1));
    }

    pub fn transactions(&self) -> u32 {
        self.transactions.get()
    }

    fn check_seq(&self, map: &IndexMap, seq: Seqnum) -> Result<usize, Error> {
        let ix = seq.to_index();
        if ix >= map.messages_count() as usize {
            Err(Error::SeqnumOutOfRange)
        } else {
            Ok(ix)
        }
    }

    fn corrupt_record(&self, e: Error) -> Error {
        if e.is_corruption() {
            error!("{} {}", self.log_prefix, e);
            self.index.mark_corrupted();
        }
        e
    }

    /// Bring the view up to the head of the index.
    pub fn sync(&self) -> Result<ViewSyncChanges, Error> {
        self.check_consistent()?;
        let head = self.index.sync()?;
        self.check_consistent()?;

        let old = self.map();
        if Arc::ptr_eq(&old, &head) {
            return Ok(ViewSyncChanges::default());
        }

        let from = self.log_pos.get();
        let to = head.header().head_position();
        let set = {
            let mut log_view = self.log_view.borrow_mut();
            self.index.with_log(|log| log_view.set(log, from, to))?
        };

        let changes = match set {
            LogViewSet::Ok => self.changes_from_log(&old, &head),
            LogViewSet::FilesLost => {
                warn!(
                    "{} Transaction log from {} is gone; comparing \
                     generations directly",
                    self.log_prefix, from
                );
                Ok(ViewSyncChanges {
                    reset: true,
                    ..changes_from_maps(&old, &head)
                })
            }
        };
        self.log_view.borrow_mut().close();
        let changes = changes.map_err(|e| self.corrupt_record(e))?;

        if changes.reset || head.header().flags.contains(HeaderFlags::FSCKD) {
            self.broken_counters.set(true);
        }
        self.adopt(head);
        Ok(changes)
    }

    fn adopt(&self, map: Arc<IndexMap>) {
        self.log_pos.set(map.header().head_position());
        self.ext_slots.borrow_mut().clear();
        self.recounted.set(None);
        *self.map.borrow_mut() = map;
    }

    fn changes_from_log(
        &self,
        old: &IndexMap,
        head: &IndexMap,
    ) -> Result<ViewSyncChanges, Error> {
        let mut touched = Vec::<UidRange>::new();
        let mut log_view = self.log_view.borrow_mut();
        while let Some(record) = log_view.next()? {
            // Extension records need the decoder state of the whole log, and
            // do not change anything sync reports anyway
            if !matches!(
                record.hdr.kind,
                TxKind::FlagUpdate | TxKind::KeywordUpdate | TxKind::KeywordReset
            ) {
                continue;
            }

            match TxDecoder::new().decode(&record.hdr, &record.payload)? {
                Transaction::FlagUpdate(updates) => {
                    touched.extend(updates.iter().map(|u| u.range))
                }
                Transaction::KeywordUpdate(ku) => touched.extend(ku.ranges),
                Transaction::KeywordReset(ranges) => touched.extend(ranges),
                _ => (),
            }
        }

        let mut changes = changes_from_maps(old, head);
        changes.changed = touched_uids(old, head, &touched);
        Ok(changes)
    }

    fn ext_name_slot(
        &self,
        map: &IndexMap,
        ext: ExtId,
    ) -> Result<Option<ExtSlot>, Error> {
        let key = (map.generation(), ext);
        if let Some(&slot) = self.ext_slots.borrow().get(&key) {
            return Ok(slot);
        }

        let name = self.index.ext_name(ext)?;
        let slot = ExtSlot::resolve(map, &name);
        self.ext_slots.borrow_mut().insert(key, slot);
        Ok(slot)
    }
}

/// Compare two generations record by record.
///
/// `changed` lists the UIDs present in both whose flags or keywords differ.
fn changes_from_maps(old: &IndexMap, new: &IndexMap) -> ViewSyncChanges {
    let mut changes = ViewSyncChanges::default();

    let (mut oix, mut nix) = (0, 0);
    let (ocount, ncount) =
        (old.messages_count() as usize, new.messages_count() as usize);
    while oix < ocount || nix < ncount {
        let ouid = old.record(oix).and_then(|r| r.uid());
        let nuid = new.record(nix).and_then(|r| r.uid());
        match (ouid, nuid) {
            (Some(o), Some(n)) if o == n => {
                let (orec, nrec) = (old.record(oix), new.record(nix));
                if orec.map(|r| r.flags()) != nrec.map(|r| r.flags())
                    || old.record_keywords(oix) != new.record_keywords(nix)
                {
                    changes.changed.push(o);
                }
                oix += 1;
                nix += 1;
            }
            (Some(o), Some(n)) if o < n => {
                changes.expunged.push(o);
                oix += 1;
            }
            (Some(o), None) => {
                changes.expunged.push(o);
                oix += 1;
            }
            (_, Some(n)) => {
                changes.appended.push(n);
                nix += 1;
            }
            // UID 0 is caught by the map check; skip past it here
            (None, None) => {
                oix += 1;
                nix += 1;
            }
        }
    }

    changes
}

/// The UIDs in `ranges` which exist in both `old` and `new`.
fn touched_uids(old: &IndexMap, new: &IndexMap, ranges: &[UidRange]) -> Vec<Uid> {
    let mut uids = BTreeSet::new();
    for &range in ranges {
        let (first, last) = match old.lookup_uid_range(range.first, range.last)
        {
            Some(r) => r,
            None => continue,
        };
        for ix in first.to_index()..=last.to_index() {
            if let Some(uid) = old.record(ix).and_then(|r| r.uid()) {
                if new.bsearch_uid(uid, Nearest::Exact).is_some() {
                    uids.insert(uid);
                }
            }
        }
    }
    uids.into_iter().collect()
}

impl View for IndexView {
    fn map(&self) -> Arc<IndexMap> {
        Arc::clone(&self.map.borrow())
    }

    fn header(&self) -> IndexHeader {
        let map = self.map();
        if !self.broken_counters.get() {
            return *map.header();
        }

        match self.recounted.get() {
            Some((generation, hdr)) if generation == map.generation() => hdr,
            _ => {
                let hdr = map.recount_header();
                self.recounted.set(Some((map.generation(), hdr)));
                hdr
            }
        }
    }

    fn messages_count(&self) -> u32 {
        self.map().messages_count()
    }

    fn lookup_full(&self, seq: Seqnum) -> Result<MapRecord, Error> {
        self.check_consistent()?;
        let map = self.map();
        let ix = self.check_seq(&map, seq)?;
        self.lock_head()?;

        let record = MapRecord::new(Arc::clone(&map), ix)
            .map_err(|e| self.corrupt_record(e))?;
        let head = self.index.head();
        if Arc::ptr_eq(&map, &head) || 0 == head.messages_count() {
            return Ok(record);
        }

        // Walk the head backwards; records are only ever removed, so the
        // record can only have moved down
        let _lock = self.head_lock()?;
        let uid = record.uid().get();
        let start = ix.min(head.messages_count() as usize - 1);
        for hix in (0..=start).rev() {
            let head_uid = head.record(hix).map_or(0, |r| r.raw_uid());
            if head_uid == uid {
                return MapRecord::new(Arc::clone(&head), hix)
                    .map_err(|e| self.corrupt_record(e));
            }
            if head_uid < uid {
                break;
            }
        }

        // Expunged from the head; the stale copy is still the best answer
        Ok(record)
    }

    fn lookup_uid(&self, seq: Seqnum) -> Result<Uid, Error> {
        self.check_consistent()?;
        let map = self.map();
        let ix = self.check_seq(&map, seq)?;
        self.lock_head()?;
        MapRecord::new(map, ix)
            .map(|r| r.uid())
            .map_err(|e| self.corrupt_record(e))
    }

    fn lookup_uid_range(
        &self,
        first: Uid,
        last: Uid,
    ) -> Result<Option<(Seqnum, Seqnum)>, Error> {
        self.check_consistent()?;
        self.lock_head()?;
        Ok(self.map().lookup_uid_range(first, last))
    }

    fn lookup_first(
        &self,
        want: MailFlags,
        mask: MailFlags,
    ) -> Result<Option<Seqnum>, Error> {
        self.check_consistent()?;
        self.lock_head()?;
        Ok(self.map().lookup_first(want, mask))
    }

    fn ext_slot(
        &self,
        map: &IndexMap,
        ext: ExtId,
    ) -> Result<Option<ExtSlot>, Error> {
        self.ext_name_slot(map, ext)
    }

    fn get_header_ext(
        &self,
        map: Option<&Arc<IndexMap>>,
        ext: ExtId,
    ) -> Result<Option<Vec<u8>>, Error> {
        self.check_consistent()?;
        let name = self.index.ext_name(ext)?;
        let (map, _lock) = match map {
            Some(map) => (Arc::clone(map), None),
            None => {
                let lock = self.head_lock()?;
                (self.index.head(), lock)
            }
        };

        Ok(map.ext_by_name(&name).map(|e| e.hdr_data.clone()))
    }
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;
    use crate::ext::ExtensionRegistry;
    use crate::index::IndexState;
    use crate::log::format::{
        AppendRecord, ExtIntro, ExtRecEntry, FlagUpdate, KeywordUpdate,
    };
    use crate::model::ModifyType;
    use crate::support::config::IndexConfig;

    struct Setup {
        _tmpdir: TempDir,
        index: Index,
        x: ExtId,
    }

    fn set_up() -> Setup {
        let tmpdir = TempDir::new().unwrap();
        let mut registry = ExtensionRegistry::new();
        let x = registry.register("X", 0, 4, 4);
        let index =
            Index::open(tmpdir.path(), &IndexConfig::default(), registry)
                .unwrap();
        Setup {
            _tmpdir: tmpdir,
            index,
            x,
        }
    }

    fn commit(index: &Index, txs: Vec<Transaction>) {
        index.commit(false, |_| Ok((txs, ()))).unwrap();
    }

    fn append(index: &Index, flags: &[MailFlags]) {
        let next = index.sync().unwrap().header().next_uid;
        commit(
            index,
            vec![Transaction::Append(
                flags
                    .iter()
                    .enumerate()
                    .map(|(i, &flags)| AppendRecord {
                        uid: Uid::u(next + i as u32),
                        flags,
                    })
                    .collect(),
            )],
        );
    }

    fn expunge(index: &Index, uid: u32) {
        commit(
            index,
            vec![Transaction::Expunge(vec![UidRange::single(Uid::u(uid))])],
        );
    }

    fn set_flags(index: &Index, uid: u32, add: MailFlags) {
        commit(
            index,
            vec![Transaction::FlagUpdate(vec![FlagUpdate {
                range: UidRange::single(Uid::u(uid)),
                add,
                remove: MailFlags::empty(),
            }])],
        );
    }

    #[test]
    fn lookup_first_unseen() {
        let setup = set_up();
        append(
            &setup.index,
            &[MailFlags::empty(), MailFlags::SEEN, MailFlags::empty()],
        );

        let view = IndexView::open(&setup.index).unwrap();
        assert_eq!(3, view.messages_count());
        assert_eq!(
            Some(Seqnum::u(1)),
            view.lookup_first(MailFlags::empty(), MailFlags::SEEN)
                .unwrap()
        );
        assert_eq!(
            Some(Seqnum::u(2)),
            view.lookup_first(MailFlags::SEEN, MailFlags::SEEN).unwrap()
        );
        assert_eq!(
            None,
            view.lookup_first(MailFlags::DELETED, MailFlags::DELETED)
                .unwrap()
        );
        assert_eq!(1, view.header().seen_messages_count);
    }

    #[test]
    fn uid_lookups() {
        let setup = set_up();
        append(&setup.index, &[MailFlags::empty(); 5]);
        expunge(&setup.index, 1);
        expunge(&setup.index, 3);

        let view = IndexView::open(&setup.index).unwrap();
        assert_eq!(Uid::u(2), view.lookup_uid(Seqnum::u(1)).unwrap());
        assert_eq!(Uid::u(5), view.lookup_uid(Seqnum::u(3)).unwrap());
        assert_matches!(
            Err(Error::SeqnumOutOfRange),
            view.lookup_uid(Seqnum::u(4))
        );
        assert_eq!(
            Some((Seqnum::u(2), Seqnum::u(3))),
            view.lookup_uid_range(Uid::u(3), Uid::u(5)).unwrap()
        );
        assert_eq!(None, view.lookup_uid_range(Uid::u(1), Uid::u(1)).unwrap());
        assert_eq!(
            Some((Seqnum::u(1), Seqnum::u(3))),
            view.lookup_uid_range(Uid::u(1), Uid::MAX).unwrap()
        );
    }

    #[test]
    fn extension_record_lookup() {
        let setup = set_up();
        append(&setup.index, &[MailFlags::empty(); 2]);
        commit(
            &setup.index,
            vec![
                Transaction::ExtIntro(ExtIntro {
                    ext_id: None,
                    reset_id: 0,
                    hdr_size: 8,
                    record_size: 4,
                    record_align: 4,
                    name: "X".to_owned(),
                }),
                Transaction::ExtRecUpdate(vec![ExtRecEntry {
                    uid: Uid::u(2),
                    data: vec![1, 2, 3, 4],
                }]),
            ],
        );

        let view = IndexView::open(&setup.index).unwrap();
        let found = view.lookup_ext_full(Seqnum::u(2), setup.x).unwrap();
        assert_eq!(Uid::u(2), found.record().uid());
        assert_eq!(Some(&[1u8, 2, 3, 4][..]), found.data());

        let found = view.lookup_ext_full(Seqnum::u(1), setup.x).unwrap();
        assert_eq!(Some(&[0u8; 4][..]), found.data());

        // Unknown to the index's registry
        let mut registry = setup.index.registry();
        assert_matches!(
            Err(Error::UnknownExtension),
            view.lookup_ext_full(Seqnum::u(1), registry.register("Y", 0, 4, 4))
        );
        let kw = registry.keywords();
        assert!(view.lookup_ext_full(Seqnum::u(1), kw).unwrap().data().is_none());

        assert_eq!(
            Some(vec![0u8; 8]),
            view.get_header_ext(None, setup.x).unwrap()
        );
        assert_eq!(None, view.get_header_ext(Some(&view.map()), kw).unwrap());
    }

    #[test]
    fn extension_introduced_after_open() {
        let setup = set_up();
        append(&setup.index, &[MailFlags::empty(); 2]);
        let view = IndexView::open(&setup.index).unwrap();
        assert!(view
            .lookup_ext_full(Seqnum::u(2), setup.x)
            .unwrap()
            .data()
            .is_none());

        commit(
            &setup.index,
            vec![
                Transaction::ExtIntro(ExtIntro {
                    ext_id: None,
                    reset_id: 0,
                    hdr_size: 8,
                    record_size: 4,
                    record_align: 4,
                    name: "X".to_owned(),
                }),
                Transaction::ExtRecUpdate(vec![ExtRecEntry {
                    uid: Uid::u(2),
                    data: vec![5, 6, 7, 8],
                }]),
            ],
        );

        // The view's own generation knows nothing of the extension, but the
        // record is read from the head
        assert_eq!(
            None,
            view.get_header_ext(Some(&view.map()), setup.x).unwrap()
        );
        let found = view.lookup_ext_full(Seqnum::u(2), setup.x).unwrap();
        assert_eq!(Some(&[5u8, 6, 7, 8][..]), found.data());

        assert_eq!(ViewSyncChanges::default(), view.sync().unwrap());
        assert!(view.is_head());
        assert_eq!(
            Some(vec![0u8; 8]),
            view.get_header_ext(Some(&view.map()), setup.x).unwrap()
        );
        let found = view.lookup_ext_full(Seqnum::u(2), setup.x).unwrap();
        assert!(Arc::ptr_eq(&view.map(), found.record().map()));
        assert_eq!(Some(&[5u8, 6, 7, 8][..]), found.data());
        let found = view.lookup_ext_full(Seqnum::u(1), setup.x).unwrap();
        assert_eq!(Some(&[0u8; 4][..]), found.data());
    }

    #[test]
    fn uid_zero_record_marks_index_corrupted() {
        let setup = set_up();
        append(&setup.index, &[MailFlags::empty(); 2]);

        let generations = setup.index.generations();
        let mut damaged = setup.index.head().clone_for_update(&generations);
        damaged.record_mut(1)[..4].copy_from_slice(&0u32.to_le_bytes());
        let view = IndexView::open_with_map(&setup.index, Arc::new(damaged));

        assert_eq!(Uid::u(1), view.lookup_full(Seqnum::u(1)).unwrap().uid());
        assert_eq!(IndexState::Valid, setup.index.state());
        assert_matches!(
            Err(Error::CorruptIndex(_)),
            view.lookup_full(Seqnum::u(2))
        );
        assert_eq!(IndexState::Corrupted, setup.index.state());
        assert_matches!(Err(Error::IndexCorrupted), setup.index.sync());
    }

    #[test]
    fn stale_view_prefers_head_records() {
        let setup = set_up();
        append(&setup.index, &[MailFlags::empty(); 3]);
        let view = IndexView::open(&setup.index).unwrap();

        set_flags(&setup.index, 3, MailFlags::FLAGGED);
        expunge(&setup.index, 2);
        assert!(!view.is_head());

        // Still in the head, which now has it at seq 2
        let found = view.lookup_full(Seqnum::u(3)).unwrap();
        assert_eq!(Uid::u(3), found.uid());
        assert_eq!(MailFlags::FLAGGED, found.flags());
        assert!(Arc::ptr_eq(&setup.index.head(), found.map()));
        assert_eq!(1, found.index());

        // Gone from the head; the view's own copy is returned
        let found = view.lookup_full(Seqnum::u(2)).unwrap();
        assert_eq!(Uid::u(2), found.uid());
        assert!(Arc::ptr_eq(&view.map(), found.map()));

        assert_eq!(3, view.messages_count());
    }

    #[test]
    fn sync_reports_changes() {
        let setup = set_up();
        append(&setup.index, &[MailFlags::empty(); 3]);
        let view = IndexView::open(&setup.index).unwrap();
        let other = view.clone_view();

        set_flags(&setup.index, 1, MailFlags::SEEN);
        commit(
            &setup.index,
            vec![Transaction::KeywordUpdate(KeywordUpdate {
                modify: ModifyType::Add,
                name: "$Junk".to_owned(),
                ranges: vec![UidRange::single(Uid::u(3))],
            })],
        );
        expunge(&setup.index, 2);
        append(&setup.index, &[MailFlags::empty()]);

        let changes = view.sync().unwrap();
        assert_eq!(
            ViewSyncChanges {
                expunged: vec![Uid::u(2)],
                appended: vec![Uid::u(4)],
                changed: vec![Uid::u(1), Uid::u(3)],
                reset: false,
            },
            changes
        );
        assert!(view.is_head());
        assert_eq!(setup.index.log_head_position(), view.log_position());
        assert_eq!(
            vec!["$Junk".to_owned()],
            view.lookup_keywords(Seqnum::u(2)).unwrap()
        );
        assert_eq!(ViewSyncChanges::default(), view.sync().unwrap());

        // The clone was left behind
        assert_eq!(3, other.messages_count());
        assert_eq!(1, other.sync().unwrap().expunged.len());
    }

    #[test]
    fn recreated_index_makes_view_inconsistent() {
        let setup = set_up();
        append(&setup.index, &[MailFlags::empty(); 2]);
        let view = IndexView::open(&setup.index).unwrap();
        assert_eq!(ViewState::Valid, view.state());

        setup.index.reset().unwrap();
        assert!(view.is_inconsistent());
        assert_matches!(
            Err(Error::ViewInconsistent),
            view.lookup_uid(Seqnum::u(1))
        );
        assert_matches!(Err(Error::ViewInconsistent), view.sync());
        assert_matches!(Err(Error::ViewInconsistent), view.lock());
        assert!(view.is_inconsistent());
        assert_eq!(ViewState::Inconsistent, view.state());

        let view = IndexView::open(&setup.index).unwrap();
        assert!(!view.is_inconsistent());
        assert_eq!(0, view.messages_count());
    }

    #[test]
    fn unlock_waits_for_transactions() {
        let setup = set_up();
        let view = IndexView::open(&setup.index).unwrap();
        view.lock().unwrap();
        assert!(view.is_locked());

        view.begin_transaction();
        view.unlock();
        assert!(view.is_locked());
        view.end_transaction();
        view.unlock();
        assert!(!view.is_locked());

        // Old generations need no lock
        append(&setup.index, &[MailFlags::empty()]);
        view.lock().unwrap();
        assert!(!view.is_locked());
    }

    #[test]
    fn rebuilt_index_counters_are_recomputed() {
        let tmpdir = TempDir::new().unwrap();
        let index = Index::open(
            tmpdir.path(),
            &IndexConfig::default(),
            ExtensionRegistry::new(),
        )
        .unwrap();
        append(&index, &[MailFlags::SEEN, MailFlags::empty()]);
        index.mark_corrupted();
        drop(index);

        let index = Index::open(
            tmpdir.path(),
            &IndexConfig::default(),
            ExtensionRegistry::new(),
        )
        .unwrap();
        let view = IndexView::open(&index).unwrap();
        let hdr = view.header();
        assert_eq!(1, hdr.seen_messages_count);
        assert_eq!(2, hdr.first_unseen_uid_lowwater);
    }
}
