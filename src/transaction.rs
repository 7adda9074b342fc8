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

//! Batches of changes to the index.
//!
//! Nothing is written until `commit()`, which turns the whole batch into log
//! records and appends them with a single write. UIDs for new messages are
//! only assigned then, from the `next_uid` of the head as synced under the
//! log lock, so concurrent committers never hand out the same UID.

use std::sync::Arc;

use log::debug;

use crate::apply::{ApplyState, MapUpdater};
use crate::ext::{ExtId, ExtensionRegistry};
use crate::log::format::{
    AppendRecord, ExtIntro, ExtRecEntry, FlagUpdate, HeaderPatch,
    KeywordUpdate, Transaction,
};
use crate::map::{IndexHeader, IndexMap, BASE_HEADER_SIZE, HEADER_PATCH_MIN_OFFSET};
use crate::model::{LogPosition, MailFlags, ModifyType, Seqnum, Uid, UidRange};
use crate::support::error::Error;
use crate::view::{ExtSlot, IndexView, MapRecord, View};

/// Refers to a message in a transaction: either one already in the index,
/// or one appended earlier in the same transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageRef {
    Uid(Uid),
    /// The n-th message appended by the transaction.
    Appended(usize),
}

/// The outcome of a commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitResult {
    /// The end of the log before the batch was written.
    pub first: LogPosition,
    /// The end of the log after the batch was written.
    pub last: LogPosition,
    /// The UIDs assigned to appended messages, in append order.
    pub uids: Vec<Uid>,
}

#[derive(Clone, Debug)]
enum KeywordChange {
    Modify(ModifyType, String, MessageRef),
    Reset(UidRange),
}

#[derive(Clone, Debug, Default)]
struct ExtChanges {
    resize: Option<(u32, u16, u16)>,
    reset: bool,
    hdr: Vec<HeaderPatch>,
    records: Vec<(MessageRef, Vec<u8>)>,
}

/// A pending batch of changes made through a view.
///
/// While a transaction exists, the view's lock is not released by
/// `IndexView::unlock()`.
pub struct IndexTransaction<'a> {
    view: &'a IndexView,
    external: bool,
    appends: Vec<MailFlags>,
    flags: Vec<FlagUpdate>,
    keywords: Vec<KeywordChange>,
    header: Vec<HeaderPatch>,
    exts: Vec<(ExtId, ExtChanges)>,
    expunges: Vec<UidRange>,
}

impl<'a> IndexTransaction<'a> {
    /// Start a transaction on `view`.
    ///
    /// `external` marks the records as describing changes which already
    /// happened elsewhere, such as in the backing message store.
    pub fn begin(view: &'a IndexView, external: bool) -> Self {
        view.begin_transaction();
        IndexTransaction {
            view,
            external,
            appends: Vec::new(),
            flags: Vec::new(),
            keywords: Vec::new(),
            header: Vec::new(),
            exts: Vec::new(),
            expunges: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.appends.is_empty()
            && self.flags.is_empty()
            && self.keywords.is_empty()
            && self.header.is_empty()
            && self.exts.is_empty()
            && self.expunges.is_empty()
    }

    /// Append a new message. Its UID is assigned at commit.
    pub fn append(&mut self, flags: MailFlags) -> MessageRef {
        self.appends.push(flags);
        MessageRef::Appended(self.appends.len() - 1)
    }

    pub fn expunge(&mut self, range: UidRange) {
        self.expunges.push(range);
    }

    pub fn update_flags(
        &mut self,
        range: UidRange,
        add: MailFlags,
        remove: MailFlags,
    ) {
        self.flags.push(FlagUpdate { range, add, remove });
    }

    pub fn update_keyword(
        &mut self,
        modify: ModifyType,
        name: &str,
        msg: MessageRef,
    ) -> Result<(), Error> {
        if name.is_empty() || name.as_bytes().contains(&0) {
            return Err(Error::BadKeyword);
        }
        self.check_ref(msg)?;

        self.keywords
            .push(KeywordChange::Modify(modify, name.to_owned(), msg));
        Ok(())
    }

    /// Clear every keyword of the messages in `range`.
    pub fn reset_keywords(&mut self, range: UidRange) {
        self.keywords.push(KeywordChange::Reset(range));
    }

    /// Overwrite part of the base header.
    ///
    /// Only the fields after `indexid` can be written; counters and log
    /// positions are maintained by the index itself and writes to them have
    /// no effect.
    pub fn update_header(
        &mut self,
        offset: u16,
        data: &[u8],
    ) -> Result<(), Error> {
        if offset < HEADER_PATCH_MIN_OFFSET
            || usize::from(offset) + data.len() > usize::from(BASE_HEADER_SIZE)
        {
            return Err(Error::BadHeaderUpdate);
        }

        self.header.push(HeaderPatch {
            offset,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn ext(&mut self, ext: ExtId) -> Result<&mut ExtChanges, Error> {
        self.view.index().ext_name(ext)?;
        let pos = match self.exts.iter().position(|&(id, _)| id == ext) {
            Some(pos) => pos,
            None => {
                self.exts.push((ext, ExtChanges::default()));
                self.exts.len() - 1
            }
        };
        Ok(&mut self.exts[pos].1)
    }

    /// Change the sizes of `ext`, introducing it if needed.
    pub fn ext_resize(
        &mut self,
        ext: ExtId,
        hdr_size: u32,
        record_size: u16,
        record_align: u16,
    ) -> Result<(), Error> {
        self.ext(ext)?.resize = Some((hdr_size, record_size, record_align));
        Ok(())
    }

    /// Zero all data of `ext`, making pending updates of other committers
    /// obsolete.
    pub fn ext_reset(&mut self, ext: ExtId) -> Result<(), Error> {
        self.ext(ext)?.reset = true;
        Ok(())
    }

    pub fn ext_update_header(
        &mut self,
        ext: ExtId,
        offset: u16,
        data: &[u8],
    ) -> Result<(), Error> {
        self.ext(ext)?.hdr.push(HeaderPatch {
            offset,
            data: data.to_vec(),
        });
        Ok(())
    }

    pub fn ext_update_record(
        &mut self,
        ext: ExtId,
        msg: MessageRef,
        data: &[u8],
    ) -> Result<(), Error> {
        self.check_ref(msg)?;
        self.ext(ext)?.records.push((msg, data.to_vec()));
        Ok(())
    }

    fn check_ref(&self, msg: MessageRef) -> Result<(), Error> {
        match msg {
            MessageRef::Appended(ix) if ix >= self.appends.len() => {
                Err(Error::NxMessage)
            }
            _ => Ok(()),
        }
    }

    /// Write the transaction to the log.
    pub fn commit(self) -> Result<CommitResult, Error> {
        if self.view.is_inconsistent() {
            return Err(Error::ViewInconsistent);
        }

        let registry = self.view.index().registry();
        let (first, last, uids) = self
            .view
            .index()
            .commit(self.external, |head| self.build(head, &registry))?;
        Ok(CommitResult { first, last, uids })
    }

    /// Discard the transaction.
    pub fn rollback(self) {
        debug!(
            "{} Rolling back transaction of {} appends",
            self.view.index().log_prefix(),
            self.appends.len()
        );
    }

    /// A view of the view's generation with this transaction applied.
    pub fn view(&self) -> Result<TransactionView<'_>, Error> {
        let base = self.view.map();
        let (txs, uids) = self.build(&base, &self.view.index().registry())?;

        let index = self.view.index();
        let log_prefix = index.log_prefix();
        let generations = index.generations();
        let mut state = ApplyState::default();
        let mut updater =
            MapUpdater::new(&log_prefix, &base, &mut state, &generations);
        for tx in &txs {
            updater.apply(tx)?;
        }

        Ok(TransactionView {
            view: self.view,
            map: Arc::new(updater.finish()),
            uids,
        })
    }

    /// Turn the pending changes into log records against `head`.
    fn build(
        &self,
        head: &IndexMap,
        registry: &ExtensionRegistry,
    ) -> Result<(Vec<Transaction>, Vec<Uid>), Error> {
        let mut txs = Vec::new();

        let mut uids = Vec::with_capacity(self.appends.len());
        let mut next_uid = head.header().next_uid;
        for _ in &self.appends {
            uids.push(Uid::of(next_uid).ok_or(Error::UidsExhausted)?);
            next_uid += 1;
        }
        if !uids.is_empty() {
            txs.push(Transaction::Append(
                uids.iter()
                    .zip(&self.appends)
                    .map(|(&uid, &flags)| AppendRecord { uid, flags })
                    .collect(),
            ));
        }

        let resolve = |msg: MessageRef| -> Result<Uid, Error> {
            match msg {
                MessageRef::Uid(uid) => Ok(uid),
                MessageRef::Appended(ix) => {
                    uids.get(ix).copied().ok_or(Error::NxMessage)
                }
            }
        };

        if !self.flags.is_empty() {
            txs.push(Transaction::FlagUpdate(self.flags.clone()));
        }

        for change in &self.keywords {
            txs.push(match *change {
                KeywordChange::Modify(modify, ref name, msg) => {
                    Transaction::KeywordUpdate(KeywordUpdate {
                        modify,
                        name: name.clone(),
                        ranges: vec![UidRange::single(resolve(msg)?)],
                    })
                }
                KeywordChange::Reset(range) => {
                    Transaction::KeywordReset(vec![range])
                }
            });
        }

        if !self.header.is_empty() {
            txs.push(Transaction::HeaderUpdate(self.header.clone()));
        }

        for &(ext, ref changes) in &self.exts {
            let name = registry.name(ext)?;
            let spec = registry.get(ext).ok_or(Error::UnknownExtension)?;
            let existing = head
                .ext_index(name)
                .map(|ix| (ix, &head.extensions()[ix]));

            let (hdr_size, record_size, record_align) = changes
                .resize
                .or_else(|| {
                    existing.map(|(_, e)| {
                        (e.hdr_size(), e.record_size, e.record_align)
                    })
                })
                .unwrap_or((spec.hdr_size, spec.record_size, spec.record_align));
            let reset_id = existing.map_or(0, |(_, e)| e.reset_id);

            txs.push(Transaction::ExtIntro(ExtIntro {
                ext_id: existing.map(|(ix, _)| ix as u32),
                reset_id,
                hdr_size,
                record_size,
                record_align,
                name: name.to_owned(),
            }));

            if changes.reset {
                txs.push(Transaction::ExtReset {
                    new_reset_id: reset_id.wrapping_add(1),
                });
            }

            for patch in &changes.hdr {
                if usize::from(patch.offset) + patch.data.len()
                    > hdr_size as usize
                {
                    return Err(Error::ExtensionSizeMismatch);
                }
            }
            if !changes.hdr.is_empty() {
                txs.push(Transaction::ExtHdrUpdate(changes.hdr.clone()));
            }

            let mut entries = Vec::with_capacity(changes.records.len());
            for &(msg, ref data) in &changes.records {
                if data.len() != usize::from(record_size) {
                    return Err(Error::ExtensionSizeMismatch);
                }
                entries.push(ExtRecEntry {
                    uid: resolve(msg)?,
                    data: data.clone(),
                });
            }
            if !entries.is_empty() {
                txs.push(Transaction::ExtRecUpdate(entries));
            }
        }

        if !self.expunges.is_empty() {
            txs.push(Transaction::Expunge(self.expunges.clone()));
        }

        Ok((txs, uids))
    }
}

impl Drop for IndexTransaction<'_> {
    fn drop(&mut self) {
        self.view.end_transaction();
    }
}

/// The view's generation as it would look after the transaction commits.
///
/// Appended messages carry provisional UIDs, which the commit may change if
/// other messages are appended first.
pub struct TransactionView<'a> {
    view: &'a IndexView,
    map: Arc<IndexMap>,
    uids: Vec<Uid>,
}

impl TransactionView<'_> {
    /// The provisional UIDs of the appended messages.
    pub fn appended_uids(&self) -> &[Uid] {
        &self.uids
    }
}

impl View for TransactionView<'_> {
    fn map(&self) -> Arc<IndexMap> {
        Arc::clone(&self.map)
    }

    fn header(&self) -> IndexHeader {
        *self.map.header()
    }

    fn lookup_full(&self, seq: Seqnum) -> Result<MapRecord, Error> {
        if seq.to_index() >= self.map.messages_count() as usize {
            return Err(Error::SeqnumOutOfRange);
        }
        MapRecord::new(Arc::clone(&self.map), seq.to_index())
    }

    fn ext_slot(
        &self,
        map: &IndexMap,
        ext: ExtId,
    ) -> Result<Option<ExtSlot>, Error> {
        let name = self.view.index().ext_name(ext)?;
        Ok(ExtSlot::resolve(map, &name))
    }

    fn get_header_ext(
        &self,
        map: Option<&Arc<IndexMap>>,
        ext: ExtId,
    ) -> Result<Option<Vec<u8>>, Error> {
        let name = self.view.index().ext_name(ext)?;
        let map = map.unwrap_or(&self.map);
        Ok(map.ext_by_name(&name).map(|e| e.hdr_data.clone()))
    }
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;
    use crate::index::Index;
    use crate::support::config::IndexConfig;

    struct Setup {
        _tmpdir: TempDir,
        index: Index,
        x: ExtId,
    }

    fn set_up() -> Setup {
        let tmpdir = TempDir::new().unwrap();
        let mut registry = ExtensionRegistry::new();
        let x = registry.register("X", 4, 4, 4);
        let index =
            Index::open(tmpdir.path(), &IndexConfig::default(), registry)
                .unwrap();
        Setup {
            _tmpdir: tmpdir,
            index,
            x,
        }
    }

    fn append_n(view: &IndexView, n: usize) -> CommitResult {
        let mut tx = IndexTransaction::begin(view, false);
        for _ in 0..n {
            tx.append(MailFlags::empty());
        }
        tx.commit().unwrap()
    }

    #[test]
    fn commit_assigns_uids_from_head() {
        let setup = set_up();
        let a = IndexView::open(&setup.index).unwrap();
        let b = IndexView::open(&setup.index).unwrap();

        let res = append_n(&a, 2);
        assert_eq!(vec![Uid::u(1), Uid::u(2)], res.uids);
        assert!(res.first.is_before(res.last));
        assert_eq!(setup.index.log_head_position(), res.last);

        // b never saw a's appends, but the commit does
        let res = append_n(&b, 1);
        assert_eq!(vec![Uid::u(3)], res.uids);
        assert_eq!(0, b.messages_count());

        let changes = b.sync().unwrap();
        assert_eq!(vec![Uid::u(1), Uid::u(2), Uid::u(3)], changes.appended);
    }

    #[test]
    fn changes_to_appended_messages() {
        let setup = set_up();
        let view = IndexView::open(&setup.index).unwrap();

        let mut tx = IndexTransaction::begin(&view, false);
        let msg = tx.append(MailFlags::SEEN);
        tx.update_keyword(ModifyType::Add, "$Label1", msg).unwrap();
        tx.ext_update_record(setup.x, msg, &[9, 8, 7, 6]).unwrap();
        tx.ext_update_header(setup.x, 0, &[1, 2]).unwrap();
        let res = tx.commit().unwrap();
        assert_eq!(vec![Uid::u(1)], res.uids);

        view.sync().unwrap();
        let seq = Seqnum::u(1);
        assert_eq!(MailFlags::SEEN, view.lookup_full(seq).unwrap().flags());
        assert_eq!(vec!["$Label1".to_owned()], view.lookup_keywords(seq).unwrap());
        assert_eq!(
            Some(&[9u8, 8, 7, 6][..]),
            view.lookup_ext_full(seq, setup.x).unwrap().data()
        );
        assert_eq!(
            Some(vec![1, 2, 0, 0]),
            view.get_header_ext(None, setup.x).unwrap()
        );
    }

    #[test]
    fn bad_changes_are_rejected() {
        let setup = set_up();
        let view = IndexView::open(&setup.index).unwrap();

        let mut tx = IndexTransaction::begin(&view, false);
        assert_matches!(Err(Error::BadHeaderUpdate), tx.update_header(8, &[0]));
        assert_matches!(
            Err(Error::BadHeaderUpdate),
            tx.update_header(60, &[0; 8])
        );
        assert_matches!(
            Err(Error::BadKeyword),
            tx.update_keyword(ModifyType::Add, "", MessageRef::Uid(Uid::MIN))
        );
        assert_matches!(
            Err(Error::BadKeyword),
            tx.update_keyword(
                ModifyType::Add,
                "a\0b",
                MessageRef::Uid(Uid::MIN)
            )
        );
        assert_matches!(
            Err(Error::NxMessage),
            tx.ext_update_record(setup.x, MessageRef::Appended(0), &[0; 4])
        );
        assert_matches!(
            Err(Error::UnknownExtension),
            tx.ext_reset(ExtId(99))
        );
        assert!(tx.is_empty());

        let msg = tx.append(MailFlags::empty());
        tx.ext_update_record(setup.x, msg, &[0; 3]).unwrap();
        assert_matches!(Err(Error::ExtensionSizeMismatch), tx.commit());
        assert_eq!(0, view.transactions());
        assert_eq!(0, setup.index.sync().unwrap().messages_count());
    }

    #[test]
    fn transaction_view_shows_pending_changes() {
        let setup = set_up();
        let view = IndexView::open(&setup.index).unwrap();
        append_n(&view, 3);
        view.sync().unwrap();

        let mut tx = IndexTransaction::begin(&view, false);
        tx.expunge(UidRange::single(Uid::u(2)));
        tx.update_flags(
            UidRange::new(Uid::u(1), Uid::u(3)),
            MailFlags::FLAGGED,
            MailFlags::empty(),
        );
        tx.append(MailFlags::DRAFT);

        {
            let txview = tx.view().unwrap();
            assert_eq!(vec![Uid::u(4)], txview.appended_uids());
            assert_eq!(3, txview.messages_count());
            assert_eq!(Uid::u(3), txview.lookup_uid(Seqnum::u(2)).unwrap());
            assert_eq!(
                MailFlags::FLAGGED,
                txview.lookup_full(Seqnum::u(1)).unwrap().flags()
            );
            assert_eq!(
                Some(Seqnum::u(3)),
                txview
                    .lookup_first(MailFlags::DRAFT, MailFlags::DRAFT)
                    .unwrap()
            );
            assert_matches!(
                Err(Error::SeqnumOutOfRange),
                txview.lookup_full(Seqnum::u(4))
            );
        }

        // Nothing has been written yet
        assert_eq!(3, view.messages_count());
        assert_eq!(3, setup.index.sync().unwrap().messages_count());
        tx.rollback();
        assert_eq!(3, setup.index.sync().unwrap().messages_count());
    }

    #[test]
    fn ext_reset_zeroes_data() {
        let setup = set_up();
        let view = IndexView::open(&setup.index).unwrap();
        append_n(&view, 1);

        let mut tx = IndexTransaction::begin(&view, false);
        tx.ext_update_record(setup.x, MessageRef::Uid(Uid::u(1)), &[1; 4])
            .unwrap();
        tx.commit().unwrap();

        let mut tx = IndexTransaction::begin(&view, false);
        tx.ext_reset(setup.x).unwrap();
        tx.commit().unwrap();

        view.sync().unwrap();
        let map = view.map();
        let ext = map.ext_by_name("X").unwrap();
        assert_eq!(1, ext.reset_id);
        assert_eq!(
            Some(&[0u8; 4][..]),
            view.lookup_ext_full(Seqnum::u(1), setup.x).unwrap().data()
        );

        // Resizing keeps the data
        let mut tx = IndexTransaction::begin(&view, false);
        tx.ext_resize(setup.x, 4, 8, 4).unwrap();
        tx.ext_update_record(setup.x, MessageRef::Uid(Uid::u(1)), &[2; 8])
            .unwrap();
        tx.commit().unwrap();
        view.sync().unwrap();
        assert_eq!(
            Some(&[2u8; 8][..]),
            view.lookup_ext_full(Seqnum::u(1), setup.x).unwrap().data()
        );
    }

    #[test]
    fn uids_run_out() {
        let setup = set_up();
        let view = IndexView::open(&setup.index).unwrap();

        let mut tx = IndexTransaction::begin(&view, false);
        tx.update_header(20, &Uid::MAX.get().to_le_bytes()).unwrap();
        tx.commit().unwrap();

        let res = append_n(&view, 1);
        assert_eq!(vec![Uid::MAX], res.uids);

        let mut tx = IndexTransaction::begin(&view, false);
        tx.append(MailFlags::empty());
        assert_matches!(Err(Error::UidsExhausted), tx.commit());
    }

    #[test]
    fn transactions_hold_the_view_lock() {
        let setup = set_up();
        let view = IndexView::open(&setup.index).unwrap();
        view.lock().unwrap();

        let tx = IndexTransaction::begin(&view, true);
        assert_eq!(1, view.transactions());
        view.unlock();
        assert!(view.is_locked());

        let res = tx.commit().unwrap();
        assert_eq!(res.first, res.last);
        assert_eq!(0, view.transactions());
        view.unlock();
        assert!(!view.is_locked());
    }
}
