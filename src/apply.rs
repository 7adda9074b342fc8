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

//! Applying transaction log records to produce a new map generation.
//!
//! Everything derived (message counters, low-water marks, the log position)
//! is maintained incrementally and exactly, so the resulting map depends only
//! on the sequence of records applied and not on how that sequence was split
//! across calls.

use log::warn;

use crate::ext::{MapExtension, KEYWORDS_EXT_NAME};
use crate::log::format::{
    AppendRecord, ExtIntro, ExtRecEntry, FlagUpdate, HeaderPatch,
    KeywordUpdate, Transaction, TxDecoder,
};
use crate::log::view::LogRecord;
use crate::map::{
    parse_keyword_names, Generations, HeaderFlags, IndexHeader, IndexMap,
    Nearest,
};
use crate::model::{LogPosition, MailFlags, ModifyType, Uid, UidRange};
use crate::support::error::Error;

/// Which extension ExtReset/ExtHdrUpdate/ExtRecUpdate records apply to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CurrentExt {
    None,
    /// The last intro named a stale reset id; its updates are dropped.
    Stale,
    Ext(usize),
}

impl Default for CurrentExt {
    fn default() -> Self {
        CurrentExt::None
    }
}

/// Replay state which carries over from one batch of records to the next.
#[derive(Clone, Debug, Default)]
pub struct ApplyState {
    decoder: TxDecoder,
    cur_ext: CurrentExt,
}

#[derive(Clone, Copy, Debug)]
enum Lowwater {
    Recent,
    Unseen,
    Deleted,
}

const LOWWATERS: [Lowwater; 3] =
    [Lowwater::Recent, Lowwater::Unseen, Lowwater::Deleted];

impl Lowwater {
    fn matches(self, flags: MailFlags) -> bool {
        match self {
            Lowwater::Recent => flags.contains(MailFlags::RECENT),
            Lowwater::Unseen => !flags.contains(MailFlags::SEEN),
            Lowwater::Deleted => flags.contains(MailFlags::DELETED),
        }
    }

    fn field(self, hdr: &mut IndexHeader) -> &mut u32 {
        match self {
            Lowwater::Recent => &mut hdr.first_recent_uid,
            Lowwater::Unseen => &mut hdr.first_unseen_uid_lowwater,
            Lowwater::Deleted => &mut hdr.first_deleted_uid_lowwater,
        }
    }
}

/// Builds one new map generation from a base map and a run of records.
pub struct MapUpdater<'a> {
    log_prefix: &'a str,
    map: IndexMap,
    state: &'a mut ApplyState,
}

impl<'a> MapUpdater<'a> {
    pub fn new(
        log_prefix: &'a str,
        base: &IndexMap,
        state: &'a mut ApplyState,
        generations: &Generations,
    ) -> Self {
        MapUpdater {
            log_prefix,
            map: base.clone_for_update(generations),
            state,
        }
    }

    pub fn map(&self) -> &IndexMap {
        &self.map
    }

    pub fn finish(self) -> IndexMap {
        self.map
    }

    /// Decode and apply the record read from the log, then advance the map's
    /// log position past it.
    ///
    /// Returns the decoded transaction.
    pub fn apply_record(
        &mut self,
        record: &LogRecord,
    ) -> Result<Transaction, Error> {
        let tx = self.state.decoder.decode(&record.hdr, &record.payload)?;
        self.apply(&tx).map_err(|e| match e {
            Error::CorruptLog(msg) => {
                Error::CorruptLog(format!("{} at {}", msg, record.pos))
            }
            Error::CorruptIndex(msg) => {
                Error::CorruptLog(format!("{} at {}", msg, record.pos))
            }
            e => e,
        })?;

        let end = record.end();
        let hdr = self.map.header_mut();
        if hdr.log_file_seq != end.file_seq {
            hdr.log_file_seq = end.file_seq;
            hdr.log_file_tail_offset = 0;
        }
        hdr.log_file_head_offset = end.offset;
        Ok(tx)
    }

    /// Jump over a damaged part of the log, flagging the map as repaired.
    pub fn skip_to(&mut self, pos: LogPosition) {
        warn!(
            "{} Skipping damaged transaction log records up to {}",
            self.log_prefix, pos
        );
        *self.state = ApplyState::default();
        let hdr = self.map.header_mut();
        if hdr.log_file_seq != pos.file_seq {
            hdr.log_file_seq = pos.file_seq;
            hdr.log_file_tail_offset = 0;
        }
        hdr.log_file_head_offset = pos.offset;
        hdr.flags |= HeaderFlags::FSCKD;
    }

    /// Apply one transaction to the map.
    pub fn apply(&mut self, tx: &Transaction) -> Result<(), Error> {
        match *tx {
            Transaction::Expunge(ref ranges) => {
                for &range in ranges {
                    self.expunge(range);
                }
                Ok(())
            }
            Transaction::Append(ref records) => self.append(records),
            Transaction::FlagUpdate(ref updates) => {
                for update in updates {
                    self.update_flags(update);
                }
                Ok(())
            }
            Transaction::HeaderUpdate(ref patches) => {
                self.update_header(patches)
            }
            Transaction::ExtIntro(ref intro) => self.ext_intro(intro),
            Transaction::ExtReset { new_reset_id } => {
                self.ext_reset(new_reset_id)
            }
            Transaction::ExtHdrUpdate(ref patches) => {
                self.ext_hdr_update(patches)
            }
            Transaction::ExtRecUpdate(ref entries) => {
                self.ext_rec_update(entries)
            }
            Transaction::KeywordUpdate(ref ku) => self.keyword_update(ku),
            Transaction::KeywordReset(ref ranges) => {
                self.keyword_reset(ranges);
                Ok(())
            }
        }
    }

    /// The record indices `[start, end)` of the messages in `range`.
    fn index_range(&self, range: UidRange) -> Option<(usize, usize)> {
        self.map
            .lookup_uid_range(range.first, range.last)
            .map(|(first, last)| (first.to_index(), last.to_index() + 1))
    }

    fn expunge(&mut self, range: UidRange) {
        let (start, end) = match self.index_range(range) {
            Some(r) => r,
            // Already expunged
            None => return,
        };

        let mut seen = 0;
        let mut deleted = 0;
        for ix in start..end {
            if let Some(r) = self.map.record(ix) {
                let flags = r.flags();
                if flags.contains(MailFlags::SEEN) {
                    seen += 1;
                }
                if flags.contains(MailFlags::DELETED) {
                    deleted += 1;
                }
            }
        }

        self.map.remove_records(start, end);
        let hdr = self.map.header_mut();
        hdr.seen_messages_count -= seen;
        hdr.deleted_messages_count -= deleted;

        for &lw in &LOWWATERS {
            let current = *lw.field(self.map.header_mut());
            if Uid::of(current).map_or(false, |uid| range.contains(uid)) {
                let next = self.map.scan_lowwater(start, |f| lw.matches(f));
                *lw.field(self.map.header_mut()) = next;
            }
        }
    }

    fn append(&mut self, records: &[AppendRecord]) -> Result<(), Error> {
        for rec in records {
            let next_uid = self.map.header().next_uid;
            if rec.uid.get() < next_uid {
                return Err(Error::CorruptLog(format!(
                    "append of UID {} below next_uid {}",
                    rec.uid, next_uid
                )));
            }

            self.map.push_record(rec.uid, rec.flags);
            let new_next_uid = rec.uid.get() + 1;
            let hdr = self.map.header_mut();
            hdr.next_uid = new_next_uid;
            if rec.flags.contains(MailFlags::SEEN) {
                hdr.seen_messages_count += 1;
            }
            if rec.flags.contains(MailFlags::DELETED) {
                hdr.deleted_messages_count += 1;
            }

            for &lw in &LOWWATERS {
                let field = lw.field(hdr);
                // A mark at the old next_uid means nothing matched
                if *field >= next_uid {
                    *field = if lw.matches(rec.flags) {
                        rec.uid.get()
                    } else {
                        new_next_uid
                    };
                }
            }
        }

        Ok(())
    }

    fn update_flags(&mut self, update: &FlagUpdate) {
        let (start, end) = match self.index_range(update.range) {
            Some(r) => r,
            None => return,
        };

        for ix in start..end {
            let (uid, old) = match self.map.record(ix) {
                Some(r) => (r.raw_uid(), r.flags()),
                None => return,
            };
            let new = (old - update.remove) | update.add;
            if old == new {
                continue;
            }
            self.map.set_flags(ix, new);

            let hdr = self.map.header_mut();
            adjust_counter(
                &mut hdr.seen_messages_count,
                old.contains(MailFlags::SEEN),
                new.contains(MailFlags::SEEN),
            );
            adjust_counter(
                &mut hdr.deleted_messages_count,
                old.contains(MailFlags::DELETED),
                new.contains(MailFlags::DELETED),
            );

            for &lw in &LOWWATERS {
                let current = *lw.field(self.map.header_mut());
                match (lw.matches(old), lw.matches(new)) {
                    (false, true) if uid < current => {
                        *lw.field(self.map.header_mut()) = uid;
                    }
                    (true, false) if uid == current => {
                        let next =
                            self.map.scan_lowwater(ix, |f| lw.matches(f));
                        *lw.field(self.map.header_mut()) = next;
                    }
                    _ => (),
                }
            }
        }
    }

    fn update_header(&mut self, patches: &[HeaderPatch]) -> Result<(), Error> {
        for patch in patches {
            let old_next_uid = self.map.header().next_uid;
            let hdr = self.map.header_mut();
            hdr.patch(patch.offset, &patch.data).map_err(|_| {
                Error::CorruptLog(format!(
                    "header update at offset {} size {}",
                    patch.offset,
                    patch.data.len()
                ))
            })?;

            if hdr.next_uid != old_next_uid {
                let new_next_uid = hdr.next_uid;
                for &lw in &LOWWATERS {
                    let field = lw.field(hdr);
                    if *field >= old_next_uid {
                        *field = new_next_uid;
                    }
                }
            }
        }
        Ok(())
    }

    fn ext_intro(&mut self, intro: &ExtIntro) -> Result<(), Error> {
        let existing = match intro.ext_id {
            Some(ix) => {
                let ix = ix as usize;
                let ext =
                    self.map.extensions().get(ix).ok_or_else(|| {
                        Error::CorruptLog(format!(
                            "intro of unknown extension {}",
                            ix
                        ))
                    })?;
                if !intro.name.is_empty() && intro.name != ext.name {
                    return Err(Error::CorruptLog(format!(
                        "intro names extension {} as {:?}, not {:?}",
                        ix, intro.name, ext.name
                    )));
                }
                Some(ix)
            }
            None => self.map.ext_index(&intro.name),
        };

        let ix = match existing {
            None => {
                let mut exts = self.map.extensions().to_vec();
                exts.push(MapExtension::new(
                    &intro.name,
                    intro.reset_id,
                    intro.hdr_size,
                    intro.record_size,
                    intro.record_align,
                ));
                self.map.set_extensions(exts)?;
                self.map.extensions().len() - 1
            }

            Some(ix) => {
                let ext = &self.map.extensions()[ix];
                if ext.reset_id != intro.reset_id {
                    self.state.cur_ext = CurrentExt::Stale;
                    return Ok(());
                }

                if ext.hdr_size() != intro.hdr_size
                    || ext.record_size != intro.record_size
                    || ext.record_align != intro.record_align.max(1)
                {
                    let mut exts = self.map.extensions().to_vec();
                    let ext = &mut exts[ix];
                    ext.hdr_data.resize(intro.hdr_size as usize, 0);
                    ext.record_size = intro.record_size;
                    ext.record_align = intro.record_align.max(1);
                    self.map.set_extensions(exts)?;
                }
                ix
            }
        };

        self.state.cur_ext = CurrentExt::Ext(ix);
        Ok(())
    }

    fn current_ext(&self) -> Result<Option<usize>, Error> {
        match self.state.cur_ext {
            CurrentExt::None => Err(Error::CorruptLog(
                "extension update without intro".to_owned(),
            )),
            CurrentExt::Stale => Ok(None),
            CurrentExt::Ext(ix) => Ok(Some(ix)),
        }
    }

    fn ext_reset(&mut self, new_reset_id: u32) -> Result<(), Error> {
        let ix = match self.current_ext()? {
            Some(ix) => ix,
            None => return Ok(()),
        };

        let ext = self.map.ext_mut(ix);
        ext.reset_id = new_reset_id;
        for b in &mut ext.hdr_data {
            *b = 0;
        }
        let offset = usize::from(ext.record_offset);
        let size = usize::from(ext.record_size);
        if 0 != offset {
            for rix in 0..self.map.messages_count() as usize {
                for b in &mut self.map.record_mut(rix)[offset..offset + size] {
                    *b = 0;
                }
            }
        }
        Ok(())
    }

    fn ext_hdr_update(&mut self, patches: &[HeaderPatch]) -> Result<(), Error> {
        let ix = match self.current_ext()? {
            Some(ix) => ix,
            None => return Ok(()),
        };

        let ext = self.map.ext_mut(ix);
        for patch in patches {
            let start = usize::from(patch.offset);
            let end = start + patch.data.len();
            if end > ext.hdr_data.len() {
                return Err(Error::CorruptLog(format!(
                    "extension header update past end of {:?}",
                    ext.name
                )));
            }
            ext.hdr_data[start..end].copy_from_slice(&patch.data);
        }
        Ok(())
    }

    fn ext_rec_update(&mut self, entries: &[ExtRecEntry]) -> Result<(), Error> {
        let ix = match self.current_ext()? {
            Some(ix) => ix,
            None => return Ok(()),
        };

        let ext = &self.map.extensions()[ix];
        let offset = usize::from(ext.record_offset);
        let size = usize::from(ext.record_size);
        if 0 == offset {
            return Ok(());
        }

        for entry in entries {
            if entry.data.len() != size {
                return Err(Error::CorruptLog(format!(
                    "extension record update of {} bytes for {} byte slot",
                    entry.data.len(),
                    size
                )));
            }

            // Updates for expunged messages are simply dropped
            if let Some(rix) = self.map.bsearch_uid(entry.uid, Nearest::Exact) {
                self.map.record_mut(rix)[offset..offset + size]
                    .copy_from_slice(&entry.data);
            }
        }
        Ok(())
    }

    /// Find the keywords extension, creating it if `create` is set.
    fn keywords_ext(&mut self, create: bool) -> Result<Option<usize>, Error> {
        if let Some(ix) = self.map.ext_index(KEYWORDS_EXT_NAME) {
            return Ok(Some(ix));
        }
        if !create {
            return Ok(None);
        }

        let mut exts = self.map.extensions().to_vec();
        exts.push(MapExtension::new(KEYWORDS_EXT_NAME, 1, 0, 0, 4));
        self.map.set_extensions(exts)?;
        Ok(Some(self.map.extensions().len() - 1))
    }

    fn keyword_update(&mut self, ku: &KeywordUpdate) -> Result<(), Error> {
        if ku.name.as_bytes().contains(&0) {
            return Err(Error::CorruptLog(format!(
                "keyword {:?} contains NUL",
                ku.name
            )));
        }

        let ext_ix = match self.keywords_ext(ModifyType::Add == ku.modify)? {
            Some(ix) => ix,
            None => return Ok(()),
        };

        let known = parse_keyword_names(
            &self.map.extensions()[ext_ix].hdr_data,
        )
        .iter()
        .position(|&n| n == ku.name);
        let bit = match (known, ku.modify) {
            (Some(bit), _) => bit,
            (None, ModifyType::Remove) => return Ok(()),
            (None, ModifyType::Add) => self.add_keyword(ext_ix, &ku.name)?,
        };

        let ext = &self.map.extensions()[ext_ix];
        let byte = usize::from(ext.record_offset) + bit / 8;
        let mask = 1u8 << (bit % 8);
        for &range in &ku.ranges {
            let (start, end) = match self.index_range(range) {
                Some(r) => r,
                None => continue,
            };
            for rix in start..end {
                let rec = self.map.record_mut(rix);
                match ku.modify {
                    ModifyType::Add => rec[byte] |= mask,
                    ModifyType::Remove => rec[byte] &= !mask,
                }
            }
        }
        self.map.update_header_size();
        Ok(())
    }

    /// Register a new keyword name, growing the per-record bitmap if needed.
    /// Returns the bit assigned to it.
    fn add_keyword(&mut self, ext_ix: usize, name: &str) -> Result<usize, Error> {
        let mut exts = self.map.extensions().to_vec();
        let ext = &mut exts[ext_ix];
        let bit = parse_keyword_names(&ext.hdr_data).len();
        ext.hdr_data.extend_from_slice(name.as_bytes());
        ext.hdr_data.push(0);

        let needed = (bit / 8 + 1 + 3) / 4 * 4;
        if needed > usize::from(ext.record_size) {
            ext.record_size = needed as u16;
            self.map.set_extensions(exts)?;
        } else {
            *self.map.ext_mut(ext_ix) = exts.swap_remove(ext_ix);
        }
        Ok(bit)
    }

    fn keyword_reset(&mut self, ranges: &[UidRange]) {
        let ext = match self.map.ext_by_name(KEYWORDS_EXT_NAME) {
            Some(e) if 0 != e.record_offset => e,
            _ => return,
        };
        let offset = usize::from(ext.record_offset);
        let size = usize::from(ext.record_size);

        for &range in ranges {
            let (start, end) = match self.index_range(range) {
                Some(r) => r,
                None => continue,
            };
            for rix in start..end {
                for b in &mut self.map.record_mut(rix)[offset..offset + size] {
                    *b = 0;
                }
            }
        }
    }
}

fn adjust_counter(counter: &mut u32, old: bool, new: bool) {
    match (old, new) {
        (false, true) => *counter += 1,
        (true, false) => *counter -= 1,
        _ => (),
    }
}
