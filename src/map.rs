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

//! The index map: one immutable generation of the mailbox's message records.
//!
//! A map is never modified once it has been published behind an `Arc`.
//! Applying log records to it starts with `clone_for_update()`, which yields
//! a private copy with a new generation number. Generation numbers are
//! handed out by the `Generations` counter of the index the map belongs to,
//! so they are only comparable between maps of the same index.
//!
//! # Snapshot format
//!
//! The snapshot file (`index`) holds exactly one map:
//!
//! - The 64-byte base header (see `IndexHeader`).
//! - u32: number of extensions, followed by one entry per extension:
//!   `reset_id:u32 hdr_size:u32 record_size:u16 record_align:u16
//!   record_offset:u16 name_size:u16`, the name padded to 4 bytes and the
//!   extension header data padded to 4 bytes.
//! - `messages_count` records of `record_size` bytes each.
//!
//! The base header's `header_size` covers everything before the records.

use std::cell::Cell;
use std::convert::TryFrom;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::ext::{
    compute_record_layout, MapExtension, BASE_RECORD_SIZE, KEYWORDS_EXT_NAME,
};
use crate::model::{LogPosition, MailFlags, Seqnum, Uid};
use crate::support::error::Error;

pub const INDEX_MAJOR_VERSION: u8 = 1;
pub const INDEX_MINOR_VERSION: u8 = 0;
pub const BASE_HEADER_SIZE: u16 = 64;

/// Header patches may not touch anything before this offset (versions,
/// sizes, flags, indexid).
pub const HEADER_PATCH_MIN_OFFSET: u16 = 16;

/// Where the header flags live, for marking a snapshot file damaged in place.
pub const HEADER_FLAGS_OFFSET: u64 = 10;

/// Start and end of the derived fields (counters, low-water marks and log
/// positions), which header patches cannot change.
const OFF_DERIVED_START: usize = 24;
const OFF_DERIVED_END: usize = 60;

bitflags::bitflags! {
    #[derive(Default)]
    pub struct HeaderFlags: u16 {
        /// The map is known to be damaged; the next open rebuilds it.
        const CORRUPTED = 0x0001;
        /// The map was rebuilt after damage was found.
        const FSCKD = 0x0002;
    }
}

/// The fixed part of the map header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexHeader {
    pub major_version: u8,
    pub minor_version: u8,
    pub base_header_size: u16,
    pub header_size: u32,
    pub record_size: u16,
    pub flags: HeaderFlags,
    pub indexid: u32,
    pub uid_validity: u32,
    pub next_uid: u32,
    pub messages_count: u32,
    pub seen_messages_count: u32,
    pub deleted_messages_count: u32,
    /// The lowest UID with `RECENT` set, or `next_uid` if none.
    pub first_recent_uid: u32,
    /// No message with a UID below this lacks `SEEN`.
    pub first_unseen_uid_lowwater: u32,
    /// No message with a UID below this has `DELETED`.
    pub first_deleted_uid_lowwater: u32,
    pub log_file_seq: u32,
    /// Where the log must be read from to rebuild this map.
    pub log_file_tail_offset: u32,
    /// The log position this map reflects.
    pub log_file_head_offset: u32,
    pub day_stamp: u32,
}

impl IndexHeader {
    pub fn new(indexid: u32, uid_validity: u32, day_stamp: u32) -> Self {
        IndexHeader {
            major_version: INDEX_MAJOR_VERSION,
            minor_version: INDEX_MINOR_VERSION,
            base_header_size: BASE_HEADER_SIZE,
            header_size: BASE_HEADER_SIZE.into(),
            record_size: BASE_RECORD_SIZE,
            flags: HeaderFlags::empty(),
            indexid,
            uid_validity,
            next_uid: 1,
            messages_count: 0,
            seen_messages_count: 0,
            deleted_messages_count: 0,
            first_recent_uid: 1,
            first_unseen_uid_lowwater: 1,
            first_deleted_uid_lowwater: 1,
            log_file_seq: 0,
            log_file_tail_offset: 0,
            log_file_head_offset: 0,
            day_stamp,
        }
    }

    pub fn encode(&self) -> [u8; BASE_HEADER_SIZE as usize] {
        let mut out = [0u8; BASE_HEADER_SIZE as usize];
        out[0] = self.major_version;
        out[1] = self.minor_version;
        LittleEndian::write_u16(&mut out[2..], BASE_HEADER_SIZE);
        LittleEndian::write_u32(&mut out[4..], self.header_size);
        LittleEndian::write_u16(&mut out[8..], self.record_size);
        LittleEndian::write_u16(&mut out[10..], self.flags.bits());
        LittleEndian::write_u32_into(
            &[
                self.indexid,
                self.uid_validity,
                self.next_uid,
                self.messages_count,
                self.seen_messages_count,
                self.deleted_messages_count,
                self.first_recent_uid,
                self.first_unseen_uid_lowwater,
                self.first_deleted_uid_lowwater,
                self.log_file_seq,
                self.log_file_tail_offset,
                self.log_file_head_offset,
                self.day_stamp,
            ],
            &mut out[12..],
        );
        out
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, Error> {
        let truncated =
            |_| Error::CorruptIndex("truncated index header".to_owned());

        let major_version = data.read_u8().map_err(truncated)?;
        let minor_version = data.read_u8().map_err(truncated)?;
        let base_header_size =
            data.read_u16::<LittleEndian>().map_err(truncated)?;
        if INDEX_MAJOR_VERSION != major_version {
            return Err(Error::CorruptIndex(format!(
                "unsupported major version {}",
                major_version
            )));
        }
        if base_header_size < BASE_HEADER_SIZE {
            return Err(Error::CorruptIndex(format!(
                "base header too small ({})",
                base_header_size
            )));
        }

        let header_size = data.read_u32::<LittleEndian>().map_err(truncated)?;
        let record_size = data.read_u16::<LittleEndian>().map_err(truncated)?;
        let flags = data.read_u16::<LittleEndian>().map_err(truncated)?;
        let mut fields = [0u32; 13];
        data.read_u32_into::<LittleEndian>(&mut fields)
            .map_err(truncated)?;

        Ok(IndexHeader {
            major_version,
            minor_version,
            base_header_size,
            header_size,
            record_size,
            flags: HeaderFlags::from_bits_truncate(flags),
            indexid: fields[0],
            uid_validity: fields[1],
            next_uid: fields[2],
            messages_count: fields[3],
            seen_messages_count: fields[4],
            deleted_messages_count: fields[5],
            first_recent_uid: fields[6],
            first_unseen_uid_lowwater: fields[7],
            first_deleted_uid_lowwater: fields[8],
            log_file_seq: fields[9],
            log_file_tail_offset: fields[10],
            log_file_head_offset: fields[11],
            day_stamp: fields[12],
        })
    }

    /// Apply a HeaderUpdate patch.
    ///
    /// Patches before `HEADER_PATCH_MIN_OFFSET` or past the end of the base
    /// header are rejected. Bytes landing on the derived fields are dropped,
    /// and `next_uid` can never move backwards.
    pub fn patch(&mut self, offset: u16, data: &[u8]) -> Result<(), Error> {
        let start = usize::from(offset);
        let end = start + data.len();
        if offset < HEADER_PATCH_MIN_OFFSET
            || end > usize::from(BASE_HEADER_SIZE)
        {
            return Err(Error::BadHeaderUpdate);
        }

        let before = self.encode();
        let mut patched = before;
        patched[start..end].copy_from_slice(data);
        patched[OFF_DERIVED_START..OFF_DERIVED_END]
            .copy_from_slice(&before[OFF_DERIVED_START..OFF_DERIVED_END]);

        let old_next_uid = self.next_uid;
        *self = IndexHeader::decode(&patched)?;
        self.next_uid = self.next_uid.max(old_next_uid);
        Ok(())
    }

    /// The log position this header's map reflects.
    pub fn head_position(&self) -> LogPosition {
        LogPosition::new(self.log_file_seq, self.log_file_head_offset)
    }

    /// The log position replay must start from to rebuild this map.
    pub fn tail_position(&self) -> LogPosition {
        LogPosition::new(self.log_file_seq, self.log_file_tail_offset)
    }
}

/// Which way `bsearch_uid` resolves a UID that is not present.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Nearest {
    /// Only an exact match.
    Exact,
    /// The first record whose UID is greater.
    Larger,
    /// The last record whose UID is smaller.
    Smaller,
}

/// Borrowed access to one record of a map.
#[derive(Clone, Copy)]
pub struct RecordRef<'a> {
    data: &'a [u8],
}

impl<'a> RecordRef<'a> {
    /// The raw UID, which is 0 only if the map is damaged.
    pub fn raw_uid(&self) -> u32 {
        LittleEndian::read_u32(self.data)
    }

    pub fn uid(&self) -> Option<Uid> {
        Uid::of(self.raw_uid())
    }

    pub fn flags(&self) -> MailFlags {
        MailFlags::from_bits_truncate(self.data[4])
    }

    /// The record data of `ext`, or `None` if the extension has no
    /// per-record data.
    pub fn ext_data(&self, ext: &MapExtension) -> Option<&'a [u8]> {
        if 0 == ext.record_offset {
            return None;
        }

        let start = usize::from(ext.record_offset);
        self.data.get(start..start + usize::from(ext.record_size))
    }

    pub fn raw(&self) -> &'a [u8] {
        self.data
    }
}

/// Hands out generation numbers for the maps of one index.
#[derive(Debug, Default)]
pub struct Generations {
    last: Cell<u64>,
}

impl Generations {
    pub fn next(&self) -> u64 {
        let generation = self.last.get() + 1;
        self.last.set(generation);
        generation
    }
}

/// One generation of the index.
#[derive(Debug)]
pub struct IndexMap {
    hdr: IndexHeader,
    exts: Vec<MapExtension>,
    /// `messages_count * hdr.record_size` bytes.
    records: Vec<u8>,
    generation: u64,
}

impl IndexMap {
    pub fn new(hdr: IndexHeader, generations: &Generations) -> Self {
        IndexMap {
            hdr,
            exts: Vec::new(),
            records: Vec::new(),
            generation: generations.next(),
        }
    }

    /// Make a private, mutable copy of this map under a new generation
    /// number.
    pub fn clone_for_update(&self, generations: &Generations) -> Self {
        IndexMap {
            hdr: self.hdr,
            exts: self.exts.clone(),
            records: self.records.clone(),
            generation: generations.next(),
        }
    }

    pub fn header(&self) -> &IndexHeader {
        &self.hdr
    }

    /// Whether `other` holds exactly the same data, ignoring the generation
    /// number.
    pub fn content_eq(&self, other: &IndexMap) -> bool {
        self.hdr == other.hdr
            && self.exts == other.exts
            && self.records == other.records
    }

    pub(crate) fn header_mut(&mut self) -> &mut IndexHeader {
        &mut self.hdr
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn messages_count(&self) -> u32 {
        self.hdr.messages_count
    }

    fn record_size(&self) -> usize {
        self.hdr.record_size.into()
    }

    pub fn record(&self, ix: usize) -> Option<RecordRef<'_>> {
        let size = self.record_size();
        self.records
            .get(ix * size..(ix + 1) * size)
            .map(|data| RecordRef { data })
    }

    pub fn records(&self) -> impl Iterator<Item = RecordRef<'_>> + '_ {
        self.records
            .chunks_exact(self.record_size())
            .map(|data| RecordRef { data })
    }

    pub(crate) fn record_mut(&mut self, ix: usize) -> &mut [u8] {
        let size = self.record_size();
        &mut self.records[ix * size..(ix + 1) * size]
    }

    pub(crate) fn set_flags(&mut self, ix: usize, flags: MailFlags) {
        self.record_mut(ix)[4] = flags.bits();
    }

    /// Add a record to the end of the map with all extension data zeroed.
    ///
    /// The caller is responsible for UID ordering and for the counters.
    pub(crate) fn push_record(&mut self, uid: Uid, flags: MailFlags) {
        let start = self.records.len();
        self.records.resize(start + self.record_size(), 0);
        LittleEndian::write_u32(&mut self.records[start..], uid.get());
        self.records[start + 4] = flags.bits();
        self.hdr.messages_count += 1;
    }

    /// Remove records `[start, end)`.
    pub(crate) fn remove_records(&mut self, start: usize, end: usize) {
        let size = self.record_size();
        self.records.drain(start * size..end * size);
        self.hdr.messages_count -= (end - start) as u32;
    }

    pub fn extensions(&self) -> &[MapExtension] {
        &self.exts
    }

    pub fn ext_index(&self, name: &str) -> Option<usize> {
        self.exts.iter().position(|e| e.name == name)
    }

    pub fn ext_by_name(&self, name: &str) -> Option<&MapExtension> {
        self.exts.iter().find(|e| e.name == name)
    }

    pub(crate) fn ext_mut(&mut self, ix: usize) -> &mut MapExtension {
        &mut self.exts[ix]
    }

    /// Replace the extension table, re-laying out every record so that each
    /// extension keeps its per-record data where its size permits.
    pub(crate) fn set_extensions(
        &mut self,
        mut exts: Vec<MapExtension>,
    ) -> Result<(), Error> {
        let new_size = usize::from(compute_record_layout(&mut exts)?);
        let old_size = self.record_size();

        let unchanged = new_size == old_size
            && exts.len() >= self.exts.len()
            && self.exts.iter().zip(&exts).all(|(a, b)| {
                a.name == b.name
                    && a.record_offset == b.record_offset
                    && a.record_size == b.record_size
            })
            && exts[self.exts.len()..].iter().all(|e| 0 == e.record_offset);

        if !unchanged {
            let count = self.hdr.messages_count as usize;
            let mut records = vec![0u8; count * new_size];
            for (old, new) in self
                .records
                .chunks_exact(old_size)
                .zip(records.chunks_exact_mut(new_size))
            {
                new[..usize::from(BASE_RECORD_SIZE)].copy_from_slice(
                    &old[..usize::from(BASE_RECORD_SIZE)],
                );
                for ext in &exts {
                    if 0 == ext.record_offset {
                        continue;
                    }
                    let prev = match self
                        .exts
                        .iter()
                        .find(|e| e.name == ext.name && 0 != e.record_offset)
                    {
                        Some(p) => p,
                        None => continue,
                    };
                    let len = prev.record_size.min(ext.record_size);
                    let src = usize::from(prev.record_offset);
                    let dst = usize::from(ext.record_offset);
                    let len = usize::from(len);
                    new[dst..dst + len].copy_from_slice(&old[src..src + len]);
                }
            }
            self.records = records;
        }

        self.hdr.record_size = new_size as u16;
        self.exts = exts;
        self.hdr.header_size = self.ext_table_size() as u32
            + u32::from(BASE_HEADER_SIZE);
        Ok(())
    }

    /// Update `header_size` after an extension header changed size.
    pub(crate) fn update_header_size(&mut self) {
        self.hdr.header_size =
            self.ext_table_size() as u32 + u32::from(BASE_HEADER_SIZE);
    }

    fn ext_table_size(&self) -> usize {
        4 + self
            .exts
            .iter()
            .map(|e| 16 + pad4(e.name.len()) + pad4(e.hdr_data.len()))
            .sum::<usize>()
    }

    /// The names of all keywords known to this map, in bitmap order.
    pub fn keyword_names(&self) -> Vec<&str> {
        match self.ext_by_name(KEYWORDS_EXT_NAME) {
            None => Vec::new(),
            Some(ext) => parse_keyword_names(&ext.hdr_data),
        }
    }

    /// The keywords set on the record at `ix`.
    pub fn record_keywords(&self, ix: usize) -> Vec<&str> {
        let ext = match self.ext_by_name(KEYWORDS_EXT_NAME) {
            Some(e) => e,
            None => return Vec::new(),
        };
        let bitmap = match self.record(ix).and_then(|r| r.ext_data(ext)) {
            Some(b) => b,
            None => return Vec::new(),
        };

        parse_keyword_names(&ext.hdr_data)
            .into_iter()
            .enumerate()
            .filter(|&(bit, _)| test_bit(bitmap, bit))
            .map(|(_, name)| name)
            .collect()
    }

    /// Find the index of `uid`, or of its neighbour according to `nearest`.
    pub fn bsearch_uid(&self, uid: Uid, nearest: Nearest) -> Option<usize> {
        let count = self.hdr.messages_count as usize;
        let uid = uid.get();
        let mut lo = 0;
        let mut hi = count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let mid_uid = self.record(mid).map_or(0, |r| r.raw_uid());
            if mid_uid == uid {
                return Some(mid);
            } else if mid_uid < uid {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        // `lo` is now the index of the first greater UID
        match nearest {
            Nearest::Exact => None,
            Nearest::Larger => Some(lo).filter(|&ix| ix < count),
            Nearest::Smaller => lo.checked_sub(1),
        }
    }

    /// Translate a UID range into the sequence numbers of the messages in
    /// it.
    ///
    /// The lower bound resolves to the first message at or above `first`,
    /// the upper bound to the last message at or below `last`. Returns
    /// `None` if no message falls in the range.
    pub fn lookup_uid_range(
        &self,
        first: Uid,
        last: Uid,
    ) -> Option<(Seqnum, Seqnum)> {
        let count = self.hdr.messages_count as usize;
        if first > last || 0 == count {
            return None;
        }

        // UID 1 can only be the first message
        let first_ix = if Uid::MIN == first {
            0
        } else {
            self.bsearch_uid(first, Nearest::Larger)?
        };
        if self.record(first_ix)?.raw_uid() > last.get() {
            return None;
        }

        let last_ix = if last.get() >= self.hdr.next_uid.saturating_sub(1) {
            count - 1
        } else if first == last {
            first_ix
        } else {
            self.bsearch_uid(last, Nearest::Smaller)?
        };

        Some((Seqnum::from_index(first_ix), Seqnum::from_index(last_ix)))
    }

    /// Find the first message where `flags & mask == want`.
    ///
    /// The scan starts at the highest low-water mark that applies to the
    /// predicate, since no message below it can match.
    pub fn lookup_first(
        &self,
        want: MailFlags,
        mask: MailFlags,
    ) -> Option<Seqnum> {
        let want = want & mask;
        let mut low_uid = 1;
        if mask.contains(MailFlags::RECENT) && want.contains(MailFlags::RECENT)
        {
            low_uid = low_uid.max(self.hdr.first_recent_uid);
        }
        if mask.contains(MailFlags::SEEN) && !want.contains(MailFlags::SEEN) {
            low_uid = low_uid.max(self.hdr.first_unseen_uid_lowwater);
        }
        if mask.contains(MailFlags::DELETED)
            && want.contains(MailFlags::DELETED)
        {
            low_uid = low_uid.max(self.hdr.first_deleted_uid_lowwater);
        }

        if low_uid >= self.hdr.next_uid {
            return None;
        }

        let start = Uid::of(low_uid)?;
        let last = Uid::of(self.hdr.next_uid.saturating_sub(1))?;
        let (first_seq, _) = self.lookup_uid_range(start, last)?;
        self.records()
            .enumerate()
            .skip(first_seq.to_index())
            .find(|(_, r)| r.flags() & mask == want)
            .map(|(ix, _)| Seqnum::from_index(ix))
    }

    /// Compute the exact low-water mark for records satisfying `pred`,
    /// starting the search at record `from`.
    pub(crate) fn scan_lowwater(
        &self,
        from: usize,
        pred: impl Fn(MailFlags) -> bool,
    ) -> u32 {
        self.records()
            .skip(from)
            .find(|r| pred(r.flags()))
            .map_or(self.hdr.next_uid, |r| r.raw_uid())
    }

    /// The header with every counter and low-water mark recomputed from the
    /// records themselves.
    pub fn recount_header(&self) -> IndexHeader {
        let mut hdr = self.hdr;
        hdr.messages_count = self.records().count() as u32;
        hdr.seen_messages_count = self
            .records()
            .filter(|r| r.flags().contains(MailFlags::SEEN))
            .count() as u32;
        hdr.deleted_messages_count = self
            .records()
            .filter(|r| r.flags().contains(MailFlags::DELETED))
            .count() as u32;
        hdr.first_recent_uid =
            self.scan_lowwater(0, |f| f.contains(MailFlags::RECENT));
        hdr.first_unseen_uid_lowwater =
            self.scan_lowwater(0, |f| !f.contains(MailFlags::SEEN));
        hdr.first_deleted_uid_lowwater =
            self.scan_lowwater(0, |f| f.contains(MailFlags::DELETED));
        hdr
    }

    /// Validate every invariant a map must uphold.
    pub fn check(&self) -> Result<(), Error> {
        let corrupt = |msg: String| Err(Error::CorruptIndex(msg));

        if self.hdr.flags.contains(HeaderFlags::CORRUPTED) {
            return corrupt("map is flagged as corrupted".to_owned());
        }
        if self.records.len()
            != self.hdr.messages_count as usize * self.record_size()
        {
            return corrupt(format!(
                "{} bytes of records for {} messages of {} bytes",
                self.records.len(),
                self.hdr.messages_count,
                self.hdr.record_size
            ));
        }

        let mut exts = self.exts.clone();
        let record_size = compute_record_layout(&mut exts)?;
        if record_size != self.hdr.record_size || exts != self.exts {
            return corrupt("extension layout is inconsistent".to_owned());
        }

        let mut prev_uid = 0;
        let mut seen = 0;
        let mut deleted = 0;
        for r in self.records() {
            let uid = r.raw_uid();
            if 0 == uid {
                return corrupt("record with UID 0".to_owned());
            }
            if uid <= prev_uid {
                return corrupt(format!(
                    "UID {} follows UID {}",
                    uid, prev_uid
                ));
            }
            if uid >= self.hdr.next_uid {
                return corrupt(format!(
                    "UID {} is not below next_uid {}",
                    uid, self.hdr.next_uid
                ));
            }
            prev_uid = uid;

            let flags = r.flags();
            if flags.contains(MailFlags::SEEN) {
                seen += 1;
            }
            if flags.contains(MailFlags::DELETED) {
                deleted += 1;
            }
        }

        if seen != self.hdr.seen_messages_count
            || deleted != self.hdr.deleted_messages_count
        {
            return corrupt("message counters are wrong".to_owned());
        }

        let lowwaters = [
            (
                self.hdr.first_recent_uid,
                self.scan_lowwater(0, |f| f.contains(MailFlags::RECENT)),
            ),
            (
                self.hdr.first_unseen_uid_lowwater,
                self.scan_lowwater(0, |f| !f.contains(MailFlags::SEEN)),
            ),
            (
                self.hdr.first_deleted_uid_lowwater,
                self.scan_lowwater(0, |f| f.contains(MailFlags::DELETED)),
            ),
        ];
        if lowwaters.iter().any(|&(have, want)| have > want) {
            return corrupt("low-water mark is too high".to_owned());
        }

        Ok(())
    }

    /// Serialise this map in the snapshot format.
    ///
    /// The snapshot covers everything up to the map's head position, so that
    /// also becomes its tail.
    pub fn encode_snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            self.hdr.header_size as usize + self.records.len(),
        );
        let mut hdr = self.hdr;
        hdr.log_file_tail_offset = hdr.log_file_head_offset;
        out.extend_from_slice(&hdr.encode());

        // Writes to a Vec can't fail
        let _ = out.write_u32::<LittleEndian>(self.exts.len() as u32);
        for ext in &self.exts {
            let _ = out.write_u32::<LittleEndian>(ext.reset_id);
            let _ = out.write_u32::<LittleEndian>(ext.hdr_size());
            let _ = out.write_u16::<LittleEndian>(ext.record_size);
            let _ = out.write_u16::<LittleEndian>(ext.record_align);
            let _ = out.write_u16::<LittleEndian>(ext.record_offset);
            let _ = out.write_u16::<LittleEndian>(ext.name.len() as u16);
            write_padded(&mut out, ext.name.as_bytes());
            write_padded(&mut out, &ext.hdr_data);
        }

        out.extend_from_slice(&self.records);
        out
    }

    /// Load a map from the snapshot format.
    ///
    /// This only checks that the data is well-formed; call `check()` to
    /// validate the map's invariants.
    pub fn decode_snapshot(
        data: &[u8],
        generations: &Generations,
    ) -> Result<Self, Error> {
        let hdr = IndexHeader::decode(data)?;
        let mut r = data
            .get(usize::from(hdr.base_header_size)..)
            .ok_or_else(|| truncated("index header"))?;

        let ext_count = r
            .read_u32::<LittleEndian>()
            .map_err(|_| truncated("extension table"))?;
        let mut exts = Vec::new();
        for _ in 0..ext_count {
            let mut fixed = [0u8; 16];
            std::io::Read::read_exact(&mut r, &mut fixed)
                .map_err(|_| truncated("extension table"))?;
            let reset_id = LittleEndian::read_u32(&fixed[0..]);
            let hdr_size = LittleEndian::read_u32(&fixed[4..]) as usize;
            let record_size = LittleEndian::read_u16(&fixed[8..]);
            let record_align = LittleEndian::read_u16(&fixed[10..]);
            let record_offset = LittleEndian::read_u16(&fixed[12..]);
            let name_size = usize::from(LittleEndian::read_u16(&fixed[14..]));

            let name = read_padded(&mut r, name_size)?;
            let name = String::from_utf8(name).map_err(|_| {
                Error::CorruptIndex("non-UTF-8 extension name".to_owned())
            })?;
            let hdr_data = read_padded(&mut r, hdr_size)?;
            exts.push(MapExtension {
                name,
                reset_id,
                record_size,
                record_align: record_align.max(1),
                record_offset,
                hdr_data,
            });
        }

        let header_len = data.len() - r.len();
        if header_len != hdr.header_size as usize {
            return Err(Error::CorruptIndex(format!(
                "header is {} bytes, but header_size is {}",
                header_len, hdr.header_size
            )));
        }

        let records_len = usize::try_from(
            u64::from(hdr.messages_count) * u64::from(hdr.record_size),
        )
        .map_err(|_| truncated("records"))?;
        if r.len() != records_len || 0 == hdr.record_size {
            return Err(Error::CorruptIndex(format!(
                "expected {} bytes of records, found {}",
                records_len,
                r.len()
            )));
        }

        Ok(IndexMap {
            hdr,
            exts,
            records: r.to_vec(),
            generation: generations.next(),
        })
    }
}

fn truncated(what: &str) -> Error {
    Error::CorruptIndex(format!("truncated {}", what))
}

fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

fn write_padded(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(data);
    out.resize(out.len() + pad4(data.len()) - data.len(), 0);
}

fn read_padded(r: &mut &[u8], len: usize) -> Result<Vec<u8>, Error> {
    let padded = pad4(len);
    if r.len() < padded {
        return Err(truncated("extension table"));
    }
    let data = r[..len].to_vec();
    *r = &r[padded..];
    Ok(data)
}

pub(crate) fn parse_keyword_names(hdr_data: &[u8]) -> Vec<&str> {
    hdr_data
        .split(|&b| 0 == b)
        .filter(|name| !name.is_empty())
        .filter_map(|name| std::str::from_utf8(name).ok())
        .collect()
}

pub(crate) fn test_bit(bitmap: &[u8], bit: usize) -> bool {
    bitmap
        .get(bit / 8)
        .map_or(false, |&byte| 0 != byte & (1 << (bit % 8)))
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn map_with(uids: &[u32], flags: &[MailFlags]) -> IndexMap {
        let mut map =
            IndexMap::new(IndexHeader::new(1, 1, 0), &Generations::default());
        for (&uid, &f) in uids.iter().zip(flags.iter().cycle()) {
            map.push_record(Uid::u(uid), f);
            map.hdr.next_uid = uid + 1;
            if f.contains(MailFlags::SEEN) {
                map.hdr.seen_messages_count += 1;
            }
            if f.contains(MailFlags::DELETED) {
                map.hdr.deleted_messages_count += 1;
            }
        }
        map.hdr.first_recent_uid =
            map.scan_lowwater(0, |f| f.contains(MailFlags::RECENT));
        map.hdr.first_unseen_uid_lowwater =
            map.scan_lowwater(0, |f| !f.contains(MailFlags::SEEN));
        map.hdr.first_deleted_uid_lowwater =
            map.scan_lowwater(0, |f| f.contains(MailFlags::DELETED));
        map
    }

    fn s(seqnum: u32) -> Seqnum {
        Seqnum::u(seqnum)
    }

    #[test]
    fn header_layout() {
        let mut hdr = IndexHeader::new(0xdeadbeef, 1234, 5);
        hdr.next_uid = 10;
        let data = hdr.encode();
        assert_eq!(64, data.len());
        assert_eq!(&[1, 0, 64, 0, 64, 0, 0, 0, 8, 0, 0, 0], &data[..12]);
        assert_eq!(&[0xef, 0xbe, 0xad, 0xde], &data[12..16]);
        assert_eq!(hdr, IndexHeader::decode(&data).unwrap());
    }

    #[test]
    fn header_patch_rules() {
        let mut hdr = IndexHeader::new(1, 1, 0);
        hdr.next_uid = 10;
        hdr.messages_count = 3;

        assert_matches!(Err(Error::BadHeaderUpdate), hdr.patch(12, &[0; 4]));
        assert_matches!(Err(Error::BadHeaderUpdate), hdr.patch(62, &[0; 4]));

        hdr.patch(16, &99u32.to_le_bytes()).unwrap();
        assert_eq!(99, hdr.uid_validity);

        // Counters are derived and can't be patched
        hdr.patch(24, &7u32.to_le_bytes()).unwrap();
        assert_eq!(3, hdr.messages_count);

        // next_uid only moves forwards
        hdr.patch(20, &5u32.to_le_bytes()).unwrap();
        assert_eq!(10, hdr.next_uid);
        hdr.patch(20, &50u32.to_le_bytes()).unwrap();
        assert_eq!(50, hdr.next_uid);
    }

    #[test]
    fn uid_range_lookup() {
        let map = map_with(&[1, 3, 5, 7], &[MailFlags::empty()]);
        let r = |a, b| map.lookup_uid_range(Uid::u(a), Uid::u(b));

        assert_eq!(Some((s(1), s(1))), r(1, 1));
        assert_eq!(Some((s(2), s(2))), r(3, 3));
        assert_eq!(None, r(4, 4));
        assert_eq!(Some((s(2), s(3))), r(2, 6));
        assert_eq!(Some((s(3), s(4))), r(4, 7));
        assert_eq!(Some((s(1), s(4))), r(1, 1000));
        assert_eq!(None, r(8, 100));
        assert_eq!(None, r(5, 3));

        let map = map_with(&[4, 6], &[MailFlags::empty()]);
        assert_eq!(None, map.lookup_uid_range(Uid::u(1), Uid::u(1)));
        assert_eq!(None, map.lookup_uid_range(Uid::u(2), Uid::u(2)));
        assert_eq!(
            Some((s(1), s(1))),
            map.lookup_uid_range(Uid::u(1), Uid::u(5))
        );
    }

    #[test]
    fn lookup_first_uses_lowwater() {
        let map = map_with(
            &[1, 2, 3],
            &[MailFlags::empty(), MailFlags::SEEN, MailFlags::empty()],
        );
        assert_eq!(1, map.header().first_unseen_uid_lowwater);
        assert_eq!(
            Some(s(1)),
            map.lookup_first(MailFlags::empty(), MailFlags::SEEN)
        );
        assert_eq!(
            Some(s(2)),
            map.lookup_first(MailFlags::SEEN, MailFlags::SEEN)
        );
        assert_eq!(
            None,
            map.lookup_first(MailFlags::DELETED, MailFlags::DELETED)
        );

        let map = map_with(
            &[1, 2, 3, 4],
            &[
                MailFlags::SEEN,
                MailFlags::SEEN | MailFlags::DELETED,
                MailFlags::empty(),
            ],
        );
        assert_eq!(3, map.header().first_unseen_uid_lowwater);
        assert_eq!(
            Some(s(3)),
            map.lookup_first(MailFlags::empty(), MailFlags::SEEN)
        );
        assert_eq!(
            Some(s(2)),
            map.lookup_first(MailFlags::DELETED, MailFlags::DELETED)
        );
    }

    #[test]
    fn relayout_preserves_ext_data() {
        let mut map = map_with(&[1, 2], &[MailFlags::SEEN]);
        map.set_extensions(vec![MapExtension::new("a", 1, 0, 2, 2)])
            .unwrap();
        assert_eq!(12, map.header().record_size);
        let a_off = usize::from(map.extensions()[0].record_offset);
        map.record_mut(1)[a_off..a_off + 2].copy_from_slice(&[7, 8]);

        let mut exts = map.extensions().to_vec();
        exts.insert(0, MapExtension::new("b", 1, 4, 8, 8));
        map.set_extensions(exts).unwrap();
        assert_eq!(20, map.header().record_size);
        let a = map.ext_by_name("a").unwrap().clone();
        assert_eq!(Some(&[7u8, 8][..]), map.record(1).unwrap().ext_data(&a));
        assert_eq!(Some(&[0u8, 0][..]), map.record(0).unwrap().ext_data(&a));
        assert_eq!(Some(Uid::u(2)), map.record(1).unwrap().uid());
        assert_eq!(MailFlags::SEEN, map.record(1).unwrap().flags());
        map.check().unwrap();
    }

    #[test]
    fn snapshot_round_trip_and_damage() {
        let gens = Generations::default();
        let mut map = map_with(&[2, 9, 10], &[MailFlags::DELETED]);
        map.set_extensions(vec![
            MapExtension::new(KEYWORDS_EXT_NAME, 1, 0, 4, 4),
            MapExtension::new("hdr", 3, 5, 0, 1),
        ])
        .unwrap();
        map.ext_mut(0).hdr_data = b"$Junk\0".to_vec();
        map.update_header_size();
        map.record_mut(2)[8] = 1;
        map.check().unwrap();

        let data = map.encode_snapshot();
        assert_eq!(map.header().header_size as usize + 3 * 12, data.len());
        let loaded = IndexMap::decode_snapshot(&data, &gens).unwrap();
        assert_ne!(
            loaded.generation(),
            IndexMap::decode_snapshot(&data, &gens).unwrap().generation()
        );
        assert_eq!(map.header(), loaded.header());
        assert_eq!(map.extensions(), loaded.extensions());
        assert_eq!(vec!["$Junk"], loaded.keyword_names());
        assert_eq!(vec!["$Junk"], loaded.record_keywords(2));
        assert!(loaded.record_keywords(1).is_empty());
        loaded.check().unwrap();

        assert_matches!(
            Err(Error::CorruptIndex(_)),
            IndexMap::decode_snapshot(&data[..data.len() - 1], &gens)
        );

        let mut damaged = data.clone();
        let rec0 = map.header().header_size as usize;
        damaged[rec0..rec0 + 4].copy_from_slice(&0u32.to_le_bytes());
        let damaged = IndexMap::decode_snapshot(&damaged, &gens).unwrap();
        assert_matches!(Err(Error::CorruptIndex(_)), damaged.check());
    }

    proptest! {
        #[test]
        fn uid_range_matches_linear_scan(
            uids in prop::collection::btree_set(1u32..200, 1..40),
            a in 1u32..210,
            b in 1u32..210,
        ) {
            let uids = uids.into_iter().collect::<Vec<_>>();
            let map = map_with(&uids, &[MailFlags::empty()]);

            let matching = uids.iter().enumerate()
                .filter(|&(_, &u)| u >= a && u <= b)
                .map(|(ix, _)| ix)
                .collect::<Vec<_>>();
            let expected = if matching.is_empty() {
                None
            } else {
                Some((
                    Seqnum::from_index(matching[0]),
                    Seqnum::from_index(matching[matching.len() - 1]),
                ))
            };
            prop_assert_eq!(
                expected, map.lookup_uid_range(Uid::u(a), Uid::u(b)));

            for (ix, &u) in uids.iter().enumerate() {
                let seq = Seqnum::from_index(ix);
                prop_assert_eq!(
                    Some((seq, seq)),
                    map.lookup_uid_range(Uid::u(u), Uid::u(u)));
            }
            if uids[0] > 1 {
                prop_assert_eq!(
                    None,
                    map.lookup_uid_range(
                        Uid::u(uids[0] - 1), Uid::u(uids[0] - 1)));
            }
        }
    }
}
