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

//! The binary format of transaction log files.
//!
//! # File header
//!
//! All integers are little-endian.
//!
//! - u8: major version (1)
//! - u8: minor version (0)
//! - u16: header size, at least 24; readers skip anything past the fields
//!   they know
//! - u32: indexid of the index the log belongs to
//! - u32: sequence number of this file
//! - u32: sequence number of the previous file, 0 if none
//! - u32: size of the previous file when this one was created
//! - u32: UNIX time of creation
//!
//! # Records
//!
//! The rest of the file is a sequence of records, each a u32 total size
//! (including this 8-byte header and trailing padding) and a u32 type,
//! followed by the payload. Every record is padded to a multiple of 4 bytes.
//!
//! The low 16 bits of the type hold exactly one record type. Expunge records
//! additionally carry `EXPUNGE_PROT` in those bits so that a damaged type
//! field is very unlikely to turn into a valid expunge. Bit 28 (`EXTERNAL`)
//! marks changes which were already made by the synchroniser and only
//! recorded here.
//!
//! Within a payload, UID ranges are `{uid1:u32, uid2:u32}` with
//! `0 < uid1 <= uid2`, and variable-length strings and data are padded to a
//! multiple of 4 bytes.

use std::io::{self, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::model::{MailFlags, ModifyType, Uid, UidRange};
use crate::support::error::Error;

pub const LOG_MAJOR_VERSION: u8 = 1;
pub const LOG_MINOR_VERSION: u8 = 0;
pub const LOG_HEADER_MIN_SIZE: u16 = 24;
pub const TX_HEADER_SIZE: u32 = 8;

pub const TYPE_EXPUNGE: u32 = 0x0000_0001;
pub const TYPE_APPEND: u32 = 0x0000_0002;
pub const TYPE_FLAG_UPDATE: u32 = 0x0000_0004;
pub const TYPE_HEADER_UPDATE: u32 = 0x0000_0020;
pub const TYPE_EXT_INTRO: u32 = 0x0000_0040;
pub const TYPE_EXT_RESET: u32 = 0x0000_0080;
pub const TYPE_EXT_HDR_UPDATE: u32 = 0x0000_0100;
pub const TYPE_EXT_REC_UPDATE: u32 = 0x0000_0200;
pub const TYPE_KEYWORD_UPDATE: u32 = 0x0000_0400;
pub const TYPE_KEYWORD_RESET: u32 = 0x0000_0800;
pub const TYPE_MASK: u32 = 0x0000_ffff;
pub const TYPE_EXPUNGE_PROT: u32 = 0x0000_cd90;
pub const TYPE_EXTERNAL: u32 = 0x1000_0000;

/// `ext_id` value in an ExtIntro meaning "introduce by name".
pub const EXT_ID_NEW: u32 = 0xffff_ffff;

fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

fn write_padding(out: &mut Vec<u8>, start: usize) {
    while 0 != (out.len() - start) % 4 {
        out.push(0);
    }
}

fn truncated(what: &str) -> impl FnOnce(io::Error) -> Error + '_ {
    move |_| Error::CorruptLog(format!("truncated {}", what))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogFileHeader {
    pub major_version: u8,
    pub minor_version: u8,
    pub hdr_size: u16,
    pub indexid: u32,
    pub file_seq: u32,
    pub prev_file_seq: u32,
    pub prev_file_offset: u32,
    pub create_stamp: u32,
}

impl LogFileHeader {
    pub fn new(
        indexid: u32,
        file_seq: u32,
        prev_file_seq: u32,
        prev_file_offset: u32,
        create_stamp: u32,
    ) -> Self {
        LogFileHeader {
            major_version: LOG_MAJOR_VERSION,
            minor_version: LOG_MINOR_VERSION,
            hdr_size: LOG_HEADER_MIN_SIZE,
            indexid,
            file_seq,
            prev_file_seq,
            prev_file_offset,
            create_stamp,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.major_version);
        out.push(self.minor_version);
        // Writes to a Vec can't fail
        let _ = out.write_u16::<LittleEndian>(LOG_HEADER_MIN_SIZE);
        for &v in &[
            self.indexid,
            self.file_seq,
            self.prev_file_seq,
            self.prev_file_offset,
            self.create_stamp,
        ] {
            let _ = out.write_u32::<LittleEndian>(v);
        }
    }

    /// Decode the header at the start of `data`.
    ///
    /// `data` may contain the rest of the file as well.
    pub fn decode(mut data: &[u8]) -> Result<Self, Error> {
        let avail = data.len();
        let major_version = data.read_u8().map_err(truncated("header"))?;
        let minor_version = data.read_u8().map_err(truncated("header"))?;
        let hdr_size = data
            .read_u16::<LittleEndian>()
            .map_err(truncated("header"))?;

        if LOG_MAJOR_VERSION != major_version {
            return Err(Error::CorruptLog(format!(
                "unsupported major version {}",
                major_version
            )));
        }
        if hdr_size < LOG_HEADER_MIN_SIZE || usize::from(hdr_size) > avail {
            return Err(Error::CorruptLog(format!(
                "bad header size {}",
                hdr_size
            )));
        }

        let mut fields = [0u32; 5];
        for f in &mut fields {
            *f = data
                .read_u32::<LittleEndian>()
                .map_err(truncated("header"))?;
        }

        Ok(LogFileHeader {
            major_version,
            minor_version,
            hdr_size,
            indexid: fields[0],
            file_seq: fields[1],
            prev_file_seq: fields[2],
            prev_file_offset: fields[3],
            create_stamp: fields[4],
        })
    }
}

/// The kind of a log record, with the protection and external bits removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxKind {
    Expunge,
    Append,
    FlagUpdate,
    HeaderUpdate,
    ExtIntro,
    ExtReset,
    ExtHdrUpdate,
    ExtRecUpdate,
    KeywordUpdate,
    KeywordReset,
}

impl TxKind {
    fn type_bits(self) -> u32 {
        match self {
            TxKind::Expunge => TYPE_EXPUNGE | TYPE_EXPUNGE_PROT,
            TxKind::Append => TYPE_APPEND,
            TxKind::FlagUpdate => TYPE_FLAG_UPDATE,
            TxKind::HeaderUpdate => TYPE_HEADER_UPDATE,
            TxKind::ExtIntro => TYPE_EXT_INTRO,
            TxKind::ExtReset => TYPE_EXT_RESET,
            TxKind::ExtHdrUpdate => TYPE_EXT_HDR_UPDATE,
            TxKind::ExtRecUpdate => TYPE_EXT_REC_UPDATE,
            TxKind::KeywordUpdate => TYPE_KEYWORD_UPDATE,
            TxKind::KeywordReset => TYPE_KEYWORD_RESET,
        }
    }

    /// Interpret the raw type field of a record.
    pub fn from_type(raw: u32) -> Result<Self, Error> {
        let mut bits = raw & TYPE_MASK;
        if 0 != bits & TYPE_EXPUNGE {
            if TYPE_EXPUNGE_PROT != bits & TYPE_EXPUNGE_PROT {
                return Err(Error::CorruptLog(format!(
                    "expunge record without protection bits (type {:#x})",
                    raw
                )));
            }
            bits &= !TYPE_EXPUNGE_PROT;
        }

        Ok(match bits {
            TYPE_EXPUNGE => TxKind::Expunge,
            TYPE_APPEND => TxKind::Append,
            TYPE_FLAG_UPDATE => TxKind::FlagUpdate,
            TYPE_HEADER_UPDATE => TxKind::HeaderUpdate,
            TYPE_EXT_INTRO => TxKind::ExtIntro,
            TYPE_EXT_RESET => TxKind::ExtReset,
            TYPE_EXT_HDR_UPDATE => TxKind::ExtHdrUpdate,
            TYPE_EXT_REC_UPDATE => TxKind::ExtRecUpdate,
            TYPE_KEYWORD_UPDATE => TxKind::KeywordUpdate,
            TYPE_KEYWORD_RESET => TxKind::KeywordReset,
            _ => {
                return Err(Error::CorruptLog(format!(
                    "unknown record type {:#x}",
                    raw
                )))
            }
        })
    }
}

/// The 8-byte header preceding every log record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxHeader {
    /// Total size of the record, including this header and padding.
    pub size: u32,
    pub kind: TxKind,
    pub external: bool,
}

impl TxHeader {
    pub fn decode(mut data: &[u8]) -> Result<Self, Error> {
        let size = data
            .read_u32::<LittleEndian>()
            .map_err(truncated("record header"))?;
        let raw = data
            .read_u32::<LittleEndian>()
            .map_err(truncated("record header"))?;
        if size < TX_HEADER_SIZE || 0 != size % 4 {
            return Err(Error::CorruptLog(format!("bad record size {}", size)));
        }

        Ok(TxHeader {
            size,
            kind: TxKind::from_type(raw)?,
            external: 0 != raw & TYPE_EXTERNAL,
        })
    }

    pub fn raw_type(&self) -> u32 {
        self.kind.type_bits() | if self.external { TYPE_EXTERNAL } else { 0 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppendRecord {
    pub uid: Uid,
    pub flags: MailFlags,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlagUpdate {
    pub range: UidRange,
    pub add: MailFlags,
    pub remove: MailFlags,
}

/// A patch of the base header or of an extension header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderPatch {
    pub offset: u16,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtIntro {
    /// The extension's index within the map, or `None` to introduce it by
    /// name.
    pub ext_id: Option<u32>,
    pub reset_id: u32,
    pub hdr_size: u32,
    pub record_size: u16,
    pub record_align: u16,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtRecEntry {
    pub uid: Uid,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeywordUpdate {
    pub modify: ModifyType,
    pub name: String,
    pub ranges: Vec<UidRange>,
}

/// A decoded log record payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transaction {
    Expunge(Vec<UidRange>),
    Append(Vec<AppendRecord>),
    FlagUpdate(Vec<FlagUpdate>),
    HeaderUpdate(Vec<HeaderPatch>),
    ExtIntro(ExtIntro),
    ExtReset { new_reset_id: u32 },
    ExtHdrUpdate(Vec<HeaderPatch>),
    ExtRecUpdate(Vec<ExtRecEntry>),
    KeywordUpdate(KeywordUpdate),
    KeywordReset(Vec<UidRange>),
}

impl Transaction {
    pub fn kind(&self) -> TxKind {
        match *self {
            Transaction::Expunge(..) => TxKind::Expunge,
            Transaction::Append(..) => TxKind::Append,
            Transaction::FlagUpdate(..) => TxKind::FlagUpdate,
            Transaction::HeaderUpdate(..) => TxKind::HeaderUpdate,
            Transaction::ExtIntro(..) => TxKind::ExtIntro,
            Transaction::ExtReset { .. } => TxKind::ExtReset,
            Transaction::ExtHdrUpdate(..) => TxKind::ExtHdrUpdate,
            Transaction::ExtRecUpdate(..) => TxKind::ExtRecUpdate,
            Transaction::KeywordUpdate(..) => TxKind::KeywordUpdate,
            Transaction::KeywordReset(..) => TxKind::KeywordReset,
        }
    }

    /// Append this record, header included, to `out`.
    pub fn encode(&self, external: bool, out: &mut Vec<u8>) {
        let start = out.len();
        // Placeholder for the size
        out.extend_from_slice(&[0u8; 4]);
        let hdr = TxHeader {
            size: 0,
            kind: self.kind(),
            external,
        };
        let _ = out.write_u32::<LittleEndian>(hdr.raw_type());

        match *self {
            Transaction::Expunge(ref ranges)
            | Transaction::KeywordReset(ref ranges) => {
                for range in ranges {
                    write_range(out, range);
                }
            }

            Transaction::Append(ref records) => {
                for rec in records {
                    let _ = out.write_u32::<LittleEndian>(rec.uid.get());
                    out.push(rec.flags.bits());
                    out.extend_from_slice(&[0u8; 3]);
                }
            }

            Transaction::FlagUpdate(ref updates) => {
                for u in updates {
                    write_range(out, &u.range);
                    out.push(u.add.bits());
                    out.push(u.remove.bits());
                    out.extend_from_slice(&[0u8; 2]);
                }
            }

            Transaction::HeaderUpdate(ref patches)
            | Transaction::ExtHdrUpdate(ref patches) => {
                for p in patches {
                    let _ = out.write_u16::<LittleEndian>(p.offset);
                    let _ = out.write_u16::<LittleEndian>(p.data.len() as u16);
                    out.extend_from_slice(&p.data);
                    write_padding(out, start);
                }
            }

            Transaction::ExtIntro(ref intro) => {
                let _ = out.write_u32::<LittleEndian>(
                    intro.ext_id.unwrap_or(EXT_ID_NEW),
                );
                let _ = out.write_u32::<LittleEndian>(intro.reset_id);
                let _ = out.write_u32::<LittleEndian>(intro.hdr_size);
                let _ = out.write_u16::<LittleEndian>(intro.record_size);
                let _ = out.write_u16::<LittleEndian>(intro.record_align);
                let _ = out.write_u16::<LittleEndian>(0);
                let _ =
                    out.write_u16::<LittleEndian>(intro.name.len() as u16);
                out.extend_from_slice(intro.name.as_bytes());
                write_padding(out, start);
            }

            Transaction::ExtReset { new_reset_id } => {
                let _ = out.write_u32::<LittleEndian>(new_reset_id);
            }

            Transaction::ExtRecUpdate(ref entries) => {
                for e in entries {
                    let _ = out.write_u32::<LittleEndian>(e.uid.get());
                    out.extend_from_slice(&e.data);
                    write_padding(out, start);
                }
            }

            Transaction::KeywordUpdate(ref ku) => {
                out.push(ku.modify.to_wire());
                out.push(0);
                let _ = out.write_u16::<LittleEndian>(ku.name.len() as u16);
                out.extend_from_slice(ku.name.as_bytes());
                write_padding(out, start);
                for range in &ku.ranges {
                    write_range(out, range);
                }
            }
        }

        write_padding(out, start);
        let size = (out.len() - start) as u32;
        out[start..start + 4].copy_from_slice(&size.to_le_bytes());
    }
}

fn write_range(out: &mut Vec<u8>, range: &UidRange) {
    let _ = out.write_u32::<LittleEndian>(range.first.get());
    let _ = out.write_u32::<LittleEndian>(range.last.get());
}

fn read_uid(r: &mut &[u8], what: &str) -> Result<Uid, Error> {
    let raw = r.read_u32::<LittleEndian>().map_err(truncated(what))?;
    Uid::of(raw)
        .ok_or_else(|| Error::CorruptLog(format!("invalid UID {} in {}", raw, what)))
}

fn read_range(r: &mut &[u8], what: &str) -> Result<UidRange, Error> {
    let first = read_uid(r, what)?;
    let last = read_uid(r, what)?;
    if first > last {
        return Err(Error::CorruptLog(format!(
            "inverted UID range {}..{} in {}",
            first, last, what
        )));
    }
    Ok(UidRange::new(first, last))
}

fn read_ranges(mut r: &[u8], what: &str) -> Result<Vec<UidRange>, Error> {
    if 0 != r.len() % 8 {
        return Err(Error::CorruptLog(format!("bad {} size", what)));
    }

    let mut ranges = Vec::with_capacity(r.len() / 8);
    while !r.is_empty() {
        ranges.push(read_range(&mut r, what)?);
    }
    Ok(ranges)
}

fn read_padded(r: &mut &[u8], len: usize, what: &str) -> Result<Vec<u8>, Error> {
    let padded = pad4(len);
    if r.len() < len {
        return Err(Error::CorruptLog(format!("truncated {}", what)));
    }
    let data = r[..len].to_vec();
    // The final padding of a record may be absent if the payload itself ends
    // the record.
    *r = &r[padded.min(r.len())..];
    Ok(data)
}

fn read_patches(mut r: &[u8], what: &str) -> Result<Vec<HeaderPatch>, Error> {
    let mut patches = Vec::new();
    while !r.is_empty() {
        let offset = r.read_u16::<LittleEndian>().map_err(truncated(what))?;
        let size = r.read_u16::<LittleEndian>().map_err(truncated(what))?;
        let data = read_padded(&mut r, size.into(), what)?;
        patches.push(HeaderPatch { offset, data });
    }
    Ok(patches)
}

fn read_name(r: &mut &[u8], len: usize, what: &str) -> Result<String, Error> {
    let raw = read_padded(r, len, what)?;
    String::from_utf8(raw)
        .map_err(|_| Error::CorruptLog(format!("non-UTF-8 name in {}", what)))
}

/// Decodes record payloads.
///
/// ExtRecUpdate entries do not carry their own size; it is the record size
/// of the most recently introduced extension, so the decoder tracks
/// ExtIntro records as it goes. A decoder must therefore see every record of
/// a log in order.
#[derive(Clone, Debug, Default)]
pub struct TxDecoder {
    cur_ext_record_size: Option<u16>,
}

impl TxDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the payload of a record whose header is `hdr`.
    ///
    /// `payload` excludes the 8-byte header but includes padding.
    pub fn decode(
        &mut self,
        hdr: &TxHeader,
        payload: &[u8],
    ) -> Result<Transaction, Error> {
        let mut r = payload;
        Ok(match hdr.kind {
            TxKind::Expunge => {
                Transaction::Expunge(read_ranges(payload, "expunge")?)
            }
            TxKind::KeywordReset => {
                Transaction::KeywordReset(read_ranges(payload, "keyword reset")?)
            }

            TxKind::Append => {
                if 0 != payload.len() % 8 {
                    return Err(Error::CorruptLog("bad append size".to_owned()));
                }
                let mut records = Vec::with_capacity(payload.len() / 8);
                while !r.is_empty() {
                    let uid = read_uid(&mut r, "append")?;
                    let flags = MailFlags::from_bits_truncate(
                        r.read_u8().map_err(truncated("append"))?,
                    );
                    let mut pad = [0u8; 3];
                    r.read_exact(&mut pad).map_err(truncated("append"))?;
                    records.push(AppendRecord { uid, flags });
                }
                Transaction::Append(records)
            }

            TxKind::FlagUpdate => {
                if 0 != payload.len() % 12 {
                    return Err(Error::CorruptLog(
                        "bad flag update size".to_owned(),
                    ));
                }
                let mut updates = Vec::with_capacity(payload.len() / 12);
                while !r.is_empty() {
                    let range = read_range(&mut r, "flag update")?;
                    let add = r.read_u8().map_err(truncated("flag update"))?;
                    let remove =
                        r.read_u8().map_err(truncated("flag update"))?;
                    let _ = r
                        .read_u16::<LittleEndian>()
                        .map_err(truncated("flag update"))?;
                    updates.push(FlagUpdate {
                        range,
                        add: MailFlags::from_bits_truncate(add),
                        remove: MailFlags::from_bits_truncate(remove),
                    });
                }
                Transaction::FlagUpdate(updates)
            }

            TxKind::HeaderUpdate => {
                Transaction::HeaderUpdate(read_patches(payload, "header update")?)
            }
            TxKind::ExtHdrUpdate => Transaction::ExtHdrUpdate(read_patches(
                payload,
                "ext header update",
            )?),

            TxKind::ExtIntro => {
                let what = "ext intro";
                let ext_id = r.read_u32::<LittleEndian>().map_err(truncated(what))?;
                let reset_id =
                    r.read_u32::<LittleEndian>().map_err(truncated(what))?;
                let hdr_size =
                    r.read_u32::<LittleEndian>().map_err(truncated(what))?;
                let record_size =
                    r.read_u16::<LittleEndian>().map_err(truncated(what))?;
                let record_align =
                    r.read_u16::<LittleEndian>().map_err(truncated(what))?;
                let _ = r.read_u16::<LittleEndian>().map_err(truncated(what))?;
                let name_size =
                    r.read_u16::<LittleEndian>().map_err(truncated(what))?;
                let name = read_name(&mut r, name_size.into(), what)?;
                if EXT_ID_NEW == ext_id && name.is_empty() {
                    return Err(Error::CorruptLog(
                        "new extension without a name".to_owned(),
                    ));
                }
                if 0 == record_align || !record_align.is_power_of_two() {
                    return Err(Error::CorruptLog(format!(
                        "bad extension alignment {}",
                        record_align
                    )));
                }

                self.cur_ext_record_size = Some(record_size);
                Transaction::ExtIntro(ExtIntro {
                    ext_id: if EXT_ID_NEW == ext_id {
                        None
                    } else {
                        Some(ext_id)
                    },
                    reset_id,
                    hdr_size,
                    record_size,
                    record_align,
                    name,
                })
            }

            TxKind::ExtReset => Transaction::ExtReset {
                new_reset_id: r
                    .read_u32::<LittleEndian>()
                    .map_err(truncated("ext reset"))?,
            },

            TxKind::ExtRecUpdate => {
                let record_size = self.cur_ext_record_size.ok_or_else(|| {
                    Error::CorruptLog(
                        "ext record update without ext intro".to_owned(),
                    )
                })?;
                let mut entries = Vec::new();
                while !r.is_empty() {
                    let uid = read_uid(&mut r, "ext record update")?;
                    let data = read_padded(
                        &mut r,
                        record_size.into(),
                        "ext record update",
                    )?;
                    entries.push(ExtRecEntry { uid, data });
                }
                Transaction::ExtRecUpdate(entries)
            }

            TxKind::KeywordUpdate => {
                let what = "keyword update";
                let modify = r.read_u8().map_err(truncated(what))?;
                let modify = ModifyType::from_wire(modify).ok_or_else(|| {
                    Error::CorruptLog(format!("bad keyword modify type {}", modify))
                })?;
                let _ = r.read_u8().map_err(truncated(what))?;
                let name_size =
                    r.read_u16::<LittleEndian>().map_err(truncated(what))?;
                let name = read_name(&mut r, name_size.into(), what)?;
                if name.is_empty() {
                    return Err(Error::CorruptLog(
                        "keyword update without a name".to_owned(),
                    ));
                }
                KeywordUpdate {
                    modify,
                    name,
                    ranges: read_ranges(r, what)?,
                }
                .into()
            }
        })
    }
}

impl From<KeywordUpdate> for Transaction {
    fn from(ku: KeywordUpdate) -> Self {
        Transaction::KeywordUpdate(ku)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn decode_one(data: &[u8]) -> Result<(TxHeader, Transaction), Error> {
        let hdr = TxHeader::decode(data)?;
        assert_eq!(hdr.size as usize, data.len());
        let tx = TxDecoder::new()
            .decode(&hdr, &data[TX_HEADER_SIZE as usize..])?;
        Ok((hdr, tx))
    }

    #[test]
    fn file_header_layout() {
        let hdr = LogFileHeader::new(0xdeadbeef, 7, 6, 4096, 1_600_000_000);
        let mut data = Vec::new();
        hdr.encode(&mut data);
        assert_eq!(24, data.len());
        assert_eq!(&[1, 0, 24, 0, 0xef, 0xbe, 0xad, 0xde], &data[..8]);
        assert_eq!(hdr, LogFileHeader::decode(&data).unwrap());

        data[0] = 2;
        assert_matches!(
            Err(Error::CorruptLog(_)),
            LogFileHeader::decode(&data)
        );
        assert_matches!(
            Err(Error::CorruptLog(_)),
            LogFileHeader::decode(&data[..20])
        );
    }

    #[test]
    fn expunge_carries_protection_bits() {
        let mut data = Vec::new();
        Transaction::Expunge(vec![UidRange::new(Uid::u(3), Uid::u(5))])
            .encode(false, &mut data);
        assert_eq!(16, data.len());
        assert_eq!(
            TYPE_EXPUNGE | TYPE_EXPUNGE_PROT,
            u32::from_le_bytes([data[4], data[5], data[6], data[7]])
        );
        let (hdr, tx) = decode_one(&data).unwrap();
        assert_eq!(TxKind::Expunge, hdr.kind);
        assert_eq!(
            Transaction::Expunge(vec![UidRange::new(Uid::u(3), Uid::u(5))]),
            tx
        );

        // A bare expunge type is damage, not an expunge
        data[4..8].copy_from_slice(&TYPE_EXPUNGE.to_le_bytes());
        assert_matches!(Err(Error::CorruptLog(_)), decode_one(&data));
    }

    #[test]
    fn external_bit_is_preserved() {
        let mut data = Vec::new();
        Transaction::FlagUpdate(vec![FlagUpdate {
            range: UidRange::single(Uid::u(1)),
            add: MailFlags::SEEN,
            remove: MailFlags::DELETED,
        }])
        .encode(true, &mut data);
        let (hdr, _) = decode_one(&data).unwrap();
        assert!(hdr.external);
        assert_eq!(TxKind::FlagUpdate, hdr.kind);
    }

    #[test]
    fn zero_uid_is_corruption() {
        let mut data = Vec::new();
        Transaction::KeywordReset(vec![UidRange::single(Uid::u(1))])
            .encode(false, &mut data);
        data[8..12].copy_from_slice(&0u32.to_le_bytes());
        assert_matches!(Err(Error::CorruptLog(_)), decode_one(&data));
    }

    #[test]
    fn ext_rec_update_needs_intro() {
        let intro = Transaction::ExtIntro(ExtIntro {
            ext_id: None,
            reset_id: 1,
            hdr_size: 0,
            record_size: 3,
            record_align: 1,
            name: "x".to_owned(),
        });
        let update = Transaction::ExtRecUpdate(vec![
            ExtRecEntry {
                uid: Uid::u(2),
                data: vec![1, 2, 3],
            },
            ExtRecEntry {
                uid: Uid::u(4),
                data: vec![4, 5, 6],
            },
        ]);

        let mut intro_data = Vec::new();
        intro.encode(false, &mut intro_data);
        let mut update_data = Vec::new();
        update.encode(false, &mut update_data);
        assert_eq!(8 + 16, update_data.len());

        let update_hdr = TxHeader::decode(&update_data).unwrap();
        assert_matches!(
            Err(Error::CorruptLog(_)),
            TxDecoder::new().decode(&update_hdr, &update_data[8..])
        );

        let mut decoder = TxDecoder::new();
        let intro_hdr = TxHeader::decode(&intro_data).unwrap();
        assert_eq!(
            intro,
            decoder.decode(&intro_hdr, &intro_data[8..]).unwrap()
        );
        assert_eq!(
            update,
            decoder.decode(&update_hdr, &update_data[8..]).unwrap()
        );
    }

    #[test]
    fn keyword_update_layout() {
        let ku = Transaction::KeywordUpdate(KeywordUpdate {
            modify: ModifyType::Remove,
            name: "$Junk".to_owned(),
            ranges: vec![
                UidRange::new(Uid::u(1), Uid::u(2)),
                UidRange::single(Uid::u(9)),
            ],
        });
        let mut data = Vec::new();
        ku.encode(false, &mut data);
        // header + 4 + name padded to 8 + two ranges
        assert_eq!(8 + 4 + 8 + 16, data.len());
        assert_eq!(ku, decode_one(&data).unwrap().1);
    }

    #[test]
    fn unknown_types_rejected() {
        assert_matches!(Err(Error::CorruptLog(_)), TxKind::from_type(0));
        assert_matches!(
            Err(Error::CorruptLog(_)),
            TxKind::from_type(TYPE_APPEND | TYPE_FLAG_UPDATE)
        );
        assert_eq!(
            TxKind::Append,
            TxKind::from_type(TYPE_APPEND | TYPE_EXTERNAL).unwrap()
        );
    }
}
