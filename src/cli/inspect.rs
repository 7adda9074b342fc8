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

//! The read-mostly administrative subcommands.

use std::fs;
use std::io;
use std::path::Path;

use mailidx::ext::ExtensionRegistry;
use mailidx::index::{Index, SNAPSHOT_FILE_NAME};
use mailidx::log::file::LogFile;
use mailidx::log::format::TxDecoder;
use mailidx::map::{Generations, HeaderFlags, IndexMap};
use mailidx::model::{LogPosition, Seqnum};
use mailidx::support::config::IndexConfig;
use mailidx::support::error::Error;
use mailidx::view::{IndexView, View};

use super::sysexits::*;

pub fn dump_log(path: &Path) -> Result<Sysexit, Error> {
    let file = LogFile::open(&path.display().to_string(), path, true)?;
    let hdr = *file.header();
    println!(
        "log version {}.{} indexid {} seq {} prev {}:{} created {}",
        hdr.major_version,
        hdr.minor_version,
        hdr.indexid,
        hdr.file_seq,
        hdr.prev_file_seq,
        hdr.prev_file_offset,
        hdr.create_stamp,
    );

    let mut decoder = TxDecoder::new();
    let mut offset = u32::from(hdr.hdr_size);
    loop {
        let pos = LogPosition::new(hdr.file_seq, offset);
        let (txhdr, payload) = match file.read_record(offset) {
            Ok(Some(r)) => r,
            Ok(None) => {
                if offset < file.size() {
                    println!("{} incomplete record", pos);
                }
                break;
            }
            Err(e) => {
                println!("{} {}", pos, e);
                return Ok(EX_DATAERR);
            }
        };

        match decoder.decode(&txhdr, payload) {
            Ok(tx) => println!(
                "{}{} {:?}",
                pos,
                if txhdr.external { " external" } else { "" },
                tx
            ),
            Err(e) => {
                println!("{} {:?}: {}", pos, txhdr.kind, e);
                return Ok(EX_DATAERR);
            }
        }
        offset += txhdr.size;
    }

    Ok(EX_OK)
}

fn open_read_only(dir: &Path, mut config: IndexConfig) -> Result<Index, Error> {
    config.read_only = true;
    Index::open(dir, &config, ExtensionRegistry::new())
}

pub fn dump(dir: &Path, config: IndexConfig) -> Result<Sysexit, Error> {
    let index = open_read_only(dir, config)?;
    let view = IndexView::open(&index)?;
    let map = view.map();
    let hdr = view.header();

    println!(
        "index version {}.{} indexid {} uid_validity {} next_uid {}",
        hdr.major_version,
        hdr.minor_version,
        hdr.indexid,
        hdr.uid_validity,
        hdr.next_uid
    );
    println!(
        "messages {} seen {} deleted {}",
        hdr.messages_count, hdr.seen_messages_count, hdr.deleted_messages_count
    );
    println!(
        "first recent {} first unseen >= {} first deleted >= {}",
        hdr.first_recent_uid,
        hdr.first_unseen_uid_lowwater,
        hdr.first_deleted_uid_lowwater
    );
    println!(
        "log head {} tail {}:{} flags {:?} record size {}",
        hdr.head_position(),
        hdr.log_file_seq,
        hdr.log_file_tail_offset,
        hdr.flags,
        hdr.record_size
    );

    for ext in map.extensions() {
        println!(
            "extension {:?} reset {} header {} record {}@{} align {}",
            ext.name,
            ext.reset_id,
            ext.hdr_size(),
            ext.record_size,
            ext.record_offset,
            ext.record_align
        );
    }

    for ix in 0..view.messages_count() as usize {
        let record = view.lookup_full(Seqnum::from_index(ix))?;
        let keywords = record.keywords();
        println!(
            "{:6} uid {:6} {:?}{}{}",
            ix + 1,
            record.uid(),
            record.flags(),
            if keywords.is_empty() { "" } else { " " },
            keywords.join(" ")
        );
    }

    Ok(EX_OK)
}

pub fn check(dir: &Path, config: IndexConfig) -> Result<Sysexit, Error> {
    let mut damaged = false;
    let mut snapshot_fsckd = false;
    let generations = Generations::default();
    match fs::read(dir.join(SNAPSHOT_FILE_NAME)) {
        Ok(data) => match IndexMap::decode_snapshot(&data, &generations)
            .and_then(|map| {
                map.check()?;
                Ok(map)
            }) {
            Ok(map) => {
                snapshot_fsckd =
                    map.header().flags.contains(HeaderFlags::FSCKD);
            }
            Err(e) => {
                println!("{}: snapshot: {}", dir.display(), e);
                damaged = true;
            }
        },
        Err(e) if io::ErrorKind::NotFound == e.kind() => (),
        Err(e) => return Err(e.into()),
    }

    let index = open_read_only(dir, config)?;
    let head = index.head();
    if let Err(e) = head.check() {
        println!("{}: {}", dir.display(), e);
        return Ok(EX_DATAERR);
    }

    // A fresh rebuild means the log had to be repaired just now
    if head.header().flags.contains(HeaderFlags::FSCKD) && !snapshot_fsckd {
        println!("{}: transaction log is damaged", dir.display());
        damaged = true;
    }

    if damaged {
        println!(
            "{}: run `snapshot` to write the repaired index",
            dir.display()
        );
        return Ok(EX_DATAERR);
    }

    println!("{}: OK, {} messages", dir.display(), head.messages_count());
    Ok(EX_OK)
}

pub fn snapshot(dir: &Path, config: IndexConfig) -> Result<Sysexit, Error> {
    let index = Index::open(dir, &config, ExtensionRegistry::new())?;
    index.write_snapshot()?;
    println!(
        "{}: snapshot written at {}",
        dir.display(),
        index.head().header().head_position()
    );
    Ok(EX_OK)
}
