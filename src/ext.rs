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

//! Extensions: named data slots attached to the index header and to every
//! message record.
//!
//! There are two layers here. The `ExtensionRegistry` is owned by the
//! process and hands out stable `ExtId`s for names; it says nothing about
//! where anything lives. A `MapExtension` describes the layout of one
//! extension in one particular map generation. The two are joined by name,
//! since the numbering of extensions within a map depends on the order in
//! which they were introduced into the log and differs between mailboxes.

use std::collections::HashMap;
use std::convert::TryFrom;

use crate::support::error::Error;

/// The built-in extension holding keyword names and per-message keyword
/// bitmaps.
pub const KEYWORDS_EXT_NAME: &str = "keywords";

/// The size of the fixed part of every record (`uid:u32 flags:u8 pad[3]`).
pub const BASE_RECORD_SIZE: u16 = 8;

/// Stable, process-local identifier of a registered extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExtId(pub u32);

/// The sizes an extension wants when it is first introduced into a map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtensionSpec {
    pub name: String,
    pub hdr_size: u32,
    pub record_size: u16,
    pub record_align: u16,
}

/// Registry of extensions known to this process.
///
/// This is passed to `Index::open()`; there is no global registration state.
/// The `keywords` extension is always registered as `ExtId(0)`.
#[derive(Clone, Debug)]
pub struct ExtensionRegistry {
    exts: Vec<ExtensionSpec>,
    by_name: HashMap<String, ExtId>,
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        let mut this = ExtensionRegistry {
            exts: Vec::new(),
            by_name: HashMap::new(),
        };
        this.register(KEYWORDS_EXT_NAME, 0, 0, 1);
        this
    }
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keywords(&self) -> ExtId {
        ExtId(0)
    }

    /// Register an extension, returning its id.
    ///
    /// Registering the same name twice returns the original id and keeps the
    /// original sizes.
    pub fn register(
        &mut self,
        name: &str,
        hdr_size: u32,
        record_size: u16,
        record_align: u16,
    ) -> ExtId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }

        let id = ExtId(self.exts.len() as u32);
        self.exts.push(ExtensionSpec {
            name: name.to_owned(),
            hdr_size,
            record_size,
            record_align: record_align.max(1),
        });
        self.by_name.insert(name.to_owned(), id);
        id
    }

    pub fn lookup(&self, name: &str) -> Option<ExtId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: ExtId) -> Option<&ExtensionSpec> {
        self.exts.get(id.0 as usize)
    }

    pub fn name(&self, id: ExtId) -> Result<&str, Error> {
        self.get(id)
            .map(|spec| spec.name.as_str())
            .ok_or(Error::UnknownExtension)
    }
}

/// The layout and header data of one extension within one map generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapExtension {
    pub name: String,
    /// Bumped by every ExtReset. Updates written against an older reset id
    /// are discarded.
    pub reset_id: u32,
    pub record_size: u16,
    pub record_align: u16,
    /// Where the extension's data starts within each record. 0 means the
    /// extension has no per-record data.
    pub record_offset: u16,
    /// The extension header; its length is the header size.
    pub hdr_data: Vec<u8>,
}

impl MapExtension {
    pub fn new(
        name: &str,
        reset_id: u32,
        hdr_size: u32,
        record_size: u16,
        record_align: u16,
    ) -> Self {
        MapExtension {
            name: name.to_owned(),
            reset_id,
            record_size,
            record_align: record_align.max(1),
            record_offset: 0,
            hdr_data: vec![0u8; hdr_size as usize],
        }
    }

    pub fn hdr_size(&self) -> u32 {
        self.hdr_data.len() as u32
    }
}

fn align_up(v: u32, align: u32) -> u32 {
    (v + align - 1) / align * align
}

/// Assign `record_offset` to every extension with per-record data and return
/// the resulting total record size.
///
/// Extensions are laid out in map order, each aligned to its own alignment.
/// The record size is rounded up to a multiple of 4 so that the base record
/// stays aligned in the flat array.
pub fn compute_record_layout(exts: &mut [MapExtension]) -> Result<u16, Error> {
    let mut offset = u32::from(BASE_RECORD_SIZE);
    for ext in exts.iter_mut() {
        if 0 == ext.record_size {
            ext.record_offset = 0;
            continue;
        }

        let align = u32::from(ext.record_align.max(1));
        let start = align_up(offset, align);
        ext.record_offset = layout_offset(start)?;
        offset = start + u32::from(ext.record_size);
    }

    layout_offset(align_up(offset, 4))
}

fn layout_offset(v: u32) -> Result<u16, Error> {
    u16::try_from(v).map_err(|_| {
        Error::CorruptIndex(format!("record layout too large ({} bytes)", v))
    })
}
