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

use std::convert::TryFrom;
use std::fmt;
use std::num::NonZeroU32;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Uniquely identifies a message within a single mailbox.
///
/// UIDs start at 1 and increase monotonically as messages are appended.
/// UIDs are never reused while the `uid_validity` of the index stays the
/// same. A stored UID of 0 is never valid and always indicates corruption.
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Uid(pub NonZeroU32);

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Uid({})", self.0.get())
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.get())
    }
}

impl Uid {
    // Unsafe because new() isn't const for some reason
    pub const MIN: Self = unsafe { Uid(NonZeroU32::new_unchecked(1)) };
    /// The greatest allocatable UID. `next_uid` must still be representable
    /// after it has been allocated.
    pub const MAX: Self =
        unsafe { Uid(NonZeroU32::new_unchecked(u32::MAX - 1)) };

    pub fn of(uid: u32) -> Option<Self> {
        NonZeroU32::new(uid).map(Uid).filter(|&u| u <= Uid::MAX)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }

    pub fn next(self) -> Option<Self> {
        Uid::of(self.0.get() + 1)
    }

    #[cfg(test)]
    pub fn u(uid: u32) -> Self {
        Uid::of(uid).unwrap()
    }
}

impl TryFrom<u32> for Uid {
    type Error = ();

    fn try_from(v: u32) -> Result<Self, ()> {
        Self::of(v).ok_or(())
    }
}

impl From<Uid> for u32 {
    fn from(uid: Uid) -> u32 {
        uid.0.get()
    }
}

/// The 1-based position of a message within one view of a mailbox.
///
/// Unlike UIDs, sequence numbers shift whenever a message below them is
/// expunged, and only have meaning relative to a particular map generation.
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Seqnum(pub NonZeroU32);

impl fmt::Debug for Seqnum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Seqnum({})", self.0.get())
    }
}

impl Seqnum {
    // Unsafe because new() isn't const for some reason
    pub const MIN: Self = unsafe { Seqnum(NonZeroU32::new_unchecked(1)) };

    pub fn of(seqnum: u32) -> Option<Self> {
        NonZeroU32::new(seqnum).map(Seqnum)
    }

    /// Return the sequence number for 0-based array index `ix`.
    pub fn from_index(ix: usize) -> Self {
        Seqnum::of(ix as u32 + 1).unwrap_or(Seqnum::MIN)
    }

    /// Return the 0-based array index corresponding to this sequence number.
    pub fn to_index(self) -> usize {
        self.0.get() as usize - 1
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }

    #[cfg(test)]
    pub fn u(seqnum: u32) -> Self {
        Seqnum::of(seqnum).unwrap()
    }
}

bitflags! {
    /// The system flags stored directly in every message record.
    ///
    /// Keywords are not flags in this sense; they live in the `keywords`
    /// extension.
    #[derive(Default)]
    pub struct MailFlags: u8 {
        const ANSWERED = 0x01;
        const FLAGGED = 0x02;
        const DELETED = 0x04;
        const SEEN = 0x08;
        const DRAFT = 0x10;
        const RECENT = 0x20;
    }
}

/// How a keyword update changes the keyword sets of the affected messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModifyType {
    Add,
    Remove,
}

impl ModifyType {
    pub fn to_wire(self) -> u8 {
        match self {
            ModifyType::Add => 1,
            ModifyType::Remove => 2,
        }
    }

    pub fn from_wire(v: u8) -> Option<Self> {
        match v {
            1 => Some(ModifyType::Add),
            2 => Some(ModifyType::Remove),
            _ => None,
        }
    }
}

/// A point in the transaction log.
///
/// Positions are totally ordered: an earlier file sequence always comes
/// first, and within one file the smaller offset comes first. The derived
/// `Ord` implements exactly that since `file_seq` is the first field.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct LogPosition {
    pub file_seq: u32,
    pub offset: u32,
}

impl LogPosition {
    pub const ZERO: Self = LogPosition {
        file_seq: 0,
        offset: 0,
    };

    pub fn new(file_seq: u32, offset: u32) -> Self {
        LogPosition { file_seq, offset }
    }

    /// Whether `self` strictly precedes `other` in the log.
    pub fn is_before(self, other: Self) -> bool {
        self.file_seq < other.file_seq
            || (self.file_seq == other.file_seq && self.offset < other.offset)
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.file_seq, self.offset)
    }
}

/// An inclusive range of UIDs, as used throughout the log format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UidRange {
    pub first: Uid,
    pub last: Uid,
}

impl UidRange {
    pub fn new(first: Uid, last: Uid) -> Self {
        UidRange { first, last }
    }

    pub fn single(uid: Uid) -> Self {
        UidRange {
            first: uid,
            last: uid,
        }
    }

    pub fn contains(&self, uid: Uid) -> bool {
        uid >= self.first && uid <= self.last
    }
}
