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

//! A crash-safe, multi-process index of the messages in one mailbox.
//!
//! Every change is appended to a transaction log (`log`), which is replayed
//! (`apply`) into immutable map generations (`map`). An `index::Index` owns
//! the log and the newest generation; `view::IndexView` gives readers a
//! stable generation to work with, and `transaction::IndexTransaction`
//! batches changes into a single log append.

#[cfg(test)]
macro_rules! assert_matches {
    ($expected:pat, $actual:expr) => {
        match $actual {
            $expected => (),
            unexpected => panic!(
                "Expected {} matches {}, got {:?}",
                stringify!($expected),
                stringify!($actual),
                unexpected
            ),
        }
    };
}

pub mod support;

pub mod apply;
pub mod ext;
pub mod index;
pub mod log;
pub mod map;
pub mod model;
pub mod transaction;
pub mod view;

pub use crate::index::Index;
pub use crate::support::config::IndexConfig;
pub use crate::support::error::Error;
pub use crate::transaction::{CommitResult, IndexTransaction, MessageRef};
pub use crate::view::{IndexView, View};
