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

//! Advisory whole-file locks shared between processes.
//!
//! These are BSD `flock()` locks, so they belong to the open file description
//! and not to the process. Two descriptors for the same file opened within one
//! process therefore contend with each other just as two processes would;
//! callers that need reentrancy must count it themselves.

use std::fs;
use std::os::unix::io::AsRawFd;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};

use crate::support::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
}

/// Acquire a lock of the given kind on `file`, waiting at most `timeout`.
///
/// Converting an already held lock to the other kind is permitted; note that
/// the conversion is not atomic.
pub fn lock(
    file: &fs::File,
    kind: LockKind,
    timeout: Duration,
) -> Result<(), Error> {
    let arg = match kind {
        LockKind::Shared => FlockArg::LockSharedNonblock,
        LockKind::Exclusive => FlockArg::LockExclusiveNonblock,
    };

    let deadline = Instant::now() + timeout;
    let mut backoff = Duration::from_millis(1);
    loop {
        match flock(file.as_raw_fd(), arg) {
            Ok(()) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) if Errno::EWOULDBLOCK == e => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::LockTimeout);
                }

                thread::sleep(backoff.min(deadline - now));
                backoff = (backoff * 2).min(Duration::from_millis(100));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Release any lock held on `file`.
pub fn unlock(file: &fs::File) -> Result<(), Error> {
    flock(file.as_raw_fd(), FlockArg::Unlock)?;
    Ok(())
}
