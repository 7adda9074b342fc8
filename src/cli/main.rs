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

use std::io;
use std::path::{Path, PathBuf};

use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use structopt::StructOpt;

use super::inspect;
use super::sysexits::*;
use mailidx::support::config::IndexConfig;
use mailidx::support::error::Error;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
struct Options {
    /// Read index settings from this TOML file instead of using the
    /// defaults.
    #[structopt(long, parse(from_os_str), global = true)]
    config: Option<PathBuf>,

    /// Configure logging from this log4rs TOML file. Without it, warnings
    /// and errors are written to standard error.
    #[structopt(long, parse(from_os_str), global = true)]
    log_config: Option<PathBuf>,

    /// Also log informational and debug messages to standard error.
    #[structopt(short, long, global = true)]
    verbose: bool,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(StructOpt)]
enum Command {
    /// Print every record of a single transaction log file.
    ///
    /// This works on any `index.log` or `index.log.2`, even one whose index
    /// directory is gone.
    DumpLog {
        /// The log file to read.
        #[structopt(parse(from_os_str))]
        file: PathBuf,
    },
    /// Print the header, extensions and messages of an index.
    Dump(IndexDir),
    /// Check an index for damage.
    ///
    /// Exits with EX_DATAERR (65) if the index had to be repaired or is
    /// still inconsistent.
    Check(IndexDir),
    /// Bring an index up to date with its log and write a new snapshot.
    Snapshot(IndexDir),
}

#[derive(StructOpt)]
struct IndexDir {
    /// The directory holding `index`, `index.log` etc.
    #[structopt(parse(from_os_str))]
    dir: PathBuf,
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let options = Options::from_clap(&match Options::clap()
        .get_matches_safe()
    {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        }
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        }
    });

    init_log(options.log_config.as_deref(), options.verbose);

    let config = match options.config {
        None => IndexConfig::default(),
        Some(ref path) => match IndexConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error in config file at '{}': {}", path.display(), e);
                EX_CONFIG.exit()
            }
        },
    };

    let result = match options.cmd {
        Command::DumpLog { file } => inspect::dump_log(&file),
        Command::Dump(IndexDir { dir }) => inspect::dump(&dir, config),
        Command::Check(IndexDir { dir }) => inspect::check(&dir, config),
        Command::Snapshot(IndexDir { dir }) => inspect::snapshot(&dir, config),
    };

    match result {
        Ok(exit) => exit.exit(),
        Err(e) => {
            eprintln!("{}", e);
            error_exit(&e).exit()
        }
    }
}

fn error_exit(e: &Error) -> Sysexit {
    match *e {
        Error::Io(ref e) => match e.kind() {
            io::ErrorKind::NotFound => EX_NOINPUT,
            io::ErrorKind::PermissionDenied => EX_NOPERM,
            _ => EX_IOERR,
        },
        Error::LockTimeout => EX_TEMPFAIL,
        Error::Toml(..) => EX_CONFIG,
        ref e if e.is_corruption() => EX_DATAERR,
        Error::LogFilesLost => EX_DATAERR,
        _ => EX_SOFTWARE,
    }
}

fn init_log(log_config: Option<&Path>, verbose: bool) {
    if let Some(path) = log_config {
        if let Err(e) =
            log4rs::init_file(path, log4rs::file::Deserializers::new())
        {
            eprintln!("Error in log config at '{}': {}", path.display(), e);
            EX_CONFIG.exit();
        }
        return;
    }

    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(
            "{d(%H:%M:%S%.3f)} [{l}] {m}{n}",
        )))
        .build();
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    let config = Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("stderr").build(level))
        .expect("Failed to build logging configuration");
    log4rs::init_config(config).expect("Failed to initialise logging");
}
