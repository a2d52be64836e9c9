//-
// Copyright (c) 2026, Jason Lingle
//
// This file is part of Clustermail.
//
// Clustermail is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Clustermail is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along with
// Clustermail. If not, see <http://www.gnu.org/licenses/>.

//! Write-ahead log of object relocations.
//!
//! Before a move (and, advisorily, before a save or copy) the engine appends
//! an intent line; once the operation reaches its terminal state it appends
//! a `done` marker for the same destination. `replay` walks the log after a
//! crash and resolves every intent lacking a marker.
//!
//! Once replay has resolved everything it can, `compact()` rewrites the log
//! to hold only the intents which are still unfinished.
//!
//! Appends must be line-atomic across threads and processes. Within a
//! process, every `RelocationLog` opened on the same path shares one file
//! handle and appends under its lock. The file is opened in append mode and
//! each line is submitted as a single `write_all()`, so concurrent appends
//! from other processes land between whole lines.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use lazy_static::lazy_static;
use log::warn;

use crate::support::error::Error;

pub mod entry;
pub mod replay;

pub use self::entry::{
    Destination, LogEntry, LogLine, Operation, RelocationSource,
};
pub use self::replay::ReplayReport;

lazy_static! {
    static ref OPEN_LOGS: Mutex<HashMap<PathBuf, Weak<Mutex<File>>>> =
        Mutex::new(HashMap::new());
}

#[derive(Clone)]
pub struct RelocationLog {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl RelocationLog {
    /// Open (creating if needed) the log at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        // Register under the canonical path so that different spellings of
        // the same file share a handle.
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let key = path.canonicalize()?;

        let mut open_logs = OPEN_LOGS.lock().unwrap();
        open_logs.retain(|_, weak| weak.strong_count() > 0);
        let shared = match open_logs.get(&key).and_then(Weak::upgrade) {
            Some(shared) => shared,
            None => {
                let shared = Arc::new(Mutex::new(file));
                open_logs.insert(key.clone(), Arc::downgrade(&shared));
                shared
            },
        };

        Ok(RelocationLog {
            path: key,
            file: shared,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably append `line`.
    pub fn append(&self, line: &LogLine) -> Result<(), Error> {
        let text = format!("{}\n", line);
        let mut file = self.file.lock().unwrap();
        file.write_all(text.as_bytes())?;
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }

    pub fn append_intent(&self, entry: &LogEntry) -> Result<(), Error> {
        self.append(&LogLine::Intent(entry.clone()))
    }

    pub fn append_done(&self, destination: Destination) -> Result<(), Error> {
        self.append(&LogLine::Done(destination))
    }

    /// Read every line of the log.
    ///
    /// Lines which cannot be parsed are returned as errors in their position
    /// rather than failing the whole read.
    pub fn read_lines(&self) -> Result<Vec<Result<LogLine, Error>>, Error> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if io::ErrorKind::NotFound == e.kind() => {
                warn!("Relocation log {} vanished", self.path.display());
                Vec::new()
            },
            Err(e) => return Err(e.into()),
        };

        Ok(data
            .split(|&b| b'\n' == b)
            .filter(|line| !line.is_empty())
            .map(|line| match std::str::from_utf8(line) {
                Ok(line) => line.trim_end_matches('\r').parse(),
                Err(_) => Err(Error::MalformedLogLine(
                    String::from_utf8_lossy(line).into_owned(),
                )),
            })
            .collect())
    }

    /// Rewrite the log to contain only its unfinished intents, returning
    /// how many were kept. Malformed lines are dropped.
    ///
    /// Appends from this process wait for the rewrite; other processes must
    /// not be appending to the log while it runs.
    pub fn compact(&self) -> Result<usize, Error> {
        let mut file = self.file.lock().unwrap();
        let unfinished = Unfinished::of(
            self.read_lines()?.into_iter().filter_map(Result::ok),
        );

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tf = tempfile::NamedTempFile::new_in(dir)?;
        for entry in &unfinished.intents {
            writeln!(tf.as_file_mut(), "{}", LogLine::Intent(entry.clone()))?;
        }
        tf.as_file_mut().sync_all()?;
        tf.persist(&self.path).map_err(|e| e.error)?;

        *file = OpenOptions::new().append(true).open(&self.path)?;
        Ok(unfinished.intents.len())
    }
}

/// The result of matching intents against `done` markers.
#[derive(Debug, Default)]
pub(crate) struct Unfinished {
    /// Intents with no later marker for their destination, in log order.
    pub intents: Vec<LogEntry>,
    /// The number of intents a marker resolved.
    pub completed: usize,
}

impl Unfinished {
    /// A marker resolves every earlier intent for its destination, so an
    /// operation which failed and was then retried successfully counts as
    /// finished.
    pub fn of(lines: impl IntoIterator<Item = LogLine>) -> Self {
        let mut intents = Vec::<Option<LogEntry>>::new();
        let mut pending = HashMap::<Destination, Vec<usize>>::new();
        let mut completed = 0;

        for line in lines {
            match line {
                LogLine::Intent(entry) => {
                    pending
                        .entry(entry.destination())
                        .or_default()
                        .push(intents.len());
                    intents.push(Some(entry));
                },
                LogLine::Done(destination) => {
                    for ix in pending.remove(&destination).unwrap_or_default()
                    {
                        intents[ix] = None;
                        completed += 1;
                    }
                },
            }
        }

        Unfinished {
            intents: intents.into_iter().flatten().collect(),
            completed,
        }
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use tempfile::TempDir;

    use super::*;
    use crate::mail::model::AttrKey;

    fn entry(thread: usize, ix: usize) -> LogEntry {
        LogEntry {
            operation: Operation::Move,
            pool: "mail".to_owned(),
            namespace: format!("ns{}", thread),
            oid: format!("oid-{}-{}", thread, ix),
            source: Some(RelocationSource {
                pool: None,
                namespace: "inbox".to_owned(),
                oid: format!("src-{}-{}", thread, ix),
                principal: format!("user{}", thread),
            }),
            updates: vec![(AttrKey::MailUid, ix.to_string().into_bytes())],
        }
    }

    #[test]
    fn concurrent_appends_are_line_atomic() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 64;

        let root = TempDir::new().unwrap();
        let path = root.path().join("relocation.log");

        let threads: Vec<_> = (0..THREADS)
            .map(|t| {
                let path = path.clone();
                thread::spawn(move || {
                    // Each thread opens its own log to exercise the shared
                    // handle registry.
                    let log = RelocationLog::open(&path).unwrap();
                    for ix in 0..PER_THREAD {
                        log.append_intent(&entry(t, ix)).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let log = RelocationLog::open(&path).unwrap();
        let lines = log.read_lines().unwrap();
        assert_eq!(THREADS * PER_THREAD, lines.len());

        let mut next_ix = vec![0; THREADS];
        for line in lines {
            let entry = match line.unwrap() {
                LogLine::Intent(entry) => entry,
                l => panic!("unexpected {:?}", l),
            };
            let t: usize = entry.namespace[2..].parse().unwrap();
            // Each thread's own appends stay in order
            assert_eq!(self::entry(t, next_ix[t]), entry);
            next_ix[t] += 1;
        }
        assert_eq!(vec![PER_THREAD; THREADS], next_ix);
    }

    #[test]
    fn registry_shares_handles() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("a.log");
        let a = RelocationLog::open(&path).unwrap();
        let b = RelocationLog::open(root.path().join(".").join("a.log"))
            .unwrap();
        assert!(Arc::ptr_eq(&a.file, &b.file));
        assert_eq!(a.path(), b.path());
    }

    #[test]
    fn marker_resolves_all_earlier_intents() {
        let save = LogEntry::save("mail", "ns", "a");
        let unfinished = Unfinished::of(vec![
            LogLine::Intent(save.clone()),
            LogLine::Intent(save.clone()),
            LogLine::Done(save.destination()),
            LogLine::Intent(entry(0, 0)),
            LogLine::Intent(save.clone()),
        ]);
        assert_eq!(2, unfinished.completed);
        assert_eq!(vec![entry(0, 0), save], unfinished.intents);
    }

    #[test]
    fn compact_keeps_only_unfinished_intents() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("r.log");
        fs::write(
            &path,
            "save;mail;ns;a\ngarbage\nsave;mail;ns;b\ndone;mail;ns;a\n",
        )
        .unwrap();

        let log = RelocationLog::open(&path).unwrap();
        let other = RelocationLog::open(&path).unwrap();
        assert_eq!(1, log.compact().unwrap());
        assert_eq!("save;mail;ns;b\n", fs::read_to_string(&path).unwrap());

        // Every handle on the log appends to the rewritten file
        other
            .append_done(LogEntry::save("mail", "ns", "b").destination())
            .unwrap();
        assert_eq!(
            "save;mail;ns;b\ndone;mail;ns;b\n",
            fs::read_to_string(&path).unwrap()
        );
        assert_eq!(0, log.compact().unwrap());
        assert_eq!("", fs::read_to_string(&path).unwrap());
    }

    #[test]
    fn malformed_lines_reported_in_place() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("r.log");
        fs::write(
            &path,
            b"save;mail;ns;a\ngarbage\n\xFF\xFE\r\ndone;mail;ns;a\r\n".as_ref(),
        )
        .unwrap();

        let log = RelocationLog::open(&path).unwrap();
        let lines = log.read_lines().unwrap();
        assert_eq!(4, lines.len());
        assert_matches!(Ok(LogLine::Intent(_)), &lines[0]);
        assert_matches!(Err(Error::MalformedLogLine(_)), &lines[1]);
        assert_matches!(Err(Error::MalformedLogLine(_)), &lines[2]);
        assert_matches!(Ok(LogLine::Done(_)), &lines[3]);
    }
}
