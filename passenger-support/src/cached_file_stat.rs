// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Throttled `stat()` calls.
//!
//! Results are cached per path. As long as an entry is younger than the throttle interval, it is
//! returned without asking the operating system again. Failed calls are cached as well, so that
//! probing for missing files is cheap.

use std::collections::{BTreeMap, HashMap};
use std::fs::Metadata;
use std::io;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

/// Maximal number of cached entries unless configured otherwise
pub const DEFAULT_MAX_SIZE: usize = 1024;

/// File type as far as the users of this cache are concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Regular file
    File,
    /// Directory
    Directory,
    /// Anything else: sockets, devices, pipes
    Other,
}

/// Subset of the `stat()` result kept in the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Type of the file
    pub kind: FileKind,
    /// File size in bytes
    pub size: u64,
    /// Last modification time if known
    pub modified: Option<SystemTime>,
}

impl FileStat {
    /// Checks whether this is a regular file.
    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }

    /// Checks whether this is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

impl From<&Metadata> for FileStat {
    fn from(meta: &Metadata) -> Self {
        let kind = if meta.is_file() {
            FileKind::File
        } else if meta.is_dir() {
            FileKind::Directory
        } else {
            FileKind::Other
        };
        Self {
            kind,
            size: meta.len(),
            modified: meta.modified().ok(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct StatFailure {
    kind: io::ErrorKind,
    errno: i32,
}

impl From<&io::Error> for StatFailure {
    fn from(err: &io::Error) -> Self {
        Self {
            kind: err.kind(),
            errno: err.raw_os_error().unwrap_or(0),
        }
    }
}

impl From<StatFailure> for io::Error {
    fn from(failure: StatFailure) -> Self {
        if failure.errno != 0 {
            io::Error::from_raw_os_error(failure.errno)
        } else {
            failure.kind.into()
        }
    }
}

type Outcome = Result<FileStat, StatFailure>;

#[derive(Debug)]
struct Entry {
    outcome: Outcome,
    last_stat: Instant,
    tick: u64,
}

#[derive(Debug, Default)]
struct Index {
    entries: HashMap<String, Entry>,
    // Least recently used entries come first
    lru: BTreeMap<u64, String>,
    next_tick: u64,
}

impl Index {
    fn touch(&mut self, path: &str) {
        let tick = self.next_tick;
        if let Some(entry) = self.entries.get_mut(path) {
            self.lru.remove(&entry.tick);
            entry.tick = tick;
            self.lru.insert(tick, path.to_owned());
            self.next_tick += 1;
        }
    }

    fn store(&mut self, path: &str, outcome: Outcome, now: Instant, max_size: usize) {
        let tick = self.next_tick;
        self.next_tick += 1;

        if let Some(entry) = self.entries.get_mut(path) {
            self.lru.remove(&entry.tick);
            entry.outcome = outcome;
            entry.last_stat = now;
            entry.tick = tick;
        } else {
            self.entries.insert(
                path.to_owned(),
                Entry {
                    outcome,
                    last_stat: now,
                    tick,
                },
            );
        }
        self.lru.insert(tick, path.to_owned());

        while self.entries.len() > max_size {
            match self.lru.pop_first() {
                Some((_, oldest)) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }
}

/// A cache of `stat()` results with per-call throttling
#[derive(Debug)]
pub struct CachedFileStat {
    index: Mutex<Index>,
    max_size: usize,
}

impl Default for CachedFileStat {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE)
    }
}

impl CachedFileStat {
    /// Creates a new cache holding at most `max_size` entries.
    pub fn new(max_size: usize) -> Self {
        Self {
            index: Mutex::new(Index::default()),
            max_size: max_size.max(1),
        }
    }

    /// Returns the number of cached entries.
    pub fn len(&self) -> usize {
        self.index
            .lock()
            .map(|index| index.entries.len())
            .unwrap_or(0)
    }

    /// Checks whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retrieves file information for `path`.
    ///
    /// If the path has been checked less than `throttle_rate` seconds ago, the cached result is
    /// returned. A throttle rate of zero always queries the operating system.
    pub fn stat(&self, path: &str, throttle_rate: u32) -> io::Result<FileStat> {
        self.stat_at(path, throttle_rate, Instant::now())
    }

    pub(crate) fn stat_at(
        &self,
        path: &str,
        throttle_rate: u32,
        now: Instant,
    ) -> io::Result<FileStat> {
        let throttle = Duration::from_secs(throttle_rate.into());
        if throttle_rate > 0 {
            if let Ok(mut index) = self.index.lock() {
                let cached = index.entries.get(path).and_then(|entry| {
                    (now.saturating_duration_since(entry.last_stat) < throttle)
                        .then_some(entry.outcome)
                });
                if let Some(outcome) = cached {
                    index.touch(path);
                    return outcome.map_err(io::Error::from);
                }
            }
        }

        // The lock isn’t held while waiting for the file system
        let result = std::fs::metadata(path);
        let outcome = match &result {
            Ok(meta) => Ok(FileStat::from(meta)),
            Err(err) => Err(StatFailure::from(err)),
        };

        if let Ok(mut index) = self.index.lock() {
            index.store(path, outcome, now, self.max_size);
        }

        result.map(|meta| FileStat::from(&meta))
    }
}
