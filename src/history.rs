//! Last-played history.
//!
//! An append-only, bounded list of `(timestamp, uri)` pairs, newest first.
//! Kept in memory, persisted as one tab-separated record per line on
//! shutdown and loaded again on startup.

use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};

use crate::error::Result;

const FILE_NAME: &str = "last_played";

#[derive(Debug)]
pub struct LastPlayed {
    entries: VecDeque<(u64, String)>,
    cap: usize,
}

impl LastPlayed {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            cap,
        }
    }

    fn file(workdir: &Path) -> PathBuf {
        workdir.join(FILE_NAME)
    }

    /// Loads the persisted history, tolerating a missing file.
    pub fn load(workdir: &Path, cap: usize) -> Result<Self> {
        let mut history = Self::new(cap);
        let contents = match fs::read_to_string(Self::file(workdir)) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(history),
            Err(e) => return Err(e.into()),
        };
        // Oldest first on disk, so pushing preserves order.
        for line in contents.lines() {
            let Some((stamp, uri)) = line.split_once('\t') else {
                debug!("skipping malformed history line: {line}");
                continue;
            };
            let Ok(stamp) = stamp.parse::<u64>() else {
                debug!("skipping malformed history line: {line}");
                continue;
            };
            history.push(stamp, uri.to_string());
        }
        info!("loaded {} last played songs", history.entries.len());
        Ok(history)
    }

    /// Writes the history through a temp file and an atomic rename.
    pub fn save(&self, workdir: &Path) -> Result<()> {
        fs::create_dir_all(workdir)?;
        let path = Self::file(workdir);
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            for (stamp, uri) in self.entries.iter().rev() {
                writeln!(file, "{stamp}\t{uri}")?;
            }
        }
        fs::rename(&tmp, &path)?;
        debug!("saved {} last played songs", self.entries.len());
        Ok(())
    }

    /// Records `uri` as played at `stamp`, evicting the oldest entry past
    /// the cap.
    pub fn push(&mut self, stamp: u64, uri: String) {
        if self.cap == 0 {
            return;
        }
        self.entries.push_front((stamp, uri));
        while self.entries.len() > self.cap {
            self.entries.pop_back();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One page of history, newest first.
    #[must_use]
    pub fn page(&self, offset: usize, limit: usize) -> Value {
        let entries: Vec<Value> = self
            .entries
            .iter()
            .skip(offset)
            .take(limit)
            .map(|(stamp, uri)| json!({ "lastPlayed": stamp, "uri": uri }))
            .collect();
        json!({
            "totalEntities": self.entries.len(),
            "offset": offset,
            "data": entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newest_entries_come_first() {
        let mut history = LastPlayed::new(10);
        history.push(1, "a.flac".into());
        history.push(2, "b.flac".into());
        let page = history.page(0, 10);
        assert_eq!(page["data"][0]["uri"], "b.flac");
        assert_eq!(page["data"][1]["uri"], "a.flac");
    }

    #[test]
    fn cap_evicts_the_oldest() {
        let mut history = LastPlayed::new(2);
        history.push(1, "a.flac".into());
        history.push(2, "b.flac".into());
        history.push(3, "c.flac".into());
        assert_eq!(history.len(), 2);
        let page = history.page(0, 10);
        assert_eq!(page["data"][1]["uri"], "b.flac");
    }

    #[test]
    fn zero_cap_disables_tracking() {
        let mut history = LastPlayed::new(0);
        history.push(1, "a.flac".into());
        assert!(history.is_empty());
    }

    #[test]
    fn survives_a_save_load_round_trip() {
        let workdir = tempfile::tempdir().unwrap();
        let mut history = LastPlayed::new(10);
        history.push(10, "a.flac".into());
        history.push(20, "b.flac".into());
        history.save(workdir.path()).unwrap();

        let restored = LastPlayed::load(workdir.path(), 10).unwrap();
        assert_eq!(restored.len(), 2);
        let page = restored.page(0, 10);
        assert_eq!(page["data"][0]["uri"], "b.flac");
        assert_eq!(page["data"][0]["lastPlayed"], 20);
    }

    #[test]
    fn loading_without_a_file_is_empty() {
        let workdir = tempfile::tempdir().unwrap();
        let history = LastPlayed::load(workdir.path(), 10).unwrap();
        assert!(history.is_empty());
    }
}
