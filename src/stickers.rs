//! Per-song sticker tracking.
//!
//! Play and skip counters, last-played/last-skipped timestamps and the
//! "like" flag are stored as stickers on the server. Updates are driven by
//! idle transitions only and are queued rather than written immediately:
//! the multiplexer flushes the queue once the connection has left idle
//! mode. A failed flush keeps the remaining operations queued so they are
//! re-attempted after a reconnect.

use std::collections::{HashMap, VecDeque};

use mpd::Client;

use crate::error::{Error, ErrorKind, Result};
use crate::link::Pollable;

pub const STICKER_TYPE_SONG: &str = "song";

pub const PLAY_COUNT: &str = "playCount";
pub const SKIP_COUNT: &str = "skipCount";
pub const LAST_PLAYED: &str = "lastPlayed";
pub const LAST_SKIPPED: &str = "lastSkipped";
pub const LIKE: &str = "like";

/// A queued sticker mutation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StickerOp {
    IncPlayCount(String),
    IncSkipCount(String),
    LastPlayed(String, u64),
    LastSkipped(String, u64),
    Like(String, u8),
}

/// Cached numeric sticker values for one song.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StickerValues {
    pub play_count: u32,
    pub skip_count: u32,
    pub last_played: u64,
    pub last_skipped: u64,
    pub like: u8,
}

/// Pending sticker operations plus a uri-keyed cache of current values.
///
/// The cache is rebuilt on connect and whenever the database changes; it
/// backs sticker-ranked smart playlists and enriches song listings without
/// another server round trip.
#[derive(Debug, Default)]
pub struct StickerStore {
    pending: VecDeque<StickerOp>,
    cache: HashMap<String, StickerValues>,
}

impl StickerStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, op: StickerOp) {
        self.pending.push_back(op);
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn get(&self, uri: &str) -> Option<&StickerValues> {
        self.cache.get(uri)
    }

    /// Songs with the named sticker at or above `min_value`, unsorted.
    #[must_use]
    pub fn ranked(&self, sticker: &str, min_value: u32) -> Vec<(String, u32)> {
        self.cache
            .iter()
            .filter_map(|(uri, values)| {
                let value = match sticker {
                    PLAY_COUNT => values.play_count,
                    SKIP_COUNT => values.skip_count,
                    LIKE => u32::from(values.like),
                    _ => 0,
                };
                (value >= min_value && value >= 1).then(|| (uri.clone(), value))
            })
            .collect()
    }

    /// Applies every queued operation against the connection.
    ///
    /// A transport failure keeps the remaining operations queued so they
    /// are re-attempted after the reconnect; a server rejection drops just
    /// the offending operation.
    pub fn flush<S: Pollable>(&mut self, client: &mut Client<S>) -> Result<()> {
        while let Some(op) = self.pending.front().cloned() {
            match self.apply(client, &op) {
                Ok(()) => {
                    self.pending.pop_front();
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("dropping sticker update {op:?}: {e}");
                    self.pending.pop_front();
                }
            }
        }
        Ok(())
    }

    fn apply<S: Pollable>(&mut self, client: &mut Client<S>, op: &StickerOp) -> Result<()> {
        match op {
            StickerOp::IncPlayCount(uri) => {
                let count = bump(client, uri, PLAY_COUNT)?;
                self.cache.entry(uri.clone()).or_default().play_count = count;
            }
            StickerOp::IncSkipCount(uri) => {
                let count = bump(client, uri, SKIP_COUNT)?;
                self.cache.entry(uri.clone()).or_default().skip_count = count;
            }
            StickerOp::LastPlayed(uri, stamp) => {
                set_numeric(client, uri, LAST_PLAYED, *stamp)?;
                self.cache.entry(uri.clone()).or_default().last_played = *stamp;
            }
            StickerOp::LastSkipped(uri, stamp) => {
                set_numeric(client, uri, LAST_SKIPPED, *stamp)?;
                self.cache.entry(uri.clone()).or_default().last_skipped = *stamp;
            }
            StickerOp::Like(uri, value) => {
                set_numeric(client, uri, LIKE, u64::from(*value))?;
                self.cache.entry(uri.clone()).or_default().like = *value;
            }
        }
        Ok(())
    }

    /// Rebuilds the cache from the server's sticker database.
    pub fn rebuild<S: Pollable>(&mut self, client: &mut Client<S>) -> Result<()> {
        let mut cache: HashMap<String, StickerValues> = HashMap::new();
        for name in [PLAY_COUNT, SKIP_COUNT, LAST_PLAYED, LAST_SKIPPED, LIKE] {
            let found = match client.find_sticker(STICKER_TYPE_SONG, "", name) {
                Ok(found) => found,
                Err(e) => {
                    // An empty sticker database answers with an ACK.
                    let error = Error::from(e);
                    if error.kind == ErrorKind::Rejected {
                        continue;
                    }
                    return Err(error);
                }
            };
            for (uri, value) in found {
                let parsed = value.parse::<u64>().unwrap_or(0);
                let values = cache.entry(uri).or_default();
                match name {
                    PLAY_COUNT => {
                        values.play_count = u32::try_from(parsed).unwrap_or(u32::MAX);
                    }
                    SKIP_COUNT => {
                        values.skip_count = u32::try_from(parsed).unwrap_or(u32::MAX);
                    }
                    LAST_PLAYED => values.last_played = parsed,
                    LAST_SKIPPED => values.last_skipped = parsed,
                    _ => values.like = u8::try_from(parsed.min(2)).unwrap_or(2),
                }
            }
        }
        info!("sticker cache rebuilt with {} songs", cache.len());
        self.cache = cache;
        Ok(())
    }
}

/// Reads, increments and writes back a counter sticker, returning the new
/// value. A missing sticker counts as zero.
fn bump<S: Pollable>(client: &mut Client<S>, uri: &str, name: &str) -> Result<u32> {
    let current = read_numeric(client, uri, name)?;
    let next = u32::try_from(current.saturating_add(1)).unwrap_or(u32::MAX);
    set_numeric(client, uri, name, u64::from(next))?;
    debug!("sticker {name}={next} for {uri}");
    Ok(next)
}

fn read_numeric<S: Pollable>(client: &mut Client<S>, uri: &str, name: &str) -> Result<u64> {
    match client.sticker(STICKER_TYPE_SONG, uri, name) {
        Ok(value) => Ok(value.parse::<u64>().unwrap_or(0)),
        Err(e) => {
            let error = Error::from(e);
            if error.kind == ErrorKind::Rejected {
                // Sticker not set yet.
                Ok(0)
            } else {
                Err(error)
            }
        }
    }
}

fn set_numeric<S: Pollable>(
    client: &mut Client<S>,
    uri: &str,
    name: &str,
    value: u64,
) -> Result<()> {
    client
        .set_sticker(STICKER_TYPE_SONG, uri, name, &value.to_string())
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_ops_queue_in_order() {
        let mut store = StickerStore::new();
        store.enqueue(StickerOp::IncPlayCount("a.flac".into()));
        store.enqueue(StickerOp::LastPlayed("a.flac".into(), 1_000));
        assert_eq!(store.pending_len(), 2);
    }

    #[test]
    fn ranked_filters_by_minimum() {
        let mut store = StickerStore::new();
        store.cache.insert(
            "hot.flac".into(),
            StickerValues {
                play_count: 9,
                ..StickerValues::default()
            },
        );
        store.cache.insert(
            "cold.flac".into(),
            StickerValues {
                play_count: 1,
                ..StickerValues::default()
            },
        );
        let ranked = store.ranked(PLAY_COUNT, 5);
        assert_eq!(ranked, vec![(String::from("hot.flac"), 9)]);
    }

    #[test]
    fn ranked_ignores_zero_values() {
        let mut store = StickerStore::new();
        store
            .cache
            .insert("new.flac".into(), StickerValues::default());
        assert!(store.ranked(PLAY_COUNT, 0).is_empty());
    }
}
