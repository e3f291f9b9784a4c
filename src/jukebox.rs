//! Jukebox: keeps the play queue filled without user intervention.
//!
//! Candidates come either from the whole library or from one stored
//! playlist (song mode), or from the distinct album list (album mode).
//! Selection is uniform over a stream of unknown length via reservoir
//! sampling, the kept set gets an independent final shuffle, and playback
//! is restarted once at least one item landed in the queue.

use mpd::{Query, Song, Term};

use crate::error::{Error, Result};
use crate::features::Features;
use crate::link::{Link, Pollable};
use crate::rand;
use crate::snapshot::PlaybackSnapshot;
use crate::stickers::StickerStore;

/// Source name selecting the whole library instead of a playlist.
pub const LIBRARY: &str = "Library";

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JukeboxMode {
    #[default]
    Off,
    AddSong,
    AddAlbum,
}

#[derive(Clone, Debug)]
pub struct JukeboxConfig {
    pub mode: JukeboxMode,

    /// Playlist name, or [`LIBRARY`].
    pub source: String,

    /// Queue length the jukebox tops up to.
    pub queue_length: u32,

    /// Tag that distinguishes candidates for uniqueness purposes.
    pub unique_tag: String,

    /// Hours a song stays excluded after having been played.
    pub lookback_hours: u32,
}

impl Default for JukeboxConfig {
    fn default() -> Self {
        Self {
            mode: JukeboxMode::Off,
            source: String::from(LIBRARY),
            queue_length: 1,
            unique_tag: String::from("Artist"),
            lookback_hours: 24,
        }
    }
}

/// Uniform sample of `want` items from a stream of unknown length.
///
/// The i-th candidate (1-indexed) is kept with probability `want / i`,
/// replacing a uniformly chosen slot once the reservoir is full. Memory is
/// O(want) regardless of stream length.
#[derive(Debug)]
pub struct Reservoir {
    keep: Vec<String>,
    seen: usize,
    want: usize,
}

impl Reservoir {
    #[must_use]
    pub fn new(want: usize) -> Self {
        Self {
            keep: Vec::with_capacity(want),
            seen: 0,
            want,
        }
    }

    pub fn offer(&mut self, item: String) {
        if self.want == 0 {
            return;
        }
        self.seen += 1;
        if rand::below(self.seen) < self.want {
            if self.keep.len() < self.want {
                self.keep.push(item);
            } else {
                let slot = rand::below(self.want);
                self.keep[slot] = item;
            }
        }
    }

    #[must_use]
    pub fn seen(&self) -> usize {
        self.seen
    }

    /// The kept set in a fresh random order, independent of arrival order.
    #[must_use]
    pub fn into_picks(mut self) -> Vec<String> {
        rand::shuffle(&mut self.keep);
        self.keep
    }
}

/// How many items a jukebox pass should add.
///
/// Nothing is due while the queue is at its target and the add-time has not
/// been reached; one extra song is added once it has.
#[must_use]
pub fn songs_due(target: u32, queue_length: u32, add_time: u64, now: u64) -> u32 {
    let add_time_reached = add_time > 0 && now > add_time;
    if queue_length >= target && !add_time_reached {
        return 0;
    }
    let mut due = target.saturating_sub(queue_length);
    if add_time_reached {
        due += 1;
    }
    due
}

/// Runs one jukebox pass against the live connection.
///
/// Retries the add once on failure; a second failure is reported to the
/// caller instead of looping on a persistently empty source.
pub fn run<S: Pollable>(
    link: &mut Link<S>,
    features: &Features,
    jukebox: &JukeboxConfig,
    snapshot: &PlaybackSnapshot,
    stickers: &StickerStore,
) -> Result<()> {
    if jukebox.mode == JukeboxMode::Off {
        return Ok(());
    }

    let status = link.client.status()?;
    let queue_length = status.queue_len;

    let now = crate::snapshot::unix_now();
    let add_time = snapshot
        .song_end_time
        .saturating_sub(snapshot.crossfade.min(snapshot.song_end_time));
    let due = songs_due(jukebox.queue_length, queue_length, add_time, now);
    if due == 0 {
        debug!(
            "jukebox: queue length {queue_length} >= {} and add time not reached",
            jukebox.queue_length
        );
        return Ok(());
    }

    if !features.playlists && jukebox.source != LIBRARY {
        warn!("jukebox: playlists are disabled");
        return Ok(());
    }

    // One bounded retry; a second failure is the caller's problem.
    for attempt in 0..2 {
        match add(link, jukebox, stickers, due as usize) {
            Ok(added) if added > 0 => {
                link.client.play()?;
                return Ok(());
            }
            Ok(_) => warn!("jukebox: added no songs, trying again"),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!("jukebox: adding songs failed: {e}"),
        }
        if attempt == 0 {
            debug!("jukebox: retrying");
        }
    }
    Err(Error::internal("jukebox could not add any songs"))
}

/// Explicit random-add, reusing the jukebox sampler with caller-supplied
/// mode, source and quantity.
pub fn add_random<S: Pollable>(
    link: &mut Link<S>,
    features: &Features,
    mode: JukeboxMode,
    source: &str,
    quantity: usize,
    stickers: &StickerStore,
) -> Result<usize> {
    if !features.playlists && source != LIBRARY {
        return Err(Error::unsupported("playlists are disabled"));
    }
    let jukebox = JukeboxConfig {
        mode,
        source: source.to_string(),
        lookback_hours: 0,
        ..JukeboxConfig::default()
    };
    add(link, &jukebox, stickers, quantity)
}

/// Samples candidates and enqueues them, returning how many were added.
fn add<S: Pollable>(
    link: &mut Link<S>,
    jukebox: &JukeboxConfig,
    stickers: &StickerStore,
    want: usize,
) -> Result<usize> {
    if want == 0 {
        return Ok(0);
    }

    let picks = match jukebox.mode {
        JukeboxMode::Off => return Ok(0),
        JukeboxMode::AddSong => sample_songs(link, jukebox, stickers, want)?,
        JukeboxMode::AddAlbum => sample_albums(link, want)?,
    };
    if picks.len() < want {
        warn!("jukebox: input had only {} candidates", picks.len());
    }

    let mut added = 0;
    for pick in picks {
        let outcome = match jukebox.mode {
            JukeboxMode::AddSong => {
                info!("jukebox: adding song {pick}");
                let song = Song {
                    file: pick,
                    ..Song::default()
                };
                link.client.push(&song).map(|_| ())
            }
            JukeboxMode::AddAlbum => {
                info!("jukebox: adding album {pick}");
                let mut query = Query::new();
                query.and(Term::Tag("Album".into()), pick);
                link.client.findadd(&query)
            }
            JukeboxMode::Off => unreachable!(),
        };
        match outcome {
            Ok(()) => added += 1,
            Err(e) => {
                let error = Error::from(e);
                if error.is_fatal() {
                    return Err(error);
                }
                warn!("jukebox: enqueue failed: {error}");
            }
        }
    }
    Ok(added)
}

fn sample_songs<S: Pollable>(
    link: &mut Link<S>,
    jukebox: &JukeboxConfig,
    stickers: &StickerStore,
    want: usize,
) -> Result<Vec<String>> {
    let candidates = if jukebox.source == LIBRARY {
        link.client.listall()?
    } else {
        link.client.playlist(&jukebox.source)?
    };

    // Songs already queued or played within the lookback window are not
    // candidates.
    let queued: std::collections::HashSet<String> = link
        .client
        .queue()?
        .into_iter()
        .map(|song| song.file)
        .collect();
    let now = crate::snapshot::unix_now();
    let lookback = u64::from(jukebox.lookback_hours) * 3_600;

    let mut reservoir = Reservoir::new(want);
    for song in candidates {
        if queued.contains(&song.file) {
            continue;
        }
        if lookback > 0 {
            if let Some(values) = stickers.get(&song.file) {
                if values.last_played + lookback > now {
                    continue;
                }
            }
        }
        reservoir.offer(song.file);
    }
    debug!("jukebox: sampled from {} songs", reservoir.seen());
    Ok(reservoir.into_picks())
}

fn sample_albums<S: Pollable>(link: &mut Link<S>, want: usize) -> Result<Vec<String>> {
    let albums = link.client.list(&Term::Tag("Album".into()), &Query::new())?;
    let mut reservoir = Reservoir::new(want);
    for album in albums {
        reservoir.offer(album);
    }
    debug!("jukebox: sampled from {} albums", reservoir.seen());
    Ok(reservoir.into_picks())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn keeps_exactly_the_requested_count() {
        let mut reservoir = Reservoir::new(5);
        for i in 0..20 {
            reservoir.offer(format!("song-{i}"));
        }
        assert_eq!(reservoir.into_picks().len(), 5);
    }

    #[test]
    fn keeps_everything_when_stream_is_short() {
        let mut reservoir = Reservoir::new(5);
        for i in 0..3 {
            reservoir.offer(format!("song-{i}"));
        }
        let mut picks = reservoir.into_picks();
        picks.sort();
        assert_eq!(picks, vec!["song-0", "song-1", "song-2"]);
    }

    #[test]
    fn selection_is_uniform_over_many_trials() {
        // 10,000 trials of picking 5 out of 20: each candidate's marginal
        // selection count should land near 2,500. The band is wide enough
        // that a correct sampler virtually never leaves it.
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..10_000 {
            let mut reservoir = Reservoir::new(5);
            for i in 0..20 {
                reservoir.offer(format!("song-{i}"));
            }
            for pick in reservoir.into_picks() {
                *counts.entry(pick).or_default() += 1;
            }
        }
        assert_eq!(counts.len(), 20);
        for (song, count) in counts {
            assert!(
                (2_000..=3_000).contains(&count),
                "{song} selected {count} times"
            );
        }
    }

    #[test]
    fn nothing_due_at_target_before_add_time() {
        assert_eq!(songs_due(5, 5, 2_000, 1_000), 0);
        assert_eq!(songs_due(5, 7, 0, 1_000), 0);
    }

    #[test]
    fn short_queue_tops_up_to_target() {
        assert_eq!(songs_due(5, 0, 2_000, 1_000), 5);
        assert_eq!(songs_due(5, 3, 2_000, 1_000), 2);
    }

    #[test]
    fn crossing_add_time_adds_one_extra() {
        assert_eq!(songs_due(5, 5, 1_000, 1_001), 1);
        assert_eq!(songs_due(5, 3, 1_000, 1_001), 3);
    }

    #[test]
    fn empty_reservoir_yields_nothing() {
        let reservoir = Reservoir::new(0);
        assert!(reservoir.into_picks().is_empty());
    }

    #[test]
    fn fills_an_empty_queue_to_target_and_starts_playback() {
        use std::time::Duration;

        use mpd::Client;

        use crate::link::testing::FakeStream;
        use crate::link::Link;
        use crate::snapshot::PlaybackSnapshot;

        let fake = FakeStream::new();
        fake.set_library((0..8).map(|i| format!("song-{i}.flac")));
        let client = Client::new(fake.clone()).expect("handshake");
        let mut link = Link::new(client, fake.clone(), Duration::from_secs(1));

        let features = Features {
            playlists: true,
            ..Features::default()
        };
        let jukebox = JukeboxConfig {
            mode: JukeboxMode::AddSong,
            queue_length: 5,
            lookback_hours: 0,
            ..JukeboxConfig::default()
        };
        run(
            &mut link,
            &features,
            &jukebox,
            &PlaybackSnapshot::default(),
            &StickerStore::new(),
        )
        .expect("jukebox run");

        let written = fake.written();
        let adds = written
            .lines()
            .filter(|line| line.starts_with("addid") || line.starts_with("add "))
            .count();
        assert_eq!(adds, 5, "expected five add commands: {written}");
        assert!(
            written.lines().any(|line| line == "play"),
            "playback restarted: {written}"
        );
    }
}
