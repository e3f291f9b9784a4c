//! Last-observed playback state.
//!
//! The snapshot is refreshed on every relevant idle event and consumed by
//! the derived trackers: the jukebox schedules its next add from the
//! projected song end, the play-count tracker from the mark-as-played
//! deadline, and skip detection compares consecutive snapshots.

use std::time::{SystemTime, UNIX_EPOCH};

use mpd::{Song, State, Status};

/// A song is marked played after half its length, at most this many seconds
/// into it.
const PLAYED_CAP_SECS: u64 = 240;

/// Minimum seconds a song must have run for its abandonment to count as a
/// skip. Strictly greater-than.
const SKIP_THRESHOLD_SECS: u64 = 10;

/// Seconds since the Unix epoch.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PlayState {
    Play,
    Pause,
    #[default]
    Stop,
}

impl PlayState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Play => "play",
            Self::Pause => "pause",
            Self::Stop => "stop",
        }
    }
}

impl From<State> for PlayState {
    fn from(state: State) -> Self {
        match state {
            State::Play => Self::Play,
            State::Pause => Self::Pause,
            State::Stop => Self::Stop,
        }
    }
}

/// The subset of the server status the session keeps between refreshes.
///
/// Decoupled from the protocol types so state transitions can be exercised
/// without a connection.
#[derive(Clone, Debug, Default)]
pub struct StatusView {
    pub state: PlayState,
    pub volume: i8,
    pub queue_length: u32,
    pub queue_version: u32,
    pub crossfade: u64,
    pub elapsed: u64,
    pub duration: u64,
    pub song_id: Option<u32>,
    pub next_song_id: Option<u32>,
    pub song_uri: Option<String>,
}

impl StatusView {
    #[must_use]
    pub fn capture(status: &Status, current: Option<&Song>) -> Self {
        Self {
            state: status.state.into(),
            volume: status.volume,
            queue_length: status.queue_len,
            queue_version: status.queue_version,
            crossfade: status.crossfade.map_or(0, |value| value.as_secs()),
            elapsed: status.elapsed.map_or(0, |value| value.as_secs()),
            duration: current
                .and_then(|song| song.duration)
                .map_or(0, |value| value.as_secs()),
            song_id: status.song.map(|place| place.id.0),
            next_song_id: status.nextsong.map(|place| place.id.0),
            song_uri: current.map(|song| song.file.clone()),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PlaybackSnapshot {
    pub state: PlayState,
    pub volume: i8,
    pub queue_length: u32,
    pub queue_version: u32,
    pub crossfade: u64,
    pub elapsed: u64,
    pub duration: u64,

    pub song_id: Option<u32>,
    pub song_uri: String,
    pub next_song_id: Option<u32>,

    pub last_song_id: Option<u32>,
    pub last_song_uri: String,

    /// Epoch seconds the current song started and is projected to end.
    pub song_start_time: u64,
    pub song_end_time: u64,
    pub last_song_start_time: u64,
    pub last_song_end_time: u64,

    /// Epoch second after which the current song counts as played.
    pub set_song_played_time: u64,

    /// Songs already accounted for, so each transition is recorded once.
    pub last_skipped_id: Option<u32>,
    pub last_counted_id: Option<u32>,
}

impl PlaybackSnapshot {
    /// Folds a fresh status into the snapshot.
    ///
    /// On a song change the previous song's timing moves into the
    /// `last_song_*` fields for skip accounting.
    pub fn apply(&mut self, view: &StatusView, now: u64) {
        self.state = view.state;
        self.volume = view.volume;
        self.queue_length = view.queue_length;
        self.queue_version = view.queue_version;
        self.crossfade = view.crossfade;
        self.elapsed = view.elapsed;
        self.duration = view.duration;
        self.next_song_id = view.next_song_id;

        if view.song_id != self.song_id {
            self.last_song_id = self.song_id;
            self.last_song_uri = std::mem::take(&mut self.song_uri);
            self.last_song_start_time = self.song_start_time;
            self.last_song_end_time = self.song_end_time;
            self.song_id = view.song_id;
        }
        self.song_uri = view.song_uri.clone().unwrap_or_default();

        if self.state == PlayState::Play && view.duration > 0 {
            self.song_start_time = now.saturating_sub(view.elapsed);
            self.song_end_time = self.song_start_time + view.duration;
            let half = view.duration / 2;
            self.set_song_played_time = self.song_start_time + half.min(PLAYED_CAP_SECS);
        } else {
            // Stopped, or a stream without a known length: nothing to
            // schedule against.
            self.song_start_time = 0;
            self.song_end_time = 0;
            self.set_song_played_time = 0;
        }
    }

    /// The previous song's uri when the transition away from it counts as a
    /// skip at `now`: the player moved on before the projected end, after
    /// more than [`SKIP_THRESHOLD_SECS`] of playback, and the song has not
    /// been flagged yet.
    #[must_use]
    pub fn skipped(&self, now: u64) -> Option<&str> {
        if self.song_id == self.last_song_id {
            return None;
        }
        self.last_song_id?;
        if self.last_song_uri.is_empty() || self.last_skipped_id == self.last_song_id {
            return None;
        }
        if self.last_song_end_time <= now || self.last_song_start_time == 0 {
            return None;
        }
        let ran_for = now.saturating_sub(self.last_song_start_time);
        (ran_for > SKIP_THRESHOLD_SECS).then_some(self.last_song_uri.as_str())
    }

    /// Flags the previous song so it is not counted as skipped twice.
    pub fn mark_skipped(&mut self) {
        self.last_skipped_id = self.last_song_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playing(song_id: u32, uri: &str, elapsed: u64, duration: u64) -> StatusView {
        StatusView {
            state: PlayState::Play,
            queue_length: 2,
            elapsed,
            duration,
            song_id: Some(song_id),
            song_uri: Some(uri.to_string()),
            ..StatusView::default()
        }
    }

    #[test]
    fn song_change_rotates_previous_timing() {
        let mut snapshot = PlaybackSnapshot::default();
        snapshot.apply(&playing(1, "a.flac", 0, 180), 1_000);
        snapshot.apply(&playing(2, "b.flac", 0, 200), 1_015);

        assert_eq!(snapshot.song_id, Some(2));
        assert_eq!(snapshot.last_song_id, Some(1));
        assert_eq!(snapshot.last_song_uri, "a.flac");
        assert_eq!(snapshot.last_song_start_time, 1_000);
        assert_eq!(snapshot.last_song_end_time, 1_180);
    }

    #[test]
    fn abandoning_a_song_after_fifteen_seconds_is_a_skip() {
        let mut snapshot = PlaybackSnapshot::default();
        snapshot.apply(&playing(1, "a.flac", 0, 180), 1_000);
        snapshot.apply(&playing(2, "b.flac", 0, 200), 1_015);

        assert_eq!(snapshot.skipped(1_015), Some("a.flac"));
    }

    #[test]
    fn short_plays_are_not_skips() {
        let mut snapshot = PlaybackSnapshot::default();
        snapshot.apply(&playing(1, "a.flac", 0, 180), 1_000);
        snapshot.apply(&playing(2, "b.flac", 0, 200), 1_003);

        assert_eq!(snapshot.skipped(1_003), None);
    }

    #[test]
    fn exactly_ten_seconds_is_not_a_skip() {
        let mut snapshot = PlaybackSnapshot::default();
        snapshot.apply(&playing(1, "a.flac", 0, 180), 1_000);
        snapshot.apply(&playing(2, "b.flac", 0, 200), 1_010);

        assert_eq!(snapshot.skipped(1_010), None);
    }

    #[test]
    fn natural_end_is_not_a_skip() {
        let mut snapshot = PlaybackSnapshot::default();
        snapshot.apply(&playing(1, "a.flac", 0, 180), 1_000);
        // Next refresh happens after the projected end of the first song.
        snapshot.apply(&playing(2, "b.flac", 0, 200), 1_181);

        assert_eq!(snapshot.skipped(1_181), None);
    }

    #[test]
    fn skips_are_counted_once() {
        let mut snapshot = PlaybackSnapshot::default();
        snapshot.apply(&playing(1, "a.flac", 0, 180), 1_000);
        snapshot.apply(&playing(2, "b.flac", 0, 200), 1_015);

        assert!(snapshot.skipped(1_015).is_some());
        snapshot.mark_skipped();
        assert_eq!(snapshot.skipped(1_015), None);
    }

    #[test]
    fn played_deadline_is_half_duration_capped() {
        let mut snapshot = PlaybackSnapshot::default();
        snapshot.apply(&playing(1, "a.flac", 0, 180), 1_000);
        assert_eq!(snapshot.set_song_played_time, 1_090);

        snapshot.apply(&playing(2, "long.flac", 0, 1_200), 2_000);
        assert_eq!(snapshot.set_song_played_time, 2_000 + PLAYED_CAP_SECS);
    }

    #[test]
    fn stopping_clears_the_schedule() {
        let mut snapshot = PlaybackSnapshot::default();
        snapshot.apply(&playing(1, "a.flac", 0, 180), 1_000);
        snapshot.apply(&StatusView::default(), 1_020);

        assert_eq!(snapshot.song_end_time, 0);
        assert_eq!(snapshot.set_song_played_time, 0);
    }
}
