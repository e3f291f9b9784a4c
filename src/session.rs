//! The session engine.
//!
//! One dedicated thread owns the single server connection and everything
//! derived from it. The connection moves through a small state machine:
//!
//! ```text
//! Disconnected -> Connected -> (Failure | Disconnect) -> Wait -> Disconnected
//! ```
//!
//! While connected, the loop alternates between a blocking idle wait on the
//! server's notification stream and servicing pending work items and
//! scheduled side effects, with a short poll budget as the scheduling tick.
//! Idle wait and command execution are mutually exclusive on the wire: the
//! loop always cancels the idle wait before issuing a command and re-enters
//! it afterwards.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mpd::idle::Subsystem;
use mpd::Idle;
use serde_json::Value;

use crate::api::{self, Method, WorkRequest, WorkResult};
use crate::config::Config;
use crate::dispatch;
use crate::error::Result;
use crate::features::{self, Features};
use crate::history::LastPlayed;
use crate::jukebox::{self, JukeboxConfig, JukeboxMode};
use crate::link::{self, Link, Pollable};
use crate::notify;
use crate::playlists;
use crate::queue::Queue;
use crate::snapshot::{unix_now, PlayState, PlaybackSnapshot};
use crate::stickers::{StickerOp, StickerStore};

/// Poll budget for the idle readiness check and the work queue length.
const POLL_BUDGET: Duration = Duration::from_millis(50);

/// Backoff added per failed connect attempt, and its ceiling, in seconds.
const BACKOFF_STEP_SECS: u64 = 2;
const BACKOFF_CAP_SECS: u64 = 20;

/// Sleep between wait-state rounds so a dead server does not spin the CPU.
const WAIT_NAP: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnState {
    #[default]
    Disconnected,
    Connected,
    Wait,
    Failure,
    Disconnect,
    Reconnect,
}

/// Effects of a settings update the dispatcher must act on.
#[derive(Debug, Default)]
pub struct SettingsOutcome {
    /// Connection parameters changed; drop and redial.
    pub reconnect: bool,
    /// Jukebox configuration changed; re-kick the engine.
    pub jukebox_changed: bool,
    /// First key that failed to apply, if any.
    pub failed_key: Option<String>,
}

/// All state owned by the session thread.
///
/// Nothing in here is shared: cross-thread traffic goes through the two
/// queues and the shutdown flag only.
pub struct Session {
    pub config: Config,
    pub conn_state: ConnState,
    pub features: Features,
    pub snapshot: PlaybackSnapshot,
    pub jukebox: JukeboxConfig,
    pub stickers: StickerStore,
    pub history: LastPlayed,

    pub inbound: Arc<Queue<WorkRequest>>,
    pub outbound: Arc<Queue<WorkResult>>,
    shutdown: Arc<AtomicBool>,

    reconnect_interval: u64,
    reconnect_at: u64,
    smartpls_due: u64,
}

/// Scheduled side effects due in the current loop iteration.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Wakeup {
    pub set_played: bool,
    pub jukebox_add: bool,
    pub sticker_flush: bool,
    pub smartpls_refresh: bool,
}

impl Wakeup {
    /// Evaluates the scheduled triggers against the playback snapshot.
    ///
    /// Jukebox and played-marking only fire while the player is playing;
    /// the jukebox add-time is the projected song end minus the crossfade.
    #[must_use]
    pub fn compute(
        snapshot: &PlaybackSnapshot,
        jukebox: &JukeboxConfig,
        sticker_pending: usize,
        smartpls_due: u64,
        now: u64,
    ) -> Self {
        let mut wakeup = Self {
            sticker_flush: sticker_pending > 0,
            smartpls_refresh: smartpls_due > 0 && now >= smartpls_due,
            ..Self::default()
        };
        if snapshot.state == PlayState::Play {
            wakeup.set_played = snapshot.set_song_played_time > 0
                && now > snapshot.set_song_played_time
                && snapshot.last_counted_id != snapshot.song_id;
            if jukebox.mode != JukeboxMode::Off {
                let add_time = snapshot
                    .song_end_time
                    .saturating_sub(snapshot.crossfade.min(snapshot.song_end_time));
                wakeup.jukebox_add = add_time > 0
                    && now > add_time
                    && snapshot.queue_length <= jukebox.queue_length;
            }
        }
        wakeup
    }

    #[must_use]
    pub fn any(&self) -> bool {
        self.set_played || self.jukebox_add || self.sticker_flush || self.smartpls_refresh
    }
}

/// Runs the session until the shutdown flag is raised. This is the entry
/// point for the dedicated session thread.
pub fn run(
    config: Config,
    inbound: Arc<Queue<WorkRequest>>,
    outbound: Arc<Queue<WorkResult>>,
    shutdown: Arc<AtomicBool>,
) {
    let mut session = Session::new(config, inbound, outbound, shutdown);

    session.wait_for_initial_settings();
    info!("starting session loop");

    while !session.shutting_down() {
        match session.conn_state {
            ConnState::Disconnected => session.connect(),
            ConnState::Connected => {
                // `connect` only returns once the state moved on; seeing
                // Connected here means the bookkeeping broke.
                error!("invalid connection state");
                session.conn_state = ConnState::Failure;
            }
            ConnState::Failure => {
                error!("connection failed");
                session.broadcast(notify::connection(false));
                session.schedule_reconnect();
            }
            ConnState::Disconnect | ConnState::Reconnect => session.schedule_reconnect(),
            ConnState::Wait => session.wait_tick(),
        }
    }

    info!("session shutting down");
    if let Err(e) = session.history.save(&session.config.workdir) {
        error!("saving last played history failed: {e}");
    }
}

impl Session {
    #[must_use]
    pub fn new(
        config: Config,
        inbound: Arc<Queue<WorkRequest>>,
        outbound: Arc<Queue<WorkResult>>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let history = LastPlayed::load(&config.workdir, config.last_played_count)
            .unwrap_or_else(|e| {
                error!("loading last played history failed: {e}");
                LastPlayed::new(config.last_played_count)
            });
        Self {
            config,
            conn_state: ConnState::Disconnected,
            features: Features::default(),
            snapshot: PlaybackSnapshot::default(),
            jukebox: JukeboxConfig::default(),
            stickers: StickerStore::new(),
            history,
            inbound,
            outbound,
            shutdown,
            reconnect_interval: 0,
            reconnect_at: 0,
            smartpls_due: 0,
        }
    }

    #[must_use]
    pub fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Queues an unsolicited notification for the front end. Best effort:
    /// delivery is not acknowledged and never retried.
    pub fn broadcast(&self, payload: Value) {
        self.outbound.push(WorkResult::broadcast(payload));
    }

    /// Answers a request with a "server disconnected" error, used for
    /// everything that arrives while no connection exists.
    fn reply_disconnected(&self, request: &WorkRequest) {
        if request.wants_reply() {
            debug!("rejecting request while disconnected");
            self.outbound.push(WorkResult::reply_to(
                request,
                api::respond_message(request.method, "server disconnected", true),
            ));
        }
    }

    /// Blocks until the initial settings arrive from the front end.
    ///
    /// Everything else submitted before that is answered with a
    /// disconnected error and dropped.
    fn wait_for_initial_settings(&mut self) {
        while !self.shutting_down() {
            let Some(request) = self.inbound.pop_timeout(POLL_BUDGET) else {
                continue;
            };
            if request.method == Method::SettingsSet {
                debug!("got initial settings");
                let outcome = self.apply_settings(&request.params);
                if let Some(key) = outcome.failed_key {
                    error!("initial settings rejected at key {key}");
                }
                if request.wants_reply() {
                    self.outbound.push(WorkResult::reply_to(
                        &request,
                        api::respond_ok(request.method),
                    ));
                }
                return;
            }
            self.reply_disconnected(&request);
        }
    }

    /// Applies a settings map, reporting whether a reconnect or jukebox
    /// re-kick is needed. Unknown keys fail the update.
    pub fn apply_settings(&mut self, settings: &Value) -> SettingsOutcome {
        let mut outcome = SettingsOutcome::default();
        let Some(map) = settings.as_object() else {
            outcome.failed_key = Some(String::from("params"));
            return outcome;
        };
        for (key, value) in map {
            if !self.apply_setting(key, value, &mut outcome) {
                warn!("unusable setting {key}: {value}");
                outcome.failed_key = Some(key.clone());
                return outcome;
            }
        }
        outcome
    }

    #[expect(clippy::too_many_lines)]
    fn apply_setting(&mut self, key: &str, value: &Value, outcome: &mut SettingsOutcome) -> bool {
        match key {
            "mpdHost" => {
                let Some(host) = value.as_str() else {
                    return false;
                };
                if host != self.config.mpd_host {
                    self.config.mpd_host = host.to_string();
                    outcome.reconnect = true;
                }
            }
            "mpdPort" => {
                let Some(port) = value.as_u64().and_then(|p| u16::try_from(p).ok()) else {
                    return false;
                };
                if port != self.config.mpd_port {
                    self.config.mpd_port = port;
                    outcome.reconnect = true;
                }
            }
            "mpdPass" => {
                let Some(pass) = value.as_str() else {
                    return false;
                };
                if pass != self.config.mpd_pass {
                    self.config.mpd_pass = pass.to_string();
                    outcome.reconnect = true;
                }
            }
            "autoPlay" => {
                let Some(auto_play) = value.as_bool() else {
                    return false;
                };
                self.config.auto_play = auto_play;
            }
            "stickers" => {
                let Some(stickers) = value.as_bool() else {
                    return false;
                };
                self.config.stickers = stickers;
            }
            "smartpls" => {
                let Some(smartpls) = value.as_bool() else {
                    return false;
                };
                self.config.smartpls = smartpls;
            }
            "smartplsInterval" => {
                let Some(interval) = value.as_u64() else {
                    return false;
                };
                self.config.smartpls_interval = interval;
            }
            "lastPlayedCount" => {
                let Some(count) = value.as_u64() else {
                    return false;
                };
                self.config.last_played_count = usize::try_from(count).unwrap_or(usize::MAX);
            }
            "love" => {
                let Some(love) = value.as_bool() else {
                    return false;
                };
                self.config.love = love;
            }
            "loveChannel" => {
                let Some(channel) = value.as_str() else {
                    return false;
                };
                self.config.love_channel = channel.to_string();
            }
            "loveMessage" => {
                let Some(message) = value.as_str() else {
                    return false;
                };
                self.config.love_message = message.to_string();
            }
            "taglist" => {
                let Some(tags) = value.as_array() else {
                    return false;
                };
                let mut taglist = Vec::with_capacity(tags.len());
                for tag in tags {
                    let Some(tag) = tag.as_str() else {
                        return false;
                    };
                    taglist.push(tag.to_string());
                }
                self.config.taglist = taglist;
            }
            "maxElementsPerPage" => {
                let Some(max) = value.as_u64() else {
                    return false;
                };
                self.config.max_elements_per_page = usize::try_from(max).unwrap_or(usize::MAX);
            }
            "jukeboxMode" => {
                let Ok(mode) = serde_json::from_value::<JukeboxMode>(value.clone()) else {
                    return false;
                };
                if mode != self.jukebox.mode {
                    self.jukebox.mode = mode;
                    outcome.jukebox_changed = true;
                }
            }
            "jukeboxPlaylist" => {
                let Some(source) = value.as_str() else {
                    return false;
                };
                if source != self.jukebox.source {
                    self.jukebox.source = source.to_string();
                    outcome.jukebox_changed = true;
                }
            }
            "jukeboxQueueLength" => {
                let Some(length) = value.as_u64().and_then(|l| u32::try_from(l).ok()) else {
                    return false;
                };
                self.jukebox.queue_length = length;
            }
            "jukeboxUniqueTag" => {
                let Some(tag) = value.as_str() else {
                    return false;
                };
                self.jukebox.unique_tag = tag.to_string();
            }
            "jukeboxLastPlayed" => {
                let Some(hours) = value.as_u64().and_then(|h| u32::try_from(h).ok()) else {
                    return false;
                };
                self.jukebox.lookback_hours = hours;
            }
            _ => return false,
        }
        true
    }

    /// Adds the backoff step, caps it, and parks the state machine in
    /// `Wait` until the retry deadline.
    fn schedule_reconnect(&mut self) {
        self.release_wire_state();
        self.reconnect_interval =
            (self.reconnect_interval + BACKOFF_STEP_SECS).min(BACKOFF_CAP_SECS);
        self.reconnect_at = unix_now() + self.reconnect_interval;
        info!("waiting {} seconds before reconnect", self.reconnect_interval);
        self.conn_state = ConnState::Wait;
    }

    #[must_use]
    pub fn reconnect_interval(&self) -> u64 {
        self.reconnect_interval
    }

    /// Forgets connection-derived state. Pending sticker updates stay
    /// queued so they are re-attempted after the reconnect.
    fn release_wire_state(&mut self) {
        self.features = Features::default();
        self.snapshot = PlaybackSnapshot::default();
        self.smartpls_due = 0;
    }

    /// One round of the wait state: honor settings updates, reject
    /// everything else, and move on once the retry deadline passed.
    fn wait_tick(&mut self) {
        let now = unix_now();
        if now > self.reconnect_at {
            self.conn_state = ConnState::Disconnected;
        }
        if let Some(request) = self.inbound.pop_timeout(POLL_BUDGET) {
            if request.method == Method::SettingsSet {
                debug!("handling settings update while disconnected");
                let outcome = self.apply_settings(&request.params);
                if request.wants_reply() {
                    let payload = match outcome.failed_key {
                        Some(key) => api::respond_message(
                            request.method,
                            &format!("can't save setting {key}"),
                            true,
                        ),
                        None => api::respond_ok(request.method),
                    };
                    self.outbound.push(WorkResult::reply_to(&request, payload));
                }
                // Retry immediately with the fresh parameters.
                self.conn_state = ConnState::Disconnected;
                self.reconnect_interval = 0;
                self.reconnect_at = 0;
                return;
            }
            self.reply_disconnected(&request);
        }
        if now < self.reconnect_at {
            thread::sleep(WAIT_NAP);
        }
    }

    /// Attempts one connection with the current settings and, on success,
    /// serves it until it fails or is torn down.
    fn connect(&mut self) {
        let result = if link::is_socket_path(&self.config.mpd_host) {
            link::connect_unix(&self.config).map(|mut l| self.serve(&mut l))
        } else {
            link::connect_tcp(&self.config).map(|mut l| self.serve(&mut l))
        };
        if let Err(e) = result {
            error!("connection failed: {e}");
            self.broadcast(notify::connection_error(&e.to_string()));
            self.conn_state = ConnState::Failure;
        }
    }

    /// Post-connect setup and the connected loop.
    fn serve<S: Pollable>(&mut self, link: &mut Link<S>) {
        info!("server connected");
        self.conn_state = ConnState::Connected;
        self.reconnect_interval = 0;
        self.reconnect_at = 0;
        self.broadcast(notify::connection(true));

        if let Err(e) = self.prime(link) {
            error!("priming the connection failed: {e}");
            self.conn_state = ConnState::Failure;
            return;
        }

        while self.conn_state == ConnState::Connected && !self.shutting_down() {
            if let Err(e) = self.iteration(link) {
                error!("session iteration failed: {e}");
                if self.conn_state == ConnState::Connected {
                    self.conn_state = ConnState::Failure;
                }
            }
        }
        debug!("leaving connected loop in state {:?}", self.conn_state);
    }

    /// Feature detection, cache priming, timers, and the initial jukebox
    /// kick, run once per successful connect.
    fn prime<S: Pollable>(&mut self, link: &mut Link<S>) -> Result<()> {
        self.features = features::detect(link, &self.config)?;
        dispatch::refresh_snapshot(self, link)?;
        if self.features.stickers {
            self.stickers.rebuild(&mut link.client)?;
        }
        if self.features.smartpls && self.config.smartpls_interval > 0 {
            self.smartpls_due = unix_now() + self.config.smartpls_interval;
        }
        if self.jukebox.mode != JukeboxMode::Off {
            self.run_jukebox(link);
        }
        Ok(())
    }

    /// One pass of the idle multiplexer.
    ///
    /// Enters idle mode and polls readiness, queue length and the
    /// scheduled triggers on the 50ms tick. The first trigger leaves idle
    /// mode, the due work is serviced in a fixed order, and the caller
    /// re-enters idle mode on the next pass. Ownership makes overlap
    /// impossible: commands need the client back, and the idle guard has
    /// to be consumed first.
    fn iteration<S: Pollable>(&mut self, link: &mut Link<S>) -> Result<()> {
        let (mut events, pending, wakeup) = {
            let (client, probe, restore) = link.split();
            let guard = client.idle(&[])?;
            loop {
                if self.shutdown.load(Ordering::Relaxed) {
                    drop(guard);
                    return Ok(());
                }
                let ready = probe.poll_ready(POLL_BUDGET, restore)?;
                let pending = self.inbound.len_within(POLL_BUDGET);
                let wakeup = Wakeup::compute(
                    &self.snapshot,
                    &self.jukebox,
                    self.stickers.pending_len(),
                    self.smartpls_due,
                    unix_now(),
                );
                if ready {
                    break (guard.get()?, pending, wakeup);
                }
                if pending > 0 || wakeup.any() {
                    // Cancel the idle wait before touching the connection.
                    drop(guard);
                    break (Vec::new(), pending, wakeup);
                }
            }
        };

        self.handle_events(link, &mut events)?;

        if wakeup.set_played {
            self.mark_played();
        }
        if wakeup.jukebox_add {
            self.run_jukebox(link);
        }
        if pending > 0 {
            if let Some(request) = self.inbound.pop_timeout(POLL_BUDGET) {
                dispatch::handle(self, link, &request);
            }
        }
        if wakeup.sticker_flush && self.features.stickers {
            self.stickers.flush(&mut link.client)?;
        }
        if wakeup.smartpls_refresh {
            self.refresh_smart_playlists(link);
        }
        Ok(())
    }

    /// Handles one batch of idle events, each set bit independently, in
    /// ascending protocol bit order. Unknown subsystems are ignored.
    fn handle_events<S: Pollable>(
        &mut self,
        link: &mut Link<S>,
        events: &mut [Subsystem],
    ) -> Result<()> {
        events.sort_by_key(|subsystem| subsystem_rank(*subsystem));
        for subsystem in events.iter() {
            debug!("idle event: {subsystem:?}");
            match subsystem {
                Subsystem::Database => {
                    self.broadcast(notify::event("update_database"));
                    if self.features.stickers {
                        self.stickers.rebuild(&mut link.client)?;
                    }
                }
                Subsystem::Update => {
                    let status = link.client.status()?;
                    self.broadcast(notify::update_db(status.updating_db));
                }
                Subsystem::Playlist => {
                    self.broadcast(notify::event("update_stored_playlist"));
                }
                Subsystem::Queue => {
                    dispatch::refresh_snapshot(self, link)?;
                    self.broadcast(notify::queue_state(&self.snapshot));
                    if self.jukebox.mode != JukeboxMode::Off
                        && self.snapshot.queue_length < self.jukebox.queue_length
                    {
                        self.run_jukebox(link);
                    }
                    if self.config.auto_play
                        && self.snapshot.queue_length > 0
                        && self.snapshot.state != PlayState::Play
                    {
                        info!("auto play enabled, starting playback");
                        if let Err(e) = link.client.play() {
                            let error = crate::error::Error::from(e);
                            if error.is_fatal() {
                                return Err(error);
                            }
                            warn!("auto play failed: {error}");
                        }
                    }
                }
                Subsystem::Player => {
                    dispatch::refresh_snapshot(self, link)?;
                    self.broadcast(notify::player_state(&self.snapshot));
                    if self.features.stickers {
                        if let Some(uri) = self.snapshot.skipped(unix_now()) {
                            debug!("song {uri} skipped");
                            let uri = uri.to_string();
                            self.stickers
                                .enqueue(StickerOp::IncSkipCount(uri.clone()));
                            self.stickers
                                .enqueue(StickerOp::LastSkipped(uri, unix_now()));
                            self.snapshot.mark_skipped();
                        }
                    }
                }
                Subsystem::Mixer => {
                    let status = link.client.status()?;
                    self.snapshot.volume = status.volume;
                    self.broadcast(notify::volume(status.volume));
                }
                Subsystem::Output => {
                    self.broadcast(notify::event("update_outputs"));
                }
                Subsystem::Options => {
                    dispatch::refresh_snapshot(self, link)?;
                    self.broadcast(notify::event("update_options"));
                }
                Subsystem::Subscription => {
                    if self.config.love {
                        let had_love = self.features.love;
                        self.features.love = features::probe_love(link, &self.config)?;
                        if had_love != self.features.love {
                            self.broadcast(notify::event("update_options"));
                        }
                    }
                }
                _ => {
                    // Sticker, message and anything newer than this build:
                    // nothing to do.
                    trace!("unhandled idle event {subsystem:?}");
                }
            }
        }
        Ok(())
    }

    /// Records the current song as played: last-played history, play-count
    /// sticker and timestamp. Each song id is counted once; the sticker
    /// writes go through the pending queue and are flushed on a later pass.
    fn mark_played(&mut self) {
        self.snapshot.last_counted_id = self.snapshot.song_id;
        let now = unix_now();
        let uri = self.snapshot.song_uri.clone();
        if uri.is_empty() {
            return;
        }
        if self.config.last_played_count > 0 {
            self.history.push(now, uri.clone());
        }
        if self.features.stickers {
            self.stickers.enqueue(StickerOp::IncPlayCount(uri.clone()));
            self.stickers.enqueue(StickerOp::LastPlayed(uri, now));
        }
        self.broadcast(notify::event("scrobble"));
    }

    fn run_jukebox<S: Pollable>(&mut self, link: &mut Link<S>) {
        if let Err(e) = jukebox::run(
            link,
            &self.features,
            &self.jukebox,
            &self.snapshot,
            &self.stickers,
        ) {
            if e.is_fatal() {
                error!("jukebox lost the connection: {e}");
                self.conn_state = ConnState::Failure;
            } else {
                error!("jukebox failed: {e}");
            }
        }
    }

    fn refresh_smart_playlists<S: Pollable>(&mut self, link: &mut Link<S>) {
        self.smartpls_due = unix_now() + self.config.smartpls_interval;
        if let Err(e) = playlists::update_all(
            link,
            &self.features,
            &self.stickers,
            &self.config.workdir,
        ) {
            if e.is_fatal() {
                self.conn_state = ConnState::Failure;
            }
            error!("smart playlist refresh failed: {e}");
        }
    }
}

/// Protocol bit order of the idle subsystems, used to handle events in
/// ascending order regardless of how the batch arrived.
fn subsystem_rank(subsystem: Subsystem) -> u32 {
    match subsystem {
        Subsystem::Database => 0,
        Subsystem::Update => 1,
        Subsystem::Playlist => 2,
        Subsystem::Queue => 3,
        Subsystem::Player => 4,
        Subsystem::Mixer => 5,
        Subsystem::Output => 6,
        Subsystem::Options => 7,
        Subsystem::Sticker => 8,
        Subsystem::Subscription => 9,
        Subsystem::Message => 10,
        // Anything newer than this build sorts last and is ignored by the
        // handler.
        #[allow(unreachable_patterns)]
        _ => u32::MAX,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mpd::Client;
    use serde_json::json;

    use super::*;
    use crate::link::testing::FakeStream;

    fn test_session() -> Session {
        Session::new(
            Config::default(),
            Arc::new(Queue::new()),
            Arc::new(Queue::new()),
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn playing_snapshot() -> PlaybackSnapshot {
        PlaybackSnapshot {
            state: PlayState::Play,
            song_id: Some(7),
            song_uri: String::from("now.flac"),
            queue_length: 1,
            song_start_time: 900,
            song_end_time: 1_100,
            set_song_played_time: 990,
            ..PlaybackSnapshot::default()
        }
    }

    #[test]
    fn backoff_grows_by_steps_and_caps() {
        let mut session = test_session();
        let mut seen = Vec::new();
        for _ in 0..15 {
            session.schedule_reconnect();
            seen.push(session.reconnect_interval());
        }
        // Monotonically non-decreasing, capped at the ceiling.
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen[0], 2);
        assert_eq!(*seen.last().unwrap(), BACKOFF_CAP_SECS);
    }

    #[test]
    fn settings_change_of_host_requests_reconnect() {
        let mut session = test_session();
        let outcome = session.apply_settings(&json!({ "mpdHost": "elsewhere" }));
        assert!(outcome.reconnect);
        assert!(outcome.failed_key.is_none());

        // Applying the same value again is a no-op.
        let outcome = session.apply_settings(&json!({ "mpdHost": "elsewhere" }));
        assert!(!outcome.reconnect);
    }

    #[test]
    fn unknown_settings_keys_are_rejected() {
        let mut session = test_session();
        let outcome = session.apply_settings(&json!({ "noSuchKey": 1 }));
        assert_eq!(outcome.failed_key.as_deref(), Some("noSuchKey"));
    }

    #[test]
    fn jukebox_settings_flag_a_rekick() {
        let mut session = test_session();
        let outcome = session.apply_settings(&json!({ "jukeboxMode": "add_song" }));
        assert!(outcome.jukebox_changed);
        assert_eq!(session.jukebox.mode, JukeboxMode::AddSong);
    }

    #[test]
    fn wakeup_fires_jukebox_at_add_time_minus_crossfade() {
        let mut snapshot = playing_snapshot();
        snapshot.crossfade = 10;
        let jukebox = JukeboxConfig {
            mode: JukeboxMode::AddSong,
            queue_length: 3,
            ..JukeboxConfig::default()
        };
        // Add time is 1_100 - 10 = 1_090.
        let before = Wakeup::compute(&snapshot, &jukebox, 0, 0, 1_090);
        assert!(!before.jukebox_add);
        let after = Wakeup::compute(&snapshot, &jukebox, 0, 0, 1_091);
        assert!(after.jukebox_add);
    }

    #[test]
    fn wakeup_ignores_jukebox_when_stopped() {
        let mut snapshot = playing_snapshot();
        snapshot.state = PlayState::Stop;
        let jukebox = JukeboxConfig {
            mode: JukeboxMode::AddSong,
            ..JukeboxConfig::default()
        };
        let wakeup = Wakeup::compute(&snapshot, &jukebox, 0, 0, 2_000);
        assert!(!wakeup.jukebox_add);
        assert!(!wakeup.set_played);
    }

    #[test]
    fn wakeup_marks_played_once_per_song() {
        let mut snapshot = playing_snapshot();
        let jukebox = JukeboxConfig::default();
        let due = Wakeup::compute(&snapshot, &jukebox, 0, 0, 1_000);
        assert!(due.set_played);

        snapshot.last_counted_id = snapshot.song_id;
        let again = Wakeup::compute(&snapshot, &jukebox, 0, 0, 1_000);
        assert!(!again.set_played);
    }

    #[test]
    fn wakeup_flags_pending_stickers_and_due_refresh() {
        let snapshot = PlaybackSnapshot::default();
        let jukebox = JukeboxConfig::default();
        let wakeup = Wakeup::compute(&snapshot, &jukebox, 3, 500, 600);
        assert!(wakeup.sticker_flush);
        assert!(wakeup.smartpls_refresh);
        assert!(wakeup.any());
    }

    #[test]
    fn events_are_handled_in_ascending_bit_order() {
        let mut events = vec![
            Subsystem::Options,
            Subsystem::Database,
            Subsystem::Player,
        ];
        events.sort_by_key(|subsystem| subsystem_rank(*subsystem));
        assert_eq!(
            events,
            vec![Subsystem::Database, Subsystem::Player, Subsystem::Options]
        );
    }

    /// Idle wait and command execution must never overlap on the wire: the
    /// `noidle` has to be written before any command once work is pending.
    #[test]
    fn commands_never_overlap_the_idle_wait() {
        let mut session = test_session();
        session.conn_state = ConnState::Connected;
        let fake = FakeStream::new();
        let client = Client::new(fake.clone()).expect("handshake");
        let mut link = Link::new(client, fake.clone(), Duration::from_secs(1));

        session.inbound.push(WorkRequest {
            conn_id: 1,
            id: 1,
            method: Method::PlayerPlay,
            params: Value::Null,
        });
        session.iteration(&mut link).expect("iteration");

        let written = fake.written();
        let idle_at = written.find("idle").expect("idle sent");
        let noidle_at = written.find("noidle").expect("noidle sent");
        let play_at = written.find("play").expect("command sent");
        assert!(idle_at < noidle_at, "idle before noidle: {written}");
        assert!(noidle_at < play_at, "command only after noidle: {written}");
    }

    #[test]
    fn wait_state_honors_only_settings_updates() {
        let mut session = test_session();
        session.schedule_reconnect();
        assert_eq!(session.conn_state, ConnState::Wait);

        session.inbound.push(WorkRequest {
            conn_id: 2,
            id: 9,
            method: Method::PlayerPlay,
            params: Value::Null,
        });
        session.wait_tick();
        let rejected = session
            .outbound
            .pop_timeout(Duration::from_millis(10))
            .expect("rejection reply");
        assert_eq!(rejected.id, 9);
        assert_eq!(rejected.payload["error"]["message"], "server disconnected");

        session.inbound.push(WorkRequest {
            conn_id: 2,
            id: 10,
            method: Method::SettingsSet,
            params: json!({ "mpdPort": 6601 }),
        });
        session.wait_tick();
        assert_eq!(session.conn_state, ConnState::Disconnected);
        assert_eq!(session.reconnect_interval(), 0);
        assert_eq!(session.config.mpd_port, 6601);
        let accepted = session
            .outbound
            .pop_timeout(Duration::from_millis(10))
            .expect("settings reply");
        assert!(accepted.payload.get("result").is_some());
    }

    /// A pushed idle event is consumed by the same pass that leaves idle
    /// mode, and exactly one event-processing pass happens per iteration.
    #[test]
    fn idle_events_are_read_before_commands() {
        let mut session = test_session();
        session.conn_state = ConnState::Connected;
        let fake = FakeStream::new();
        let client = Client::new(fake.clone()).expect("handshake");
        let mut link = Link::new(client, fake.clone(), Duration::from_secs(1));

        fake.push_event("output");
        session.iteration(&mut link).expect("iteration");

        // The output event produced a broadcast.
        let result = session
            .outbound
            .pop_timeout(Duration::from_millis(10))
            .expect("broadcast");
        assert_eq!(result.payload["params"]["event"], "update_outputs");
    }
}
