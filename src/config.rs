//! Daemon configuration.
//!
//! Settings are seeded from an optional TOML file and may be changed at
//! runtime through a settings-update work item; the session applies those
//! changes itself (see [`crate::session`]). The MPD password is redacted
//! from debug output.

use std::{fs, path::PathBuf, time::Duration};

use serde::Deserialize;
use serde_json::json;
use veil::Redact;

use crate::error::Result;

#[derive(Redact, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// MPD host name, address, or socket path. A leading `/` selects a
    /// local socket connection.
    pub mpd_host: String,

    /// MPD port, ignored for socket connections.
    pub mpd_port: u16,

    /// MPD password; empty means no authentication.
    #[redact]
    pub mpd_pass: String,

    /// Read/write timeout for the connection, in milliseconds.
    pub mpd_timeout_ms: u64,

    /// Directory for derived state: smart playlist definitions and the
    /// last-played history.
    pub workdir: PathBuf,

    /// Tags to enable, intersected with what the server supports.
    pub taglist: Vec<String>,

    /// Start playback when songs are queued and the player is stopped.
    pub auto_play: bool,

    /// Track play/skip counters as server stickers.
    pub stickers: bool,

    /// Maintain smart playlists. Requires sticker and playlist support.
    pub smartpls: bool,

    /// Interval between smart playlist refreshes, in seconds.
    pub smartpls_interval: u64,

    /// How many songs the last-played history keeps.
    pub last_played_count: usize,

    /// Forward "love" messages to a client channel.
    pub love: bool,

    /// Channel the love message is sent to.
    pub love_channel: String,

    /// Message body sent on love requests.
    pub love_message: String,

    /// Page size cap for list responses.
    pub max_elements_per_page: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mpd_host: String::from("localhost"),
            mpd_port: 6600,
            mpd_pass: String::new(),
            mpd_timeout_ms: 10_000,
            workdir: PathBuf::from("/var/lib/maestro"),
            taglist: vec![
                String::from("Artist"),
                String::from("Album"),
                String::from("AlbumArtist"),
                String::from("Title"),
                String::from("Track"),
                String::from("Genre"),
                String::from("Date"),
            ],
            auto_play: false,
            stickers: true,
            smartpls: true,
            smartpls_interval: 14_400,
            last_played_count: 200,
            love: false,
            love_channel: String::new(),
            love_message: String::from("love"),
            max_elements_per_page: 100,
        }
    }
}

impl Config {
    /// Loads the configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.mpd_timeout_ms)
    }

    /// The configuration as a settings-update parameter map, used to seed
    /// the session with its initial settings on startup.
    #[must_use]
    pub fn settings_payload(&self) -> serde_json::Value {
        json!({
            "mpdHost": self.mpd_host,
            "mpdPort": self.mpd_port,
            "mpdPass": self.mpd_pass,
            "autoPlay": self.auto_play,
            "stickers": self.stickers,
            "smartpls": self.smartpls,
            "smartplsInterval": self.smartpls_interval,
            "lastPlayedCount": self.last_played_count,
            "love": self.love,
            "loveChannel": self.love_channel,
            "loveMessage": self.love_message,
            "taglist": self.taglist,
            "maxElementsPerPage": self.max_elements_per_page,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.mpd_port, 6600);
        assert!(config.mpd_pass.is_empty());
        assert_eq!(config.timeout(), Duration::from_secs(10));
    }

    #[test]
    fn parses_partial_toml() {
        let config: Config =
            toml::from_str("mpd_host = \"/run/mpd/socket\"\nsmartpls = false\n").unwrap();
        assert_eq!(config.mpd_host, "/run/mpd/socket");
        assert!(!config.smartpls);
        assert_eq!(config.mpd_port, 6600);
    }

    #[test]
    fn password_is_redacted_from_debug() {
        let config = Config {
            mpd_pass: String::from("hunter2"),
            ..Config::default()
        };
        let debugged = format!("{config:?}");
        assert!(!debugged.contains("hunter2"));
    }
}
