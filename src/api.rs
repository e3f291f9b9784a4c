//! Work items and results exchanged with the front end.
//!
//! A front-end thread enqueues a [`WorkRequest`] naming a [`Method`] and its
//! raw parameters; the session thread dequeues it exactly once, runs one
//! operation against the connection, and answers with a [`WorkResult`] routed
//! by the caller's connection id. A `conn_id` of [`NO_REPLY`] means fire and
//! forget: the result is dropped instead of queued.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Identifies the front-end context waiting for a reply.
pub type ConnectionId = u64;

/// Sentinel connection id: no caller is waiting, drop the result.
pub const NO_REPLY: ConnectionId = 0;

/// All operations the session dispatches.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Method {
    // Playback transport and player state
    PlayerState,
    PlayerPlay,
    PlayerPause,
    PlayerStop,
    PlayerNext,
    PlayerPrev,
    PlayerPlayTrack,
    PlayerSeek,
    PlayerSeekCurrent,
    PlayerVolumeGet,
    PlayerVolumeSet,
    PlayerCurrentSong,
    PlayerOutputList,
    PlayerToggleOutput,

    // Queue
    QueueList,
    QueueClear,
    QueueCrop,
    QueueCropOrClear,
    QueueAddTrack,
    QueueAddPlayTrack,
    QueueAddTrackAfter,
    QueueReplaceTrack,
    QueueAddPlaylist,
    QueueReplacePlaylist,
    QueueAddRandom,
    QueueRmTrack,
    QueueRmRange,
    QueueMoveTrack,
    QueueShuffle,
    QueueSave,
    QueueSearch,
    QueueLastPlayed,

    // Stored playlists
    PlaylistList,
    PlaylistContentList,
    PlaylistAddTrack,
    PlaylistClear,
    PlaylistRmTrack,
    PlaylistMoveTrack,
    PlaylistRename,
    PlaylistRm,
    PlaylistRmAll,
    PlaylistShuffle,
    PlaylistSort,

    // Smart playlists
    SmartplsSave,
    SmartplsGet,
    SmartplsUpdate,
    SmartplsUpdateAll,

    // Database
    DatabaseSearch,
    DatabaseSearchAdv,
    DatabaseUpdate,
    DatabaseRescan,
    DatabaseStats,
    DatabaseSongdetails,
    DatabaseFingerprint,
    DatabaseTagList,
    DatabaseTagAlbumList,
    DatabaseTagAlbumTitleList,
    DatabaseGetAlbums,
    DatabaseFilesystemList,
    Albumart,

    // Settings
    SettingsGet,
    SettingsSet,

    // Messaging and annotations
    Love,
    Like,
    UrlHandlers,
}

impl Method {
    /// The wire name, as used in request and response payloads.
    #[must_use]
    pub fn name(self) -> String {
        // Serialization of a unit variant cannot fail.
        serde_json::to_value(self)
            .ok()
            .and_then(|value| value.as_str().map(ToOwned::to_owned))
            .unwrap_or_default()
    }
}

/// Inbound work item.
///
/// Never mutated after the producer enqueues it.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WorkRequest {
    /// Caller connection id, or [`NO_REPLY`].
    pub conn_id: ConnectionId,

    /// Correlation id echoed back in the result.
    pub id: u64,

    pub method: Method,

    /// Raw parameters; decoded by the dispatcher with exact arity.
    #[serde(default)]
    pub params: Value,
}

impl WorkRequest {
    #[must_use]
    pub fn wants_reply(&self) -> bool {
        self.conn_id != NO_REPLY
    }
}

/// Outbound result or broadcast.
///
/// Results carry the caller's connection id; broadcasts use [`NO_REPLY`] and
/// are fanned out to every connected front-end context.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WorkResult {
    pub conn_id: ConnectionId,

    /// Correlation id of the request, `0` for broadcasts.
    pub id: u64,

    pub payload: Value,

    /// Raw bytes riding along with the payload (cover art).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary: Option<Vec<u8>>,
}

impl WorkResult {
    /// A result addressed to the caller of `request`.
    #[must_use]
    pub fn reply_to(request: &WorkRequest, payload: Value) -> Self {
        Self {
            conn_id: request.conn_id,
            id: request.id,
            payload,
            binary: None,
        }
    }

    /// An unsolicited broadcast.
    #[must_use]
    pub fn broadcast(payload: Value) -> Self {
        Self {
            conn_id: NO_REPLY,
            id: 0,
            payload,
            binary: None,
        }
    }
}

/// A plain success reply.
#[must_use]
pub fn respond_ok(method: Method) -> Value {
    json!({
        "jsonrpc": "2.0",
        "result": {
            "method": method.name(),
            "message": "ok",
        },
    })
}

/// A human-readable success or failure message.
#[must_use]
pub fn respond_message(method: Method, message: &str, is_error: bool) -> Value {
    if is_error {
        json!({
            "jsonrpc": "2.0",
            "error": {
                "method": method.name(),
                "message": message,
            },
        })
    } else {
        json!({
            "jsonrpc": "2.0",
            "result": {
                "method": method.name(),
                "message": message,
            },
        })
    }
}

/// A structured data reply.
#[must_use]
pub fn respond_data(method: Method, data: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "result": {
            "method": method.name(),
            "data": data,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_names_are_screaming_snake() {
        assert_eq!(Method::QueueAddTrack.name(), "QUEUE_ADD_TRACK");
        assert_eq!(Method::SmartplsUpdateAll.name(), "SMARTPLS_UPDATE_ALL");
    }

    #[test]
    fn requests_round_trip_through_json() {
        let request = WorkRequest {
            conn_id: 7,
            id: 123,
            method: Method::PlayerSeek,
            params: json!({"songid": 3, "seek": 95}),
        };
        let encoded = serde_json::to_string(&request).unwrap();
        let decoded: WorkRequest = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.method, Method::PlayerSeek);
        assert_eq!(decoded.params["seek"], 95);
    }

    #[test]
    fn no_reply_sentinel_suppresses_replies() {
        let request = WorkRequest {
            conn_id: NO_REPLY,
            id: 1,
            method: Method::PlayerPlay,
            params: Value::Null,
        };
        assert!(!request.wants_reply());
    }

    #[test]
    fn error_replies_carry_the_message() {
        let reply = respond_message(Method::PlayerPlay, "not playing", true);
        assert_eq!(reply["error"]["message"], "not playing");
        assert!(reply.get("result").is_none());
    }
}
