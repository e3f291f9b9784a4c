//! Unsolicited broadcast payloads pushed to the front end.
//!
//! These are best-effort notifications, not replies: connection state
//! changes and idle-driven updates the front end should know about without
//! having asked.

use serde_json::{json, Value};

use crate::snapshot::PlaybackSnapshot;

fn notify(event: &str, data: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "notify",
        "params": {
            "event": event,
            "data": data,
        },
    })
}

/// Connection established or lost.
#[must_use]
pub fn connection(connected: bool) -> Value {
    let event = if connected {
        "mpd_connected"
    } else {
        "mpd_disconnected"
    };
    notify(event, Value::Null)
}

/// A connect attempt failed with the server's message.
#[must_use]
pub fn connection_error(message: &str) -> Value {
    notify("mpd_connection_error", json!({ "error": message }))
}

/// A subsystem changed with no payload worth carrying.
#[must_use]
pub fn event(name: &str) -> Value {
    notify(name, Value::Null)
}

/// Queue length/version changed.
#[must_use]
pub fn queue_state(snapshot: &PlaybackSnapshot) -> Value {
    notify(
        "update_queue",
        json!({
            "length": snapshot.queue_length,
            "version": snapshot.queue_version,
            "state": snapshot.state.as_str(),
        }),
    )
}

/// Player state or current song changed.
#[must_use]
pub fn player_state(snapshot: &PlaybackSnapshot) -> Value {
    notify(
        "update_player",
        json!({
            "state": snapshot.state.as_str(),
            "songId": snapshot.song_id,
            "uri": snapshot.song_uri,
            "elapsed": snapshot.elapsed,
            "duration": snapshot.duration,
            "queueLength": snapshot.queue_length,
            "crossfade": snapshot.crossfade,
        }),
    )
}

/// Volume changed.
#[must_use]
pub fn volume(volume: i8) -> Value {
    notify("update_volume", json!({ "volume": volume }))
}

/// A database update job started, progressed, or finished.
#[must_use]
pub fn update_db(job: Option<u32>) -> Value {
    match job {
        Some(id) => notify("update_started", json!({ "jobId": id })),
        None => notify("update_finished", Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_events_are_distinct() {
        assert_eq!(
            connection(true)["params"]["event"],
            json!("mpd_connected")
        );
        assert_eq!(
            connection(false)["params"]["event"],
            json!("mpd_disconnected")
        );
    }

    #[test]
    fn update_db_distinguishes_running_and_done() {
        assert_eq!(update_db(Some(3))["params"]["data"]["jobId"], json!(3));
        assert_eq!(
            update_db(None)["params"]["event"],
            json!("update_finished")
        );
    }
}
