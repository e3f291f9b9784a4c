//! Command dispatcher.
//!
//! Decodes a work item's parameters with exact arity, runs exactly one
//! operation against the live connection, and queues the reply. Parameter
//! mismatches are dropped with a debug log and no crafted reply; whatever
//! reaches the end of dispatch without a response gets the generic
//! "no response" error, which is a bug signal, not a normal path.

use std::sync::Arc;
use std::time::Duration;

use mpd::message::Channel;
use mpd::{Id, Query, Song, Term};
use regex_lite::RegexBuilder;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::{self, Method, WorkRequest, WorkResult};
use crate::error::{Error, ErrorKind, Result};
use crate::features;
use crate::jukebox::{self, JukeboxMode};
use crate::link::{Link, Pollable};
use crate::playlists::{self, Order, SmartPlaylist};
use crate::session::{ConnState, Session};
use crate::snapshot::StatusView;
use crate::stickers::StickerOp;

/// Handles one dequeued work item end to end.
pub fn handle<S: Pollable>(session: &mut Session, link: &mut Link<S>, request: &WorkRequest) {
    debug!(
        "api request ({})({}) {}",
        request.conn_id,
        request.id,
        request.method.name()
    );

    let outbound = Arc::clone(&session.outbound);
    let mut response: Option<Value> = None;
    let mut binary: Option<Vec<u8>> = None;

    if let Err(e) = run_method(session, link, request, &mut response, &mut binary) {
        match e.kind {
            // The server rejected this one command; surface its text and
            // keep the connection.
            ErrorKind::Rejected => {
                response = Some(api::respond_message(request.method, &e.to_string(), true));
            }
            ErrorKind::Unavailable | ErrorKind::Unauthenticated => {
                error!("connection failed during dispatch: {e}");
                session.conn_state = ConnState::Failure;
                response = Some(api::respond_message(
                    request.method,
                    "server disconnected",
                    true,
                ));
            }
            _ => {
                response = Some(api::respond_message(request.method, &e.to_string(), true));
            }
        }
    }

    let payload = response.unwrap_or_else(|| {
        error!("no response for method {}", request.method.name());
        api::respond_message(request.method, "no response for method", true)
    });

    if request.wants_reply() {
        let mut result = WorkResult::reply_to(request, payload);
        result.binary = binary;
        debug!("push response to queue for connection {}", request.conn_id);
        outbound.push(result);
    }
}

/// Decodes parameters, logging and dropping the request on a mismatch.
fn params<P: DeserializeOwned>(request: &WorkRequest) -> Option<P> {
    match serde_json::from_value(request.params.clone()) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            debug!(
                "malformed parameters for {}: {e}",
                request.method.name()
            );
            None
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct UriParams {
    uri: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PlistParams {
    plist: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TrackParams {
    track: u32,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RangeParams {
    start: u32,
    end: u32,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct MoveParams {
    from: u32,
    to: u32,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PlaylistMoveParams {
    plist: String,
    from: u32,
    to: u32,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SeekParams {
    songid: u32,
    seek: u64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SeekCurrentParams {
    seek: i64,
    relative: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct VolumeParams {
    volume: i8,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ToggleOutputParams {
    output: u32,
    state: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct OffsetParams {
    offset: usize,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AddAfterParams {
    uri: String,
    to: u32,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AddRandomParams {
    mode: u8,
    playlist: String,
    quantity: usize,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FilteredListParams {
    offset: usize,
    filter: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PlaylistContentParams {
    uri: String,
    offset: usize,
    filter: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SearchParams {
    offset: usize,
    filter: String,
    searchstr: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SearchAdvParams {
    offset: usize,
    expression: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RenameParams {
    from: String,
    to: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RmAllParams {
    #[serde(rename = "smartplsOnly")]
    smartpls_only: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SortParams {
    uri: String,
    tag: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TagListParams {
    offset: usize,
    filter: String,
    tag: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TagAlbumListParams {
    offset: usize,
    filter: String,
    search: String,
    tag: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AlbumTitleListParams {
    album: String,
    search: String,
    tag: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct GetAlbumsParams {
    offset: usize,
    searchstr: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FilesystemParams {
    offset: usize,
    filter: String,
    path: String,
}

#[derive(Deserialize)]
struct SmartplsSaveParams {
    playlist: String,
    #[serde(flatten)]
    definition: SmartPlaylist,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PlaylistParams {
    playlist: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PlaylistTrackParams {
    uri: String,
    track: u32,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PlaylistAddParams {
    plist: String,
    uri: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct LikeParams {
    uri: String,
    like: u8,
}

#[expect(clippy::too_many_lines)]
fn run_method<S: Pollable>(
    session: &mut Session,
    link: &mut Link<S>,
    request: &WorkRequest,
    response: &mut Option<Value>,
    binary: &mut Option<Vec<u8>>,
) -> Result<()> {
    let method = request.method;
    match method {
        // --- player -----------------------------------------------------
        Method::PlayerState => {
            refresh_snapshot(session, link)?;
            *response = Some(api::respond_data(method, player_state(session)));
        }
        Method::PlayerPlay => {
            link.client.play()?;
            *response = Some(api::respond_ok(method));
        }
        Method::PlayerPause => {
            link.client.toggle_pause()?;
            *response = Some(api::respond_ok(method));
        }
        Method::PlayerStop => {
            link.client.stop()?;
            *response = Some(api::respond_ok(method));
        }
        Method::PlayerNext => {
            link.client.next()?;
            *response = Some(api::respond_ok(method));
        }
        Method::PlayerPrev => {
            link.client.prev()?;
            *response = Some(api::respond_ok(method));
        }
        Method::PlayerPlayTrack => {
            let Some(p) = params::<TrackParams>(request) else {
                return Ok(());
            };
            link.client.switch(Id(p.track))?;
            *response = Some(api::respond_ok(method));
        }
        Method::PlayerSeek => {
            let Some(p) = params::<SeekParams>(request) else {
                return Ok(());
            };
            link.client
                .seek(Id(p.songid), Duration::from_secs(p.seek))?;
            *response = Some(api::respond_ok(method));
        }
        Method::PlayerSeekCurrent => {
            let Some(p) = params::<SeekCurrentParams>(request) else {
                return Ok(());
            };
            let target = if p.relative {
                let elapsed = i64::try_from(session.snapshot.elapsed).unwrap_or(i64::MAX);
                u64::try_from(elapsed.saturating_add(p.seek)).unwrap_or(0)
            } else {
                u64::try_from(p.seek).unwrap_or(0)
            };
            link.client.rewind(Duration::from_secs(target))?;
            *response = Some(api::respond_ok(method));
        }
        Method::PlayerVolumeGet => {
            let status = link.client.status()?;
            *response = Some(api::respond_data(
                method,
                json!({ "volume": status.volume }),
            ));
        }
        Method::PlayerVolumeSet => {
            let Some(p) = params::<VolumeParams>(request) else {
                return Ok(());
            };
            link.client.volume(p.volume)?;
            *response = Some(api::respond_ok(method));
        }
        Method::PlayerCurrentSong => {
            let song = link.client.currentsong()?;
            let data = song.as_ref().map_or(Value::Null, |song| {
                song_to_json(song, session)
            });
            *response = Some(api::respond_data(method, data));
        }
        Method::PlayerOutputList => {
            let outputs: Vec<Value> = link
                .client
                .outputs()?
                .into_iter()
                .map(|output| {
                    json!({
                        "id": output.id,
                        "name": output.name,
                        "enabled": output.enabled,
                    })
                })
                .collect();
            *response = Some(api::respond_data(method, json!({ "outputs": outputs })));
        }
        Method::PlayerToggleOutput => {
            let Some(p) = params::<ToggleOutputParams>(request) else {
                return Ok(());
            };
            if p.state {
                link.client.out_enable(p.output)?;
            } else {
                link.client.out_disable(p.output)?;
            }
            *response = Some(api::respond_ok(method));
        }

        // --- queue ------------------------------------------------------
        Method::QueueList => {
            let Some(p) = params::<OffsetParams>(request) else {
                return Ok(());
            };
            let songs = link.client.queue()?;
            *response = Some(api::respond_data(
                method,
                song_page(&songs, p.offset, session, None),
            ));
        }
        Method::QueueClear => {
            link.client.clear()?;
            *response = Some(api::respond_ok(method));
        }
        Method::QueueCrop => {
            *response = Some(crop_queue(session, link, method, false)?);
        }
        Method::QueueCropOrClear => {
            *response = Some(crop_queue(session, link, method, true)?);
        }
        Method::QueueAddTrack => {
            let Some(p) = params::<UriParams>(request) else {
                return Ok(());
            };
            if p.uri.is_empty() {
                return Ok(());
            }
            link.client.push(&song_for(&p.uri))?;
            *response = Some(api::respond_ok(method));
        }
        Method::QueueAddPlayTrack => {
            let Some(p) = params::<UriParams>(request) else {
                return Ok(());
            };
            let id = link.client.push(&song_for(&p.uri))?;
            link.client.switch(id)?;
            *response = Some(api::respond_ok(method));
        }
        Method::QueueAddTrackAfter => {
            let Some(p) = params::<AddAfterParams>(request) else {
                return Ok(());
            };
            let id = link.client.push(&song_for(&p.uri))?;
            if let Some(pos) = queue_pos_of(link, id.0)? {
                link.client.shift(pos, p.to as usize)?;
            }
            *response = Some(api::respond_ok(method));
        }
        Method::QueueReplaceTrack => {
            let Some(p) = params::<UriParams>(request) else {
                return Ok(());
            };
            if p.uri.is_empty() {
                return Ok(());
            }
            link.client.clear()?;
            link.client.push(&song_for(&p.uri))?;
            link.client.play()?;
            *response = Some(api::respond_ok(method));
        }
        Method::QueueAddPlaylist => {
            let Some(p) = params::<PlistParams>(request) else {
                return Ok(());
            };
            link.client.load(&p.plist, ..)?;
            *response = Some(api::respond_ok(method));
        }
        Method::QueueReplacePlaylist => {
            let Some(p) = params::<PlistParams>(request) else {
                return Ok(());
            };
            link.client.clear()?;
            link.client.load(&p.plist, ..)?;
            link.client.play()?;
            *response = Some(api::respond_ok(method));
        }
        Method::QueueAddRandom => {
            let Some(p) = params::<AddRandomParams>(request) else {
                return Ok(());
            };
            let mode = match p.mode {
                1 => JukeboxMode::AddSong,
                2 => JukeboxMode::AddAlbum,
                _ => {
                    *response = Some(api::respond_message(method, "unknown add mode", true));
                    return Ok(());
                }
            };
            let added = jukebox::add_random(
                link,
                &session.features,
                mode,
                &p.playlist,
                p.quantity,
                &session.stickers,
            )?;
            if added > 0 {
                *response = Some(api::respond_message(
                    method,
                    "successfully added random songs to queue",
                    false,
                ));
            } else {
                *response = Some(api::respond_message(
                    method,
                    "adding random songs to queue failed",
                    true,
                ));
            }
        }
        Method::QueueRmTrack => {
            let Some(p) = params::<TrackParams>(request) else {
                return Ok(());
            };
            match queue_pos_of(link, p.track)? {
                Some(pos) => {
                    link.client.delete(pos)?;
                    *response = Some(api::respond_ok(method));
                }
                None => {
                    *response = Some(api::respond_message(method, "no such song id", true));
                }
            }
        }
        Method::QueueRmRange => {
            let Some(p) = params::<RangeParams>(request) else {
                return Ok(());
            };
            link.client.delete(p.start..p.end)?;
            *response = Some(api::respond_ok(method));
        }
        Method::QueueMoveTrack => {
            let Some(p) = params::<MoveParams>(request) else {
                return Ok(());
            };
            // 1-indexed on the wire.
            let from = p.from.saturating_sub(1);
            let mut to = p.to.saturating_sub(1);
            if from < to {
                to -= 1;
            }
            link.client.shift(from, to as usize)?;
            *response = Some(api::respond_ok(method));
        }
        Method::QueueShuffle => {
            link.client.shuffle(..)?;
            *response = Some(api::respond_ok(method));
        }
        Method::QueueSave => {
            let Some(p) = params::<PlistParams>(request) else {
                return Ok(());
            };
            link.client.save(&p.plist)?;
            *response = Some(api::respond_ok(method));
        }
        Method::QueueSearch => {
            let Some(p) = params::<SearchParams>(request) else {
                return Ok(());
            };
            let songs = link.client.queue()?;
            let matcher = filter(&p.searchstr);
            let matched: Vec<Song> = songs
                .into_iter()
                .filter(|song| {
                    let tag_value = if p.filter.eq_ignore_ascii_case("any") {
                        None
                    } else {
                        tag_of(song, &p.filter)
                    };
                    match (&matcher, tag_value) {
                        (Some(re), Some(value)) => re.is_match(&value),
                        (Some(re), None) => {
                            re.is_match(&song.file)
                                || song.title.as_deref().is_some_and(|t| re.is_match(t))
                        }
                        (None, _) => true,
                    }
                })
                .collect();
            *response = Some(api::respond_data(
                method,
                song_page(&matched, p.offset, session, None),
            ));
        }
        Method::QueueLastPlayed => {
            let Some(p) = params::<OffsetParams>(request) else {
                return Ok(());
            };
            let data = session
                .history
                .page(p.offset, session.config.max_elements_per_page);
            *response = Some(api::respond_data(method, data));
        }

        // --- stored playlists --------------------------------------------
        Method::PlaylistList => {
            let Some(p) = params::<FilteredListParams>(request) else {
                return Ok(());
            };
            let matcher = filter(&p.filter);
            let mut playlists: Vec<Value> = link
                .client
                .playlists()?
                .into_iter()
                .filter(|playlist| {
                    matcher
                        .as_ref()
                        .is_none_or(|re| re.is_match(&playlist.name))
                })
                .map(|playlist| {
                    let smart = playlists::is_smart(&session.config.workdir, &playlist.name);
                    json!({
                        "uri": playlist.name,
                        "type": if smart { "smartpls" } else { "plist" },
                    })
                })
                .collect();
            playlists.sort_by(|a, b| a["uri"].as_str().cmp(&b["uri"].as_str()));
            let total = playlists.len();
            let page: Vec<Value> = playlists
                .into_iter()
                .skip(p.offset)
                .take(session.config.max_elements_per_page)
                .collect();
            *response = Some(api::respond_data(
                method,
                json!({ "totalEntities": total, "offset": p.offset, "data": page }),
            ));
        }
        Method::PlaylistContentList => {
            let Some(p) = params::<PlaylistContentParams>(request) else {
                return Ok(());
            };
            let songs = link.client.playlist(&p.uri)?;
            *response = Some(api::respond_data(
                method,
                song_page(&songs, p.offset, session, Some(&p.filter)),
            ));
        }
        Method::PlaylistAddTrack => {
            let Some(p) = params::<PlaylistAddParams>(request) else {
                return Ok(());
            };
            link.client.pl_push(&p.plist, &song_for(&p.uri))?;
            *response = Some(api::respond_message(
                method,
                &format!("added {} to playlist {}", p.uri, p.plist),
                false,
            ));
        }
        Method::PlaylistClear => {
            let Some(p) = params::<UriParams>(request) else {
                return Ok(());
            };
            link.client.pl_clear(&p.uri)?;
            *response = Some(api::respond_ok(method));
        }
        Method::PlaylistRmTrack => {
            let Some(p) = params::<PlaylistTrackParams>(request) else {
                return Ok(());
            };
            link.client.pl_delete(&p.uri, p.track)?;
            *response = Some(api::respond_ok(method));
        }
        Method::PlaylistMoveTrack => {
            let Some(p) = params::<PlaylistMoveParams>(request) else {
                return Ok(());
            };
            let from = p.from.saturating_sub(1);
            let mut to = p.to.saturating_sub(1);
            if from < to {
                to -= 1;
            }
            link.client.pl_shift(&p.plist, from, to)?;
            *response = Some(api::respond_ok(method));
        }
        Method::PlaylistRename => {
            let Some(p) = params::<RenameParams>(request) else {
                return Ok(());
            };
            if playlists::is_smart(&session.config.workdir, &p.from) {
                let definition = playlists::load_definition(&session.config.workdir, &p.from)?;
                playlists::save_definition(&session.config.workdir, &p.to, &definition)?;
                playlists::remove_definition(&session.config.workdir, &p.from)?;
            }
            link.client.pl_rename(&p.from, &p.to)?;
            *response = Some(api::respond_message(method, "renamed playlist", false));
        }
        Method::PlaylistRm => {
            let Some(p) = params::<UriParams>(request) else {
                return Ok(());
            };
            playlists::remove_definition(&session.config.workdir, &p.uri)?;
            link.client.pl_remove(&p.uri)?;
            *response = Some(api::respond_ok(method));
        }
        Method::PlaylistRmAll => {
            let Some(p) = params::<RmAllParams>(request) else {
                return Ok(());
            };
            let mut removed = 0;
            for playlist in link.client.playlists()? {
                let smart = playlists::is_smart(&session.config.workdir, &playlist.name);
                if p.smartpls_only && !smart {
                    continue;
                }
                playlists::remove_definition(&session.config.workdir, &playlist.name)?;
                link.client.pl_remove(&playlist.name)?;
                removed += 1;
            }
            *response = Some(api::respond_message(
                method,
                &format!("removed {removed} playlists"),
                false,
            ));
        }
        Method::PlaylistShuffle => {
            let Some(p) = params::<UriParams>(request) else {
                return Ok(());
            };
            playlists::shuffle_sort(link, &p.uri, &Order::Shuffle)?;
            *response = Some(api::respond_message(
                method,
                "shuffled playlist successfully",
                false,
            ));
        }
        Method::PlaylistSort => {
            let Some(p) = params::<SortParams>(request) else {
                return Ok(());
            };
            playlists::shuffle_sort(link, &p.uri, &Order::from_keyword(&p.tag))?;
            *response = Some(api::respond_message(
                method,
                "sorted playlist successfully",
                false,
            ));
        }

        // --- smart playlists ---------------------------------------------
        Method::SmartplsSave => {
            let Some(p) = params::<SmartplsSaveParams>(request) else {
                return Ok(());
            };
            playlists::save_definition(&session.config.workdir, &p.playlist, &p.definition)?;
            playlists::update(
                link,
                &session.features,
                &session.stickers,
                &session.config.workdir,
                &p.playlist,
            )?;
            *response = Some(api::respond_ok(method));
        }
        Method::SmartplsGet => {
            let Some(p) = params::<PlaylistParams>(request) else {
                return Ok(());
            };
            let definition = playlists::load_definition(&session.config.workdir, &p.playlist)?;
            let mut data = serde_json::to_value(&definition)?;
            data["playlist"] = Value::String(p.playlist);
            *response = Some(api::respond_data(method, data));
        }
        Method::SmartplsUpdate => {
            let Some(p) = params::<PlaylistParams>(request) else {
                return Ok(());
            };
            match playlists::update(
                link,
                &session.features,
                &session.stickers,
                &session.config.workdir,
                &p.playlist,
            ) {
                Ok(()) => {
                    *response = Some(api::respond_message(
                        method,
                        &format!("smart playlist {} updated", p.playlist),
                        false,
                    ));
                }
                Err(e) if !e.is_fatal() => {
                    *response = Some(api::respond_message(
                        method,
                        &format!("updating of smart playlist {} failed", p.playlist),
                        true,
                    ));
                }
                Err(e) => return Err(e),
            }
        }
        Method::SmartplsUpdateAll => {
            playlists::update_all(
                link,
                &session.features,
                &session.stickers,
                &session.config.workdir,
            )?;
            *response = Some(api::respond_message(method, "smart playlists updated", false));
        }

        // --- database ----------------------------------------------------
        Method::DatabaseSearch => {
            let Some(p) = params::<SearchParams>(request) else {
                return Ok(());
            };
            if p.searchstr.is_empty() {
                return Ok(());
            }
            let mut query = Query::new();
            if p.filter.eq_ignore_ascii_case("any") {
                query.and(Term::Any, p.searchstr.as_str());
            } else {
                query.and(Term::Tag(p.filter.clone().into()), p.searchstr.as_str());
            }
            let songs = link.client.search(&query, None::<(u32, u32)>)?;
            *response = Some(api::respond_data(
                method,
                song_page(&songs, p.offset, session, None),
            ));
        }
        Method::DatabaseSearchAdv => {
            let Some(p) = params::<SearchAdvParams>(request) else {
                return Ok(());
            };
            if !session.features.advsearch {
                *response = Some(api::respond_message(
                    method,
                    "advanced search is not supported",
                    true,
                ));
                return Ok(());
            }
            let mut query = Query::new();
            query.and(Term::Any, p.expression.as_str());
            let songs = link.client.search(&query, None::<(u32, u32)>)?;
            *response = Some(api::respond_data(
                method,
                song_page(&songs, p.offset, session, None),
            ));
        }
        Method::DatabaseUpdate => {
            let job = link.client.update()?;
            *response = Some(api::respond_data(method, json!({ "jobId": job })));
        }
        Method::DatabaseRescan => {
            let job = link.client.rescan()?;
            *response = Some(api::respond_data(method, json!({ "jobId": job })));
        }
        Method::DatabaseStats => {
            let stats = link.client.stats()?;
            *response = Some(api::respond_data(
                method,
                json!({
                    "artists": stats.artists,
                    "albums": stats.albums,
                    "songs": stats.songs,
                    "playtime": stats.playtime.as_secs(),
                    "dbPlaytime": stats.db_playtime.as_secs(),
                    "dbUpdated": stats.db_update.as_secs(),
                    "uptime": stats.uptime.as_secs(),
                }),
            ));
        }
        Method::DatabaseSongdetails => {
            let Some(p) = params::<UriParams>(request) else {
                return Ok(());
            };
            if p.uri.is_empty() {
                *response = Some(api::respond_message(method, "invalid api request", true));
                return Ok(());
            }
            let mut query = Query::new();
            query.and(Term::File, p.uri.as_str());
            let songs = link.client.find(&query, None::<(u32, u32)>)?;
            let data = songs
                .first()
                .map_or(Value::Null, |song| song_to_json(song, session));
            *response = Some(api::respond_data(method, data));
        }
        Method::DatabaseFingerprint => {
            // The capability is probed and reported, but the client library
            // exposes no fingerprint command.
            *response = Some(api::respond_message(
                method,
                "fingerprint command not supported",
                true,
            ));
        }
        Method::DatabaseTagList => {
            let Some(p) = params::<TagListParams>(request) else {
                return Ok(());
            };
            let values = link
                .client
                .list(&Term::Tag(p.tag.clone().into()), &Query::new())?;
            *response = Some(api::respond_data(
                method,
                string_page(values, &p.filter, p.offset, session),
            ));
        }
        Method::DatabaseTagAlbumList => {
            let Some(p) = params::<TagAlbumListParams>(request) else {
                return Ok(());
            };
            let mut query = Query::new();
            if !p.search.is_empty() {
                query.and(Term::Tag(p.tag.clone().into()), p.search.as_str());
            }
            let albums = link.client.list(&Term::Tag("Album".into()), &query)?;
            *response = Some(api::respond_data(
                method,
                string_page(albums, &p.filter, p.offset, session),
            ));
        }
        Method::DatabaseTagAlbumTitleList => {
            let Some(p) = params::<AlbumTitleListParams>(request) else {
                return Ok(());
            };
            let mut query = Query::new();
            query.and(Term::Tag("Album".into()), p.album.as_str());
            if !p.search.is_empty() {
                query.and(Term::Tag(p.tag.clone().into()), p.search.as_str());
            }
            let songs = link.client.find(&query, None::<(u32, u32)>)?;
            let mut data = song_page(&songs, 0, session, None);
            data["album"] = Value::String(p.album);
            *response = Some(api::respond_data(method, data));
        }
        Method::DatabaseGetAlbums => {
            let Some(p) = params::<GetAlbumsParams>(request) else {
                return Ok(());
            };
            let albums = link.client.list(&Term::Tag("Album".into()), &Query::new())?;
            let matcher = filter(&p.searchstr);
            let matched: Vec<String> = albums
                .into_iter()
                .filter(|album| matcher.as_ref().is_none_or(|re| re.is_match(album)))
                .collect();
            let total = matched.len();
            let mut entries = Vec::new();
            for album in matched
                .iter()
                .skip(p.offset)
                .take(session.config.max_elements_per_page)
            {
                let mut query = Query::new();
                query.and(Term::Tag("Album".into()), album.as_str());
                let first = link.client.find(&query, (0, 1))?;
                if let Some(song) = first.first() {
                    let mut entry = song_to_json(song, session);
                    entry["album"] = Value::String(album.clone());
                    entries.push(entry);
                }
            }
            *response = Some(api::respond_data(
                method,
                json!({ "totalEntities": total, "offset": p.offset, "data": entries }),
            ));
        }
        Method::DatabaseFilesystemList => {
            let Some(p) = params::<FilesystemParams>(request) else {
                return Ok(());
            };
            let listing = link.client.lsinfo(&song_for(&p.path))?;
            *response = Some(api::respond_data(
                method,
                song_page(&listing, p.offset, session, Some(&p.filter)),
            ));
        }
        Method::Albumart => {
            let Some(p) = params::<UriParams>(request) else {
                return Ok(());
            };
            let art = link.client.albumart(&song_for(&p.uri))?;
            *binary = Some(art);
            *response = Some(api::respond_data(method, json!({ "uri": p.uri })));
        }

        // --- settings ----------------------------------------------------
        Method::SettingsGet => {
            *response = Some(api::respond_data(method, settings_view(session)));
        }
        Method::SettingsSet => {
            let outcome = session.apply_settings(&request.params);
            if let Some(key) = outcome.failed_key {
                *response = Some(api::respond_message(
                    method,
                    &format!("can't save setting {key}"),
                    true,
                ));
                return Ok(());
            }
            if outcome.reconnect {
                // Reconnect with the new connection parameters.
                session.conn_state = ConnState::Disconnect;
            } else if session.conn_state == ConnState::Connected {
                session.features = features::detect(link, &session.config)?;
                if session.jukebox.mode != JukeboxMode::Off {
                    jukebox::run(
                        link,
                        &session.features,
                        &session.jukebox,
                        &session.snapshot,
                        &session.stickers,
                    )?;
                }
            }
            *response = Some(api::respond_ok(method));
        }

        // --- messaging and annotations -----------------------------------
        Method::Love => {
            if !session.features.love {
                *response = Some(api::respond_message(
                    method,
                    "love channel is not available",
                    true,
                ));
                return Ok(());
            }
            let Some(channel) = Channel::new(&session.config.love_channel) else {
                return Err(Error::invalid_argument("invalid love channel name"));
            };
            link.client
                .sendmessage(channel, &session.config.love_message)?;
            *response = Some(api::respond_message(method, "scrobbled love", false));
        }
        Method::Like => {
            if !session.features.stickers {
                *response = Some(api::respond_message(method, "stickers are disabled", true));
                return Ok(());
            }
            let Some(p) = params::<LikeParams>(request) else {
                return Ok(());
            };
            if p.uri.is_empty() || p.like > 2 {
                return Ok(());
            }
            session
                .stickers
                .enqueue(StickerOp::Like(p.uri, p.like));
            session.stickers.flush(&mut link.client)?;
            *response = Some(api::respond_ok(method));
        }
        Method::UrlHandlers => {
            let handlers = link.client.urlhandlers()?;
            *response = Some(api::respond_data(method, json!({ "handlers": handlers })));
        }
    }
    Ok(())
}

/// Refreshes the playback snapshot from the live connection.
pub fn refresh_snapshot<S: Pollable>(session: &mut Session, link: &mut Link<S>) -> Result<()> {
    let status = link.client.status()?;
    let current = link.client.currentsong()?;
    let view = StatusView::capture(&status, current.as_ref());
    session.snapshot.apply(&view, crate::snapshot::unix_now());
    Ok(())
}

/// The player state payload served to state requests.
pub fn player_state(session: &Session) -> Value {
    json!({
        "state": session.snapshot.state.as_str(),
        "songId": session.snapshot.song_id,
        "uri": session.snapshot.song_uri,
        "elapsed": session.snapshot.elapsed,
        "duration": session.snapshot.duration,
        "queueLength": session.snapshot.queue_length,
        "queueVersion": session.snapshot.queue_version,
        "volume": session.snapshot.volume,
        "crossfade": session.snapshot.crossfade,
    })
}

fn settings_view(session: &Session) -> Value {
    let mut data = session.config.settings_payload();
    data["jukeboxMode"] = serde_json::to_value(session.jukebox.mode).unwrap_or_default();
    data["jukeboxPlaylist"] = Value::String(session.jukebox.source.clone());
    data["jukeboxQueueLength"] = json!(session.jukebox.queue_length);
    data["jukeboxUniqueTag"] = Value::String(session.jukebox.unique_tag.clone());
    data["jukeboxLastPlayed"] = json!(session.jukebox.lookback_hours);
    data["features"] = json!({
        "stickers": session.features.stickers,
        "playlists": session.features.playlists,
        "fingerprint": session.features.fingerprint,
        "advsearch": session.features.advsearch,
        "tags": session.features.tags,
        "smartpls": session.features.smartpls,
        "love": session.features.love,
        "enabledTags": session.features.enabled_tags,
    });
    data
}

fn song_for(uri: &str) -> Song {
    Song {
        file: uri.to_string(),
        ..Song::default()
    }
}

fn tag_of(song: &Song, tag: &str) -> Option<String> {
    song.tags
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(tag))
        .map(|(_, value)| value.clone())
}

fn song_to_json(song: &Song, session: &Session) -> Value {
    let mut data = json!({
        "uri": song.file,
        "title": song.title,
        "artist": song.artist,
        "album": tag_of(song, "Album"),
        "duration": song.duration.map(|d| d.as_secs()),
        "songId": song.place.map(|place| place.id.0),
        "pos": song.place.map(|place| place.pos),
    });
    if let Some(values) = session.stickers.get(&song.file) {
        data["playCount"] = json!(values.play_count);
        data["skipCount"] = json!(values.skip_count);
        data["lastPlayed"] = json!(values.last_played);
        data["like"] = json!(values.like);
    }
    data
}

/// Compiles a client-supplied filter; empty or `-` matches everything.
fn filter(pattern: &str) -> Option<regex_lite::Regex> {
    if pattern.is_empty() || pattern == "-" {
        return None;
    }
    match RegexBuilder::new(pattern).case_insensitive(true).build() {
        Ok(re) => Some(re),
        Err(e) => {
            debug!("invalid filter expression {pattern}: {e}");
            None
        }
    }
}

fn song_page(
    songs: &[Song],
    offset: usize,
    session: &Session,
    pattern: Option<&str>,
) -> Value {
    let matcher = pattern.and_then(filter);
    let matched: Vec<&Song> = songs
        .iter()
        .filter(|song| {
            matcher.as_ref().is_none_or(|re| {
                re.is_match(&song.file)
                    || song.title.as_deref().is_some_and(|t| re.is_match(t))
                    || song.artist.as_deref().is_some_and(|a| re.is_match(a))
            })
        })
        .collect();
    let total = matched.len();
    let entries: Vec<Value> = matched
        .into_iter()
        .skip(offset)
        .take(session.config.max_elements_per_page)
        .map(|song| song_to_json(song, session))
        .collect();
    json!({ "totalEntities": total, "offset": offset, "data": entries })
}

fn string_page(values: Vec<String>, pattern: &str, offset: usize, session: &Session) -> Value {
    let matcher = filter(pattern);
    let matched: Vec<String> = values
        .into_iter()
        .filter(|value| matcher.as_ref().is_none_or(|re| re.is_match(value)))
        .collect();
    let total = matched.len();
    let entries: Vec<String> = matched
        .into_iter()
        .skip(offset)
        .take(session.config.max_elements_per_page)
        .collect();
    json!({ "totalEntities": total, "offset": offset, "data": entries })
}

fn queue_pos_of<S: Pollable>(link: &mut Link<S>, id: u32) -> Result<Option<u32>> {
    Ok(link
        .client
        .queue()?
        .into_iter()
        .find(|song| song.place.map(|place| place.id.0) == Some(id))
        .and_then(|song| song.place.map(|place| place.pos)))
}

/// Removes everything from the queue except the current song; with `clear`
/// the queue is wiped outright when nothing sensible can be kept.
fn crop_queue<S: Pollable>(
    session: &mut Session,
    link: &mut Link<S>,
    method: Method,
    clear: bool,
) -> Result<Value> {
    let status = link.client.status()?;
    let Some(place) = status.song else {
        if clear {
            link.client.clear()?;
            return Ok(api::respond_message(method, "cleared the queue", false));
        }
        return Ok(api::respond_message(
            method,
            "can not crop without a current song",
            true,
        ));
    };
    if status.queue_len <= 1 {
        if clear {
            link.client.clear()?;
            return Ok(api::respond_message(method, "cleared the queue", false));
        }
        return Ok(api::respond_message(method, "queue is too small to crop", true));
    }
    // Tail first so the head positions stay valid.
    if place.pos + 1 < status.queue_len {
        link.client.delete(place.pos + 1..status.queue_len)?;
    }
    if place.pos > 0 {
        link.client.delete(0..place.pos)?;
    }
    session.snapshot.queue_length = 1;
    Ok(api::respond_ok(method))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use mpd::Client;

    use super::*;
    use crate::api::{WorkRequest, NO_REPLY};
    use crate::config::Config;
    use crate::link::testing::FakeStream;
    use crate::queue::Queue;

    fn test_session() -> Session {
        Session::new(
            Config::default(),
            Arc::new(Queue::new()),
            Arc::new(Queue::new()),
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn test_link(fake: &FakeStream) -> Link<FakeStream> {
        let client = Client::new(fake.clone()).expect("handshake");
        Link::new(client, fake.clone(), Duration::from_secs(1))
    }

    fn request(method: Method, params: Value) -> WorkRequest {
        WorkRequest {
            conn_id: 7,
            id: 1,
            method,
            params,
        }
    }

    #[test]
    fn each_request_gets_exactly_one_reply_in_order() {
        let mut session = test_session();
        let fake = FakeStream::new();
        let mut link = test_link(&fake);

        for id in 1..=3 {
            let mut req = request(Method::PlayerPlay, Value::Null);
            req.id = id;
            handle(&mut session, &mut link, &req);
        }

        let outbound = Arc::clone(&session.outbound);
        for id in 1..=3 {
            let result = outbound.pop_timeout(Duration::from_millis(10)).unwrap();
            assert_eq!(result.id, id);
            assert_eq!(result.conn_id, 7);
        }
        assert!(outbound.is_empty());
    }

    #[test]
    fn fire_and_forget_produces_no_result() {
        let mut session = test_session();
        let fake = FakeStream::new();
        let mut link = test_link(&fake);

        let mut req = request(Method::PlayerStop, Value::Null);
        req.conn_id = NO_REPLY;
        handle(&mut session, &mut link, &req);

        assert!(session.outbound.is_empty());
        assert!(fake.written().contains("stop"));
    }

    #[test]
    fn malformed_parameters_fall_back_to_the_generic_reply() {
        let mut session = test_session();
        let fake = FakeStream::new();
        let mut link = test_link(&fake);

        // `track` is missing entirely: exact-arity decode fails.
        let req = request(Method::PlayerPlayTrack, json!({ "wrong": true }));
        handle(&mut session, &mut link, &req);

        let result = session
            .outbound
            .pop_timeout(Duration::from_millis(10))
            .unwrap();
        assert_eq!(
            result.payload["error"]["message"],
            "no response for method"
        );
        // No command went over the wire for the malformed request.
        assert!(!fake.written().contains("playid"));
    }

    #[test]
    fn settings_update_can_force_a_reconnect() {
        let mut session = test_session();
        session.conn_state = ConnState::Connected;
        let fake = FakeStream::new();
        let mut link = test_link(&fake);

        let req = request(Method::SettingsSet, json!({ "mpdHost": "other.host" }));
        handle(&mut session, &mut link, &req);

        assert_eq!(session.conn_state, ConnState::Disconnect);
        assert_eq!(session.config.mpd_host, "other.host");
        let result = session
            .outbound
            .pop_timeout(Duration::from_millis(10))
            .unwrap();
        assert!(result.payload.get("result").is_some());
    }
}
