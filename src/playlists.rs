//! Smart playlists and stored playlist maintenance.
//!
//! A smart playlist is a rule kept as one JSON definition file under
//! `<workdir>/smartpls/`; materializing it clears the target playlist and
//! repopulates it from the rule. Refresh happens on a fixed interval, on
//! explicit request, and right after a definition is saved. Shuffle and
//! sort rebuild a playlist through a temp name and a rename dance so
//! clients never observe a half-written playlist.

use std::fs;
use std::path::{Path, PathBuf};

use mpd::{Query, Term};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::features::Features;
use crate::link::{Link, Pollable};
use crate::rand;
use crate::stickers::StickerStore;

const SMARTPLS_DIR: &str = "smartpls";

/// A persisted smart playlist rule.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum SmartPlaylist {
    /// Songs ranked by a numeric sticker value.
    Sticker {
        sticker: String,
        maxentries: usize,
        minvalue: u32,
    },
    /// Songs modified within the trailing time range.
    Newest { timerange: u64 },
    /// A saved search re-executed on every refresh.
    Search { tag: String, expression: String },
}

fn dir(workdir: &Path) -> PathBuf {
    workdir.join(SMARTPLS_DIR)
}

fn definition_path(workdir: &Path, name: &str) -> Result<PathBuf> {
    // Definition files live flat in one directory; a separator in the name
    // would escape it.
    if name.is_empty() || name.contains('/') || name.contains('\\') {
        return Err(Error::invalid_argument(format!(
            "invalid playlist name: {name}"
        )));
    }
    Ok(dir(workdir).join(name))
}

/// Whether a playlist has a smart definition behind it.
#[must_use]
pub fn is_smart(workdir: &Path, name: &str) -> bool {
    definition_path(workdir, name)
        .map(|path| path.exists())
        .unwrap_or(false)
}

/// Persists a definition via temp file and atomic rename.
pub fn save_definition(workdir: &Path, name: &str, definition: &SmartPlaylist) -> Result<()> {
    let path = definition_path(workdir, name)?;
    fs::create_dir_all(dir(workdir))?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, serde_json::to_string(definition)?)?;
    fs::rename(&tmp, &path)?;
    info!("saved smart playlist {name}");
    Ok(())
}

pub fn load_definition(workdir: &Path, name: &str) -> Result<SmartPlaylist> {
    let path = definition_path(workdir, name)?;
    let contents = fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&contents)?)
}

pub fn remove_definition(workdir: &Path, name: &str) -> Result<()> {
    let path = definition_path(workdir, name)?;
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// The modification cutoff for a "newest" playlist: everything at or after
/// `db_update − timerange` qualifies.
#[must_use]
pub fn newest_cutoff(db_update: u64, timerange: u64) -> u64 {
    db_update.saturating_sub(timerange)
}

/// Re-materializes one smart playlist.
pub fn update<S: Pollable>(
    link: &mut Link<S>,
    features: &Features,
    stickers: &StickerStore,
    workdir: &Path,
    name: &str,
) -> Result<()> {
    if !features.smartpls {
        warn!("smart playlists are disabled");
        return Ok(());
    }
    let definition = load_definition(workdir, name)?;
    match definition {
        SmartPlaylist::Sticker {
            sticker,
            maxentries,
            minvalue,
        } => update_sticker(link, stickers, name, &sticker, maxentries, minvalue)?,
        SmartPlaylist::Newest { timerange } => update_newest(link, name, timerange)?,
        SmartPlaylist::Search { tag, expression } => {
            update_search(link, name, &tag, &expression)?;
        }
    }
    info!("updated smart playlist {name}");
    Ok(())
}

/// Refreshes every smart playlist with a definition on disk.
pub fn update_all<S: Pollable>(
    link: &mut Link<S>,
    features: &Features,
    stickers: &StickerStore,
    workdir: &Path,
) -> Result<()> {
    let entries = match fs::read_dir(dir(workdir)) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.ends_with(".tmp") {
            continue;
        }
        if let Err(e) = update(link, features, stickers, workdir, name) {
            if e.is_fatal() {
                return Err(e);
            }
            error!("update of smart playlist {name} failed: {e}");
        }
    }
    Ok(())
}

/// Removes the stored playlist if it exists; missing is fine.
fn clear_playlist<S: Pollable>(link: &mut Link<S>, name: &str) -> Result<()> {
    let exists = link
        .client
        .playlists()?
        .iter()
        .any(|playlist| playlist.name == name);
    if exists {
        link.client.pl_remove(name)?;
    }
    Ok(())
}

fn update_sticker<S: Pollable>(
    link: &mut Link<S>,
    stickers: &StickerStore,
    name: &str,
    sticker: &str,
    maxentries: usize,
    minvalue: u32,
) -> Result<()> {
    let mut ranked = stickers.ranked(sticker, 1);
    let threshold = if minvalue > 0 {
        minvalue
    } else {
        // No explicit floor: keep the upper half of the observed range.
        let observed_max = ranked.iter().map(|(_, value)| *value).max().unwrap_or(0);
        if observed_max > 2 {
            observed_max / 2
        } else {
            observed_max
        }
    };
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    clear_playlist(link, name)?;
    let mut added = 0;
    for (uri, value) in ranked {
        if value < threshold {
            break;
        }
        let song = mpd::Song {
            file: uri,
            ..mpd::Song::default()
        };
        link.client.pl_push(name, &song)?;
        added += 1;
        if added >= maxentries {
            break;
        }
    }
    info!("smart playlist {name}: {added} songs with {sticker} >= {threshold}");
    Ok(())
}

fn update_newest<S: Pollable>(link: &mut Link<S>, name: &str, timerange: u64) -> Result<()> {
    let stats = link.client.stats()?;
    let cutoff = newest_cutoff(stats.db_update.as_secs(), timerange);

    clear_playlist(link, name)?;
    if cutoff == 0 {
        return Ok(());
    }
    let mut query = Query::new();
    query.and(Term::LastMod, cutoff.to_string());
    let found = link.client.find(&query, None::<(u32, u32)>)?;
    for song in &found {
        link.client.pl_push(name, song)?;
    }
    debug!("smart playlist {name}: {} songs since {cutoff}", found.len());
    Ok(())
}

fn update_search<S: Pollable>(
    link: &mut Link<S>,
    name: &str,
    tag: &str,
    expression: &str,
) -> Result<()> {
    clear_playlist(link, name)?;
    let mut query = Query::new();
    if tag.eq_ignore_ascii_case("any") {
        query.and(Term::Any, expression);
    } else {
        query.and(Term::Tag(tag.to_string().into()), expression);
    }
    let found = link.client.search(&query, None::<(u32, u32)>)?;
    for song in &found {
        link.client.pl_push(name, song)?;
    }
    Ok(())
}

/// How a playlist rebuild orders its songs.
pub enum Order {
    Shuffle,
    ByUri,
    ByTag(String),
}

impl Order {
    /// Maps the request's sort keyword: `shuffle`, `filename`, or a tag.
    #[must_use]
    pub fn from_keyword(keyword: &str) -> Self {
        match keyword {
            "shuffle" => Self::Shuffle,
            "filename" => Self::ByUri,
            tag => Self::ByTag(tag.to_string()),
        }
    }
}

/// Rebuilds a stored playlist shuffled or sorted.
///
/// The new order is written to a temp playlist first; two renames swap it
/// in and the old content is only dropped once the swap succeeded.
pub fn shuffle_sort<S: Pollable>(link: &mut Link<S>, name: &str, order: &Order) -> Result<()> {
    let songs = link.client.playlist(name)?;
    if songs.len() < 2 {
        return Err(Error::invalid_argument("playlist is too small to reorder"));
    }

    let mut entries: Vec<(String, String)> = songs
        .into_iter()
        .map(|song| {
            let key = match order {
                Order::Shuffle | Order::ByUri => String::new(),
                Order::ByTag(tag) => song
                    .tags
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(tag))
                    .map(|(_, value)| value.clone())
                    .unwrap_or_default(),
            };
            (song.file, key)
        })
        .collect();
    match order {
        Order::Shuffle => rand::shuffle(&mut entries),
        Order::ByUri => entries.sort_by(|a, b| a.0.cmp(&b.0)),
        Order::ByTag(_) => entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0))),
    }

    let nonce = rand::range(100_000, 999_999);
    let tmp = format!("{nonce}-tmp-{name}");
    let old = format!("{nonce}-old-{name}");

    for (uri, _) in &entries {
        let song = mpd::Song {
            file: uri.clone(),
            ..mpd::Song::default()
        };
        if let Err(e) = link.client.pl_push(&tmp, &song) {
            let _ = link.client.pl_remove(&tmp);
            return Err(e.into());
        }
    }

    link.client.pl_rename(name, &old)?;
    if let Err(e) = link.client.pl_rename(&tmp, name) {
        // Put the original back before giving up.
        let _ = link.client.pl_rename(&old, name);
        return Err(e.into());
    }
    link.client.pl_remove(&old)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definitions_round_trip() {
        let workdir = tempfile::tempdir().unwrap();
        let definition = SmartPlaylist::Sticker {
            sticker: String::from("playCount"),
            maxentries: 50,
            minvalue: 3,
        };
        save_definition(workdir.path(), "most-played", &definition).unwrap();
        let loaded = load_definition(workdir.path(), "most-played").unwrap();
        assert_eq!(loaded, definition);
        assert!(is_smart(workdir.path(), "most-played"));
    }

    #[test]
    fn definition_files_are_tagged_json() {
        let encoded = serde_json::to_value(SmartPlaylist::Newest { timerange: 3_600 }).unwrap();
        assert_eq!(encoded["type"], "newest");
        assert_eq!(encoded["timerange"], 3_600);
    }

    #[test]
    fn names_cannot_escape_the_directory() {
        let workdir = tempfile::tempdir().unwrap();
        let definition = SmartPlaylist::Newest { timerange: 60 };
        assert!(save_definition(workdir.path(), "../escape", &definition).is_err());
        assert!(save_definition(workdir.path(), "", &definition).is_err());
    }

    #[test]
    fn removing_a_missing_definition_is_fine() {
        let workdir = tempfile::tempdir().unwrap();
        assert!(remove_definition(workdir.path(), "nothing-here").is_ok());
    }

    #[test]
    fn newest_cutoff_is_inclusive_arithmetic() {
        assert_eq!(newest_cutoff(10_000, 3_600), 6_400);
        // A range wider than the database age selects everything.
        assert_eq!(newest_cutoff(100, 3_600), 0);
    }

    #[test]
    fn order_keywords_map_to_strategies() {
        assert!(matches!(Order::from_keyword("shuffle"), Order::Shuffle));
        assert!(matches!(Order::from_keyword("filename"), Order::ByUri));
        assert!(matches!(
            Order::from_keyword("Artist"),
            Order::ByTag(tag) if tag == "Artist"
        ));
    }
}
