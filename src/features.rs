//! Server capability probing.
//!
//! Run once after every successful connect and again when settings change
//! while connected. The session trusts these flags instead of issuing
//! commands the server would reject: stickers, stored playlists and the
//! fingerprint command are gated on the command allowlist, tags on the
//! negotiated tag-type set, and the "love" message channel on the channel
//! list.

use mpd::message::Channel;

use crate::config::Config;
use crate::error::Result;
use crate::link::{Link, Pollable};

/// Negotiated capability flags and the effective tag set.
#[derive(Clone, Debug, Default)]
pub struct Features {
    pub stickers: bool,
    pub playlists: bool,
    pub fingerprint: bool,
    pub advsearch: bool,
    pub tags: bool,
    pub smartpls: bool,
    pub love: bool,

    /// Configured tags the server actually supports.
    pub enabled_tags: Vec<String>,
}

/// Probes the server and derives the feature set for this connection.
pub fn detect<S: Pollable>(link: &mut Link<S>, config: &Config) -> Result<Features> {
    let mut features = Features::default();

    probe_commands(link, config, &mut features)?;
    probe_tags(link, config, &mut features)?;
    features.love = probe_love(link, config)?;

    // Newer servers understand filter expressions; the protocol version is
    // announced in the connect banner.
    features.advsearch = link.client.version >= mpd::Version(0, 21, 0);
    if features.advsearch {
        info!("enabling advanced search");
    } else {
        warn!("disabling advanced search, depends on mpd >= 0.21.0");
    }

    features.smartpls = config.smartpls;
    if features.smartpls && !features.stickers {
        warn!("stickers are disabled, disabling smart playlists");
        features.smartpls = false;
    }
    if features.smartpls && !features.playlists {
        warn!("playlists are disabled, disabling smart playlists");
        features.smartpls = false;
    }

    Ok(features)
}

fn probe_commands<S: Pollable>(
    link: &mut Link<S>,
    config: &Config,
    features: &mut Features,
) -> Result<()> {
    for command in link.client.commands()? {
        match command.as_str() {
            "sticker" => {
                debug!("server supports stickers");
                features.stickers = true;
            }
            "listplaylists" => {
                debug!("server supports playlists");
                features.playlists = true;
            }
            "getfingerprint" => {
                debug!("server supports the fingerprint command");
                features.fingerprint = true;
            }
            _ => {}
        }
    }
    if features.stickers && !config.stickers {
        features.stickers = false;
    }
    if !features.stickers && config.stickers {
        warn!("server does not support stickers, disabling sticker tracking");
    }
    Ok(())
}

fn probe_tags<S: Pollable>(
    link: &mut Link<S>,
    config: &Config,
    features: &mut Features,
) -> Result<()> {
    let supported = link.client.tagtypes()?;
    if supported.is_empty() {
        info!("tags are disabled");
        features.tags = false;
        return Ok(());
    }

    features.enabled_tags = config
        .taglist
        .iter()
        .filter(|wanted| {
            let known = supported
                .iter()
                .any(|tag| tag.eq_ignore_ascii_case(wanted));
            if !known {
                debug!("disabling tag {wanted}");
            }
            known
        })
        .cloned()
        .collect();
    features.tags = !features.enabled_tags.is_empty();
    info!("enabled tags: {}", features.enabled_tags.join(" "));
    Ok(())
}

/// Checks whether the configured love channel exists. Re-run whenever the
/// server's channel list changes.
pub fn probe_love<S: Pollable>(link: &mut Link<S>, config: &Config) -> Result<bool> {
    if !config.love || config.love_channel.is_empty() {
        return Ok(false);
    }
    let wanted = Channel::new(&config.love_channel);
    let found = link
        .client
        .channels()?
        .iter()
        .any(|channel| Some(channel) == wanted.as_ref());
    if found {
        info!("found love channel {}", config.love_channel);
    } else {
        warn!("love channel {} not found", config.love_channel);
    }
    Ok(found)
}
