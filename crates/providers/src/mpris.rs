use crate::media_session::{MediaSession, SessionRegistry, SessionStatus};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use url::Url;
use zbus::zvariant::{OwnedValue, Str};
use zbus::{Connection, Proxy};

const PLAYER_PREFIX: &str = "org.mpris.MediaPlayer2.";

/// Every MPRIS player on the session bus, one session per bus name.
#[derive(Debug, Default, Clone, Copy)]
pub struct MprisRegistry;

impl MprisRegistry {
    pub fn new() -> Self {
        Self
    }

    async fn player_names(conn: &Connection) -> Result<Vec<String>> {
        let proxy = Proxy::new(
            conn,
            "org.freedesktop.DBus",
            "/org/freedesktop/DBus",
            "org.freedesktop.DBus",
        )
        .await?;

        let names: Vec<String> = proxy.call("ListNames", &()).await?;
        let mut players: Vec<String> = names
            .into_iter()
            .filter(|n| n.starts_with(PLAYER_PREFIX))
            .collect();
        players.sort();
        Ok(players)
    }

    async fn read_player(conn: &Connection, bus_name: String) -> Result<MediaSession> {
        let proxy = Proxy::new_owned(
            conn.clone(),
            bus_name.clone(),
            "/org/mpris/MediaPlayer2",
            "org.mpris.MediaPlayer2.Player",
        )
        .await?;

        let status: String = proxy.get_property("PlaybackStatus").await?;
        let metadata: HashMap<String, OwnedValue> = proxy.get_property("Metadata").await?;
        let position: i64 = proxy.get_property("Position").await.unwrap_or(0);

        let text = |key: &str| metadata.get(key).and_then(ov_to_string).unwrap_or_default();
        // MPRIS times are microseconds.
        let micros = |v: i64| (v > 0).then(|| Duration::from_micros(v as u64));
        let thumbnail = metadata
            .get("mpris:artUrl")
            .and_then(ov_to_string)
            .and_then(|art| read_local_art(&art));

        Ok(MediaSession {
            source_app_id: bus_name,
            title: text("xesam:title"),
            artist: metadata
                .get("xesam:artist")
                .and_then(first_artist)
                .unwrap_or_default(),
            album: text("xesam:album"),
            status: match status.as_str() {
                "Playing" => SessionStatus::Playing,
                "Paused" => SessionStatus::Paused,
                "Stopped" => SessionStatus::Stopped,
                _ => SessionStatus::Other,
            },
            position: micros(position),
            duration: metadata.get("mpris:length").and_then(ov_to_i64).and_then(micros),
            thumbnail,
        })
    }
}

#[async_trait]
impl SessionRegistry for MprisRegistry {
    async fn sessions(&self) -> Result<Vec<MediaSession>> {
        let conn = Connection::session()
            .await
            .context("failed to connect DBus session")?;

        let mut sessions = Vec::new();
        for bus_name in Self::player_names(&conn).await? {
            match Self::read_player(&conn, bus_name.clone()).await {
                Ok(session) => sessions.push(session),
                Err(err) => debug!(player = %bus_name, error = %err, "mpris player skipped"),
            }
        }
        Ok(sessions)
    }
}

/// Only `file://` art is read; remote art would need a fetch per poll.
fn read_local_art(art_url: &str) -> Option<Vec<u8>> {
    let path = Url::parse(art_url)
        .ok()
        .filter(|u| u.scheme() == "file")?
        .to_file_path()
        .ok()?;
    std::fs::read(path).ok()
}

fn ov_to_string(v: &OwnedValue) -> Option<String> {
    let owned = v.try_clone().ok()?;
    if let Ok(s) = String::try_from(owned.try_clone().ok()?) {
        return Some(s);
    }
    Str::try_from(owned).ok().map(|s| s.to_string())
}

fn ov_to_i64(v: &OwnedValue) -> Option<i64> {
    <i64>::try_from(v)
        .ok()
        .or_else(|| <u64>::try_from(v).ok().map(|u| u as i64))
}

fn first_artist(v: &OwnedValue) -> Option<String> {
    Vec::<String>::try_from(v.try_clone().ok()?)
        .ok()?
        .into_iter()
        .find(|a| !a.trim().is_empty())
}
