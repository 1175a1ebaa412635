use crate::{AdapterError, ArtworkCache, TrackAdapter};
use anyhow::Result;
use async_trait::async_trait;
use playcord_core::apps::GENERIC_SESSION_IDS;
use playcord_core::{AppName, DetectedApp, Track, UNKNOWN_ARTIST};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Playing,
    Paused,
    Stopped,
    Other,
}

/// One entry of the OS media-session registry, already copied out of the
/// platform API.
#[derive(Debug, Clone)]
pub struct MediaSession {
    pub source_app_id: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub status: SessionStatus,
    pub position: Option<Duration>,
    pub duration: Option<Duration>,
    pub thumbnail: Option<Vec<u8>>,
}

#[async_trait]
pub trait SessionRegistry: Send + Sync {
    async fn sessions(&self) -> Result<Vec<MediaSession>>;
}

/// Reads the OS media-session registry and keeps only known music players.
pub struct MediaSessionAdapter {
    registry: Option<Box<dyn SessionRegistry>>,
    artwork: Arc<ArtworkCache>,
    cached_thumbnail: Option<(String, PathBuf)>,
}

impl MediaSessionAdapter {
    pub fn new(registry: Option<Box<dyn SessionRegistry>>, artwork: Arc<ArtworkCache>) -> Self {
        Self {
            registry,
            artwork,
            cached_thumbnail: None,
        }
    }

    /// Writes the thumbnail once per track and reuses the file afterwards.
    async fn thumbnail_path(&mut self, session: &MediaSession) -> Option<PathBuf> {
        let bytes = session.thumbnail.as_deref().filter(|b| !b.is_empty())?;
        let key = format!("{}\u{1f}{}\u{1f}{}", session.title, session.artist, session.album);
        if let Some((cached, path)) = &self.cached_thumbnail {
            if *cached == key && path.exists() {
                return Some(path.clone());
            }
        }
        match self.artwork.store(bytes, "jpg").await {
            Ok(path) => {
                self.cached_thumbnail = Some((key, path.clone()));
                Some(path)
            }
            Err(err) => {
                debug!(error = %err, "thumbnail not cached");
                None
            }
        }
    }
}

#[async_trait]
impl TrackAdapter for MediaSessionAdapter {
    fn name(&self) -> &'static str {
        "media_session"
    }

    async fn try_get_track(
        &mut self,
        hint: Option<&DetectedApp>,
    ) -> Result<Option<Track>, AdapterError> {
        let Some(registry) = self.registry.as_ref() else {
            return Ok(None);
        };
        let sessions = registry.sessions().await?;
        let Some(session) = select_session(&sessions, hint.map(|h| h.app_name)).cloned() else {
            return Ok(None);
        };

        let mut track = session_to_track(&session, SystemTime::now());
        track.artwork_path = self.thumbnail_path(&session).await;
        Ok(Some(track))
    }
}

/// Case-insensitive substring match of a session's source identifier
/// against every known player and the generic allow-list.
pub fn is_relevant(source_app_id: &str) -> bool {
    let source = source_app_id.to_lowercase();
    if source.is_empty() {
        return false;
    }
    AppName::ALL
        .iter()
        .flat_map(|app| app.media_session_ids().iter())
        .chain(GENERIC_SESSION_IDS.iter())
        .any(|id| source.contains(&id.to_lowercase()))
}

/// Picks the session to report out of every relevant one.
///
/// A playing session beats a paused one. Among equals the hinted app wins,
/// then the higher registry priority, then registry order.
pub fn select_session(sessions: &[MediaSession], hint: Option<AppName>) -> Option<&MediaSession> {
    sessions
        .iter()
        .filter(|s| !s.title.trim().is_empty() && is_relevant(&s.source_app_id))
        .rev()
        .max_by_key(|s| {
            let app = AppName::from_session_id(&s.source_app_id);
            (
                s.status == SessionStatus::Playing,
                hint.is_some() && app == hint,
                app.map(AppName::priority).unwrap_or(0),
            )
        })
}

pub fn session_to_track(session: &MediaSession, now: SystemTime) -> Track {
    let artist = if session.artist.trim().is_empty() {
        UNKNOWN_ARTIST.to_string()
    } else {
        session.artist.clone()
    };
    let mut track = Track::with_window(
        session.title.clone(),
        artist,
        session.album.clone(),
        session.status == SessionStatus::Playing,
        session.position.unwrap_or_default(),
        session.duration,
        now,
    );
    track.source_app = AppName::from_session_id(&session.source_app_id);
    track
}

/// Registry for the current OS, or `None` where there is none.
pub fn platform_registry() -> Option<Box<dyn SessionRegistry>> {
    #[cfg(target_os = "windows")]
    return Some(Box::new(crate::windows::GsmtcRegistry::new()));

    #[cfg(target_os = "linux")]
    return Some(Box::new(crate::mpris::MprisRegistry::new()));

    #[cfg(not(any(target_os = "windows", target_os = "linux")))]
    None
}
