use crate::{AdapterError, ArtworkCache, TrackAdapter};
use async_trait::async_trait;
use playcord_core::{AppName, DetectedApp, Track, UNKNOWN_ARTIST};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::debug;

/// What the automation scripts print: one JSON object on stdout.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ScriptOutput {
    pub state: String,
    pub name: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub year: Option<u32>,
    pub track_number: Option<u32>,
    pub track_count: Option<u32>,
    /// Seconds.
    pub duration: Option<f64>,
    /// Seconds.
    pub position: Option<f64>,
    pub artwork_saved: bool,
    pub error: Option<String>,
}

/// Talks to the scriptable player through the host's automation interface.
///
/// Cover art is only exported when the track differs from the one whose
/// artwork is already cached.
pub struct LegacyAppAdapter {
    artwork: Arc<ArtworkCache>,
    cached_artwork: Option<(String, PathBuf)>,
}

impl LegacyAppAdapter {
    pub fn new(artwork: Arc<ArtworkCache>) -> Self {
        Self {
            artwork,
            cached_artwork: None,
        }
    }
}

#[async_trait]
impl TrackAdapter for LegacyAppAdapter {
    fn name(&self) -> &'static str {
        "legacy_app"
    }

    async fn try_get_track(
        &mut self,
        hint: Option<&DetectedApp>,
    ) -> Result<Option<Track>, AdapterError> {
        let app = hint.map(|h| h.app_name).unwrap_or(AppName::ITunes);
        let artwork_path = match self.artwork.next_path("jpg") {
            Ok(path) => Some(path),
            Err(err) => {
                debug!(error = %err, "artwork path unavailable");
                None
            }
        };
        let known_key = self
            .cached_artwork
            .as_ref()
            .map(|(key, _)| key.as_str())
            .unwrap_or_default();

        let request = ScriptRequest {
            dir: self.artwork.dir(),
            app,
            artwork: artwork_path.as_deref(),
            known_key,
        };
        let Some(raw) = run_script(&request).await? else {
            return Ok(None);
        };
        let output: ScriptOutput = serde_json::from_str(raw.trim())
            .map_err(|err| AdapterError::InvalidOutput(err.to_string()))?;

        if let Some(err) = output.error.as_deref() {
            debug!(app = %app, error = err, "automation interface reported an error");
        }
        let saved = output.artwork_saved;
        let key = artwork_key(&output);
        let Some(mut track) = track_from_output(output, SystemTime::now()) else {
            return Ok(None);
        };

        match artwork_path.filter(|p| saved && p.exists()) {
            Some(path) => {
                self.cached_artwork = Some((key, path.clone()));
                track.artwork_path = Some(path);
            }
            None => {
                track.artwork_path = self
                    .cached_artwork
                    .as_ref()
                    .filter(|(cached, path)| *cached == key && path.exists())
                    .map(|(_, path)| path.clone());
            }
        }
        Ok(Some(track))
    }
}

#[cfg(target_os = "windows")]
const ITUNES_SCRIPT: &str = include_str!("../scripts/itunes_now_playing.js");
#[cfg(target_os = "macos")]
const JXA_SCRIPT: &str = include_str!("../scripts/jxa_now_playing.js");

struct ScriptRequest<'a> {
    /// Where the bundled scripts are materialized before running.
    #[cfg_attr(not(any(target_os = "windows", target_os = "macos")), allow(dead_code))]
    dir: &'a Path,
    app: AppName,
    #[cfg_attr(not(any(target_os = "windows", target_os = "macos")), allow(dead_code))]
    artwork: Option<&'a Path>,
    #[cfg_attr(not(any(target_os = "windows", target_os = "macos")), allow(dead_code))]
    known_key: &'a str,
}

/// Writes `body` to `dir/name` unless an identical copy is already there.
#[cfg_attr(not(any(target_os = "windows", target_os = "macos")), allow(dead_code))]
async fn install_script(dir: &Path, name: &str, body: &str) -> Result<PathBuf, AdapterError> {
    let path = dir.join(name);
    if tokio::fs::read_to_string(&path).await.ok().as_deref() == Some(body) {
        return Ok(path);
    }
    let failed = |err: std::io::Error| AdapterError::ScriptFailed(format!("{}: {err}", path.display()));
    tokio::fs::create_dir_all(dir).await.map_err(failed)?;
    tokio::fs::write(&path, body).await.map_err(failed)?;
    Ok(path)
}

/// Same layout the scripts use to decide whether artwork must be exported.
/// Built from the raw fields the player reported, before any placeholder.
fn artwork_key(output: &ScriptOutput) -> String {
    let raw = |field: &Option<String>| field.clone().unwrap_or_default();
    format!(
        "{}\u{1f}{}\u{1f}{}",
        raw(&output.name),
        raw(&output.artist),
        raw(&output.album)
    )
}

/// `Ok(None)` for "interface unavailable or nothing loaded".
pub fn track_from_output(output: ScriptOutput, now: SystemTime) -> Option<Track> {
    let is_playing = match output.state.as_str() {
        "playing" => true,
        "stopped" | "paused" | "fastForward" | "rewind" => false,
        _ => return None,
    };
    let name = output.name.filter(|n| !n.trim().is_empty())?;
    let artist = output
        .artist
        .filter(|a| !a.trim().is_empty())
        .unwrap_or_else(|| UNKNOWN_ARTIST.to_string());

    let secs = |v: Option<f64>| {
        v.filter(|s| s.is_finite() && *s > 0.0)
            .map(Duration::from_secs_f64)
    };
    let mut track = Track::with_window(
        name,
        artist,
        output.album.unwrap_or_default(),
        is_playing,
        secs(output.position).unwrap_or_default(),
        secs(output.duration),
        now,
    );
    track.genre = output.genre.unwrap_or_default();
    track.year = output.year.unwrap_or_default();
    track.track_number = output.track_number.unwrap_or_default();
    track.track_count = output.track_count.unwrap_or_default();
    Some(track)
}

#[cfg(target_os = "windows")]
async fn run_script(req: &ScriptRequest<'_>) -> Result<Option<String>, AdapterError> {
    if req.app != AppName::ITunes {
        return Ok(None);
    }
    let script = install_script(req.dir, "itunes_now_playing.js", ITUNES_SCRIPT).await?;
    let mut cmd = tokio::process::Command::new("cscript");
    cmd.arg("//NoLogo").arg("//E:jscript").arg(script);
    push_artwork_args(&mut cmd, req);
    capture(cmd).await.map(Some)
}

#[cfg(target_os = "macos")]
async fn run_script(req: &ScriptRequest<'_>) -> Result<Option<String>, AdapterError> {
    let target = match req.app {
        AppName::ITunes => "iTunes",
        AppName::AppleMusic => "Music",
        _ => return Ok(None),
    };
    let script = install_script(req.dir, "jxa_now_playing.js", JXA_SCRIPT).await?;
    let mut cmd = tokio::process::Command::new("osascript");
    cmd.arg("-l").arg("JavaScript").arg(script).arg(target);
    push_artwork_args(&mut cmd, req);
    capture(cmd).await.map(Some)
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
async fn run_script(req: &ScriptRequest<'_>) -> Result<Option<String>, AdapterError> {
    debug!(app = %req.app, "no automation interface on this platform");
    Ok(None)
}

#[cfg(any(target_os = "windows", target_os = "macos"))]
fn push_artwork_args(cmd: &mut tokio::process::Command, req: &ScriptRequest<'_>) {
    if let Some(path) = req.artwork {
        cmd.arg(path).arg(req.known_key);
    }
}

#[cfg(any(target_os = "windows", target_os = "macos"))]
async fn capture(mut cmd: tokio::process::Command) -> Result<String, AdapterError> {
    let output = cmd
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| AdapterError::ScriptFailed(err.to_string()))?;
    if !output.status.success() {
        return Err(AdapterError::ScriptFailed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    String::from_utf8(output.stdout).map_err(|err| AdapterError::InvalidOutput(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::{artwork_key, install_script, track_from_output, ScriptOutput};
    use playcord_core::UNKNOWN_ARTIST;
    use std::time::{Duration, UNIX_EPOCH};

    fn parse(json: &str) -> ScriptOutput {
        serde_json::from_str(json).expect("json")
    }

    #[test]
    fn playing_track_is_mapped_with_window() {
        let now = UNIX_EPOCH + Duration::from_secs(10_000);
        let track = track_from_output(
            parse(
                r#"{"state":"playing","name":"Song A","artist":"Artist X","album":"Album",
                    "trackNumber":3,"trackCount":12,"duration":200.0,"position":50.0,"year":1999}"#,
            ),
            now,
        )
        .expect("track");
        assert_eq!(track.name, "Song A");
        assert!(track.is_playing);
        assert_eq!(track.track_number, 3);
        assert_eq!(track.track_count, 12);
        assert_eq!(track.year, 1999);
        assert_eq!(track.start_time, UNIX_EPOCH + Duration::from_secs(9_950));
        assert_eq!(track.end_time, UNIX_EPOCH + Duration::from_secs(10_150));
    }

    #[test]
    fn only_playing_state_counts_as_playing() {
        for state in ["stopped", "fastForward", "rewind"] {
            let json = format!(r#"{{"state":"{state}","name":"Song A","artist":"Artist X"}}"#);
            let track = track_from_output(parse(&json), UNIX_EPOCH).expect("track");
            assert!(!track.is_playing, "{state}");
        }
    }

    #[test]
    fn unavailable_interface_is_no_track() {
        assert!(track_from_output(parse(r#"{"state":"unavailable"}"#), UNIX_EPOCH).is_none());
        assert!(track_from_output(
            parse(r#"{"state":"not_running","error":"iTunes is not running"}"#),
            UNIX_EPOCH
        )
        .is_none());
        assert!(track_from_output(parse(r#"{"state":"playing","name":""}"#), UNIX_EPOCH).is_none());
    }

    #[test]
    fn missing_artist_and_duration_get_defaults() {
        let track = track_from_output(parse(r#"{"state":"playing","name":"Song A"}"#), UNIX_EPOCH)
            .expect("track");
        assert_eq!(track.artist, UNKNOWN_ARTIST);
        assert_eq!(track.duration(), Duration::from_secs(180));
    }

    #[test]
    fn artwork_key_matches_the_script_layout_for_blank_artists() {
        let output = parse(r#"{"state":"playing","name":"Song A","artist":"","album":"Album"}"#);
        assert_eq!(artwork_key(&output), "Song A\u{1f}\u{1f}Album");

        let missing = parse(r#"{"state":"playing","name":"Song A","album":"Album"}"#);
        assert_eq!(artwork_key(&missing), artwork_key(&output));
        let track = track_from_output(output, UNIX_EPOCH).expect("track");
        assert_eq!(track.artist, UNKNOWN_ARTIST);
    }

    #[tokio::test]
    async fn scripts_are_written_once_and_refreshed_when_stale() {
        let dir = std::env::temp_dir().join(format!("playcord-scripts-{}", std::process::id()));
        let path = install_script(&dir, "now_playing.js", "v1").await.expect("install");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "v1");

        let again = install_script(&dir, "now_playing.js", "v1").await.expect("reuse");
        assert_eq!(again, path);

        install_script(&dir, "now_playing.js", "v2").await.expect("refresh");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "v2");
        let _ = std::fs::remove_dir_all(dir);
    }
}
