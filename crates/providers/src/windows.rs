use crate::media_session::{MediaSession, SessionRegistry, SessionStatus};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use windows::Media::Control::{
    GlobalSystemMediaTransportControlsSession,
    GlobalSystemMediaTransportControlsSessionManager,
    GlobalSystemMediaTransportControlsSessionPlaybackStatus as PlaybackStatus,
};
use windows::Storage::Streams::DataReader;
use windows::Win32::Foundation::{BOOL, HWND, LPARAM};
use windows::Win32::UI::WindowsAndMessaging::{
    EnumWindows, GetWindowTextLengthW, GetWindowTextW, GetWindowThreadProcessId, IsWindowVisible,
};

/// Global System Media Transport Controls.
///
/// WinRT calls block, so every read runs on the blocking pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct GsmtcRegistry;

impl GsmtcRegistry {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SessionRegistry for GsmtcRegistry {
    async fn sessions(&self) -> Result<Vec<MediaSession>> {
        tokio::task::spawn_blocking(read_sessions)
            .await
            .context("media session reader panicked")?
    }
}

fn read_sessions() -> Result<Vec<MediaSession>> {
    let manager = GlobalSystemMediaTransportControlsSessionManager::RequestAsync()?.get()?;
    let sessions = manager.GetSessions()?;
    let mut out = Vec::with_capacity(sessions.Size()? as usize);
    for index in 0..sessions.Size()? {
        let session = sessions.GetAt(index)?;
        match read_session(&session) {
            Ok(entry) => out.push(entry),
            Err(err) => tracing::debug!(error = %err, "media session skipped"),
        }
    }
    Ok(out)
}

fn read_session(session: &GlobalSystemMediaTransportControlsSession) -> Result<MediaSession> {
    let source_app_id = session.SourceAppUserModelId()?.to_string_lossy();
    let props = session.TryGetMediaPropertiesAsync()?.get()?;
    let status = match session.GetPlaybackInfo()?.PlaybackStatus()? {
        PlaybackStatus::Playing => SessionStatus::Playing,
        PlaybackStatus::Paused => SessionStatus::Paused,
        PlaybackStatus::Stopped => SessionStatus::Stopped,
        _ => SessionStatus::Other,
    };

    let timeline = session.GetTimelineProperties()?;
    // TimeSpan counts 100ns ticks.
    let ticks = |t: i64| (t > 0).then(|| Duration::from_nanos(t as u64 * 100));
    let duration = ticks(timeline.EndTime()?.Duration - timeline.StartTime()?.Duration);
    let position = ticks(timeline.Position()?.Duration);

    Ok(MediaSession {
        source_app_id,
        title: props.Title()?.to_string_lossy(),
        artist: props.Artist()?.to_string_lossy(),
        album: props.AlbumTitle()?.to_string_lossy(),
        status,
        position,
        duration,
        thumbnail: read_thumbnail(&props).ok().flatten(),
    })
}

fn read_thumbnail(
    props: &windows::Media::Control::GlobalSystemMediaTransportControlsSessionMediaProperties,
) -> Result<Option<Vec<u8>>> {
    let Ok(reference) = props.Thumbnail() else {
        return Ok(None);
    };
    let stream = reference.OpenReadAsync()?.get()?;
    let size = u32::try_from(stream.Size()?).context("thumbnail too large")?;
    if size == 0 {
        return Ok(None);
    }
    let reader = DataReader::CreateDataReader(&stream.GetInputStreamAt(0)?)?;
    reader.LoadAsync(size)?.get()?;
    let mut bytes = vec![0u8; size as usize];
    reader.ReadBytes(&mut bytes)?;
    Ok(Some(bytes))
}

/// Title of every visible top-level window, keyed by owning process id.
pub fn visible_window_titles() -> HashMap<u32, String> {
    let mut titles: HashMap<u32, String> = HashMap::new();
    let ptr = &mut titles as *mut HashMap<u32, String>;
    // SAFETY: the callback only runs during EnumWindows, while `titles` is alive.
    if let Err(err) = unsafe { EnumWindows(Some(collect_title), LPARAM(ptr as isize)) } {
        tracing::debug!(error = %err, "window enumeration stopped early");
    }
    titles
}

unsafe extern "system" fn collect_title(hwnd: HWND, lparam: LPARAM) -> BOOL {
    let titles = &mut *(lparam.0 as *mut HashMap<u32, String>);
    if !IsWindowVisible(hwnd).as_bool() {
        return true.into();
    }
    let len = GetWindowTextLengthW(hwnd);
    if len <= 0 {
        return true.into();
    }
    let mut buf = vec![0u16; len as usize + 1];
    let copied = GetWindowTextW(hwnd, &mut buf);
    if copied <= 0 {
        return true.into();
    }
    let mut pid = 0u32;
    GetWindowThreadProcessId(hwnd, Some(&mut pid as *mut u32));
    let title = String::from_utf16_lossy(&buf[..copied as usize]);
    titles.entry(pid).or_insert(title);
    true.into()
}
