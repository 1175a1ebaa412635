use playcord_core::{AppName, DetectedApp};
use std::collections::HashMap;
use sysinfo::{ProcessesToUpdate, System};

/// Enumerates the supported players that are currently running.
///
/// Implementations keep no state between calls; each call is a fresh pass.
pub trait AppPresence: Send + Sync {
    /// Running players, highest priority first.
    fn detect_running_apps(&self) -> Vec<DetectedApp>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAppDetector;

impl SystemAppDetector {
    pub fn new() -> Self {
        Self
    }
}

impl AppPresence for SystemAppDetector {
    fn detect_running_apps(&self) -> Vec<DetectedApp> {
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All, true);
        let titles = window_titles();
        let processes = sys
            .processes()
            .iter()
            .map(|(pid, process)| (pid.as_u32(), process.name().to_string_lossy().into_owned()));
        rank_processes(processes, &titles)
    }
}

/// Matches `(pid, process name)` pairs against the registry.
///
/// One entry per app is kept, preferring the process that owns a titled
/// window, then the lowest pid.
pub fn rank_processes(
    processes: impl IntoIterator<Item = (u32, String)>,
    titles: &HashMap<u32, String>,
) -> Vec<DetectedApp> {
    let mut found: HashMap<AppName, DetectedApp> = HashMap::new();

    for (pid, name) in processes {
        let Some(app) = AppName::from_process_name(&name) else {
            continue;
        };
        let title = titles.get(&pid).cloned().unwrap_or_default();
        let candidate = DetectedApp::new(app, pid, title);

        let replace = match found.get(&app) {
            None => true,
            Some(current) => {
                let current_titled = !current.window_title.is_empty();
                let candidate_titled = !candidate.window_title.is_empty();
                (candidate_titled && !current_titled)
                    || (candidate_titled == current_titled
                        && candidate.process_identifier < current.process_identifier)
            }
        };
        if replace {
            found.insert(app, candidate);
        }
    }

    let mut apps: Vec<DetectedApp> = found.into_values().collect();
    apps.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.process_identifier.cmp(&b.process_identifier))
    });
    apps
}

#[cfg(target_os = "windows")]
fn window_titles() -> HashMap<u32, String> {
    crate::windows::visible_window_titles()
}

#[cfg(not(target_os = "windows"))]
fn window_titles() -> HashMap<u32, String> {
    HashMap::new()
}

#[cfg(test)]
mod tests {
    use super::rank_processes;
    use playcord_core::AppName;
    use std::collections::HashMap;

    fn procs(list: &[(u32, &str)]) -> Vec<(u32, String)> {
        list.iter().map(|(pid, n)| (*pid, n.to_string())).collect()
    }

    #[test]
    fn sorts_by_descending_priority() {
        let apps = rank_processes(
            procs(&[
                (10, "vlc.exe"),
                (11, "explorer.exe"),
                (12, "iTunes.exe"),
                (13, "Spotify.exe"),
                (14, "AppleMusic.exe"),
            ]),
            &HashMap::new(),
        );
        let names: Vec<AppName> = apps.iter().map(|a| a.app_name).collect();
        assert_eq!(
            names,
            vec![
                AppName::AppleMusic,
                AppName::ITunes,
                AppName::Spotify,
                AppName::Vlc
            ]
        );
        assert_eq!(apps[0].priority, 100);
    }

    #[test]
    fn keeps_one_instance_preferring_the_titled_window() {
        let mut titles = HashMap::new();
        titles.insert(42, "Artist X - Song A".to_string());
        let apps = rank_processes(
            procs(&[(7, "Spotify.exe"), (42, "Spotify.exe"), (50, "Spotify.exe")]),
            &titles,
        );
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].process_identifier, 42);
        assert_eq!(apps[0].window_title, "Artist X - Song A");
    }

    #[test]
    fn no_supported_app_yields_empty() {
        assert!(rank_processes(procs(&[(1, "bash")]), &HashMap::new()).is_empty());
    }
}
