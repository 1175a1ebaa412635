//! Picks which source family speaks for the host.
//!
//! The arbitrator is a plain state machine: [`Arbitrator::handle`] turns one
//! [`SourceEvent`] into the [`Outcome`]s the runtime must carry out, in order.
//! The policy deciding who wins when both families play is a strategy object.

use crate::source::SourceEvent;
use playcord_core::{AppName, ArbitrationMode, SourceFamily, Track};
use std::fmt;
use tracing::{debug, info};

/// Arbitrated view of "what is playing", for subscribers such as a UI.
#[derive(Debug, Clone, PartialEq)]
pub enum NowPlayingEvent {
    TrackChanged {
        family: SourceFamily,
        source: Option<AppName>,
        track: Track,
    },
    PlayStateChanged {
        family: SourceFamily,
        is_playing: bool,
    },
    /// Nothing is active any more and the presence was cleared.
    Cleared,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Publish {
        track: Track,
        source: Option<AppName>,
    },
    Clear,
    Notify(NowPlayingEvent),
}

/// One flag per family. At most one is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FamilyFlags {
    pub legacy: bool,
    pub media_session: bool,
}

impl FamilyFlags {
    pub fn get(&self, family: SourceFamily) -> bool {
        match family {
            SourceFamily::LegacyApp => self.legacy,
            SourceFamily::MediaSession => self.media_session,
        }
    }

    pub fn set(&mut self, family: SourceFamily, value: bool) {
        match family {
            SourceFamily::LegacyApp => self.legacy = value,
            SourceFamily::MediaSession => self.media_session = value,
        }
    }
}

/// Decides the active family. Implementations hold no state of their own.
pub trait ArbitrationPolicy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Family that should be active after `claimant` reported playing.
    fn winner(&self, claimant: SourceFamily, playing: &FamilyFlags) -> SourceFamily;

    /// Family to hand over to once `stopped` stopped playing, if any.
    fn fallback(&self, stopped: SourceFamily, playing: &FamilyFlags) -> Option<SourceFamily>;
}

/// The most recent family to report playing takes over, whatever its rank.
///
/// Two players toggling play in turn will make the presence flap.
#[derive(Debug, Default, Clone, Copy)]
pub struct LastPlayingWins;

impl ArbitrationPolicy for LastPlayingWins {
    fn name(&self) -> &'static str {
        "last_playing_wins"
    }

    fn winner(&self, claimant: SourceFamily, _playing: &FamilyFlags) -> SourceFamily {
        claimant
    }

    fn fallback(&self, _stopped: SourceFamily, _playing: &FamilyFlags) -> Option<SourceFamily> {
        None
    }
}

/// Media sessions outrank the legacy app while both play.
#[derive(Debug, Default, Clone, Copy)]
pub struct PriorityOrder;

impl PriorityOrder {
    fn rank(family: SourceFamily) -> u8 {
        match family {
            SourceFamily::MediaSession => 2,
            SourceFamily::LegacyApp => 1,
        }
    }
}

impl ArbitrationPolicy for PriorityOrder {
    fn name(&self) -> &'static str {
        "priority"
    }

    fn winner(&self, claimant: SourceFamily, playing: &FamilyFlags) -> SourceFamily {
        let other = claimant.other();
        if playing.get(other) && Self::rank(other) > Self::rank(claimant) {
            other
        } else {
            claimant
        }
    }

    fn fallback(&self, stopped: SourceFamily, playing: &FamilyFlags) -> Option<SourceFamily> {
        let other = stopped.other();
        playing.get(other).then_some(other)
    }
}

pub fn policy_for(mode: ArbitrationMode) -> Box<dyn ArbitrationPolicy> {
    match mode {
        ArbitrationMode::LastPlayingWins => Box::new(LastPlayingWins),
        ArbitrationMode::Priority => Box::new(PriorityOrder),
    }
}

#[derive(Debug, Clone)]
struct Latest {
    track: Track,
    source: Option<AppName>,
}

#[derive(Debug)]
pub struct Arbitrator {
    policy: Box<dyn ArbitrationPolicy>,
    active: FamilyFlags,
    playing: FamilyFlags,
    latest_legacy: Option<Latest>,
    latest_media: Option<Latest>,
}

impl Arbitrator {
    pub fn new(policy: Box<dyn ArbitrationPolicy>) -> Self {
        Self {
            policy,
            active: FamilyFlags::default(),
            playing: FamilyFlags::default(),
            latest_legacy: None,
            latest_media: None,
        }
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn active_family(&self) -> Option<SourceFamily> {
        SourceFamily::ALL
            .into_iter()
            .find(|family| self.active.get(*family))
    }

    pub fn active_flags(&self) -> FamilyFlags {
        self.active
    }

    pub fn handle(&mut self, event: SourceEvent) -> Vec<Outcome> {
        match event {
            SourceEvent::TrackChanged {
                family,
                source,
                track,
            } => self.on_track(family, source, track),
            SourceEvent::PlayStateChanged {
                family, is_playing, ..
            } => self.on_play_state(family, is_playing),
        }
    }

    fn on_track(
        &mut self,
        family: SourceFamily,
        source: Option<AppName>,
        track: Track,
    ) -> Vec<Outcome> {
        *self.latest_mut(family) = Some(Latest {
            track: track.clone(),
            source,
        });
        if track.is_playing {
            self.playing.set(family, true);
            self.claim(family);
        }
        if !self.active.get(family) {
            debug!(family = %family, track = %track.name, "ignoring track from inactive family");
            return Vec::new();
        }

        let mut out = Vec::with_capacity(2);
        if track.is_playing {
            out.push(Outcome::Publish {
                track: track.clone(),
                source,
            });
        }
        out.push(Outcome::Notify(NowPlayingEvent::TrackChanged {
            family,
            source,
            track,
        }));
        out
    }

    fn on_play_state(&mut self, family: SourceFamily, is_playing: bool) -> Vec<Outcome> {
        self.playing.set(family, is_playing);
        if is_playing {
            self.claim(family);
            return if self.active.get(family) {
                vec![Outcome::Notify(NowPlayingEvent::PlayStateChanged {
                    family,
                    is_playing,
                })]
            } else {
                Vec::new()
            };
        }

        if !self.active.get(family) {
            return Vec::new();
        }
        let mut out = vec![Outcome::Notify(NowPlayingEvent::PlayStateChanged {
            family,
            is_playing: false,
        })];

        let handover = self
            .policy
            .fallback(family, &self.playing)
            .and_then(|next| self.latest(next).cloned().map(|latest| (next, latest)))
            .filter(|(_, latest)| latest.track.is_playing);

        match handover {
            Some((next, latest)) => {
                info!(from = %family, to = %next, "active family stopped; falling back");
                self.activate(Some(next));
                out.push(Outcome::Publish {
                    track: latest.track.clone(),
                    source: latest.source,
                });
                out.push(Outcome::Notify(NowPlayingEvent::TrackChanged {
                    family: next,
                    source: latest.source,
                    track: latest.track,
                }));
            }
            None => {
                info!(family = %family, "active family stopped; clearing presence");
                self.activate(None);
                out.push(Outcome::Clear);
                out.push(Outcome::Notify(NowPlayingEvent::Cleared));
            }
        }
        out
    }

    fn claim(&mut self, claimant: SourceFamily) {
        let winner = self.policy.winner(claimant, &self.playing);
        if self.active_family() != Some(winner) {
            info!(family = %winner, policy = self.policy.name(), "family became active");
        }
        self.activate(Some(winner));
    }

    fn activate(&mut self, family: Option<SourceFamily>) {
        self.active = FamilyFlags::default();
        if let Some(family) = family {
            self.active.set(family, true);
        }
    }

    fn latest(&self, family: SourceFamily) -> Option<&Latest> {
        match family {
            SourceFamily::LegacyApp => self.latest_legacy.as_ref(),
            SourceFamily::MediaSession => self.latest_media.as_ref(),
        }
    }

    fn latest_mut(&mut self, family: SourceFamily) -> &mut Option<Latest> {
        match family {
            SourceFamily::LegacyApp => &mut self.latest_legacy,
            SourceFamily::MediaSession => &mut self.latest_media,
        }
    }
}
