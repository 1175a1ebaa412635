pub mod arbitrator;
pub mod backoff;
pub mod payload;
pub mod publisher;
pub mod runtime;
pub mod source;

pub use arbitrator::{
    policy_for, ArbitrationPolicy, Arbitrator, FamilyFlags, LastPlayingWins, NowPlayingEvent,
    Outcome, PriorityOrder,
};
pub use backoff::{BackoffPolicy, BackoffState};
pub use payload::{payload_from_track, PresencePayload};
pub use publisher::{
    ClientFactory, ConnectionEvent, ConnectionState, PresenceClient, PresencePublisher,
    PublishError, PublisherConfig,
};
pub use runtime::{Engine, EngineConfig};
pub use source::{PollingSource, SourceConfig, SourceEvent, SourcePhase, SourceState};
