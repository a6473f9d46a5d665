pub mod client;
pub mod events;
pub mod hub;
pub mod merge;
pub mod middleware;
pub mod wire;

pub use client::{ClientConfig, ClientError, DeltaEvaluator, DeltaNormalizer, StateClient};
pub use events::{Event, EventBus};
pub use hub::{HubError, RoomHub, RoomStats};
pub use merge::{
    is_collection_key, is_private_key, merge, player_entry, suppress_buried, NullPolicy,
    TombstoneSet, PLAYERS_KEY,
};
pub use middleware::{ChangeFilter, Middleware, Pipeline, PrecisionRound, TombstoneGuard};
pub use wire::{strip_private, Envelope, Frame, LabFrame, WireError};
