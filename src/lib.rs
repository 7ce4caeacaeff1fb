//! Advisory-process bridge for a game frame loop.
//!
//! A supervised advisor subprocess talks line-delimited text over stdio,
//! overlay viewers talk over WebSocket, and both feed one inbound queue that
//! the host drains once per frame through [`Bridge::tick`].

pub mod bridge;
pub mod broadcast;
pub mod config;
pub mod demo;
pub mod events;
pub mod log;
pub mod protocol;
pub mod pump;
pub mod queue;
pub mod store;
pub mod supervisor;

pub use bridge::{Bridge, CommandError, CommandExecutor, StateSerializer, TickReport};
pub use broadcast::{BroadcastServer, ConnectionId};
pub use config::BridgeConfig;
pub use events::{BridgeEvent, EventSink};
pub use store::{Recommendation, RecommendationStore};
pub use supervisor::{ProcessSupervisor, SupervisorSettings};
