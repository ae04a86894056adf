//! Turn execution for parley: the tool registry and built-in tools, the
//! per-turn tool-call loop, session actors and their broadcast hubs.

pub mod error;
pub mod hub;
pub mod manager;
pub mod registry;
pub mod schema;
pub mod session;
pub mod tool_loop;
pub mod tools;
pub mod truncate;

#[cfg(test)]
mod testing;

pub use error::EngineError;
pub use hub::{BroadcastHub, ChannelSink, EventSink, EventSubscription, SinkError, Subscription};
pub use manager::{EngineConfig, SessionManager};
pub use registry::ToolRegistry;
pub use session::{SessionActor, TurnHandle};
pub use tool_loop::{LoopConfig, ToolCallLoop, TurnSink};
pub use tools::create_default_registry;
