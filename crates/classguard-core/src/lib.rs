pub mod bypass;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod error;
pub mod host;
pub mod ipc;
pub mod mode;
pub mod pattern;
pub mod policy;
pub mod reconcile;
pub mod rules;
pub mod state;
pub mod telemetry;

pub use config::{AgentConfig, BlockPages};
pub use daemon::{Agent, AgentParts};
pub use error::AgentError;
pub use host::{SessionHost, SessionId};
pub use policy::{Mode, PolicySnapshot};
pub use rules::{CompiledRuleSet, RuleCompiler, RuleEngine};
pub use state::{AgentState, StateHandle};
