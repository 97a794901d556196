pub mod client;
pub mod error;
pub mod fixture;
pub mod http;
pub mod identity;
pub mod traits;
pub mod types;

pub use client::BackendClient;
pub use error::BackendError;
pub use fixture::FixtureBackend;
pub use identity::{resolve_student, IdentityError, IdentityProvider, StaticIdentity, StudentIdentity};
pub use traits::PolicyBackend;
pub use types::{
    ActivePolicyDocument, AgentCommand, BypassDecision, BypassRequest, CategoryDocument,
    ClassInfo, HeartbeatPayload, HeartbeatResponse, OfftaskCheck, PendingAction, PolicyDocument,
    PollResponse, Stroke, TabSummary,
};
