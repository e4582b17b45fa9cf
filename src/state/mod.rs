//! Application state: data model, registries, events and the state machine.

pub mod events;
pub mod machine;
mod models;

pub use events::{
    event_bus, AuthSuccessPayload, CleanupResultPayload, ConnectSuccessPayload,
    CredentialsPayload, Event, EventBus, EventSender, MachineStopped, PrepareEnvSuccessPayload,
    ProcessExitPayload, ScenarioResultPayload, SelectionPayload, SyncSuccessPayload,
    TimeoutPayload,
};
pub use machine::Machine;
pub use models::*;
