//! CustomVPN client library
//!
//! Connection-lifecycle engine for the CustomVPN desktop client: the
//! event-driven state machine that sequences preflight, auth, profile sync,
//! environment preparation, connect and disconnect, plus the transactional
//! side-effect orchestrator that applies route/DNS/firewall/process changes
//! with per-step rollback.
//!
//! The presentation layer is external: it consumes [`ui::UiSnapshot`] values
//! from the publisher and feeds typed [`state::Event`]s back into the engine.

pub mod app;
pub mod config;
pub mod control;
pub mod logging;
pub mod platform;
pub mod process;
pub mod state;
pub mod ui;

pub use app::Application;
pub use config::Config;
