//! Core data model: profiles, gateways, route/process registries, errors and
//! the flat UI state owned by the state machine.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;

/// States of the application finite state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    AppStarting,
    PreflightCheck,
    WaitingLogin,
    AuthInProgress,
    SyncInProgress,
    PreparingEnvironment,
    ReadyDisconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
    Exiting,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            State::AppStarting => "AppStarting",
            State::PreflightCheck => "PreflightCheck",
            State::WaitingLogin => "WaitingLogin",
            State::AuthInProgress => "AuthInProgress",
            State::SyncInProgress => "SyncInProgress",
            State::PreparingEnvironment => "PreparingEnvironment",
            State::ReadyDisconnected => "ReadyDisconnected",
            State::Connecting => "Connecting",
            State::Connected => "Connected",
            State::Disconnecting => "Disconnecting",
            State::Error => "Error",
            State::Exiting => "Exiting",
        };
        f.write_str(name)
    }
}

/// Classification of user-visible errors; drives both messaging and the
/// retry affordances of the Error state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NetworkUnavailable,
    AuthFailed,
    SyncFailed,
    RoutingFailed,
    ProcessFailed,
    ConfigFailed,
    Unknown,
}

/// An error presented to the user. The technical message is preserved
/// verbatim for the log; the user message is localized.
#[derive(Debug, Clone)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub user_message: String,
    pub technical_message: String,
    pub occurred_at: DateTime<Utc>,
}

/// A proxy profile delivered by the control server. `core_config` is an
/// opaque JSON byte string that is written to disk verbatim, never parsed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub country: String,
    pub host: String,
    pub port: u16,
    pub core_config: Vec<u8>,
    pub direct_routes: Vec<String>,
    pub tunnel_routes: Vec<String>,
    pub kill_switch: bool,
}

/// The IPv4 default gateway (or tunnel gateway) of a network adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayInfo {
    pub ip: String,
    pub interface_index: u32,
    /// Adapter alias; may be empty when the gateway is only used for route
    /// installation, but is required for DNS and kill-switch binding.
    pub interface_name: String,
    pub metric: u32,
}

impl GatewayInfo {
    /// Metric used for route installation; non-positive adapter metrics are
    /// coerced to 1.
    pub fn route_metric(&self) -> u32 {
        if self.metric == 0 {
            1
        } else {
            self.metric
        }
    }
}

/// Why a route exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteKind {
    Service,
    Direct,
    Tunnel,
}

impl std::fmt::Display for RouteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RouteKind::Service => "Service",
            RouteKind::Direct => "Direct",
            RouteKind::Tunnel => "Tunnel",
        };
        f.write_str(name)
    }
}

/// One route this client added to the OS routing table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRecord {
    pub id: String,
    pub destination: String,
    pub gateway: String,
    pub interface_index: u32,
    pub metric: u32,
    pub kind: RouteKind,
    pub created_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl RouteRecord {
    /// Stable record id: `{kind}-{destination}-{timestamp}`.
    pub fn make_id(kind: RouteKind, destination: &str) -> String {
        let nanos = Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_else(|| Utc::now().timestamp_millis());
        format!("{}-{}-{}", kind, destination, nanos)
    }
}

/// Registry of every route currently applied to the OS. Invariant: after a
/// clean disconnect or force-cleanup the registry is empty.
#[derive(Debug, Default)]
pub struct RoutesRegistry {
    routes: RwLock<HashMap<String, RouteRecord>>,
}

impl RoutesRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a record, stamping `created_at` if unset.
    pub fn upsert(&self, mut record: RouteRecord) {
        if record.created_at.is_none() {
            record.created_at = Some(Utc::now());
        }
        let mut routes = self.routes.write().expect("routes registry poisoned");
        routes.insert(record.id.clone(), record);
    }

    pub fn remove(&self, id: &str) {
        let mut routes = self.routes.write().expect("routes registry poisoned");
        routes.remove(id);
    }

    /// Returns a copy of the records matching any of `kinds`; an empty slice
    /// selects everything.
    pub fn list_by_kinds(&self, kinds: &[RouteKind]) -> Vec<RouteRecord> {
        let routes = self.routes.read().expect("routes registry poisoned");
        let mut selected: Vec<RouteRecord> = routes
            .values()
            .filter(|record| kinds.is_empty() || kinds.contains(&record.kind))
            .cloned()
            .collect();
        selected.sort_by(|a, b| a.id.cmp(&b.id));
        selected
    }

    pub fn len(&self) -> usize {
        self.routes.read().expect("routes registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Identity of a supervised child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessName {
    Core,
}

impl std::fmt::Display for ProcessName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessName::Core => f.write_str("Core"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Starting,
    Running,
    Exited,
    Failed,
}

impl ProcessStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessStatus::Exited | ProcessStatus::Failed)
    }
}

/// Lifecycle record of a supervised child process. At most one non-terminal
/// record exists per [`ProcessName`].
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub name: ProcessName,
    pub command: String,
    pub args: Vec<String>,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub exited_at: Option<DateTime<Utc>>,
    pub status: ProcessStatus,
    pub exit_code: Option<i32>,
    pub exit_reason: String,
}

/// Registry of supervised processes.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    processes: RwLock<HashMap<ProcessName, ProcessRecord>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, record: ProcessRecord) {
        let mut processes = self.processes.write().expect("process registry poisoned");
        processes.insert(record.name, record);
    }

    pub fn get(&self, name: ProcessName) -> Option<ProcessRecord> {
        let processes = self.processes.read().expect("process registry poisoned");
        processes.get(&name).cloned()
    }
}

/// Flat state consumed by the presentation layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UiState {
    pub is_login_visible: bool,
    pub is_main_visible: bool,
    pub is_connecting: bool,
    pub is_connected: bool,
    pub selected_profile_id: String,
    pub status_text: String,
    pub login_input: String,
    pub password_input: String,
    pub can_login: bool,
    pub allow_preflight_retry: bool,
}

/// Everything the state machine owns. Mutated only on the FSM thread; the
/// registries are shared handles so cleanup scenarios can read them off
/// thread.
pub struct AppContext {
    pub config: Arc<Config>,
    pub auth_token: Option<String>,
    pub profiles: Vec<Profile>,
    pub selected_profile_id: Option<String>,
    pub default_gateway: Option<GatewayInfo>,
    pub kill_switch_rules: Vec<String>,
    pub routes_registry: Arc<RoutesRegistry>,
    pub process_registry: Arc<ProcessRegistry>,
    pub last_error: Option<ErrorInfo>,
    pub ui: UiState,
    pub state: State,
}

impl AppContext {
    pub fn new(
        config: Arc<Config>,
        routes_registry: Arc<RoutesRegistry>,
        process_registry: Arc<ProcessRegistry>,
    ) -> Self {
        Self {
            config,
            auth_token: None,
            profiles: Vec::new(),
            selected_profile_id: None,
            default_gateway: None,
            kill_switch_rules: Vec::new(),
            routes_registry,
            process_registry,
            last_error: None,
            ui: UiState::default(),
            state: State::AppStarting,
        }
    }

    pub fn find_profile(&self, id: &str) -> Option<&Profile> {
        self.profiles.iter().find(|profile| profile.id == id)
    }
}

/// Keeps `[A-Za-z0-9]`, replaces every other byte with `_`; falls back to
/// the profile id, then to `core-config`.
pub fn sanitize_filename(name: &str, fallback: &str) -> String {
    let mut base = name.trim();
    if base.is_empty() {
        base = fallback.trim();
    }
    if base.is_empty() {
        return "core-config".to_string();
    }
    base.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
