//! Shared test harness: mock effectors, a scripted control server and a
//! recording UI sink wired into the real engine.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use customvpn::app::Application;
use customvpn::config::{Config, LogLevel};
use customvpn::control::{ControlApi, ControlError};
use customvpn::platform::firewall::dns_block_rule_names;
use customvpn::platform::routes::{check_remove_allowed, parse_ipv4_cidr, route_record};
use customvpn::platform::{
    Dns, DnsError, Effectors, Firewall, FirewallError, GatewayError, GatewayProbe, Routes,
    RoutingError,
};
use customvpn::process::{ExitCallback, ProcessError, ProcessLauncher};
use customvpn::state::{
    ErrorInfo, ErrorKind, GatewayInfo, ProcessName, ProcessRecord, ProcessStatus, Profile,
    RouteKind, RouteRecord,
};
use customvpn::ui::UiSink;

// --- Control server mock ----------------------------------------------------

pub struct MockControl {
    pub health_failures_remaining: AtomicUsize,
    pub health_calls: AtomicUsize,
    pub auth_calls: AtomicUsize,
    pub sync_list_calls: AtomicUsize,
    pub sync_profile_calls: AtomicUsize,
    /// `Some(status)` makes auth fail with that HTTP status.
    pub auth_status: Mutex<Option<u16>>,
    pub profiles: Mutex<Vec<Profile>>,
}

impl MockControl {
    pub fn new(profiles: Vec<Profile>) -> Arc<Self> {
        Arc::new(Self {
            health_failures_remaining: AtomicUsize::new(0),
            health_calls: AtomicUsize::new(0),
            auth_calls: AtomicUsize::new(0),
            sync_list_calls: AtomicUsize::new(0),
            sync_profile_calls: AtomicUsize::new(0),
            auth_status: Mutex::new(None),
            profiles: Mutex::new(profiles),
        })
    }
}

#[async_trait]
impl ControlApi for MockControl {
    async fn check_health(&self) -> Result<(), ControlError> {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.health_failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.health_failures_remaining
                .store(remaining - 1, Ordering::SeqCst);
            return Err(ControlError {
                op: "check_health",
                kind: ErrorKind::NetworkUnavailable,
                status: None,
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    async fn auth(&self, _login: &str, _password: &str) -> Result<String, ControlError> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = *self.auth_status.lock().unwrap() {
            let kind = if status == 401 || status == 403 {
                ErrorKind::AuthFailed
            } else {
                ErrorKind::Unknown
            };
            return Err(ControlError {
                op: "auth",
                kind,
                status: Some(status),
                message: "Auth Failed".to_string(),
            });
        }
        Ok("token-1".to_string())
    }

    async fn sync_profile_list(&self, _token: &str) -> Result<Vec<Profile>, ControlError> {
        self.sync_list_calls.fetch_add(1, Ordering::SeqCst);
        let profiles = self.profiles.lock().unwrap();
        Ok(profiles
            .iter()
            .map(|profile| Profile {
                id: profile.id.clone(),
                name: profile.name.clone(),
                country: profile.country.clone(),
                ..Profile::default()
            })
            .collect())
    }

    async fn sync_profile(&self, _token: &str, id: &str) -> Result<Profile, ControlError> {
        self.sync_profile_calls.fetch_add(1, Ordering::SeqCst);
        let profiles = self.profiles.lock().unwrap();
        profiles
            .iter()
            .find(|profile| profile.id == id)
            .cloned()
            .ok_or_else(|| ControlError {
                op: "sync_profile",
                kind: ErrorKind::SyncFailed,
                status: Some(404),
                message: format!("profile {} not found", id),
            })
    }
}

// --- Routes mock ------------------------------------------------------------

pub struct MockRoutes {
    pub applied: Mutex<Vec<RouteRecord>>,
    pub add_calls: AtomicUsize,
    pub remove_calls: AtomicUsize,
    pub removed_existing: AtomicUsize,
}

impl MockRoutes {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            applied: Mutex::new(Vec::new()),
            add_calls: AtomicUsize::new(0),
            remove_calls: AtomicUsize::new(0),
            removed_existing: AtomicUsize::new(0),
        })
    }

    pub fn applied_destinations(&self) -> Vec<String> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .map(|record| record.destination.clone())
            .collect()
    }
}

#[async_trait]
impl Routes for MockRoutes {
    async fn add_cidr_route(
        &self,
        cidr: &str,
        gateway: &GatewayInfo,
        kind: RouteKind,
    ) -> Result<RouteRecord, RoutingError> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        parse_ipv4_cidr(cidr)?;
        let record = route_record(cidr, gateway, kind);
        self.applied.lock().unwrap().push(record.clone());
        Ok(record)
    }

    async fn remove_route(&self, record: &RouteRecord) -> Result<(), RoutingError> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        check_remove_allowed(record)?;
        let mut applied = self.applied.lock().unwrap();
        let before = applied.len();
        applied.retain(|entry| entry.id != record.id);
        if applied.len() < before {
            self.removed_existing.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// --- Gateway probe mock -----------------------------------------------------

pub struct MockGatewayProbe {
    pub default_gateway: Mutex<Option<GatewayInfo>>,
    pub tunnel_interface: Mutex<GatewayInfo>,
    /// How many probe calls fail before the tunnel adapter appears.
    pub tunnel_ready_after: AtomicUsize,
    pub tunnel_calls: AtomicUsize,
}

impl MockGatewayProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            default_gateway: Mutex::new(Some(default_gateway())),
            tunnel_interface: Mutex::new(GatewayInfo {
                ip: "100.64.127.1".to_string(),
                interface_index: 77,
                interface_name: "CustomVPN Tunnel".to_string(),
                metric: 5,
            }),
            tunnel_ready_after: AtomicUsize::new(0),
            tunnel_calls: AtomicUsize::new(0),
        })
    }
}

pub fn default_gateway() -> GatewayInfo {
    GatewayInfo {
        ip: "192.168.1.1".to_string(),
        interface_index: 12,
        interface_name: "Ethernet".to_string(),
        metric: 25,
    }
}

#[async_trait]
impl GatewayProbe for MockGatewayProbe {
    async fn detect_default_gateway(&self) -> Result<GatewayInfo, GatewayError> {
        self.default_gateway
            .lock()
            .unwrap()
            .clone()
            .ok_or(GatewayError::NotFound)
    }

    async fn detect_gateway_for_ip(&self, ip: Ipv4Addr) -> Result<GatewayInfo, GatewayError> {
        let calls = self.tunnel_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if calls <= self.tunnel_ready_after.load(Ordering::SeqCst) {
            return Err(GatewayError::NoInterfaceForIp(ip));
        }
        Ok(self.tunnel_interface.lock().unwrap().clone())
    }
}

// --- Firewall mock ----------------------------------------------------------

pub struct MockFirewall {
    pub installed: Mutex<Vec<String>>,
    pub block_calls: AtomicUsize,
    pub remove_calls: AtomicUsize,
    pub group_removals: AtomicUsize,
    pub fail_block: AtomicBool,
}

impl MockFirewall {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            installed: Mutex::new(Vec::new()),
            block_calls: AtomicUsize::new(0),
            remove_calls: AtomicUsize::new(0),
            group_removals: AtomicUsize::new(0),
            fail_block: AtomicBool::new(false),
        })
    }

    pub fn installed_rules(&self) -> Vec<String> {
        self.installed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Firewall for MockFirewall {
    async fn block_dns_on_interface(
        &self,
        interface_alias: &str,
    ) -> Result<Vec<String>, FirewallError> {
        self.block_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_block.load(Ordering::SeqCst) {
            return Err(FirewallError::new("firewall unavailable"));
        }
        let (udp, tcp) = dns_block_rule_names(interface_alias);
        let mut installed = self.installed.lock().unwrap();
        installed.retain(|name| name != &udp && name != &tcp);
        installed.push(udp.clone());
        installed.push(tcp.clone());
        Ok(vec![udp, tcp])
    }

    async fn remove_rules(&self, names: &[String]) -> Result<(), FirewallError> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        let mut installed = self.installed.lock().unwrap();
        installed.retain(|name| !names.contains(name));
        Ok(())
    }

    async fn remove_kill_switch_group(&self) -> Result<(), FirewallError> {
        self.group_removals.fetch_add(1, Ordering::SeqCst);
        self.installed.lock().unwrap().clear();
        Ok(())
    }
}

// --- DNS mock ---------------------------------------------------------------

pub struct MockDns {
    pub sets: Mutex<Vec<(String, Vec<String>)>>,
    pub fail: AtomicBool,
}

impl MockDns {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sets: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Dns for MockDns {
    async fn set_interface_dns(
        &self,
        interface_alias: &str,
        servers: &[String],
    ) -> Result<(), DnsError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DnsError::Command("dns configuration refused".to_string()));
        }
        self.sets
            .lock()
            .unwrap()
            .push((interface_alias.to_string(), servers.to_vec()));
        Ok(())
    }
}

// --- Launcher mock ----------------------------------------------------------

pub struct MockLauncher {
    callback: Mutex<Option<ExitCallback>>,
    pub live: Mutex<HashMap<ProcessName, ProcessRecord>>,
    pub started: Mutex<Vec<(PathBuf, Vec<String>)>>,
    pub stop_calls: Mutex<Vec<ProcessName>>,
    pub run_once_calls: Mutex<Vec<Vec<String>>>,
    pub fail_start: AtomicBool,
    pub fail_run_once: AtomicBool,
}

impl MockLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            callback: Mutex::new(None),
            live: Mutex::new(HashMap::new()),
            started: Mutex::new(Vec::new()),
            stop_calls: Mutex::new(Vec::new()),
            run_once_calls: Mutex::new(Vec::new()),
            fail_start: AtomicBool::new(false),
            fail_run_once: AtomicBool::new(false),
        })
    }

    pub fn start_count(&self) -> usize {
        self.started.lock().unwrap().len()
    }

    pub fn stop_count(&self) -> usize {
        self.stop_calls.lock().unwrap().len()
    }

    /// Simulates the supervised process dying with `exit_code`.
    pub fn simulate_exit(&self, name: ProcessName, exit_code: i32, reason: &str) {
        self.live.lock().unwrap().remove(&name);
        let callback = self.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(name, exit_code, reason.to_string());
        }
    }
}

#[async_trait]
impl ProcessLauncher for MockLauncher {
    fn set_exit_callback(&self, callback: ExitCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    async fn start(
        &self,
        name: ProcessName,
        binary: &std::path::Path,
        args: &[String],
        _log_file: &std::path::Path,
    ) -> Result<ProcessRecord, ProcessError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(ProcessError::RunFailed {
                binary: binary.display().to_string(),
                message: "spawn refused".to_string(),
            });
        }
        let record = ProcessRecord {
            name,
            command: binary.display().to_string(),
            args: args.to_vec(),
            pid: 4242,
            started_at: chrono::Utc::now(),
            exited_at: None,
            status: ProcessStatus::Running,
            exit_code: None,
            exit_reason: String::new(),
        };
        self.live.lock().unwrap().insert(name, record.clone());
        self.started
            .lock()
            .unwrap()
            .push((binary.to_path_buf(), args.to_vec()));
        Ok(record)
    }

    async fn stop(&self, name: ProcessName, _timeout: Duration) {
        self.stop_calls.lock().unwrap().push(name);
        let was_live = self.live.lock().unwrap().remove(&name).is_some();
        if was_live {
            let callback = self.callback.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback(name, 0, "process exited normally".to_string());
            }
        }
    }

    async fn run_once(
        &self,
        _binary: &std::path::Path,
        args: &[String],
    ) -> Result<(), ProcessError> {
        self.run_once_calls.lock().unwrap().push(args.to_vec());
        if self.fail_run_once.load(Ordering::SeqCst) {
            return Err(ProcessError::RunFailed {
                binary: "core".to_string(),
                message: "config check failed".to_string(),
            });
        }
        Ok(())
    }
}

// --- Recording UI sink ------------------------------------------------------

#[derive(Default)]
pub struct RecordingSink {
    pub modal_errors: Mutex<Vec<ErrorInfo>>,
    pub notices: Mutex<Vec<String>>,
    pub cleanup_done: Mutex<Vec<bool>>,
    pub cleanup_started: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn last_modal_error(&self) -> Option<ErrorInfo> {
        self.modal_errors.lock().unwrap().last().cloned()
    }
}

impl UiSink for RecordingSink {
    fn show_login_window(&self) {}
    fn show_main_window(&self) {}
    fn hide_main_window(&self) {}

    fn show_modal_error(&self, info: &ErrorInfo) {
        self.modal_errors.lock().unwrap().push(info.clone());
    }

    fn show_transient_notice(&self, message: &str) {
        self.notices.lock().unwrap().push(message.to_string());
    }

    fn show_cleanup_started(&self) {
        self.cleanup_started.fetch_add(1, Ordering::SeqCst);
    }

    fn show_cleanup_done(&self, has_errors: bool) {
        self.cleanup_done.lock().unwrap().push(has_errors);
    }
}

// --- Harness ----------------------------------------------------------------

pub struct Harness {
    pub runtime: tokio::runtime::Runtime,
    pub app: Application,
    pub control: Arc<MockControl>,
    pub routes: Arc<MockRoutes>,
    pub gateway: Arc<MockGatewayProbe>,
    pub firewall: Arc<MockFirewall>,
    pub dns: Arc<MockDns>,
    pub launcher: Arc<MockLauncher>,
    pub sink: Arc<RecordingSink>,
    pub app_dir: PathBuf,
}

static HARNESS_COUNTER: AtomicUsize = AtomicUsize::new(0);

pub fn test_config(tag: &str) -> (Arc<Config>, PathBuf) {
    let unique = HARNESS_COUNTER.fetch_add(1, Ordering::SeqCst);
    let app_dir = std::env::temp_dir().join(format!(
        "customvpn-test-{}-{}-{}",
        tag,
        std::process::id(),
        unique
    ));
    std::fs::create_dir_all(&app_dir).unwrap();
    let config = Arc::new(Config {
        control_server_url: "http://127.0.0.1:9".to_string(),
        core_path: app_dir.join("core"),
        log_level: LogLevel::Info,
        log_file: app_dir.join("logs").join("app.log"),
        app_dir: app_dir.clone(),
        core_log_file: app_dir.join("logs").join("core.log"),
    });
    (config, app_dir)
}

impl Harness {
    pub fn new(tag: &str, profiles: Vec<Profile>) -> Self {
        let (config, app_dir) = test_config(tag);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();

        let control = MockControl::new(profiles);
        let routes = MockRoutes::new();
        let gateway = MockGatewayProbe::new();
        let firewall = MockFirewall::new();
        let dns = MockDns::new();
        let launcher = MockLauncher::new();
        let sink = RecordingSink::new();

        let effectors = Effectors {
            routes: routes.clone(),
            gateway: gateway.clone(),
            firewall: firewall.clone(),
            dns: dns.clone(),
        };
        let app = Application::with_parts(
            config,
            runtime.handle().clone(),
            sink.clone(),
            control.clone(),
            effectors,
            launcher.clone(),
        )
        .unwrap();

        Self {
            runtime,
            app,
            control,
            routes,
            gateway,
            firewall,
            dns,
            launcher,
            sink,
            app_dir,
        }
    }

    pub fn start(&self) {
        self.app.run().unwrap();
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> customvpn::ui::UiSnapshot {
        self.app.subscribe_ui().borrow().clone()
    }

    pub fn shutdown(self) {
        self.app.stop();
        std::fs::remove_dir_all(&self.app_dir).ok();
    }
}

pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    predicate()
}

// --- Profile fixtures -------------------------------------------------------

pub fn profile_p1() -> Profile {
    Profile {
        id: "p1".to_string(),
        name: "FR #1".to_string(),
        country: "FR".to_string(),
        host: "1.2.3.4".to_string(),
        port: 443,
        core_config: br#"{"outbounds":[{"type":"proxy"}]}"#.to_vec(),
        direct_routes: vec!["10.0.0.0/8".to_string()],
        tunnel_routes: vec!["0.0.0.0/0".to_string()],
        kill_switch: false,
    }
}

/// Drives the engine from launch to the main window (ReadyDisconnected).
pub fn login_to_ready(harness: &Harness) {
    use customvpn::state::{CredentialsPayload, Event};

    harness.start();
    assert!(
        wait_until(Duration::from_secs(5), || harness.snapshot().is_login_visible),
        "login window never became visible"
    );
    harness
        .app
        .sender()
        .dispatch(Event::UiClickLogin(CredentialsPayload {
            login: "user".to_string(),
            password: "secret".to_string(),
        }))
        .unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || harness.snapshot().is_main_visible),
        "main window never became visible"
    );
}

/// Selects `profile_id` and connects; waits until Connected.
pub fn connect(harness: &Harness, profile_id: &str) {
    use customvpn::state::{Event, SelectionPayload};

    harness
        .app
        .sender()
        .dispatch(Event::UiSelectProfile(SelectionPayload {
            id: profile_id.to_string(),
        }))
        .unwrap();
    harness.app.sender().dispatch(Event::UiClickConnect).unwrap();
    assert!(
        wait_until(Duration::from_secs(10), || harness.snapshot().is_connected),
        "connection never reached Connected"
    );
}
