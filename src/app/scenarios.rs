//! Scenario orchestrator
//!
//! Each scenario (preflight, auth, sync, prepare, connect, disconnect,
//! force-cleanup) runs on a worker task, never touches the FSM-owned
//! context, and reports exactly one terminal event. The connect scenario
//! keeps an artifact journal of every applied side effect and reverses it in
//! LIFO order on any failure, so a partial connect leaves nothing behind.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::app::cleanup_state::{self, CleanupState};
use crate::config::Config;
use crate::control::{ControlApi, ControlError};
use crate::platform::Effectors;
use crate::process::{ProcessLauncher, DEFAULT_STOP_TIMEOUT};
use crate::state::{
    sanitize_filename, AuthSuccessPayload, CleanupResultPayload, ConnectSuccessPayload, ErrorKind,
    Event, EventSender, GatewayInfo, PrepareEnvSuccessPayload, ProcessName, ProcessRecord,
    ProcessRegistry, ProcessStatus, Profile, RouteKind, RouteRecord, RoutesRegistry,
    ScenarioResultPayload, SyncSuccessPayload,
};

const PREFLIGHT_ATTEMPTS: u32 = 3;
const PREFLIGHT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
const PREFLIGHT_ATTEMPT_DELAY: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const GATEWAY_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const TUNNEL_DETECT_TIMEOUT: Duration = Duration::from_secs(10);
const TUNNEL_DETECT_DELAY: Duration = Duration::from_millis(500);

/// Address probed to discover the tunnel adapter the core creates.
const TUNNEL_PROBE_IP: Ipv4Addr = Ipv4Addr::new(100, 64, 127, 1);
/// DNS server configured on the tunnel interface.
const TUNNEL_DNS_SERVER: &str = "100.64.127.2";

/// Failure of a scenario, carrying both the localized user message and the
/// verbatim technical message for the log.
#[derive(Debug, Clone)]
pub struct ScenarioError {
    pub kind: ErrorKind,
    pub user_message: String,
    pub technical_message: String,
    pub canceled: bool,
}

impl ScenarioError {
    pub fn new(
        kind: ErrorKind,
        user_message: impl Into<String>,
        technical_message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            user_message: user_message.into(),
            technical_message: technical_message.into(),
            canceled: false,
        }
    }

    /// Benign cancellation during shutdown.
    pub fn canceled() -> Self {
        Self {
            kind: ErrorKind::Unknown,
            user_message: String::new(),
            technical_message: "canceled".to_string(),
            canceled: true,
        }
    }

    pub fn payload(&self) -> ScenarioResultPayload {
        ScenarioResultPayload {
            kind: self.kind,
            user_message: self.user_message.clone(),
            technical_message: self.technical_message.clone(),
        }
    }
}

/// How a deadline-guarded operation ended.
enum Attempt<T, E> {
    Ok(T),
    Err(E),
    TimedOut,
    Canceled,
}

/// Executes the scenario procedures. Holds only immutable configuration,
/// typed effector handles and the event sender; the FSM-owned context is
/// never visible from here.
pub struct Scenarios {
    config: Arc<Config>,
    control: Arc<dyn ControlApi>,
    effectors: Effectors,
    launcher: Arc<dyn ProcessLauncher>,
    routes_registry: Arc<RoutesRegistry>,
    process_registry: Arc<ProcessRegistry>,
    events: EventSender,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    runtime: Handle,
}

impl Scenarios {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        control: Arc<dyn ControlApi>,
        effectors: Effectors,
        launcher: Arc<dyn ProcessLauncher>,
        routes_registry: Arc<RoutesRegistry>,
        process_registry: Arc<ProcessRegistry>,
        events: EventSender,
        shutdown: CancellationToken,
        runtime: Handle,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            control,
            effectors,
            launcher,
            routes_registry,
            process_registry,
            events,
            shutdown,
            tracker: TaskTracker::new(),
            runtime,
        })
    }

    /// Waits for in-flight scenario tasks to finish.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        self.tracker.close();
        tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok()
    }

    fn emit(&self, event: Event) {
        if let Err(error) = self.events.dispatch(event) {
            log::debug!("scenario event dropped: {}", error);
        }
    }

    fn spawn<F>(self: &Arc<Self>, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn_on(future, &self.runtime);
    }

    fn is_stopping(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Runs `future` under `timeout`, aborting early on shutdown.
    async fn attempt<T, E, F>(&self, timeout: Duration, future: F) -> Attempt<T, E>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        tokio::select! {
            _ = self.shutdown.cancelled() => Attempt::Canceled,
            outcome = tokio::time::timeout(timeout, future) => match outcome {
                Ok(Ok(value)) => Attempt::Ok(value),
                Ok(Err(error)) => Attempt::Err(error),
                Err(_) => Attempt::TimedOut,
            },
        }
    }

    /// Shutdown-aware sleep; returns false when interrupted.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    // --- Preflight ---------------------------------------------------------

    /// Up to three health-check attempts with a short delay in between; the
    /// FSM arms the 5 s retry timer on failure.
    pub fn start_preflight(self: &Arc<Self>) {
        let this = self.clone();
        self.spawn(async move {
            let mut last: Option<Attempt<(), ControlError>> = None;
            for attempt in 1..=PREFLIGHT_ATTEMPTS {
                if this.is_stopping() {
                    return;
                }
                match this
                    .attempt(PREFLIGHT_ATTEMPT_TIMEOUT, this.control.check_health())
                    .await
                {
                    Attempt::Ok(()) => {
                        log::info!("preflight succeeded on attempt {}", attempt);
                        this.emit(Event::PreflightSucceeded);
                        return;
                    }
                    Attempt::Canceled => return,
                    outcome => {
                        if let Attempt::Err(error) = &outcome {
                            log::error!(
                                "preflight attempt {}/{} failed: {}",
                                attempt,
                                PREFLIGHT_ATTEMPTS,
                                error
                            );
                        } else {
                            log::error!(
                                "preflight attempt {}/{} timed out",
                                attempt,
                                PREFLIGHT_ATTEMPTS
                            );
                        }
                        last = Some(outcome);
                    }
                }
                if attempt < PREFLIGHT_ATTEMPTS && !this.sleep(PREFLIGHT_ATTEMPT_DELAY).await {
                    return;
                }
            }
            let payload = build_preflight_failure(last);
            this.emit(Event::PreflightFailed(payload));
        });
    }

    // --- Auth --------------------------------------------------------------

    pub fn start_auth(self: &Arc<Self>, login: String, password: String) {
        let this = self.clone();
        self.spawn(async move {
            if this.is_stopping() {
                return;
            }
            match this
                .attempt(REQUEST_TIMEOUT, this.control.auth(&login, &password))
                .await
            {
                Attempt::Ok(token) => {
                    log::info!("auth succeeded, token length {}", token.len());
                    this.emit(Event::AuthSucceeded(AuthSuccessPayload { token }));
                }
                Attempt::Canceled => {}
                Attempt::TimedOut => {
                    log::error!("auth request timed out");
                    this.emit(Event::AuthFailed(ScenarioResultPayload {
                        kind: ErrorKind::NetworkUnavailable,
                        user_message: "Истекло время ожидания ответа сервера авторизации"
                            .to_string(),
                        technical_message: "auth deadline exceeded".to_string(),
                    }));
                }
                Attempt::Err(error) => {
                    log::error!("auth request failed: {}", error);
                    this.emit(Event::AuthFailed(build_auth_failure(&error)));
                }
            }
        });
    }

    // --- Sync --------------------------------------------------------------

    /// Fetches the profile list, then the full profile for the selected (or
    /// first) id. Any transport or validation failure aborts the whole sync.
    pub fn start_sync(self: &Arc<Self>, token: String, selected: Option<String>) {
        let this = self.clone();
        self.spawn(async move {
            if this.is_stopping() {
                return;
            }
            let token = token.trim().to_string();
            if token.is_empty() {
                log::error!("sync requested without auth token");
                this.emit(Event::SyncFailed(ScenarioResultPayload {
                    kind: ErrorKind::SyncFailed,
                    user_message: "Не удалось загрузить данные".to_string(),
                    technical_message: "auth token is empty".to_string(),
                }));
                return;
            }

            let mut profiles = match this
                .attempt(REQUEST_TIMEOUT, this.control.sync_profile_list(&token))
                .await
            {
                Attempt::Ok(profiles) => profiles,
                Attempt::Canceled => return,
                outcome => {
                    let payload =
                        build_sync_failure(outcome, "Не удалось загрузить список профилей");
                    log::error!("sync profile list failed: {}", payload.technical_message);
                    this.emit(Event::SyncFailed(payload));
                    return;
                }
            };

            let wanted = selected
                .filter(|id| profiles.iter().any(|profile| &profile.id == id))
                .or_else(|| profiles.first().map(|profile| profile.id.clone()));
            if let Some(id) = wanted {
                let full = match this
                    .attempt(REQUEST_TIMEOUT, this.control.sync_profile(&token, &id))
                    .await
                {
                    Attempt::Ok(profile) => profile,
                    Attempt::Canceled => return,
                    outcome => {
                        let payload = build_sync_failure(outcome, "Не удалось загрузить профиль");
                        log::error!("sync profile {} failed: {}", id, payload.technical_message);
                        this.emit(Event::SyncFailed(payload));
                        return;
                    }
                };
                if let Some(slot) = profiles.iter_mut().find(|profile| profile.id == id) {
                    *slot = full;
                } else {
                    profiles.push(full);
                }
            }

            log::info!("sync completed: {} profiles", profiles.len());
            this.emit(Event::SyncSucceeded(SyncSuccessPayload { profiles }));
        });
    }

    // --- PrepareEnvironment -------------------------------------------------

    /// Best-effort probe of the default gateway; stores the result when it
    /// works and proceeds either way (connect re-probes authoritatively).
    pub fn start_prepare_env(self: &Arc<Self>) {
        let this = self.clone();
        self.spawn(async move {
            if this.is_stopping() {
                return;
            }
            let gateway = match this
                .attempt(
                    GATEWAY_PROBE_TIMEOUT,
                    this.effectors.gateway.detect_default_gateway(),
                )
                .await
            {
                Attempt::Ok(gateway) => {
                    log::info!(
                        "default gateway: {} (if {}, metric {})",
                        gateway.ip,
                        gateway.interface_index,
                        gateway.metric
                    );
                    Some(gateway)
                }
                Attempt::Canceled => return,
                Attempt::TimedOut => {
                    log::warn!("default gateway probe timed out");
                    None
                }
                Attempt::Err(error) => {
                    log::warn!("default gateway probe failed: {}", error);
                    None
                }
            };
            this.emit(Event::PrepareEnvSucceeded(PrepareEnvSuccessPayload {
                gateway,
            }));
        });
    }

    // --- Connect ------------------------------------------------------------

    /// The critical section: direct routes, kill switch, core config, core
    /// launch, tunnel discovery, tunnel DNS, tunnel routes, in that order,
    /// with full rollback on any failure.
    pub fn start_connect(self: &Arc<Self>, profile: Profile) {
        let this = self.clone();
        self.spawn(async move {
            if this.is_stopping() {
                return;
            }
            let mut artifacts = ConnectArtifacts::default();
            match this.execute_connect(&profile, &mut artifacts).await {
                Ok(payload) => {
                    this.save_cleanup_state(&payload.kill_switch_rules);
                    log::info!("connecting scenario completed");
                    this.emit(Event::ConnectingSucceeded(payload));
                }
                Err(error) => {
                    this.rollback(&artifacts).await;
                    if error.canceled {
                        log::info!("connecting scenario canceled");
                        return;
                    }
                    log::error!("connecting scenario failed: {}", error.technical_message);
                    let mut payload = error.payload();
                    if payload.user_message.is_empty() {
                        payload.user_message = "Не удалось подключиться".to_string();
                    }
                    this.emit(Event::ConnectingFailed(payload));
                }
            }
        });
    }

    async fn execute_connect(
        &self,
        profile: &Profile,
        artifacts: &mut ConnectArtifacts,
    ) -> Result<ConnectSuccessPayload, ScenarioError> {
        // 1. Re-probe the default gateway.
        let gateway = match self
            .attempt(
                GATEWAY_PROBE_TIMEOUT,
                self.effectors.gateway.detect_default_gateway(),
            )
            .await
        {
            Attempt::Ok(gateway) => gateway,
            Attempt::Canceled => return Err(ScenarioError::canceled()),
            Attempt::TimedOut => {
                return Err(ScenarioError::new(
                    ErrorKind::RoutingFailed,
                    "Не удалось определить шлюз по умолчанию",
                    "default gateway probe timed out",
                ))
            }
            Attempt::Err(error) => {
                return Err(ScenarioError::new(
                    ErrorKind::RoutingFailed,
                    gateway_user_message(&error.to_string()),
                    error.to_string(),
                ))
            }
        };

        // 2. Validate the profile endpoint.
        if profile.host.trim().is_empty() {
            return Err(ScenarioError::new(
                ErrorKind::ConfigFailed,
                "Профиль не содержит адрес",
                format!("profile {} host is empty", profile.id),
            ));
        }
        if profile.port == 0 {
            return Err(ScenarioError::new(
                ErrorKind::ConfigFailed,
                "Профиль не содержит корректный порт",
                format!("profile {} port is invalid", profile.id),
            ));
        }

        // 3. Direct routes through the physical gateway.
        self.add_profile_routes(
            &profile.direct_routes,
            RouteKind::Direct,
            &gateway,
            artifacts,
        )
        .await?;

        // 4. Kill switch on the physical interface.
        if profile.kill_switch {
            if gateway.interface_name.trim().is_empty() {
                return Err(ScenarioError::new(
                    ErrorKind::RoutingFailed,
                    "Kill Switch не может определить основной интерфейс",
                    "default gateway interface name is empty",
                ));
            }
            match self
                .effectors
                .firewall
                .block_dns_on_interface(&gateway.interface_name)
                .await
            {
                Ok(rules) => {
                    log::info!(
                        "kill switch enabled: interface={} rules={:?}",
                        gateway.interface_name,
                        rules
                    );
                    artifacts.kill_switch_rules = rules;
                }
                Err(error) => {
                    return Err(ScenarioError::new(
                        ErrorKind::RoutingFailed,
                        "Не удалось применить Kill Switch",
                        error.to_string(),
                    ))
                }
            }
        }

        // 5. Materialize the core config verbatim.
        let config_path = self.write_core_config(profile)?;

        // 6. Core check mode gates the launch.
        let check_args = vec![
            "check".to_string(),
            "-c".to_string(),
            config_path.display().to_string(),
        ];
        if let Err(error) = self
            .launcher
            .run_once(&self.config.core_path, &check_args)
            .await
        {
            return Err(ScenarioError::new(
                ErrorKind::ConfigFailed,
                "Проверка конфигурации Core не прошла",
                error.to_string(),
            ));
        }

        // 7. Launch the supervised core process.
        let run_args = vec![
            "run".to_string(),
            "-c".to_string(),
            config_path.display().to_string(),
        ];
        self.launch_core(&run_args).await?;
        artifacts.core_started = true;

        // 8. Wait for the tunnel adapter the core creates.
        let tunnel_gateway = self.wait_for_tunnel_gateway().await?;

        // 9. Tunnel DNS.
        if tunnel_gateway.interface_name.trim().is_empty() {
            return Err(ScenarioError::new(
                ErrorKind::RoutingFailed,
                "Не удалось определить интерфейс туннеля",
                "tunnel interface name is empty",
            ));
        }
        if let Err(error) = self
            .effectors
            .dns
            .set_interface_dns(
                &tunnel_gateway.interface_name,
                &[TUNNEL_DNS_SERVER.to_string()],
            )
            .await
        {
            return Err(ScenarioError::new(
                ErrorKind::RoutingFailed,
                "Не удалось настроить DNS туннеля",
                error.to_string(),
            ));
        }
        log::info!(
            "tunnel DNS set: interface={} servers=[{}]",
            tunnel_gateway.interface_name,
            TUNNEL_DNS_SERVER
        );

        // 10. Tunnel routes through the tunnel gateway.
        self.add_profile_routes(
            &profile.tunnel_routes,
            RouteKind::Tunnel,
            &tunnel_gateway,
            artifacts,
        )
        .await?;

        Ok(ConnectSuccessPayload {
            gateway,
            kill_switch_rules: artifacts.kill_switch_rules.clone(),
        })
    }

    async fn add_profile_routes(
        &self,
        cidrs: &[String],
        kind: RouteKind,
        gateway: &GatewayInfo,
        artifacts: &mut ConnectArtifacts,
    ) -> Result<(), ScenarioError> {
        if gateway.ip.trim().is_empty() {
            return Err(ScenarioError::new(
                ErrorKind::RoutingFailed,
                "Маршрутный шлюз не задан",
                "route gateway is empty",
            ));
        }
        for cidr in cidrs {
            let cidr = cidr.trim();
            if cidr.is_empty() {
                continue;
            }
            if self.is_stopping() {
                return Err(ScenarioError::canceled());
            }
            match self
                .effectors
                .routes
                .add_cidr_route(cidr, gateway, kind)
                .await
            {
                Ok(record) => {
                    self.routes_registry.upsert(record.clone());
                    artifacts.routes.push(record);
                }
                Err(error) => {
                    return Err(ScenarioError::new(
                        ErrorKind::RoutingFailed,
                        routing_user_message(
                            &format!("Не удалось добавить маршрут {}", cidr),
                            &error.to_string(),
                        ),
                        error.to_string(),
                    ))
                }
            }
        }
        Ok(())
    }

    fn write_core_config(&self, profile: &Profile) -> Result<PathBuf, ScenarioError> {
        let failed = |technical: String| {
            ScenarioError::new(
                ErrorKind::ConfigFailed,
                "Не удалось записать конфигурацию Core",
                technical,
            )
        };
        if profile.core_config.is_empty() {
            return Err(failed(format!(
                "core config for profile {} is empty",
                profile.id
            )));
        }
        let dir = self.config.core_config_dir();
        std::fs::create_dir_all(&dir)
            .map_err(|error| failed(format!("create core_config dir: {}", error)))?;
        let file_name = format!("{}.json", sanitize_filename(&profile.name, &profile.id));
        let path = dir.join(file_name);
        std::fs::write(&path, &profile.core_config)
            .map_err(|error| failed(format!("write core config: {}", error)))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
        }
        Ok(path)
    }

    async fn launch_core(&self, args: &[String]) -> Result<(), ScenarioError> {
        let starting = ProcessRecord {
            name: ProcessName::Core,
            command: self.config.core_path.display().to_string(),
            args: args.to_vec(),
            pid: 0,
            started_at: chrono::Utc::now(),
            exited_at: None,
            status: ProcessStatus::Starting,
            exit_code: None,
            exit_reason: String::new(),
        };
        self.process_registry.update(starting.clone());

        match self
            .launcher
            .start(
                ProcessName::Core,
                &self.config.core_path,
                args,
                &self.config.core_log_file,
            )
            .await
        {
            Ok(record) => {
                self.process_registry.update(record);
                Ok(())
            }
            Err(error) => {
                let mut failed = starting;
                failed.status = ProcessStatus::Failed;
                failed.exited_at = Some(chrono::Utc::now());
                failed.exit_code = Some(-1);
                failed.exit_reason = error.to_string();
                self.process_registry.update(failed);
                Err(ScenarioError::new(
                    ErrorKind::ProcessFailed,
                    "Не удалось запустить Core",
                    error.to_string(),
                ))
            }
        }
    }

    /// Polls for the tunnel adapter every 500 ms, up to 10 s total, honoring
    /// shutdown on each iteration.
    async fn wait_for_tunnel_gateway(&self) -> Result<GatewayInfo, ScenarioError> {
        let deadline = tokio::time::Instant::now() + TUNNEL_DETECT_TIMEOUT;
        let mut last_error = String::new();
        let mut attempt = 0u32;
        loop {
            if self.is_stopping() {
                return Err(ScenarioError::canceled());
            }
            attempt += 1;
            match self
                .effectors
                .gateway
                .detect_gateway_for_ip(TUNNEL_PROBE_IP)
                .await
            {
                Ok(gateway) => {
                    if attempt > 1 {
                        log::info!("tunnel interface detected after {} attempts", attempt);
                    }
                    return Ok(gateway);
                }
                Err(error) => last_error = error.to_string(),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ScenarioError::new(
                    ErrorKind::RoutingFailed,
                    "Не удалось определить интерфейс туннеля",
                    last_error,
                ));
            }
            if !self.sleep(TUNNEL_DETECT_DELAY).await {
                return Err(ScenarioError::canceled());
            }
        }
    }

    /// Reverses a partially applied connect in LIFO order: core first, then
    /// kill-switch rules, then routes newest-first.
    async fn rollback(&self, artifacts: &ConnectArtifacts) {
        if artifacts.core_started {
            self.launcher
                .stop(ProcessName::Core, DEFAULT_STOP_TIMEOUT)
                .await;
        }
        if !artifacts.kill_switch_rules.is_empty() {
            if let Err(error) = self
                .effectors
                .firewall
                .remove_rules(&artifacts.kill_switch_rules)
                .await
            {
                log::error!("rollback kill switch failed: {}", error);
            }
        }
        for record in artifacts.routes.iter().rev() {
            match self.effectors.routes.remove_route(record).await {
                Ok(()) => self.routes_registry.remove(&record.id),
                Err(error) => {
                    log::error!(
                        "rollback remove route {} failed: {}",
                        record.destination,
                        error
                    );
                }
            }
        }
    }

    // --- Disconnect ---------------------------------------------------------

    /// Stops the core, removes the session's kill-switch rules and every
    /// Direct/Tunnel route. Always completes and reports done; failures are
    /// aggregated into the log.
    pub fn start_disconnect(self: &Arc<Self>, kill_switch_rules: Vec<String>) {
        let this = self.clone();
        self.spawn(async move {
            let errors = this.teardown(&kill_switch_rules, false).await;
            if errors.is_empty() {
                log::info!("disconnecting scenario completed");
            } else {
                log::error!(
                    "disconnecting scenario completed with errors: {}",
                    errors.join("; ")
                );
            }
            this.emit(Event::DisconnectingDone);
        });
    }

    // --- ForceCleanup -------------------------------------------------------

    /// Idempotent repair sweep: stop core, drop the whole kill-switch group,
    /// remove every registered route of any kind.
    pub fn start_force_cleanup(self: &Arc<Self>) {
        let this = self.clone();
        self.spawn(async move {
            let errors = this.teardown(&[], true).await;
            this.emit(Event::CleanupDone(CleanupResultPayload { errors }));
        });
    }

    /// Shared teardown used by disconnect, force-cleanup and exit cleanup.
    /// `sweep_group` removes the whole kill-switch group and all route kinds
    /// instead of only this session's rules and Direct/Tunnel routes.
    async fn teardown(&self, kill_switch_rules: &[String], sweep_group: bool) -> Vec<String> {
        let mut errors = Vec::new();

        self.launcher
            .stop(ProcessName::Core, DEFAULT_STOP_TIMEOUT)
            .await;

        if sweep_group {
            if let Err(error) = self.effectors.firewall.remove_kill_switch_group().await {
                log::error!("kill switch group cleanup failed: {}", error);
                errors.push(error.to_string());
            }
        } else if !kill_switch_rules.is_empty() {
            if let Err(error) = self.effectors.firewall.remove_rules(kill_switch_rules).await {
                log::error!("kill switch cleanup failed: {}", error);
                errors.push(error.to_string());
            } else {
                log::info!("kill switch disabled: rules={:?}", kill_switch_rules);
            }
        }

        let kinds: &[RouteKind] = if sweep_group {
            &[]
        } else {
            &[RouteKind::Direct, RouteKind::Tunnel]
        };
        for record in self.routes_registry.list_by_kinds(kinds) {
            match self.effectors.routes.remove_route(&record).await {
                Ok(()) => self.routes_registry.remove(&record.id),
                Err(error) => {
                    log::error!("remove route {} failed: {}", record.destination, error);
                    errors.push(error.to_string());
                }
            }
        }

        self.sync_cleanup_state();
        errors
    }

    /// Full teardown at shutdown; used by both the exit event path and the
    /// signal path, guarded by the caller to run once.
    pub async fn exit_cleanup(&self) {
        let errors = self.teardown(&[], true).await;
        if !errors.is_empty() {
            log::error!("exit cleanup finished with errors: {}", errors.join("; "));
        }
    }

    // --- Crash-cleanup cache ------------------------------------------------

    fn save_cleanup_state(&self, kill_switch_rules: &[String]) {
        let state = CleanupState {
            routes: self.routes_registry.list_by_kinds(&[]),
            kill_switch_rules: kill_switch_rules.to_vec(),
        };
        let path = self.config.cleanup_state_path();
        if let Err(error) = cleanup_state::save(&path, &state) {
            log::warn!("save cleanup state failed: {}", error);
        }
    }

    /// Rewrites or deletes the cache to mirror the registry.
    fn sync_cleanup_state(&self) {
        let path = self.config.cleanup_state_path();
        let routes = self.routes_registry.list_by_kinds(&[]);
        if routes.is_empty() {
            cleanup_state::delete(&path);
            return;
        }
        let state = CleanupState {
            routes,
            kill_switch_rules: Vec::new(),
        };
        if let Err(error) = cleanup_state::save(&path, &state) {
            log::warn!("save cleanup state failed: {}", error);
        }
    }

    /// Opportunistic sweep of leftovers recorded by a previous session that
    /// crashed before cleaning up.
    pub async fn recover_previous_session(&self) {
        let path = self.config.cleanup_state_path();
        let Some(state) = cleanup_state::load(&path) else {
            return;
        };
        if state.is_empty() {
            cleanup_state::delete(&path);
            return;
        }
        log::info!(
            "found cleanup state from a previous session: {} routes, {} rules",
            state.routes.len(),
            state.kill_switch_rules.len()
        );
        if let Err(error) = self.effectors.firewall.remove_kill_switch_group().await {
            log::warn!("stale kill switch cleanup failed: {}", error);
        }
        for record in state.routes.iter().rev() {
            if let Err(error) = self.effectors.routes.remove_route(record).await {
                log::warn!(
                    "stale route {} cleanup failed: {}",
                    record.destination,
                    error
                );
            }
        }
        cleanup_state::delete(&path);
    }
}

/// Journal of side effects applied by a connect in add-order.
#[derive(Default)]
struct ConnectArtifacts {
    routes: Vec<RouteRecord>,
    core_started: bool,
    kill_switch_rules: Vec<String>,
}

// --- Failure payload builders ----------------------------------------------

fn build_preflight_failure(last: Option<Attempt<(), ControlError>>) -> ScenarioResultPayload {
    let mut payload = ScenarioResultPayload {
        kind: ErrorKind::NetworkUnavailable,
        user_message: "Нет связи с управляющим сервером. Повторим через 5 секунд".to_string(),
        technical_message: String::new(),
    };
    match last {
        Some(Attempt::TimedOut) => {
            payload.user_message = "Истекло время ожидания ответа управляющего сервера".to_string();
            payload.technical_message = "preflight deadline exceeded".to_string();
        }
        Some(Attempt::Err(error)) => {
            payload.technical_message = error.to_string();
            if error.kind != ErrorKind::Unknown {
                payload.kind = error.kind;
            }
            if let Some(status) = error.status {
                payload.user_message = format!("Управляющий сервер недоступен (код {})", status);
            }
        }
        _ => {}
    }
    payload
}

fn build_auth_failure(error: &ControlError) -> ScenarioResultPayload {
    let mut payload = ScenarioResultPayload {
        kind: ErrorKind::AuthFailed,
        user_message: "Ошибка авторизации".to_string(),
        technical_message: error.to_string(),
    };
    if error.kind != ErrorKind::Unknown {
        payload.kind = error.kind;
    }
    match error.kind {
        ErrorKind::AuthFailed => {
            payload.user_message = "Неверный логин или пароль".to_string();
        }
        ErrorKind::NetworkUnavailable => {
            payload.user_message = "Не удалось подключиться к серверу авторизации".to_string();
        }
        _ => {
            if let Some(status) = error.status {
                payload.user_message = format!("Ошибка авторизации (код {})", status);
            }
        }
    }
    payload
}

fn build_sync_failure<T>(
    outcome: Attempt<T, ControlError>,
    fallback: &str,
) -> ScenarioResultPayload {
    let mut payload = ScenarioResultPayload {
        kind: ErrorKind::SyncFailed,
        user_message: fallback.to_string(),
        technical_message: String::new(),
    };
    match outcome {
        Attempt::Err(error) => {
            payload.technical_message = error.to_string();
            if error.kind != ErrorKind::Unknown {
                payload.kind = error.kind;
            }
            if let Some(status) = error.status {
                payload.user_message = format!("{} (код {})", fallback, status);
            }
        }
        _ => {
            payload.kind = ErrorKind::NetworkUnavailable;
            payload.user_message = "Истекло время ожидания ответа сервера".to_string();
            payload.technical_message = "sync deadline exceeded".to_string();
        }
    }
    payload
}

/// Applies the privilege and multiple-gateway keyword mappings to routing
/// failures.
fn routing_user_message(default: &str, technical: &str) -> String {
    let lower = technical.to_lowercase();
    if lower.contains("requires elevation") || lower.contains("привил") {
        return "Недостаточно прав. Запустите приложение от имени администратора".to_string();
    }
    if lower.contains("multiple default gateways") {
        return "Обнаружено несколько шлюзов по умолчанию".to_string();
    }
    default.to_string()
}

fn gateway_user_message(technical: &str) -> String {
    routing_user_message("Не удалось определить шлюз по умолчанию", technical)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_message_detects_elevation_keyword() {
        let message = routing_user_message(
            "Не удалось добавить маршрут 10.0.0.0/8",
            "The requested operation requires elevation",
        );
        assert_eq!(
            message,
            "Недостаточно прав. Запустите приложение от имени администратора"
        );
    }

    #[test]
    fn routing_message_detects_multiple_gateways() {
        let message = gateway_user_message("multiple default gateways detected");
        assert_eq!(message, "Обнаружено несколько шлюзов по умолчанию");
    }

    #[test]
    fn routing_message_keeps_default_otherwise() {
        let message = routing_user_message("Не удалось добавить маршрут bad-cidr", "parse error");
        assert!(message.contains("bad-cidr"));
    }

    #[test]
    fn auth_failure_maps_credentials_message() {
        let error = ControlError {
            op: "auth",
            kind: ErrorKind::AuthFailed,
            status: Some(401),
            message: "auth failed".to_string(),
        };
        let payload = build_auth_failure(&error);
        assert_eq!(payload.kind, ErrorKind::AuthFailed);
        assert_eq!(payload.user_message, "Неверный логин или пароль");
    }

    #[test]
    fn auth_failure_maps_unknown_status_into_code_message() {
        let error = ControlError {
            op: "auth",
            kind: ErrorKind::Unknown,
            status: Some(500),
            message: "unexpected status 500".to_string(),
        };
        let payload = build_auth_failure(&error);
        assert_eq!(payload.user_message, "Ошибка авторизации (код 500)");
    }

    #[test]
    fn preflight_failure_reports_status_code() {
        let payload = build_preflight_failure(Some(Attempt::Err(ControlError {
            op: "check_health",
            kind: ErrorKind::NetworkUnavailable,
            status: Some(503),
            message: "unexpected status 503".to_string(),
        })));
        assert_eq!(
            payload.user_message,
            "Управляющий сервер недоступен (код 503)"
        );
        assert_eq!(payload.kind, ErrorKind::NetworkUnavailable);
    }

    #[test]
    fn scenario_error_payload_round_trip() {
        let error = ScenarioError::new(ErrorKind::ConfigFailed, "сообщение", "technical detail");
        let payload = error.payload();
        assert_eq!(payload.kind, ErrorKind::ConfigFailed);
        assert_eq!(payload.user_message, "сообщение");
        assert_eq!(payload.technical_message, "technical detail");
        assert!(!error.canceled);
        assert!(ScenarioError::canceled().canceled);
    }
}
