//! Application state machine
//!
//! Runs on a dedicated thread, consuming the event bus one event at a time.
//! Every handler is synchronous; long work is delegated to scenario workers
//! which report back through terminal events, so the state itself is the
//! interlock: at most one scenario is in flight at any moment.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::app::scenarios::Scenarios;
use crate::state::{
    AppContext, CleanupResultPayload, ConnectSuccessPayload, CredentialsPayload, ErrorInfo,
    ErrorKind, Event, EventBus, EventSender, ProcessExitPayload, ScenarioResultPayload,
    SelectionPayload, State,
};
use crate::ui::{UiPublisher, UiSink, UiSnapshot};

const PREFLIGHT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Invoked once when an exit event arrives: run the exit cleanup and signal
/// the host that the application wants to terminate.
pub type ExitHandler = Arc<dyn Fn() + Send + Sync>;

pub struct Machine {
    ctx: AppContext,
    scenarios: Arc<Scenarios>,
    ui: Arc<dyn UiSink>,
    publisher: UiPublisher,
    bus: EventBus,
    sender: EventSender,
    runtime: tokio::runtime::Handle,
    on_exit: ExitHandler,
    preflight_retry_timer: Option<tokio::task::JoinHandle<()>>,
    pending_process_failure: bool,
    cleanup_in_progress: bool,
}

impl Machine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: AppContext,
        scenarios: Arc<Scenarios>,
        ui: Arc<dyn UiSink>,
        publisher: UiPublisher,
        bus: EventBus,
        sender: EventSender,
        runtime: tokio::runtime::Handle,
        on_exit: ExitHandler,
    ) -> Self {
        Self {
            ctx,
            scenarios,
            ui,
            publisher,
            bus,
            sender,
            runtime,
            on_exit,
            preflight_retry_timer: None,
            pending_process_failure: false,
            cleanup_in_progress: false,
        }
    }

    /// Consumes events until the bus stops. Call from a dedicated thread.
    pub fn run(mut self) {
        while let Some(event) = self.bus.next() {
            self.handle_event(event);
        }
        self.cancel_preflight_retry();
        log::debug!("state machine loop finished in state {}", self.ctx.state);
    }

    fn handle_event(&mut self, event: Event) {
        log::debug!("event handle: {} state={}", event.name(), self.ctx.state);

        // Cleanup runs from any state and causes no transition.
        if matches!(event, Event::UiClickCleanup) {
            self.ui.show_cleanup_started();
            self.cleanup_in_progress = true;
            self.scenarios.start_force_cleanup();
            return;
        }
        if event.is_exit() {
            if self.ctx.state != State::Exiting {
                self.transition(State::Exiting);
                self.cancel_preflight_retry();
                (self.on_exit)();
            }
            return;
        }
        // Completion of a force cleanup is reported regardless of state.
        if let Event::CleanupDone(payload) = &event {
            self.cleanup_in_progress = false;
            self.report_cleanup_done(payload.clone());
            return;
        }
        // A force cleanup stops the core deliberately; the resulting exit
        // notification must not be mistaken for a crash.
        if self.cleanup_in_progress {
            if let Event::ProcessExited(payload) = &event {
                log::debug!(
                    "process {} exited during cleanup (code {})",
                    payload.name,
                    payload.exit_code
                );
                return;
            }
        }

        match self.ctx.state {
            State::AppStarting => self.on_app_starting(event),
            State::PreflightCheck => self.on_preflight_check(event),
            State::WaitingLogin => self.on_waiting_login(event),
            State::AuthInProgress => self.on_auth_in_progress(event),
            State::SyncInProgress => self.on_sync_in_progress(event),
            State::PreparingEnvironment => self.on_preparing_environment(event),
            State::ReadyDisconnected => self.on_ready(event),
            State::Connecting => self.on_connecting(event),
            State::Connected => self.on_connected(event),
            State::Disconnecting => self.on_disconnecting(event),
            State::Error => self.on_error_state(event),
            State::Exiting => {}
        }
    }

    // --- Per-state handlers -------------------------------------------------

    fn on_app_starting(&mut self, event: Event) {
        match event {
            Event::UiLaunch => {
                self.ctx.ui.status_text = "Проверяем доступность сервера...".to_string();
                self.transition(State::PreflightCheck);
                self.scenarios.start_preflight();
            }
            Event::UiCredentialsChanged(payload) => self.apply_credentials(payload),
            other => log::debug!("appStarting: ignored {}", other.name()),
        }
    }

    fn on_preflight_check(&mut self, event: Event) {
        match event {
            Event::PreflightSucceeded => {
                self.cancel_preflight_retry();
                self.ctx.ui.status_text = "Введите логин и пароль".to_string();
                self.transition(State::WaitingLogin);
                self.ui.show_login_window();
            }
            Event::PreflightFailed(payload) => self.on_preflight_failure(payload),
            Event::UiClickRetryPreflight => self.retry_preflight(true),
            Event::PreflightRetry => self.retry_preflight(false),
            Event::UiCredentialsChanged(payload) => self.apply_credentials(payload),
            other => log::debug!("preflight: ignored {}", other.name()),
        }
    }

    fn on_waiting_login(&mut self, event: Event) {
        match event {
            Event::UiCredentialsChanged(payload) => self.apply_credentials(payload),
            Event::UiClickLogin(payload) => {
                self.apply_credentials(payload);
                if self.ctx.ui.login_input.trim().is_empty()
                    || self.ctx.ui.password_input.trim().is_empty()
                {
                    self.ui.show_transient_notice("Укажите логин и пароль");
                    return;
                }
                self.begin_auth();
            }
            Event::UiCloseWindow => self.ui.hide_main_window(),
            Event::UiShowWindow | Event::TrayShowWindow => self.ui.show_login_window(),
            other => log::debug!("waitingLogin: ignored {}", other.name()),
        }
    }

    fn on_auth_in_progress(&mut self, event: Event) {
        match event {
            Event::AuthSucceeded(payload) => {
                self.ctx.auth_token = Some(payload.token.clone());
                self.ctx.last_error = None;
                self.ctx.ui.status_text = "Обновление списков серверов".to_string();
                self.transition(State::SyncInProgress);
                self.scenarios
                    .start_sync(payload.token, self.ctx.selected_profile_id.clone());
            }
            Event::AuthFailed(payload) => {
                self.enter_error_from_payload(
                    payload,
                    ErrorKind::AuthFailed,
                    "Ошибка авторизации",
                    "auth failed",
                );
            }
            other => log::debug!("auth: ignored {}", other.name()),
        }
    }

    fn on_sync_in_progress(&mut self, event: Event) {
        match event {
            Event::SyncSucceeded(payload) => {
                self.ctx.profiles = payload.profiles;
                self.ctx.ui.status_text = "Подготовка окружения".to_string();
                self.transition(State::PreparingEnvironment);
                self.scenarios.start_prepare_env();
            }
            Event::SyncFailed(payload) => {
                self.enter_error_from_payload(
                    payload,
                    ErrorKind::SyncFailed,
                    "Не удалось загрузить данные",
                    "sync failed",
                );
            }
            other => log::debug!("sync: ignored {}", other.name()),
        }
    }

    fn on_preparing_environment(&mut self, event: Event) {
        match event {
            Event::PrepareEnvSucceeded(payload) => {
                self.ctx.default_gateway = payload
                    .gateway
                    .filter(|gateway| !gateway.ip.trim().is_empty());
                self.ctx.ui.status_text = "Отключено".to_string();
                self.transition(State::ReadyDisconnected);
                self.ui.show_main_window();
            }
            Event::PrepareEnvFailed(payload) => {
                self.enter_error_from_payload(
                    payload,
                    ErrorKind::RoutingFailed,
                    "Не удалось подготовить маршруты",
                    "prepare env failed",
                );
            }
            other => log::debug!("prepareEnv: ignored {}", other.name()),
        }
    }

    fn on_ready(&mut self, event: Event) {
        match event {
            Event::UiSelectProfile(payload) => self.apply_profile_selection(payload),
            Event::UiClickConnect | Event::TrayConnect => self.begin_connect(),
            Event::UiCloseWindow | Event::TrayHideWindow => self.ui.hide_main_window(),
            Event::UiShowWindow | Event::TrayShowWindow => self.ui.show_main_window(),
            Event::UiOpenSettings => log::debug!("settings dialog requested"),
            other => log::debug!("ready: ignored {}", other.name()),
        }
    }

    fn on_connecting(&mut self, event: Event) {
        match event {
            Event::ConnectingSucceeded(payload) => self.finish_connect(payload),
            Event::ConnectingFailed(payload) => {
                self.enter_error_from_payload(
                    payload,
                    ErrorKind::ProcessFailed,
                    "Не удалось подключиться",
                    "connecting failed",
                );
            }
            Event::ProcessExited(payload) => {
                self.enter_error(
                    ErrorKind::ProcessFailed,
                    "Процесс завершился во время подключения".to_string(),
                    payload.reason,
                );
            }
            other => log::debug!("connecting: ignored {}", other.name()),
        }
    }

    fn on_connected(&mut self, event: Event) {
        match event {
            Event::UiSelectProfile(payload) => self.apply_profile_selection(payload),
            Event::UiClickDisconnect | Event::TrayDisconnect => {
                self.pending_process_failure = false;
                self.begin_disconnect();
            }
            Event::ProcessExited(payload) => self.on_process_crash_connected(payload),
            Event::Timeout(payload) => {
                self.enter_error(
                    ErrorKind::Unknown,
                    format!("Таймаут операции {}", payload.operation),
                    "timeout in connected".to_string(),
                );
            }
            other => log::debug!("connected: ignored {}", other.name()),
        }
    }

    fn on_disconnecting(&mut self, event: Event) {
        match event {
            Event::UiSelectProfile(payload) => self.apply_profile_selection(payload),
            Event::DisconnectingDone => {
                self.ctx.kill_switch_rules.clear();
                self.ctx.ui.status_text = "Отключено".to_string();
                self.transition(State::ReadyDisconnected);
                if self.pending_process_failure {
                    self.pending_process_failure = false;
                    self.enter_error(
                        ErrorKind::ProcessFailed,
                        "Процесс завершился с ошибкой".to_string(),
                        "process crashed".to_string(),
                    );
                }
            }
            other => log::debug!("disconnecting: ignored {}", other.name()),
        }
    }

    fn on_error_state(&mut self, event: Event) {
        match event {
            Event::UiCredentialsChanged(payload) => self.apply_credentials(payload),
            Event::UiSelectProfile(payload) => self.apply_profile_selection(payload),
            Event::UiClickLogin(payload) if self.ctx.last_error.is_some() => {
                self.apply_credentials(payload);
                self.begin_auth();
            }
            Event::UiClickConnect | Event::TrayConnect => {
                let retryable = self
                    .ctx
                    .last_error
                    .as_ref()
                    .map(|error| {
                        matches!(
                            error.kind,
                            ErrorKind::ProcessFailed | ErrorKind::RoutingFailed
                        )
                    })
                    .unwrap_or(false);
                if retryable {
                    self.begin_connect();
                }
            }
            Event::UiShowWindow | Event::TrayShowWindow => self.ui.show_main_window(),
            other => log::debug!("error: ignored {}", other.name()),
        }
    }

    // --- Shared actions -----------------------------------------------------

    fn begin_auth(&mut self) {
        self.ctx.ui.status_text = "Выполняется авторизация".to_string();
        self.transition(State::AuthInProgress);
        self.scenarios.start_auth(
            self.ctx.ui.login_input.clone(),
            self.ctx.ui.password_input.clone(),
        );
    }

    fn begin_connect(&mut self) {
        let Some(selected) = self.ctx.selected_profile_id.clone() else {
            self.ui.show_transient_notice("Выберите профиль");
            return;
        };
        let Some(profile) = self.ctx.find_profile(&selected).cloned() else {
            self.enter_error(
                ErrorKind::ConfigFailed,
                "Не удалось найти выбранный профиль".to_string(),
                format!("profile {} not found", selected),
            );
            return;
        };
        self.pending_process_failure = false;
        self.ctx.ui.status_text = "Подключение...".to_string();
        self.transition(State::Connecting);
        self.scenarios.start_connect(profile);
    }

    fn begin_disconnect(&mut self) {
        self.ctx.ui.status_text = "Отключение...".to_string();
        self.transition(State::Disconnecting);
        self.scenarios
            .start_disconnect(self.ctx.kill_switch_rules.clone());
    }

    fn finish_connect(&mut self, payload: ConnectSuccessPayload) {
        self.ctx.default_gateway = Some(payload.gateway);
        self.ctx.kill_switch_rules = payload.kill_switch_rules;
        self.ctx.ui.status_text = "Подключено".to_string();
        self.transition(State::Connected);
    }

    fn on_process_crash_connected(&mut self, payload: ProcessExitPayload) {
        self.pending_process_failure = true;
        self.ctx.last_error = Some(ErrorInfo {
            kind: ErrorKind::ProcessFailed,
            user_message: "Процесс завершился неожиданно".to_string(),
            technical_message: payload.reason,
            occurred_at: Utc::now(),
        });
        self.begin_disconnect();
    }

    fn report_cleanup_done(&mut self, payload: CleanupResultPayload) {
        self.ui.show_cleanup_done(!payload.errors.is_empty());
    }

    fn apply_credentials(&mut self, payload: CredentialsPayload) {
        self.ctx.ui.login_input = payload.login;
        self.ctx.ui.password_input = payload.password;
    }

    fn apply_profile_selection(&mut self, payload: SelectionPayload) {
        self.ctx.selected_profile_id = Some(payload.id.clone());
        self.ctx.ui.selected_profile_id = payload.id;
        self.refresh_ui();
    }

    // --- Preflight retry ----------------------------------------------------

    fn on_preflight_failure(&mut self, payload: ScenarioResultPayload) {
        let message = if payload.user_message.trim().is_empty() {
            "Нет связи с управляющим сервером. Повторим через 5 секунд".to_string()
        } else {
            payload.user_message
        };
        self.ctx.ui.status_text = message;
        self.ctx.ui.allow_preflight_retry = true;
        self.ctx.ui.can_login = false;
        self.ctx.ui.is_login_visible = true;
        self.ctx.ui.is_main_visible = false;
        self.refresh_ui();
        self.ui.show_login_window();
        self.schedule_preflight_retry(PREFLIGHT_RETRY_DELAY);
    }

    fn retry_preflight(&mut self, manual: bool) {
        self.cancel_preflight_retry();
        self.ctx.ui.allow_preflight_retry = false;
        self.ctx.ui.can_login = false;
        self.ctx.ui.status_text = if manual {
            "Повторяем проверку...".to_string()
        } else {
            "Повторяем проверку соединения...".to_string()
        };
        self.refresh_ui();
        self.scenarios.start_preflight();
    }

    fn schedule_preflight_retry(&mut self, delay: Duration) {
        self.cancel_preflight_retry();
        let sender = self.sender.clone();
        self.preflight_retry_timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.dispatch(Event::PreflightRetry);
        }));
    }

    fn cancel_preflight_retry(&mut self) {
        if let Some(timer) = self.preflight_retry_timer.take() {
            timer.abort();
        }
    }

    // --- Transitions and UI -------------------------------------------------

    fn transition(&mut self, next: State) {
        if self.ctx.state == next {
            return;
        }
        let previous = self.ctx.state;
        self.ctx.state = next;
        log::debug!("state transition {} -> {}", previous, next);
        self.update_ui_for_state(next);
    }

    fn update_ui_for_state(&mut self, state: State) {
        self.ctx.ui.can_login = false;
        self.ctx.ui.allow_preflight_retry = false;
        match state {
            State::WaitingLogin => {
                self.ctx.ui.is_login_visible = true;
                self.ctx.ui.is_main_visible = false;
                self.ctx.ui.can_login = true;
            }
            State::ReadyDisconnected => {
                self.ctx.ui.is_login_visible = false;
                self.ctx.ui.is_main_visible = true;
                self.ctx.ui.is_connecting = false;
                self.ctx.ui.is_connected = false;
            }
            State::Connecting => {
                self.ctx.ui.is_connecting = true;
            }
            State::Connected => {
                self.ctx.ui.is_connecting = false;
                self.ctx.ui.is_connected = true;
            }
            State::Disconnecting => {
                self.ctx.ui.is_connecting = false;
            }
            State::Error => {
                self.ctx.ui.is_connecting = false;
                // Re-login is offered only for authentication failures.
                if self
                    .ctx
                    .last_error
                    .as_ref()
                    .map(|error| error.kind == ErrorKind::AuthFailed)
                    .unwrap_or(false)
                {
                    self.ctx.ui.can_login = true;
                }
            }
            _ => {}
        }
        self.refresh_ui();
    }

    fn enter_error(&mut self, kind: ErrorKind, user_message: String, technical_message: String) {
        let info = ErrorInfo {
            kind,
            user_message: user_message.clone(),
            technical_message,
            occurred_at: Utc::now(),
        };
        self.ctx.last_error = Some(info.clone());
        self.ctx.ui.status_text = user_message;
        self.transition(State::Error);
        self.ui.show_modal_error(&info);
    }

    /// Enters Error from a scenario payload, filling defaults for any field
    /// the scenario left blank.
    fn enter_error_from_payload(
        &mut self,
        payload: ScenarioResultPayload,
        default_kind: ErrorKind,
        default_message: &str,
        default_technical: &str,
    ) {
        let kind = if payload.kind == ErrorKind::Unknown {
            default_kind
        } else {
            payload.kind
        };
        let user_message = if payload.user_message.is_empty() {
            default_message.to_string()
        } else {
            payload.user_message
        };
        let technical = if payload.technical_message.is_empty() {
            default_technical.to_string()
        } else {
            payload.technical_message
        };
        self.enter_error(kind, user_message, technical);
    }

    fn refresh_ui(&mut self) {
        self.publisher
            .publish(UiSnapshot::from_state(&self.ctx.ui, &self.ctx.profiles));
    }
}
