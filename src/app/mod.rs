//! Application assembly
//!
//! Wires the configuration, control client, platform effectors, process
//! launcher, registries, event bus, scenarios and state machine together,
//! and owns the shutdown sequence: cancel, cleanup, stop the bus, join the
//! FSM thread, drain workers.

pub mod cleanup_state;
pub mod scenarios;

use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use anyhow::Context as _;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::control::{ControlApi, ControlClient};
use crate::platform::{default_effectors, Effectors};
use crate::process::{Launcher, ProcessLauncher};
use crate::state::{
    event_bus, AppContext, Event, EventSender, ProcessExitPayload, ProcessRecord, ProcessName,
    ProcessRegistry, ProcessStatus, Machine, RoutesRegistry,
};
use crate::ui::{UiPublisher, UiSink, UiSnapshot};
use scenarios::Scenarios;

const CORE_STOP_ON_SHUTDOWN: Duration = Duration::from_secs(2);
const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Runs the exit cleanup exactly once and tells the host the application
/// wants to terminate.
pub struct ExitCoordinator {
    scenarios: Arc<Scenarios>,
    runtime: tokio::runtime::Handle,
    cleanup_once: Once,
    done_tx: watch::Sender<bool>,
}

impl ExitCoordinator {
    /// Best-effort removal of every side effect; safe to call repeatedly and
    /// from any non-runtime thread.
    pub fn run_cleanup(&self) {
        self.cleanup_once.call_once(|| {
            log::info!("running exit cleanup");
            let scenarios = self.scenarios.clone();
            self.runtime.block_on(async move {
                scenarios.exit_cleanup().await;
            });
        });
    }

    fn cleanup_and_signal(&self) {
        self.run_cleanup();
        let _ = self.done_tx.send(true);
    }
}

/// The assembled client engine.
pub struct Application {
    config: Arc<Config>,
    sender: EventSender,
    scenarios: Arc<Scenarios>,
    launcher: Arc<dyn ProcessLauncher>,
    shutdown: CancellationToken,
    publisher: UiPublisher,
    runtime: tokio::runtime::Handle,
    machine: Mutex<Option<Machine>>,
    machine_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    exit: Arc<ExitCoordinator>,
    done_rx: watch::Receiver<bool>,
    stop_once: Once,
    routes_registry: Arc<RoutesRegistry>,
    process_registry: Arc<ProcessRegistry>,
}

impl Application {
    /// Builds the engine with platform-default effectors and the HTTP
    /// control client.
    pub fn new(
        config: Arc<Config>,
        runtime: tokio::runtime::Handle,
        ui: Arc<dyn UiSink>,
    ) -> anyhow::Result<Self> {
        let control = Arc::new(
            ControlClient::new(&config.control_server_url)
                .context("init control client")?,
        );
        Self::with_parts(
            config,
            runtime,
            ui,
            control,
            default_effectors(),
            Arc::new(Launcher::new()),
        )
    }

    /// Full-injection constructor; the composition point for tests and for
    /// alternative platform backends.
    pub fn with_parts(
        config: Arc<Config>,
        runtime: tokio::runtime::Handle,
        ui: Arc<dyn UiSink>,
        control: Arc<dyn ControlApi>,
        effectors: Effectors,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> anyhow::Result<Self> {
        let routes_registry = Arc::new(RoutesRegistry::new());
        let process_registry = Arc::new(ProcessRegistry::new());
        let (sender, bus) = event_bus();
        let shutdown = CancellationToken::new();
        let publisher = UiPublisher::new();

        // Exit callback bound at construction: update the registry, then
        // dispatch. Runs on the supervisor task, never takes FSM locks.
        {
            let registry = process_registry.clone();
            let events = sender.clone();
            launcher.set_exit_callback(Arc::new(move |name: ProcessName, exit_code: i32, reason: String| {
                let mut record = registry.get(name).unwrap_or_else(|| ProcessRecord {
                    name,
                    command: String::new(),
                    args: Vec::new(),
                    pid: 0,
                    started_at: chrono::Utc::now(),
                    exited_at: None,
                    status: ProcessStatus::Starting,
                    exit_code: None,
                    exit_reason: String::new(),
                });
                record.status = if exit_code != 0 {
                    ProcessStatus::Failed
                } else {
                    ProcessStatus::Exited
                };
                record.exited_at = Some(chrono::Utc::now());
                record.exit_code = Some(exit_code);
                record.exit_reason = reason.clone();
                registry.update(record);
                let _ = events.dispatch(Event::ProcessExited(ProcessExitPayload {
                    name,
                    exit_code,
                    reason,
                }));
            }));
        }

        let scenarios = Scenarios::new(
            config.clone(),
            control,
            effectors,
            launcher.clone(),
            routes_registry.clone(),
            process_registry.clone(),
            sender.clone(),
            shutdown.clone(),
            runtime.clone(),
        );

        let (done_tx, done_rx) = watch::channel(false);
        let exit = Arc::new(ExitCoordinator {
            scenarios: scenarios.clone(),
            runtime: runtime.clone(),
            cleanup_once: Once::new(),
            done_tx,
        });

        let ctx = AppContext::new(
            config.clone(),
            routes_registry.clone(),
            process_registry.clone(),
        );
        let on_exit = {
            let exit = exit.clone();
            Arc::new(move || exit.cleanup_and_signal())
        };
        let machine = Machine::new(
            ctx,
            scenarios.clone(),
            ui,
            publisher.clone(),
            bus,
            sender.clone(),
            runtime.clone(),
            on_exit,
        );

        Ok(Self {
            config,
            sender,
            scenarios,
            launcher,
            shutdown,
            publisher,
            runtime,
            machine: Mutex::new(Some(machine)),
            machine_thread: Mutex::new(None),
            exit,
            done_rx,
            stop_once: Once::new(),
            routes_registry,
            process_registry,
        })
    }

    /// Read handle to the route registry (shared with the scenarios).
    pub fn routes_registry(&self) -> Arc<RoutesRegistry> {
        self.routes_registry.clone()
    }

    /// Read handle to the process registry.
    pub fn process_registry(&self) -> Arc<ProcessRegistry> {
        self.process_registry.clone()
    }

    /// Starts the FSM thread, kicks off crash recovery and dispatches the
    /// launch event.
    pub fn run(&self) -> anyhow::Result<()> {
        let machine = self
            .machine
            .lock()
            .expect("machine slot poisoned")
            .take()
            .context("application already running")?;
        let handle = std::thread::Builder::new()
            .name("state-machine".to_string())
            .spawn(move || machine.run())
            .context("spawn state machine thread")?;
        *self.machine_thread.lock().expect("machine thread poisoned") = Some(handle);

        // Opportunistic sweep of leftovers from a crashed previous session.
        let scenarios = self.scenarios.clone();
        self.runtime.spawn(async move {
            scenarios.recover_previous_session().await;
        });

        self.sender
            .dispatch(Event::UiLaunch)
            .context("dispatch launch event")?;
        log::info!(
            "application started (control server: {})",
            self.config.control_server_url
        );
        Ok(())
    }

    /// Queue handle for the presentation layer.
    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    /// Latest-state subscription for the presentation layer.
    pub fn subscribe_ui(&self) -> watch::Receiver<UiSnapshot> {
        self.publisher.subscribe()
    }

    /// Resolves to `true` once the engine has decided to exit (exit event
    /// processed and cleanup finished).
    pub fn done(&self) -> watch::Receiver<bool> {
        self.done_rx.clone()
    }

    /// Installs a process-wide panic hook that reverses side effects before
    /// the default hook runs.
    pub fn install_panic_hook(&self) {
        let exit = self.exit.clone();
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            log::error!("panic: performing emergency cleanup");
            // Only attempt the blocking cleanup from plain threads.
            if tokio::runtime::Handle::try_current().is_err() {
                exit.run_cleanup();
            }
            default_hook(info);
        }));
    }

    /// Idempotent shutdown: cancel, cleanup, stop the child, stop the bus,
    /// join the FSM thread, drain workers.
    pub fn stop(&self) {
        self.stop_once.call_once(|| {
            log::info!("stopping application");
            self.shutdown.cancel();
            self.exit.run_cleanup();

            let launcher = self.launcher.clone();
            self.runtime.block_on(async move {
                launcher
                    .stop(ProcessName::Core, CORE_STOP_ON_SHUTDOWN)
                    .await;
            });

            self.sender.stop();
            if let Some(handle) = self
                .machine_thread
                .lock()
                .expect("machine thread poisoned")
                .take()
            {
                if handle.join().is_err() {
                    log::error!("state machine thread panicked");
                }
            }

            let scenarios = self.scenarios.clone();
            let drained = self
                .runtime
                .block_on(async move { scenarios.wait_idle(WORKER_DRAIN_TIMEOUT).await });
            if !drained {
                log::error!("scenario workers did not finish before timeout");
            }
            log::info!("application stopped");
        });
    }
}
