//! Event bus feeding the state machine
//!
//! Two bounded channels: a priority channel (capacity 8) reserved for exit
//! events and a normal channel (capacity 64) for everything else. The
//! consumer drains the priority channel first, then selects from either.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use thiserror::Error;

use super::models::{ErrorKind, GatewayInfo, Profile, ProcessName};

const PRIORITY_CAPACITY: usize = 8;
const NORMAL_CAPACITY: usize = 64;
const SEND_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Login/password edits from the presentation layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CredentialsPayload {
    pub login: String,
    pub password: String,
}

/// Profile selection change.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionPayload {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthSuccessPayload {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncSuccessPayload {
    pub profiles: Vec<Profile>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrepareEnvSuccessPayload {
    pub gateway: Option<GatewayInfo>,
}

/// Terminal result of a failed scenario.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioResultPayload {
    pub kind: ErrorKind,
    pub user_message: String,
    pub technical_message: String,
}

/// Carried by a successful connect so the FSM can store what the scenario
/// learned and installed without workers touching `AppContext`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectSuccessPayload {
    pub gateway: GatewayInfo,
    pub kill_switch_rules: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessExitPayload {
    pub name: ProcessName,
    pub exit_code: i32,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupResultPayload {
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutPayload {
    pub operation: String,
}

/// Every event the state machine consumes, with typed payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    // Presentation layer
    UiLaunch,
    UiCredentialsChanged(CredentialsPayload),
    UiClickLogin(CredentialsPayload),
    UiClickRetryPreflight,
    UiSelectProfile(SelectionPayload),
    UiClickConnect,
    UiClickDisconnect,
    UiClickCleanup,
    UiOpenSettings,
    UiCloseWindow,
    UiShowWindow,
    UiExit,

    // Tray
    TrayShowWindow,
    TrayHideWindow,
    TrayConnect,
    TrayDisconnect,
    TrayExit,

    // Scenario and system results
    PreflightSucceeded,
    PreflightFailed(ScenarioResultPayload),
    PreflightRetry,
    AuthSucceeded(AuthSuccessPayload),
    AuthFailed(ScenarioResultPayload),
    SyncSucceeded(SyncSuccessPayload),
    SyncFailed(ScenarioResultPayload),
    PrepareEnvSucceeded(PrepareEnvSuccessPayload),
    PrepareEnvFailed(ScenarioResultPayload),
    ConnectingSucceeded(ConnectSuccessPayload),
    ConnectingFailed(ScenarioResultPayload),
    DisconnectingDone,
    ProcessExited(ProcessExitPayload),
    CleanupDone(CleanupResultPayload),
    Timeout(TimeoutPayload),
}

impl Event {
    /// Exit events may overtake normal events through the priority channel.
    pub fn is_exit(&self) -> bool {
        matches!(self, Event::UiExit | Event::TrayExit)
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Event::UiLaunch => "UiLaunch",
            Event::UiCredentialsChanged(_) => "UiCredentialsChanged",
            Event::UiClickLogin(_) => "UiClickLogin",
            Event::UiClickRetryPreflight => "UiClickRetryPreflight",
            Event::UiSelectProfile(_) => "UiSelectProfile",
            Event::UiClickConnect => "UiClickConnect",
            Event::UiClickDisconnect => "UiClickDisconnect",
            Event::UiClickCleanup => "UiClickCleanup",
            Event::UiOpenSettings => "UiOpenSettings",
            Event::UiCloseWindow => "UiCloseWindow",
            Event::UiShowWindow => "UiShowWindow",
            Event::UiExit => "UiExit",
            Event::TrayShowWindow => "TrayShowWindow",
            Event::TrayHideWindow => "TrayHideWindow",
            Event::TrayConnect => "TrayConnect",
            Event::TrayDisconnect => "TrayDisconnect",
            Event::TrayExit => "TrayExit",
            Event::PreflightSucceeded => "PreflightSucceeded",
            Event::PreflightFailed(_) => "PreflightFailed",
            Event::PreflightRetry => "PreflightRetry",
            Event::AuthSucceeded(_) => "AuthSucceeded",
            Event::AuthFailed(_) => "AuthFailed",
            Event::SyncSucceeded(_) => "SyncSucceeded",
            Event::SyncFailed(_) => "SyncFailed",
            Event::PrepareEnvSucceeded(_) => "PrepareEnvSucceeded",
            Event::PrepareEnvFailed(_) => "PrepareEnvFailed",
            Event::ConnectingSucceeded(_) => "ConnectingSucceeded",
            Event::ConnectingFailed(_) => "ConnectingFailed",
            Event::DisconnectingDone => "DisconnectingDone",
            Event::ProcessExited(_) => "ProcessExited",
            Event::CleanupDone(_) => "CleanupDone",
            Event::Timeout(_) => "Timeout",
        }
    }
}

/// Returned by [`EventSender::dispatch`] after the machine has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("state machine stopped")]
pub struct MachineStopped;

/// Producer half of the bus; cheap to clone into timers, supervisors and
/// scenario workers.
#[derive(Clone)]
pub struct EventSender {
    priority: Sender<Event>,
    normal: Sender<Event>,
    stopped: Arc<AtomicBool>,
}

impl EventSender {
    /// Queues an event for the state machine. If the target channel is full,
    /// blocks in short stop-aware intervals rather than stalling the caller
    /// past shutdown.
    pub fn dispatch(&self, event: Event) -> Result<(), MachineStopped> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(MachineStopped);
        }
        log::debug!("event queued: {}", event.name());
        let channel = if event.is_exit() {
            &self.priority
        } else {
            &self.normal
        };
        let mut event = event;
        loop {
            match channel.try_send(event) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Disconnected(_)) => return Err(MachineStopped),
                Err(TrySendError::Full(rejected)) => {
                    if self.stopped.load(Ordering::Acquire) {
                        return Err(MachineStopped);
                    }
                    match channel.send_timeout(rejected, SEND_POLL_INTERVAL) {
                        Ok(()) => return Ok(()),
                        Err(crossbeam_channel::SendTimeoutError::Timeout(rejected)) => {
                            event = rejected;
                        }
                        Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => {
                            return Err(MachineStopped)
                        }
                    }
                }
            }
        }
    }

    /// Marks the bus stopped; subsequent dispatches fail with
    /// [`MachineStopped`]. Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Consumer half, owned by the state machine thread.
pub struct EventBus {
    priority: Receiver<Event>,
    normal: Receiver<Event>,
    stopped: Arc<AtomicBool>,
}

impl EventBus {
    /// Blocks for the next event, draining the priority channel before
    /// considering the normal one. Returns `None` once stopped and drained of
    /// priority events.
    pub fn next(&self) -> Option<Event> {
        loop {
            match self.priority.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => return None,
            }
            if self.stopped.load(Ordering::Acquire) {
                return None;
            }

            crossbeam_channel::select! {
                recv(self.priority) -> event => match event {
                    Ok(event) => return Some(event),
                    Err(_) => return None,
                },
                recv(self.normal) -> event => match event {
                    Ok(event) => return Some(event),
                    // Normal senders gone; keep serving priority events.
                    Err(_) => match self.priority.recv() {
                        Ok(event) => return Some(event),
                        Err(_) => return None,
                    },
                },
                default(SEND_POLL_INTERVAL) => continue,
            }
        }
    }
}

/// Creates a connected sender/consumer pair.
pub fn event_bus() -> (EventSender, EventBus) {
    let (priority_tx, priority_rx) = bounded(PRIORITY_CAPACITY);
    let (normal_tx, normal_rx) = bounded(NORMAL_CAPACITY);
    let stopped = Arc::new(AtomicBool::new(false));
    (
        EventSender {
            priority: priority_tx,
            normal: normal_tx,
            stopped: stopped.clone(),
        },
        EventBus {
            priority: priority_rx,
            normal: normal_rx,
            stopped,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_events_overtake_normal_events() {
        let (sender, bus) = event_bus();
        sender.dispatch(Event::UiLaunch).unwrap();
        sender.dispatch(Event::UiClickConnect).unwrap();
        sender.dispatch(Event::UiExit).unwrap();

        assert_eq!(bus.next().unwrap(), Event::UiExit);
        assert_eq!(bus.next().unwrap(), Event::UiLaunch);
        assert_eq!(bus.next().unwrap(), Event::UiClickConnect);
    }

    #[test]
    fn dispatch_fails_after_stop() {
        let (sender, _bus) = event_bus();
        sender.stop();
        assert_eq!(sender.dispatch(Event::UiLaunch), Err(MachineStopped));
    }

    #[test]
    fn next_returns_none_after_stop_and_drain() {
        let (sender, bus) = event_bus();
        sender.dispatch(Event::UiExit).unwrap();
        sender.stop();
        // Priority events queued before the stop still drain.
        assert_eq!(bus.next().unwrap(), Event::UiExit);
        assert!(bus.next().is_none());
    }

    #[test]
    fn single_producer_order_is_preserved() {
        let (sender, bus) = event_bus();
        for _ in 0..3 {
            sender.dispatch(Event::UiClickConnect).unwrap();
        }
        sender.dispatch(Event::UiClickDisconnect).unwrap();
        assert_eq!(bus.next().unwrap(), Event::UiClickConnect);
        assert_eq!(bus.next().unwrap(), Event::UiClickConnect);
        assert_eq!(bus.next().unwrap(), Event::UiClickConnect);
        assert_eq!(bus.next().unwrap(), Event::UiClickDisconnect);
    }
}
