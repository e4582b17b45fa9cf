//! UI snapshot publisher
//!
//! The state machine recomputes a flat, immutable snapshot on every
//! transition and hands it to the presentation layer through a single-slot
//! drop-oldest channel; slow consumers only ever see the latest state.
//! Imperative surfaces (modal errors, transient notices, window show/hide)
//! go through the [`UiSink`] trait the presentation layer implements.

use tokio::sync::watch;

use crate::state::{ErrorInfo, Profile, UiState};

/// Summary of a profile for list rendering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileEntry {
    pub id: String,
    pub name: String,
    pub country: String,
}

/// Flat, copy-only view of the application state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UiSnapshot {
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
    pub profiles: Vec<ProfileEntry>,
}

impl UiSnapshot {
    /// Builds a snapshot from the FSM-owned state and profile list.
    pub fn from_state(ui: &UiState, profiles: &[Profile]) -> Self {
        Self {
            is_login_visible: ui.is_login_visible,
            is_main_visible: ui.is_main_visible,
            is_connecting: ui.is_connecting,
            is_connected: ui.is_connected,
            selected_profile_id: ui.selected_profile_id.clone(),
            status_text: ui.status_text.clone(),
            login_input: ui.login_input.clone(),
            password_input: ui.password_input.clone(),
            can_login: ui.can_login,
            allow_preflight_retry: ui.allow_preflight_retry,
            profiles: profiles
                .iter()
                .map(|profile| ProfileEntry {
                    id: profile.id.clone(),
                    name: profile.name.clone(),
                    country: profile.country.clone(),
                })
                .collect(),
        }
    }
}

/// Single-slot drop-oldest publisher.
#[derive(Clone)]
pub struct UiPublisher {
    sender: watch::Sender<UiSnapshot>,
}

impl UiPublisher {
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(UiSnapshot::default());
        Self { sender }
    }

    /// Replaces the current snapshot; never blocks the FSM thread.
    pub fn publish(&self, snapshot: UiSnapshot) {
        let _ = self.sender.send(snapshot);
    }

    /// Subscription handle for the presentation layer.
    pub fn subscribe(&self) -> watch::Receiver<UiSnapshot> {
        self.sender.subscribe()
    }
}

impl Default for UiPublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// Imperative callbacks into the presentation layer. Implementations must be
/// cheap and non-blocking; they are invoked from the FSM thread.
pub trait UiSink: Send + Sync {
    fn show_login_window(&self);
    fn show_main_window(&self);
    fn hide_main_window(&self);
    fn show_modal_error(&self, info: &ErrorInfo);
    fn show_transient_notice(&self, message: &str);
    fn show_cleanup_started(&self);
    fn show_cleanup_done(&self, has_errors: bool);
}

/// Headless sink: logs everything. Used when no GUI is attached and in
/// tests that do not assert on UI callbacks.
pub struct NullUiSink;

impl UiSink for NullUiSink {
    fn show_login_window(&self) {
        log::debug!("ui: show login window");
    }

    fn show_main_window(&self) {
        log::debug!("ui: show main window");
    }

    fn hide_main_window(&self) {
        log::debug!("ui: hide main window");
    }

    fn show_modal_error(&self, info: &ErrorInfo) {
        log::error!(
            "ui: modal error [{:?}] {} ({})",
            info.kind,
            info.user_message,
            info.technical_message
        );
    }

    fn show_transient_notice(&self, message: &str) {
        log::info!("ui: notice: {}", message);
    }

    fn show_cleanup_started(&self) {
        log::info!("ui: cleanup started");
    }

    fn show_cleanup_done(&self, has_errors: bool) {
        log::info!("ui: cleanup done (errors: {})", has_errors);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publisher_keeps_only_latest_snapshot() {
        let publisher = UiPublisher::new();
        let mut receiver = publisher.subscribe();

        for status in ["a", "b", "c"] {
            publisher.publish(UiSnapshot {
                status_text: status.to_string(),
                ..UiSnapshot::default()
            });
        }
        assert_eq!(receiver.borrow_and_update().status_text, "c");
    }

    #[test]
    fn snapshot_copies_profiles() {
        let ui = UiState {
            status_text: "Подключено".to_string(),
            is_connected: true,
            ..UiState::default()
        };
        let profiles = vec![Profile {
            id: "p1".to_string(),
            name: "FR #1".to_string(),
            country: "FR".to_string(),
            ..Profile::default()
        }];
        let snapshot = UiSnapshot::from_state(&ui, &profiles);
        assert!(snapshot.is_connected);
        assert_eq!(snapshot.profiles.len(), 1);
        assert_eq!(snapshot.profiles[0].name, "FR #1");
    }
}
