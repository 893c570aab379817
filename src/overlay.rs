//! Runtime configuration overlay.
//!
//! The controller can push configuration at any time (embedded in `hello_ok` or in
//! a `config_push`). Pushed values are layered over the static [`Config`]: an overlay
//! field that has been set takes precedence, otherwise the static value applies.
//!
//! Merge rules for [`RuntimeOverlay::apply`]:
//!
//! | field                 | overwritten when                          |
//! |-----------------------|-------------------------------------------|
//! | `metrics_interval_ms` | incoming value > 0                        |
//! | `tcpping.enabled`     | always (absent reads as `false`)          |
//! | `tcpping.interval_sec`| incoming value > 0                        |
//! | `tcpping.targets`     | the key is present (replaces the list)    |
//! | `config_version`      | incoming value > current version          |
//!
//! A partial push therefore never clobbers unrelated numeric fields, while the
//! controller can still switch ping off or replace the whole target set.
//!
//! Effective intervals are capped at [`MAX_INTERVAL`] so that timers built from
//! them always fit in an [`Instant`](tokio::time::Instant).
//!
//! The overlay lives for the whole process: it is not reset when a session is
//! re-established, and it is never rolled back.
//!
//! [`Config`]: crate::config::Config

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tracing::info;

use crate::config::TcpPingDefaults;
use crate::probe::Target;

/// Upper bound for the telemetry and TCP-ping periods.
pub const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration object embedded in controller messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ConfigPatch {
    #[serde(default)]
    pub metrics_interval_ms: i64,
    #[serde(default)]
    pub tcpping: TcpPingPatch,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TcpPingPatch {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub interval_sec: i64,
    #[serde(default)]
    pub targets: Option<Vec<Target>>,
}

/// Effective TCP-ping settings for one evaluation of the probe loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpPingSettings {
    pub enabled: bool,
    pub interval: Duration,
    pub targets: Vec<Target>,
}

impl TcpPingSettings {
    /// Whether the probe loop should tick at all.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.interval.is_zero() && !self.targets.is_empty()
    }

    /// The properties whose change restarts a ticking probe loop.
    pub fn shape(&self) -> (bool, Duration, usize) {
        (self.enabled, self.interval, self.targets.len())
    }
}

#[derive(Debug, Clone, Default)]
struct OverlayState {
    metrics_interval_ms: u64,
    tcpping_enabled: Option<bool>,
    tcpping_interval_sec: u64,
    tcpping_targets: Vec<Target>,
    config_version: i64,
}

/// Remote-controllable configuration, shared by all session tasks.
#[derive(Debug)]
pub struct RuntimeOverlay {
    state: RwLock<OverlayState>,
    revision: watch::Sender<u64>,
}

impl Default for RuntimeOverlay {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeOverlay {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self { state: RwLock::new(OverlayState::default()), revision }
    }

    /// Merge a pushed configuration. Returns the version after the merge.
    pub fn apply(&self, patch: &ConfigPatch, version: Option<i64>) -> i64 {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        if patch.metrics_interval_ms > 0 {
            state.metrics_interval_ms = patch.metrics_interval_ms as u64;
        }
        state.tcpping_enabled = Some(patch.tcpping.enabled);
        if patch.tcpping.interval_sec > 0 {
            state.tcpping_interval_sec = patch.tcpping.interval_sec as u64;
        }
        if let Some(targets) = &patch.tcpping.targets {
            state.tcpping_targets = targets.clone();
        }
        if let Some(version) = version.filter(|v| *v > state.config_version) {
            state.config_version = version;
        }

        info!(
            metrics_interval_ms = state.metrics_interval_ms,
            tcpping_enabled = patch.tcpping.enabled,
            tcpping_interval_sec = state.tcpping_interval_sec,
            tcpping_targets = state.tcpping_targets.len(),
            config_version = state.config_version,
            "applied controller configuration"
        );

        let version = state.config_version;
        drop(state);
        self.revision.send_modify(|revision| *revision += 1);
        version
    }

    /// Telemetry period: the pushed interval if set, otherwise `default_ms`.
    pub fn metrics_interval(&self, default_ms: u64) -> Duration {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let ms = if state.metrics_interval_ms > 0 { state.metrics_interval_ms } else { default_ms };
        Duration::from_millis(ms).min(MAX_INTERVAL)
    }

    /// Current TCP-ping settings layered over the static defaults.
    pub fn tcpping(&self, defaults: TcpPingDefaults) -> TcpPingSettings {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let interval_sec = if state.tcpping_interval_sec > 0 {
            state.tcpping_interval_sec
        } else {
            defaults.interval_sec
        };
        TcpPingSettings {
            enabled: state.tcpping_enabled.unwrap_or(defaults.enabled),
            interval: Duration::from_secs(interval_sec).min(MAX_INTERVAL),
            targets: state.tcpping_targets.clone(),
        }
    }

    pub fn config_version(&self) -> i64 {
        self.state.read().unwrap_or_else(PoisonError::into_inner).config_version
    }

    /// Receiver notified after every [`apply`](Self::apply).
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(host: &str, port: u16) -> Target {
        Target { host: host.to_owned(), port, ..Default::default() }
    }

    fn patch(json: &str) -> ConfigPatch {
        serde_json::from_str(json).unwrap()
    }

    fn seeded() -> RuntimeOverlay {
        let overlay = RuntimeOverlay::new();
        overlay.apply(
            &patch(
                r#"{"metrics_interval_ms":5000,"tcpping":{"enabled":true,"interval_sec":10,
                    "targets":[{"host":"1.2.3.4","port":443},{"host":"5.6.7.8","port":80}]}}"#,
            ),
            Some(3),
        );
        overlay
    }

    #[test]
    fn starts_from_static_defaults() {
        let overlay = RuntimeOverlay::new();
        assert_eq!(overlay.metrics_interval(1000), Duration::from_millis(1000));
        let defaults = TcpPingDefaults { enabled: true, interval_sec: 30 };
        let settings = overlay.tcpping(defaults);
        assert!(settings.enabled);
        assert_eq!(settings.interval, Duration::from_secs(30));
        assert!(settings.targets.is_empty());
        assert!(!settings.is_active());
        assert_eq!(overlay.config_version(), 0);
    }

    #[test]
    fn disabling_ping_leaves_other_fields() {
        let overlay = seeded();
        overlay.apply(&patch(r#"{"tcpping":{"enabled":false}}"#), None);

        assert_eq!(overlay.metrics_interval(1000), Duration::from_millis(5000));
        let settings = overlay.tcpping(TcpPingDefaults::default());
        assert!(!settings.enabled);
        assert_eq!(settings.interval, Duration::from_secs(10));
        assert_eq!(settings.targets.len(), 2);
    }

    #[test]
    fn zero_interval_preserves_previous() {
        let overlay = seeded();
        overlay.apply(&patch(r#"{"metrics_interval_ms":0,"tcpping":{"enabled":true}}"#), None);
        assert_eq!(overlay.metrics_interval(1000), Duration::from_millis(5000));

        overlay.apply(&patch(r#"{"metrics_interval_ms":-5,"tcpping":{"enabled":true}}"#), None);
        assert_eq!(overlay.metrics_interval(1000), Duration::from_millis(5000));
    }

    #[test]
    fn target_list_is_replaced_wholesale() {
        let overlay = seeded();
        overlay.apply(
            &patch(r#"{"tcpping":{"enabled":true,"targets":[{"host":"9.9.9.9","port":53}]}}"#),
            None,
        );
        let settings = overlay.tcpping(TcpPingDefaults::default());
        assert_eq!(settings.targets, vec![target("9.9.9.9", 53)]);

        overlay.apply(&patch(r#"{"tcpping":{"enabled":true,"targets":[]}}"#), None);
        assert!(overlay.tcpping(TcpPingDefaults::default()).targets.is_empty());
    }

    #[test]
    fn absent_target_list_is_kept() {
        let overlay = seeded();
        overlay.apply(&patch(r#"{"tcpping":{"enabled":true,"interval_sec":20}}"#), None);
        let settings = overlay.tcpping(TcpPingDefaults::default());
        assert_eq!(settings.interval, Duration::from_secs(20));
        assert_eq!(settings.targets.len(), 2);
    }

    #[test]
    fn version_only_advances() {
        let overlay = seeded();
        assert_eq!(overlay.config_version(), 3);
        assert_eq!(overlay.apply(&ConfigPatch::default(), Some(0)), 3);
        assert_eq!(overlay.apply(&ConfigPatch::default(), Some(2)), 3);
        assert_eq!(overlay.apply(&ConfigPatch::default(), None), 3);
        assert_eq!(overlay.apply(&ConfigPatch::default(), Some(7)), 7);
    }

    #[test]
    fn pushed_disable_overrides_static_enable() {
        let overlay = RuntimeOverlay::new();
        let defaults = TcpPingDefaults { enabled: true, interval_sec: 5 };
        overlay.apply(&patch(r#"{"tcpping":{"enabled":false}}"#), None);
        assert!(!overlay.tcpping(defaults).enabled);
    }

    #[test]
    fn huge_intervals_are_capped() {
        let overlay = RuntimeOverlay::new();
        overlay.apply(
            &patch(&format!(
                r#"{{"metrics_interval_ms":{max},"tcpping":{{"enabled":true,"interval_sec":{max}}}}}"#,
                max = i64::MAX
            )),
            None,
        );
        assert_eq!(overlay.metrics_interval(1000), MAX_INTERVAL);
        assert_eq!(overlay.tcpping(TcpPingDefaults::default()).interval, MAX_INTERVAL);

        let fresh = RuntimeOverlay::new();
        let defaults = TcpPingDefaults { enabled: true, interval_sec: u64::MAX };
        assert_eq!(fresh.tcpping(defaults).interval, MAX_INTERVAL);
        assert_eq!(fresh.metrics_interval(u64::MAX), MAX_INTERVAL);

        let start = std::time::Instant::now();
        assert!(start.checked_add(MAX_INTERVAL).is_some());
    }

    #[tokio::test]
    async fn subscribers_are_notified() {
        let overlay = RuntimeOverlay::new();
        let mut changes = overlay.subscribe();
        overlay.apply(&ConfigPatch::default(), None);
        changes.changed().await.unwrap();
        assert_eq!(*changes.borrow(), 1);
    }

    #[test]
    fn shape_tracks_restart_relevant_fields() {
        let overlay = seeded();
        let before = overlay.tcpping(TcpPingDefaults::default());
        overlay.apply(
            &patch(r#"{"tcpping":{"enabled":true,"targets":[{"host":"a","port":1},{"host":"b","port":2}]}}"#),
            None,
        );
        let after = overlay.tcpping(TcpPingDefaults::default());
        assert_eq!(before.shape(), after.shape());
        assert_ne!(before.targets, after.targets);
    }
}
