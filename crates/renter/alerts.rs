//! Alert registry keyed by (module, message).
//!
//! Alerts describe persistent operational conditions, not events: a
//! condition registers the alert every maintenance pass it holds and
//! unregisters it on the first healthy pass.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub module: String,
    pub message: String,
    pub cause: String,
    pub severity: AlertSeverity,
}

#[derive(Debug, Default)]
pub struct Alerter {
    alerts: RwLock<HashMap<(String, String), Alert>>,
}

impl Alerter {
    pub fn new() -> Self {
        Alerter::default()
    }

    pub fn register(&self, module: &str, message: &str, cause: &str, severity: AlertSeverity) {
        let alert = Alert {
            module: module.to_string(),
            message: message.to_string(),
            cause: cause.to_string(),
            severity,
        };
        self.write()
            .insert((module.to_string(), message.to_string()), alert);
    }

    /// Clears an alert; no-op if it is not currently registered.
    pub fn unregister(&self, module: &str, message: &str) {
        self.write()
            .remove(&(module.to_string(), message.to_string()));
    }

    pub fn active(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.read().values().cloned().collect();
        alerts.sort_by(|a, b| (&a.module, &a.message).cmp(&(&b.module, &b.message)));
        alerts
    }

    pub fn is_registered(&self, module: &str, message: &str) -> bool {
        self.read()
            .contains_key(&(module.to_string(), message.to_string()))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<(String, String), Alert>> {
        self.alerts.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<(String, String), Alert>> {
        self.alerts.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_overwrites_and_unregister_clears() {
        let alerter = Alerter::new();
        alerter.register("contractor", "wallet locked", "maintenance", AlertSeverity::Warning);
        alerter.register("contractor", "wallet locked", "renewal", AlertSeverity::Critical);
        let active = alerter.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].severity, AlertSeverity::Critical);
        assert_eq!(active[0].cause, "renewal");

        alerter.unregister("contractor", "wallet locked");
        assert!(alerter.active().is_empty());
        // Unregistering twice is fine.
        alerter.unregister("contractor", "wallet locked");
    }

    #[test]
    fn alerts_key_on_module_and_message() {
        let alerter = Alerter::new();
        alerter.register("contractor", "low funds", "", AlertSeverity::Warning);
        alerter.register("watchdog", "low funds", "", AlertSeverity::Warning);
        assert_eq!(alerter.active().len(), 2);
        assert!(alerter.is_registered("watchdog", "low funds"));
    }
}
