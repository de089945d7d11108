//! Discovery Merger (C3): periodically merges label-annotated containers
//! into the static catalog and hands the result to the Server on change.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, Workload};
use crate::runtime::RuntimeAdapter;

/// Merges `discovered` containers into `static_catalog`: static entries come
/// first; a dynamic entry is added only if neither its host nor its name
/// collides with an entry already present (static-vs-dynamic and
/// dynamic-vs-dynamic alike — first one in wins). Collisions are logged at
/// debug and skipped. Global settings always come from the static catalog.
pub fn merge(static_catalog: &Config, discovered: &[crate::runtime::DiscoveredWorkload]) -> Config {
    let mut names: std::collections::HashSet<String> =
        static_catalog.workloads.iter().map(|w| w.name.clone()).collect();
    let mut hosts: std::collections::HashSet<String> = static_catalog
        .workloads
        .iter()
        .filter_map(|w| w.host.clone())
        .filter(|h| !h.is_empty())
        .collect();
    hosts.extend(
        static_catalog
            .groups
            .iter()
            .map(|g| g.host.clone())
            .filter(|h| !h.is_empty()),
    );

    let mut workloads = static_catalog.workloads.clone();
    for d in discovered {
        if names.contains(&d.name) || hosts.contains(&d.host) {
            tracing::debug!(name = %d.name, host = %d.host, "discovery: skipping colliding entry");
            continue;
        }
        names.insert(d.name.clone());
        hosts.insert(d.host.clone());
        workloads.push(discovered_to_workload(d));
    }

    Config {
        gateway: static_catalog.gateway.clone(),
        workloads,
        groups: static_catalog.groups.clone(),
    }
}

fn discovered_to_workload(d: &crate::runtime::DiscoveredWorkload) -> Workload {
    Workload {
        name: d.name.clone(),
        host: Some(d.host.clone()),
        target_port: d.target_port.clone().unwrap_or_else(|| "80".to_string()),
        start_timeout: d.start_timeout.unwrap_or(std::time::Duration::from_secs(60)),
        idle_timeout: d.idle_timeout.unwrap_or(std::time::Duration::ZERO),
        network: d.network.clone(),
        redirect_path: d.redirect_path.clone().unwrap_or_else(|| "/".to_string()),
        icon: d.icon.clone().unwrap_or_else(|| "box".to_string()),
        health_path: d.health_path.clone(),
        depends_on: d.depends_on.clone(),
    }
}

/// Drives the polling loop. `reload_callback` is invoked with the new
/// [`Config`] only when the merged, validated catalog structurally differs
/// from the last one successfully delivered.
pub struct DiscoveryMerger {
    runtime: Arc<dyn RuntimeAdapter>,
    static_catalog: Mutex<Config>,
    last_delivered: Mutex<Option<Config>>,
    notify: Notify,
}

impl DiscoveryMerger {
    pub fn new(runtime: Arc<dyn RuntimeAdapter>, static_catalog: Config) -> Self {
        Self {
            runtime,
            static_catalog: Mutex::new(static_catalog),
            last_delivered: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// An external "reload" signal: replaces the static catalog, clears the
    /// last-delivered cache (so the next pass always swaps), and wakes the
    /// loop immediately instead of waiting for the next tick.
    pub fn reload(&self, new_static: Config) {
        *self.static_catalog.lock() = new_static;
        *self.last_delivered.lock() = None;
        self.notify.notify_one();
    }

    /// Runs one discovery pass: list, merge, validate, and — on change —
    /// hand the result to `on_change`. Returns `Some(config)` only when a
    /// swap should happen.
    pub async fn pass(&self) -> Option<Config> {
        let discovered = match self.runtime.list_labeled().await {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "discovery: failed to list labelled containers");
                return None;
            }
        };

        let static_catalog = self.static_catalog.lock().clone();
        let merged = merge(&static_catalog, &discovered);

        if let Err(e) = merged.validate() {
            tracing::warn!(error = %e, "discovery: merged catalog failed validation, retaining previous view");
            return None;
        }

        let mut last = self.last_delivered.lock();
        if last.as_ref() == Some(&merged) {
            return None;
        }
        *last = Some(merged.clone());
        Some(merged)
    }

    pub async fn run(
        self: Arc<Self>,
        interval: std::time::Duration,
        cancel: CancellationToken,
        on_change: impl Fn(Config) + Send + Sync + 'static,
    ) {
        if let Some(config) = self.pass().await {
            on_change(config);
        }
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // consume the immediate first tick
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(config) = self.pass().await {
                        on_change(config);
                    }
                }
                _ = self.notify.notified() => {
                    if let Some(config) = self.pass().await {
                        on_change(config);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewaySettings;
    use crate::runtime::DiscoveredWorkload;
    use std::time::Duration;

    fn workload(name: &str, host: &str) -> Workload {
        Workload {
            name: name.to_string(),
            host: Some(host.to_string()),
            target_port: "80".to_string(),
            start_timeout: Duration::from_secs(60),
            idle_timeout: Duration::ZERO,
            network: None,
            redirect_path: "/".to_string(),
            icon: "box".to_string(),
            health_path: None,
            depends_on: vec![],
        }
    }

    fn discovered(name: &str, host: &str) -> DiscoveredWorkload {
        DiscoveredWorkload {
            name: name.to_string(),
            host: host.to_string(),
            target_port: None,
            start_timeout: None,
            idle_timeout: None,
            network: None,
            redirect_path: None,
            icon: None,
            health_path: None,
            depends_on: vec![],
        }
    }

    #[test]
    fn static_entries_win_over_colliding_dynamic_entries() {
        let static_catalog = Config {
            gateway: GatewaySettings::default(),
            workloads: vec![workload("app", "app.localhost")],
            groups: vec![],
        };
        let merged = merge(&static_catalog, &[discovered("app", "other.localhost")]);
        assert_eq!(merged.workloads.len(), 1);
        assert_eq!(merged.workloads[0].host.as_deref(), Some("app.localhost"));
    }

    #[test]
    fn non_colliding_dynamic_entry_is_added() {
        let static_catalog = Config {
            gateway: GatewaySettings::default(),
            workloads: vec![workload("app", "app.localhost")],
            groups: vec![],
        };
        let merged = merge(&static_catalog, &[discovered("extra", "extra.localhost")]);
        assert_eq!(merged.workloads.len(), 2);
    }

    #[test]
    fn first_dynamic_entry_wins_among_dynamic_collisions() {
        let static_catalog = Config {
            gateway: GatewaySettings::default(),
            workloads: vec![],
            groups: vec![],
        };
        let merged = merge(
            &static_catalog,
            &[
                discovered("dup", "one.localhost"),
                discovered("dup", "two.localhost"),
            ],
        );
        assert_eq!(merged.workloads.len(), 1);
        assert_eq!(merged.workloads[0].host.as_deref(), Some("one.localhost"));
    }
}
