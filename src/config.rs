//! Workload catalog: data model, defaults, YAML loading, and validation.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_LOG_LINES: usize = 30;
const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(15);
const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_TARGET_PORT: &str = "80";
const DEFAULT_REDIRECT_PATH: &str = "/";
const DEFAULT_ICON: &str = "box";

/// A single managed workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub name: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_target_port")]
    pub target_port: String,
    #[serde(default = "default_start_timeout", with = "humantime_serde")]
    pub start_timeout: Duration,
    #[serde(default, with = "humantime_serde")]
    pub idle_timeout: Duration,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default = "default_redirect_path")]
    pub redirect_path: String,
    #[serde(default = "default_icon")]
    pub icon: String,
    #[serde(default)]
    pub health_path: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

fn default_target_port() -> String {
    DEFAULT_TARGET_PORT.to_string()
}
fn default_start_timeout() -> Duration {
    DEFAULT_START_TIMEOUT
}
fn default_redirect_path() -> String {
    DEFAULT_REDIRECT_PATH.to_string()
}
fn default_icon() -> String {
    DEFAULT_ICON.to_string()
}

impl Workload {
    /// Applies the "zero means default" boundary rule: a start_timeout of
    /// zero (e.g. from a discovery label that failed to parse) is replaced
    /// with the default instead of producing a workload that never budgets
    /// time for its own start cycle.
    fn apply_boundary_defaults(&mut self) {
        if self.start_timeout.is_zero() {
            self.start_timeout = DEFAULT_START_TIMEOUT;
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum GroupStrategy {
    #[default]
    RoundRobin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub host: String,
    pub members: Vec<String>,
    #[serde(default)]
    pub strategy: GroupStrategy,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdminAuthKind {
    #[default]
    None,
    Basic,
    Bearer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AdminAuth {
    #[serde(default)]
    pub method: AdminAuthKind,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_lines")]
    pub log_lines: usize,
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
    #[serde(
        default = "default_discovery_interval",
        with = "humantime_serde"
    )]
    pub discovery_interval: Duration,
    #[serde(default)]
    pub admin_auth: AdminAuth,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_log_lines() -> usize {
    DEFAULT_LOG_LINES
}
fn default_discovery_interval() -> Duration {
    DEFAULT_DISCOVERY_INTERVAL
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            log_lines: DEFAULT_LOG_LINES,
            trusted_proxies: Vec::new(),
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
            admin_auth: AdminAuth::default(),
        }
    }
}

/// The YAML document's shape, deserialized as-is before defaults/validation
/// are applied. Kept separate from [`Config`] so that a partially-specified
/// document (the common case) round-trips through serde without every field
/// needing a manual `Option`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub containers: Vec<Workload>,
    #[serde(default)]
    pub groups: Vec<Group>,
}

impl RawConfig {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Applies field defaults and boundary rules, then validates.
    pub fn into_config(mut self) -> Result<Config, ConfigError> {
        for w in &mut self.containers {
            w.apply_boundary_defaults();
        }
        let config = Config {
            gateway: self.gateway,
            workloads: self.containers,
            groups: self.groups,
        };
        config.validate()?;
        Ok(config)
    }
}

/// A validated, ready-to-serve catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub gateway: GatewaySettings,
    pub workloads: Vec<Workload>,
    pub groups: Vec<Group>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("duplicate host {0:?}")]
    DuplicateHost(String),

    #[error("duplicate workload name {0:?}")]
    DuplicateWorkloadName(String),

    #[error("duplicate group name {0:?}")]
    DuplicateGroupName(String),

    #[error("workload {0:?} depends on itself")]
    SelfDependency(String),

    #[error("workload {0:?} depends on undefined workload {1:?}")]
    UnknownDependency(String, String),

    #[error("dependency cycle: {0}")]
    DependencyCycle(String),

    #[error("group {0:?} has no members")]
    EmptyGroup(String),

    #[error("group {0:?} member {1:?} is not a defined workload")]
    UnknownGroupMember(String, String),

    #[error("admin auth kind 'basic' requires a non-empty username and password")]
    IncompleteBasicAuth,

    #[error("admin auth kind 'bearer' requires a non-empty token")]
    IncompleteBearerAuth,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for w in &self.workloads {
            if !names.insert(w.name.as_str()) {
                return Err(ConfigError::DuplicateWorkloadName(w.name.clone()));
            }
        }

        let mut hosts = HashSet::new();
        for w in &self.workloads {
            if let Some(host) = w.host.as_deref().filter(|h| !h.is_empty()) {
                if !hosts.insert(host) {
                    return Err(ConfigError::DuplicateHost(host.to_string()));
                }
            }
        }

        let mut group_names = HashSet::new();
        for g in &self.groups {
            if !group_names.insert(g.name.as_str()) {
                return Err(ConfigError::DuplicateGroupName(g.name.clone()));
            }
            if !g.host.is_empty() && !hosts.insert(g.host.as_str()) {
                return Err(ConfigError::DuplicateHost(g.host.clone()));
            }
            if g.members.is_empty() {
                return Err(ConfigError::EmptyGroup(g.name.clone()));
            }
            for member in &g.members {
                if !names.contains(member.as_str()) {
                    return Err(ConfigError::UnknownGroupMember(
                        g.name.clone(),
                        member.clone(),
                    ));
                }
            }
        }

        for w in &self.workloads {
            for dep in &w.depends_on {
                if dep == &w.name {
                    return Err(ConfigError::SelfDependency(w.name.clone()));
                }
                if !names.contains(dep.as_str()) {
                    return Err(ConfigError::UnknownDependency(w.name.clone(), dep.clone()));
                }
            }
        }

        self.check_acyclic()?;

        match self.gateway.admin_auth.method {
            AdminAuthKind::None => {}
            AdminAuthKind::Basic => {
                if self.gateway.admin_auth.username.is_empty()
                    || self.gateway.admin_auth.password.is_empty()
                {
                    return Err(ConfigError::IncompleteBasicAuth);
                }
            }
            AdminAuthKind::Bearer => {
                if self.gateway.admin_auth.token.is_empty() {
                    return Err(ConfigError::IncompleteBearerAuth);
                }
            }
        }

        Ok(())
    }

    /// Three-colour DFS cycle detector. Returns a human-readable path
    /// through the cycle on failure, e.g. `"app -> api -> db -> app"`.
    fn check_acyclic(&self) -> Result<(), ConfigError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Colour {
            Unvisited,
            Visiting,
            Visited,
        }

        let deps: HashMap<&str, &[String]> = self
            .workloads
            .iter()
            .map(|w| (w.name.as_str(), w.depends_on.as_slice()))
            .collect();

        let mut colour: HashMap<&str, Colour> = self
            .workloads
            .iter()
            .map(|w| (w.name.as_str(), Colour::Unvisited))
            .collect();

        fn visit<'a>(
            name: &'a str,
            deps: &HashMap<&'a str, &'a [String]>,
            colour: &mut HashMap<&'a str, Colour>,
            path: &mut Vec<&'a str>,
        ) -> Result<(), ConfigError> {
            match colour.get(name).copied().unwrap_or(Colour::Visited) {
                Colour::Visited => return Ok(()),
                Colour::Visiting => {
                    path.push(name);
                    let cycle_start = path.iter().position(|n| *n == name).unwrap_or(0);
                    let cycle = path[cycle_start..].join(" -> ");
                    return Err(ConfigError::DependencyCycle(cycle));
                }
                Colour::Unvisited => {}
            }
            colour.insert(name, Colour::Visiting);
            path.push(name);
            if let Some(children) = deps.get(name) {
                for child in children.iter() {
                    visit(child.as_str(), deps, colour, path)?;
                }
            }
            path.pop();
            colour.insert(name, Colour::Visited);
            Ok(())
        }

        for w in &self.workloads {
            let mut path = Vec::new();
            visit(w.name.as_str(), &deps, &mut colour, &mut path)?;
        }
        Ok(())
    }

    pub fn workload_by_name(&self, name: &str) -> Option<&Workload> {
        self.workloads.iter().find(|w| w.name == name)
    }
}

impl fmt::Display for AdminAuthKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AdminAuthKind::None => "none",
            AdminAuthKind::Basic => "basic",
            AdminAuthKind::Bearer => "bearer",
        };
        f.write_str(s)
    }
}

/// Environment overrides applied after YAML parsing, before validation —
/// the port and admin-auth fields stay bound at startup per the hot-reload
/// boundary (§9), but *initial* values may come from the environment.
pub fn apply_env_overrides(raw: &mut RawConfig) {
    if let Ok(v) = std::env::var("GATEWAY_ADMIN_USER") {
        raw.gateway.admin_auth.username = v;
    }
    if let Ok(v) = std::env::var("GATEWAY_ADMIN_PASS") {
        raw.gateway.admin_auth.password = v;
    }
    if let Ok(v) = std::env::var("GATEWAY_ADMIN_TOKEN") {
        raw.gateway.admin_auth.token = v;
    }
    if let Ok(v) = std::env::var("GATEWAY_DISCOVERY_INTERVAL") {
        if let Ok(d) = humantime::parse_duration(&v) {
            raw.gateway.discovery_interval = d;
        } else {
            tracing::warn!(value = %v, "ignoring unparseable GATEWAY_DISCOVERY_INTERVAL");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workload(name: &str, host: Option<&str>) -> Workload {
        Workload {
            name: name.to_string(),
            host: host.map(str::to_string),
            target_port: default_target_port(),
            start_timeout: DEFAULT_START_TIMEOUT,
            idle_timeout: Duration::ZERO,
            network: None,
            redirect_path: default_redirect_path(),
            icon: default_icon(),
            health_path: None,
            depends_on: Vec::new(),
        }
    }

    #[test]
    fn duplicate_host_is_rejected_with_offending_host() {
        let config = Config {
            gateway: GatewaySettings::default(),
            workloads: vec![
                workload("a", Some("app.localhost")),
                workload("b", Some("app.localhost")),
            ],
            groups: vec![],
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateHost(h) if h == "app.localhost"));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let mut a = workload("a", Some("a.localhost"));
        a.depends_on = vec!["a".to_string()];
        let config = Config {
            gateway: GatewaySettings::default(),
            workloads: vec![a],
            groups: vec![],
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::SelfDependency(n) if n == "a"
        ));
    }

    #[test]
    fn dependency_cycle_reports_path() {
        let mut a = workload("app", Some("app.localhost"));
        a.depends_on = vec!["api".to_string()];
        let mut b = workload("api", None);
        b.depends_on = vec!["db".to_string()];
        let mut c = workload("db", None);
        c.depends_on = vec!["app".to_string()];
        let config = Config {
            gateway: GatewaySettings::default(),
            workloads: vec![a, b, c],
            groups: vec![],
        };
        let err = config.validate().unwrap_err();
        match err {
            ConfigError::DependencyCycle(path) => {
                assert!(path.contains("app"));
                assert!(path.contains("api"));
                assert!(path.contains("db"));
            }
            other => panic!("expected DependencyCycle, got {other:?}"),
        }
    }

    #[test]
    fn group_with_unknown_member_is_rejected() {
        let config = Config {
            gateway: GatewaySettings::default(),
            workloads: vec![workload("api-1", None)],
            groups: vec![Group {
                name: "cluster".to_string(),
                host: "api.localhost".to_string(),
                members: vec!["api-1".to_string(), "api-2".to_string()],
                strategy: GroupStrategy::RoundRobin,
            }],
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::UnknownGroupMember(_, m) if m == "api-2"
        ));
    }

    #[test]
    fn empty_depends_on_is_fine() {
        let config = Config {
            gateway: GatewaySettings::default(),
            workloads: vec![workload("solo", Some("solo.localhost"))],
            groups: vec![],
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_start_timeout_falls_back_to_default() {
        let raw = RawConfig {
            gateway: GatewaySettings::default(),
            containers: vec![Workload {
                start_timeout: Duration::ZERO,
                ..workload("app", Some("app.localhost"))
            }],
            groups: vec![],
        };
        let config = raw.into_config().unwrap();
        assert_eq!(
            config.workloads[0].start_timeout,
            DEFAULT_START_TIMEOUT
        );
    }

    #[test]
    fn basic_auth_requires_credentials() {
        let config = Config {
            gateway: GatewaySettings {
                admin_auth: AdminAuth {
                    method: AdminAuthKind::Basic,
                    username: String::new(),
                    password: String::new(),
                    token: String::new(),
                },
                ..GatewaySettings::default()
            },
            workloads: vec![],
            groups: vec![],
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::IncompleteBasicAuth
        ));
    }

    #[test]
    fn round_trip_preserves_semantic_content() {
        let config = Config {
            gateway: GatewaySettings::default(),
            workloads: vec![workload("app", Some("app.localhost"))],
            groups: vec![],
        };
        let yaml = serde_yaml::to_string(&config).unwrap();
        let reparsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config, reparsed);
    }
}
