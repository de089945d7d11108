//! Pure transform from a validated [`Config`] into routing dictionaries.
//!
//! Kept free of references: every index maps to an owned [`Workload`]/[`Group`]
//! clone, never a borrow, so an [`Indices`] can be swapped into an
//! [`arc_swap::ArcSwap`] and outlive the [`Config`] it was built from.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{Config, ConfigError, Group, Workload};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Indices {
    pub host_to_workload: HashMap<String, Arc<Workload>>,
    pub host_to_group: HashMap<String, Arc<Group>>,
    pub name_to_workload: HashMap<String, Arc<Workload>>,
    pub config: Arc<Config>,
}

impl Indices {
    pub fn build(config: Config) -> Self {
        let config = Arc::new(config);
        let mut name_to_workload = HashMap::new();
        let mut host_to_workload = HashMap::new();
        for w in &config.workloads {
            let w = Arc::new(w.clone());
            name_to_workload.insert(w.name.clone(), Arc::clone(&w));
            if let Some(host) = w.host.as_deref().filter(|h| !h.is_empty()) {
                host_to_workload.insert(host.to_string(), w);
            }
        }

        let mut host_to_group = HashMap::new();
        for g in &config.groups {
            if !g.host.is_empty() {
                host_to_group.insert(g.host.clone(), Arc::new(g.clone()));
            }
        }

        Self {
            host_to_workload,
            host_to_group,
            name_to_workload,
            config,
        }
    }

    /// Dependencies of `target` in visit order, with `target` last.
    ///
    /// DFS with unvisited/visiting/visited colouring; re-entering a
    /// `visiting` node means a cycle slipped past validation (shouldn't
    /// happen for a [`Config`] that passed [`Config::validate`], but
    /// discovery-merged catalogs are re-validated independently so this
    /// stays defensive).
    pub fn topo(&self, target: &str) -> Result<Vec<String>, ConfigError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Colour {
            Unvisited,
            Visiting,
            Visited,
        }

        let mut colour: HashMap<&str, Colour> = self
            .name_to_workload
            .keys()
            .map(|n| (n.as_str(), Colour::Unvisited))
            .collect();
        let mut order = Vec::new();
        let mut path: Vec<String> = Vec::new();

        fn visit(
            name: &str,
            index: &Indices,
            colour: &mut HashMap<&str, Colour>,
            order: &mut Vec<String>,
            path: &mut Vec<String>,
        ) -> Result<(), ConfigError> {
            match colour.get(name).copied() {
                Some(Colour::Visited) => return Ok(()),
                Some(Colour::Visiting) => {
                    path.push(name.to_string());
                    let start = path.iter().position(|n| n == name).unwrap_or(0);
                    return Err(ConfigError::DependencyCycle(path[start..].join(" -> ")));
                }
                Some(Colour::Unvisited) => {}
                None => {
                    return Err(ConfigError::UnknownDependency(
                        path.last().cloned().unwrap_or_default(),
                        name.to_string(),
                    ))
                }
            }
            colour.insert(
                index
                    .name_to_workload
                    .get_key_value(name)
                    .map(|(k, _)| k.as_str())
                    .unwrap_or(name),
                Colour::Visiting,
            );
            path.push(name.to_string());
            let deps = index
                .name_to_workload
                .get(name)
                .map(|w| w.depends_on.clone())
                .unwrap_or_default();
            for dep in &deps {
                visit(dep, index, colour, order, path)?;
            }
            path.pop();
            colour.insert(
                index
                    .name_to_workload
                    .get_key_value(name)
                    .map(|(k, _)| k.as_str())
                    .unwrap_or(name),
                Colour::Visited,
            );
            order.push(name.to_string());
            Ok(())
        }

        visit(target, self, &mut colour, &mut order, &mut path)?;
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewaySettings, GroupStrategy};
    use std::time::Duration;

    fn workload(name: &str, depends_on: &[&str]) -> Workload {
        Workload {
            name: name.to_string(),
            host: Some(format!("{name}.localhost")),
            target_port: "80".to_string(),
            start_timeout: Duration::from_secs(60),
            idle_timeout: Duration::ZERO,
            network: None,
            redirect_path: "/".to_string(),
            icon: "box".to_string(),
            health_path: None,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn topo_orders_dependencies_before_target_and_target_last() {
        let config = Config {
            gateway: GatewaySettings::default(),
            workloads: vec![
                workload("app", &["api"]),
                workload("api", &["db"]),
                workload("db", &[]),
            ],
            groups: vec![],
        };
        let indices = Indices::build(config);
        let order = indices.topo("app").unwrap();
        assert_eq!(order, vec!["db", "api", "app"]);
    }

    #[test]
    fn topo_with_no_dependencies_has_no_prefix() {
        let config = Config {
            gateway: GatewaySettings::default(),
            workloads: vec![workload("solo", &[])],
            groups: vec![],
        };
        let indices = Indices::build(config);
        assert_eq!(indices.topo("solo").unwrap(), vec!["solo"]);
    }

    #[test]
    fn empty_hosts_are_excluded_from_host_index() {
        let mut member = workload("api-1", &[]);
        member.host = None;
        let config = Config {
            gateway: GatewaySettings::default(),
            workloads: vec![member],
            groups: vec![Group {
                name: "cluster".to_string(),
                host: "api.localhost".to_string(),
                members: vec!["api-1".to_string()],
                strategy: GroupStrategy::RoundRobin,
            }],
        };
        let indices = Indices::build(config);
        assert!(!indices.host_to_workload.contains_key(""));
        assert!(indices.name_to_workload.contains_key("api-1"));
        assert!(indices.host_to_group.contains_key("api.localhost"));
    }
}
