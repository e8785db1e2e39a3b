//! Load balancer pool configuration
//!
//! The pool is static input: an ordered list of named load balancers, each
//! reachable on a fixed host, and one inclusive port range shared by all of
//! them. Only the occupancy of each port changes at runtime, and that lives in
//! the allocation ledger.

use std::collections::HashSet;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use super::ConfigError;

pub const DEFAULT_PORT_START: u16 = 9000;
pub const DEFAULT_PORT_END: u16 = 9049;

/// Inclusive range of external ports drawn from on every load balancer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, ConfigError> {
        if start > end {
            return Err(ConfigError::InvalidPortRange(start, end));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    /// Ports in ascending order
    pub fn ports(&self) -> RangeInclusive<u16> {
        self.start..=self.end
    }

    pub fn len(&self) -> usize {
        if self.start > self.end {
            return 0;
        }
        usize::from(self.end - self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: DEFAULT_PORT_START,
            end: DEFAULT_PORT_END,
        }
    }
}

/// A named load balancer and the host clients use to reach it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub name: String,
    pub host: String,
}

impl LoadBalancer {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
        }
    }
}

/// The validated, ordered pool of load balancers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolConfig {
    pub load_balancers: Vec<LoadBalancer>,
    pub ports: PortRange,
}

impl PoolConfig {
    pub fn new(load_balancers: Vec<LoadBalancer>, ports: PortRange) -> Result<Self, ConfigError> {
        let pool = Self {
            load_balancers,
            ports,
        };
        pool.validate()?;
        Ok(pool)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.load_balancers.is_empty() {
            return Err(ConfigError::EmptyPool);
        }
        if self.ports.start > self.ports.end {
            return Err(ConfigError::InvalidPortRange(self.ports.start, self.ports.end));
        }

        let mut seen = HashSet::new();
        for lb in &self.load_balancers {
            if lb.name.trim().is_empty() || lb.host.trim().is_empty() {
                return Err(ConfigError::MalformedEntry(format!("{}:{}", lb.name, lb.host)));
            }
            if !seen.insert(lb.name.as_str()) {
                return Err(ConfigError::DuplicateLoadBalancer(lb.name.clone()));
            }
        }
        Ok(())
    }

    pub fn host_of(&self, name: &str) -> Option<&str> {
        self.load_balancers
            .iter()
            .find(|lb| lb.name == name)
            .map(|lb| lb.host.as_str())
    }

    pub fn contains(&self, name: &str, port: u16) -> bool {
        self.ports.contains(port) && self.host_of(name).is_some()
    }

    /// Total number of (load balancer, port) pairs
    pub fn capacity(&self) -> usize {
        self.load_balancers.len() * self.ports.len()
    }
}

/// Parse a comma separated `name:host` list, e.g. the `NLB_LIST` variable.
///
/// Blank segments are ignored so a trailing comma is harmless. The host may
/// itself contain colons; only the first one separates name from host.
pub fn parse_nlb_list(input: &str) -> Result<Vec<LoadBalancer>, ConfigError> {
    let mut load_balancers = Vec::new();

    for entry in input.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, host) = entry
            .split_once(':')
            .ok_or_else(|| ConfigError::MalformedEntry(entry.to_string()))?;
        let (name, host) = (name.trim(), host.trim());
        if name.is_empty() || host.is_empty() {
            return Err(ConfigError::MalformedEntry(entry.to_string()));
        }
        load_balancers.push(LoadBalancer::new(name, host));
    }

    if load_balancers.is_empty() {
        return Err(ConfigError::EmptyPool);
    }
    Ok(load_balancers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nlb_list() {
        let lbs = parse_nlb_list("lb1:lb1.elb.amazonaws.com, lb2:lb2.elb.amazonaws.com").unwrap();
        assert_eq!(lbs.len(), 2);
        assert_eq!(lbs[0], LoadBalancer::new("lb1", "lb1.elb.amazonaws.com"));
        assert_eq!(lbs[1].name, "lb2");
    }

    #[test]
    fn test_parse_keeps_order_and_trailing_comma() {
        let lbs = parse_nlb_list("zeta:z.example,alpha:a.example,").unwrap();
        let names: Vec<_> = lbs.iter().map(|lb| lb.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
    }

    #[test]
    fn test_parse_host_with_port() {
        let lbs = parse_nlb_list("lb1:10.0.0.1:443").unwrap();
        assert_eq!(lbs[0].host, "10.0.0.1:443");
    }

    #[test]
    fn test_parse_malformed_entry() {
        assert!(matches!(
            parse_nlb_list("lb1"),
            Err(ConfigError::MalformedEntry(_))
        ));
        assert!(matches!(
            parse_nlb_list(":host"),
            Err(ConfigError::MalformedEntry(_))
        ));
        assert!(matches!(
            parse_nlb_list("lb1:"),
            Err(ConfigError::MalformedEntry(_))
        ));
    }

    #[test]
    fn test_parse_empty_list() {
        assert!(matches!(parse_nlb_list(""), Err(ConfigError::EmptyPool)));
        assert!(matches!(parse_nlb_list(" , "), Err(ConfigError::EmptyPool)));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let lbs = parse_nlb_list("lb1:a,lb1:b").unwrap();
        let result = PoolConfig::new(lbs, PortRange::default());
        assert!(matches!(result, Err(ConfigError::DuplicateLoadBalancer(name)) if name == "lb1"));
    }

    #[test]
    fn test_port_range() {
        let range = PortRange::default();
        assert_eq!(range.len(), 50);
        assert!(range.contains(9000));
        assert!(range.contains(9049));
        assert!(!range.contains(9050));

        assert!(matches!(
            PortRange::new(9010, 9000),
            Err(ConfigError::InvalidPortRange(9010, 9000))
        ));
        assert_eq!(PortRange::new(9000, 9000).unwrap().len(), 1);
    }

    #[test]
    fn test_pool_lookup() {
        let pool = PoolConfig::new(
            vec![LoadBalancer::new("lb1", "h1"), LoadBalancer::new("lb2", "h2")],
            PortRange::new(9000, 9001).unwrap(),
        )
        .unwrap();

        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.host_of("lb2"), Some("h2"));
        assert_eq!(pool.host_of("lb3"), None);
        assert!(pool.contains("lb1", 9001));
        assert!(!pool.contains("lb1", 9002));
        assert!(!pool.contains("lb3", 9000));
    }
}
