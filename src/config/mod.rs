pub mod file;
pub mod pool;
pub mod scope;

pub use file::{load_config_file, parse_config_file, ConfigFile};
pub use pool::{parse_nlb_list, LoadBalancer, PoolConfig, PortRange};
pub use scope::ProviderScope;

use thiserror::Error;

/// Errors raised while assembling the controller configuration.
///
/// Every variant is fatal at start-up: the controller refuses to run with a
/// pool it cannot trust.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("No load balancers configured")]
    EmptyPool,

    #[error("Malformed load balancer entry '{0}': expected name:host")]
    MalformedEntry(String),

    #[error("Load balancer '{0}' is configured more than once")]
    DuplicateLoadBalancer(String),

    #[error("Invalid port range {0}-{1}")]
    InvalidPortRange(u16, u16),

    #[error("Missing required setting: {0}")]
    MissingSetting(&'static str),

    #[error("No provider gateway selected; pass --provider")]
    ProviderNotSelected,

    #[error("The {0} provider only simulates load balancers; pass --simulate to run it against a cluster")]
    SimulationNotConfirmed(&'static str),
}

/// Fully resolved configuration handed to the controller at start-up.
#[derive(Debug, Clone)]
pub struct Settings {
    pub pool: PoolConfig,
    pub scope: ProviderScope,
}

/// Values supplied on the command line or through the environment.
///
/// Any value present here wins over the config file.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub nlb_list: Option<String>,
    pub port_start: Option<u16>,
    pub port_end: Option<u16>,
    pub region: Option<String>,
    pub vpc_id: Option<String>,
}

impl Settings {
    /// Merge overrides on top of an optional config file and validate the result.
    pub fn resolve(
        overrides: SettingsOverrides,
        file: Option<ConfigFile>,
    ) -> Result<Self, ConfigError> {
        let file = file.unwrap_or_default();

        let load_balancers = match overrides.nlb_list.as_deref() {
            Some(list) => parse_nlb_list(list)?,
            None => file.load_balancers,
        };

        let file_ports = file.ports.unwrap_or_default();
        let ports = PortRange::new(
            overrides.port_start.unwrap_or(file_ports.start),
            overrides.port_end.unwrap_or(file_ports.end),
        )?;

        let pool = PoolConfig::new(load_balancers, ports)?;

        let vpc_id = overrides
            .vpc_id
            .or(file.vpc_id)
            .ok_or(ConfigError::MissingSetting("vpc-id"))?;
        let mut scope = ProviderScope::new(vpc_id)?;
        if let Some(region) = overrides.region.or(file.region) {
            scope = scope.with_region(region);
        }
        if let Some(protocol) = file.protocol {
            scope = scope.with_protocol(protocol);
        }

        Ok(Self { pool, scope })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides(list: &str) -> SettingsOverrides {
        SettingsOverrides {
            nlb_list: Some(list.to_string()),
            vpc_id: Some("vpc-123".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_from_overrides() {
        let settings = Settings::resolve(overrides("lb1:lb1.example.com"), None).unwrap();

        assert_eq!(settings.pool.load_balancers.len(), 1);
        assert_eq!(settings.pool.ports, PortRange::default());
        assert_eq!(settings.scope.vpc_id, "vpc-123");
        assert_eq!(settings.scope.region, scope::DEFAULT_REGION);
    }

    #[test]
    fn test_overrides_win_over_file() {
        let file = parse_config_file(
            r#"
load-balancers:
  - name: from-file
    host: file.example.com
ports:
  start: 7000
  end: 7010
region: eu-west-1
vpc-id: vpc-file
"#,
        )
        .unwrap();

        let mut ov = overrides("lb1:lb1.example.com");
        ov.port_end = Some(7001);

        let settings = Settings::resolve(ov, Some(file)).unwrap();
        assert_eq!(settings.pool.load_balancers[0].name, "lb1");
        assert_eq!(settings.pool.ports, PortRange { start: 7000, end: 7001 });
        assert_eq!(settings.scope.region, "eu-west-1");
        assert_eq!(settings.scope.vpc_id, "vpc-123");
    }

    #[test]
    fn test_missing_vpc_is_fatal() {
        let ov = SettingsOverrides {
            nlb_list: Some("lb1:host".to_string()),
            ..Default::default()
        };
        let result = Settings::resolve(ov, None);
        assert!(matches!(result, Err(ConfigError::MissingSetting("vpc-id"))));
    }

    #[test]
    fn test_empty_configuration_is_fatal() {
        let ov = SettingsOverrides {
            vpc_id: Some("vpc-123".to_string()),
            ..Default::default()
        };
        let result = Settings::resolve(ov, None);
        assert!(matches!(result, Err(ConfigError::EmptyPool)));
    }
}
