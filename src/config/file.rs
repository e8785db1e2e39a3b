//! Optional YAML configuration file
//!
//! ```yaml
//! load-balancers:
//!   - name: nlb-a
//!     host: nlb-a.elb.us-west-1.amazonaws.com
//! ports:
//!   start: 9000
//!   end: 9049
//! region: us-west-1
//! vpc-id: vpc-0abc
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{ConfigError, LoadBalancer, PortRange};

/// Settings as written in the config file; everything is optional so the
/// command line can fill the gaps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConfigFile {
    #[serde(default)]
    pub load_balancers: Vec<LoadBalancer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<PortRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

// ============================================================================
// SBIO: Pure parsing
// ============================================================================

pub fn parse_config_file(content: &str) -> Result<ConfigFile, ConfigError> {
    Ok(serde_yaml::from_str(content)?)
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

pub fn load_config_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config_file(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_config_file() {
        let file = create_temp_file(
            r#"
load-balancers:
  - name: nlb-a
    host: a.example.com
  - name: nlb-b
    host: b.example.com
vpc-id: vpc-0abc
"#,
        );

        let config = load_config_file(file.path()).unwrap();
        assert_eq!(config.load_balancers.len(), 2);
        assert_eq!(config.load_balancers[1].host, "b.example.com");
        assert_eq!(config.vpc_id.as_deref(), Some("vpc-0abc"));
        assert!(config.ports.is_none());
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = load_config_file(Path::new("/nonexistent/controller.yaml"));
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let result = parse_config_file("load-balancers: [name: oops");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}
