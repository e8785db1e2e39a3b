use clap::{ArgAction, Parser, ValueEnum};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{ConfigError, Settings, SettingsOverrides};
use crate::reconciler::RetryPolicy;

/// Load balancer gateway implementations the binary can drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProviderKind {
    /// In-process simulation; creates nothing outside the controller
    Memory,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Memory => "memory",
        }
    }

    /// Bindings it hands out do not route any traffic
    pub fn is_simulation(&self) -> bool {
        matches!(self, ProviderKind::Memory)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Parser, Debug)]
#[command(name = "nlb-controller")]
#[command(about = "Expose NodePort services through pooled network load balancer listeners")]
#[command(version)]
pub struct Args {
    /// Load balancer pool as name:host[,name:host...]
    #[arg(long, env = "NLB_LIST", value_name = "LIST")]
    pub nlb_list: Option<String>,

    /// Network the backend groups live in
    #[arg(long, env = "VPC_ID", value_name = "ID")]
    pub vpc_id: Option<String>,

    /// Provider region
    #[arg(long, env = "AWS_REGION", value_name = "REGION")]
    pub region: Option<String>,

    /// First external port handed out on every load balancer
    #[arg(long, value_name = "PORT")]
    pub port_start: Option<u16>,

    /// Last external port handed out on every load balancer
    #[arg(long, value_name = "PORT")]
    pub port_end: Option<u16>,

    /// Path to a YAML config file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Path to a .env file
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    /// Load balancer gateway to drive
    #[arg(long, env = "NLB_PROVIDER", value_enum, value_name = "KIND")]
    pub provider: Option<ProviderKind>,

    /// Confirm that a simulated gateway may write bindings to real services
    #[arg(long)]
    pub simulate: bool,

    /// Only watch services in this namespace (default: all namespaces)
    #[arg(long, value_name = "NAMESPACE")]
    pub namespace: Option<String>,

    /// Address of the status endpoint
    #[arg(long, default_value = "0.0.0.0:8080", value_name = "ADDR")]
    pub status_addr: SocketAddr,

    /// Delay before the first retry, in seconds
    #[arg(long, default_value = "5")]
    pub retry_base_secs: u64,

    /// Upper bound for the retry delay, in seconds
    #[arg(long, default_value = "300")]
    pub retry_max_secs: u64,

    /// Consecutive failed passes before a service is left alone until it changes
    #[arg(long, value_name = "N")]
    pub max_attempts: Option<u32>,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Dry-run mode: resolve and print the pool without running
    #[arg(long)]
    pub dry_run: bool,
}

impl Args {
    pub fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            nlb_list: self.nlb_list.clone(),
            port_start: self.port_start,
            port_end: self.port_end,
            region: self.region.clone(),
            vpc_id: self.vpc_id.clone(),
        }
    }

    /// The selected gateway, refusing a simulation that was not confirmed
    pub fn provider_kind(&self) -> Result<ProviderKind, ConfigError> {
        let kind = self.provider.ok_or(ConfigError::ProviderNotSelected)?;
        if kind.is_simulation() && !self.simulate {
            return Err(ConfigError::SimulationNotConfirmed(kind.as_str()));
        }
        Ok(kind)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::new(
            Duration::from_secs(self.retry_base_secs),
            Duration::from_secs(self.retry_max_secs),
        );
        match self.max_attempts {
            Some(n) => policy.with_max_attempts(n),
            None => policy,
        }
    }
}

// ============================================================================
// SBIO: Pure display logic (no I/O - returns formatted strings)
// ============================================================================

/// Format a dry-run output showing the resolved pool.
/// Pure function - returns a formatted string.
pub fn format_dry_run(settings: &Settings, args: &Args) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "nlb-controller v{} - Dry Run Mode\n\n",
        env!("CARGO_PKG_VERSION")
    ));

    let pool = &settings.pool;
    output.push_str(&format!(
        "Load balancers ({}):\n",
        pool.load_balancers.len()
    ));
    for lb in &pool.load_balancers {
        output.push_str(&format!("  - {} ({})\n", lb.name, lb.host));
    }
    output.push('\n');

    output.push_str(&format!(
        "Ports: {}-{} ({} per load balancer, {} total)\n",
        pool.ports.start,
        pool.ports.end,
        pool.ports.len(),
        pool.capacity()
    ));

    let scope = &settings.scope;
    output.push_str(&format!(
        "Provider: region={} vpc={} protocol={}\n",
        scope.region, scope.vpc_id, scope.protocol
    ));

    match args.provider_kind() {
        Ok(kind) if kind.is_simulation() => output.push_str(&format!(
            "Gateway: {} (SIMULATION: bindings route no traffic)\n",
            kind
        )),
        Ok(kind) => output.push_str(&format!("Gateway: {}\n", kind)),
        Err(e) => output.push_str(&format!("Gateway: {}\n", e)),
    }

    output.push_str(&format!(
        "Watch: {}\n",
        args.namespace.as_deref().unwrap_or("all namespaces")
    ));
    output.push_str(&format!("Status endpoint: {}\n", args.status_addr));

    let retry = args.retry_policy();
    let attempts = retry
        .max_attempts
        .map(|n| n.to_string())
        .unwrap_or_else(|| "unlimited".to_string());
    output.push_str(&format!(
        "Retry: {}s base, {}s max, attempts {}\n",
        retry.base_delay.as_secs(),
        retry.max_delay.as_secs(),
        attempts
    ));

    output.push_str("\nValidation: PASSED\n");
    output
}
