use std::time::Duration;

use serde::Deserialize;

pub const ENV_PREFIX: &str = "CORRAL";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub conductor: ConductorConfig,
    pub database: DatabaseConfig,
    pub quotas: QuotasConfig,
    pub drivers: DriversConfig,
    pub limits: LimitsConfig,
    /// Seconds without a heartbeat before a conductor counts as down.
    /// Must exceed twice the heartbeat period.
    pub service_down_time_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConductorConfig {
    /// RPC routing key this conductor consumes.
    pub topic: String,
    /// Local identity; doubles as the lock owner id.
    pub host: String,
    /// RPC listener port.
    pub port: u16,
    /// Base URL peers use to reach this conductor's listener. Derived from
    /// host and port when empty.
    #[serde(default)]
    pub endpoint: String,
    /// Timeout for the synchronous peer liveness probe.
    #[serde(default = "default_life_check_timeout_secs")]
    pub life_check_timeout_secs: u64,
    /// Heartbeat write period.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Probe peers over RPC instead of trusting heartbeat rows.
    #[serde(default)]
    pub enable_peer_ping: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotasConfig {
    /// Fallback hard limit when a project has no quota row.
    pub max_clusters_per_project: i64,
}

/// Poller pacing, one table per driver.
#[derive(Debug, Clone, Deserialize)]
pub struct DriversConfig {
    pub kubernetes: DriverPacing,
    pub swarm: DriverPacing,
    pub mesos: DriverPacing,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DriverPacing {
    pub wait_interval_secs: u64,
    pub max_attempts: u32,
}

impl DriverPacing {
    pub fn wait_interval(&self) -> Duration {
        Duration::from_secs(self.wait_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Upper bound for any rendered template or fetched manifest.
    pub max_manifest_size_bytes: u64,
    pub max_field_len: usize,
}

impl AppConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.conductor.host.trim().is_empty() {
            anyhow::bail!("conductor.host cannot be empty");
        }
        if self.conductor.topic.trim().is_empty() {
            anyhow::bail!("conductor.topic cannot be empty");
        }
        if self.conductor.heartbeat_interval_secs == 0 {
            anyhow::bail!("conductor.heartbeat_interval_secs must be > 0");
        }
        if self.service_down_time_secs < 2 * self.conductor.heartbeat_interval_secs {
            anyhow::bail!(
                "service_down_time_secs must be at least twice conductor.heartbeat_interval_secs"
            );
        }
        if self.quotas.max_clusters_per_project < 0 {
            anyhow::bail!("quotas.max_clusters_per_project cannot be negative");
        }
        for (name, pacing) in [
            ("kubernetes", &self.drivers.kubernetes),
            ("swarm", &self.drivers.swarm),
            ("mesos", &self.drivers.mesos),
        ] {
            if pacing.max_attempts == 0 {
                anyhow::bail!("drivers.{name}.max_attempts must be > 0");
            }
            if pacing.wait_interval_secs == 0 {
                anyhow::bail!("drivers.{name}.wait_interval_secs must be > 0");
            }
        }
        if self.limits.max_manifest_size_bytes == 0 {
            anyhow::bail!("limits.max_manifest_size_bytes must be > 0");
        }
        Ok(())
    }

    pub fn service_down_time(&self) -> Duration {
        Duration::from_secs(self.service_down_time_secs)
    }

    pub fn life_check_timeout(&self) -> Duration {
        Duration::from_secs(self.conductor.life_check_timeout_secs)
    }

    /// Base URL peers use to reach this conductor.
    pub fn endpoint(&self) -> String {
        if self.conductor.endpoint.trim().is_empty() {
            format!("http://{}:{}", self.conductor.host, self.conductor.port)
        } else {
            self.conductor.endpoint.trim_end_matches('/').to_string()
        }
    }
}

fn default_life_check_timeout_secs() -> u64 {
    4
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

pub fn load() -> anyhow::Result<AppConfig> {
    load_from(None)
}

pub fn load_from(path: Option<&str>) -> anyhow::Result<AppConfig> {
    let env = config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        // Keep try_parsing disabled so numeric-looking strings survive.
        .try_parsing(false);

    let mut builder = config::Config::builder();
    builder = match path {
        Some(path) => builder.add_source(config::File::with_name(path)),
        None => builder.add_source(config::File::with_name("config").required(false)),
    };

    let cfg: AppConfig = builder
        .add_source(env)
        .set_default("conductor.topic", "conductor")?
        .set_default("conductor.host", "localhost")?
        .set_default("conductor.port", 9512)?
        .set_default("conductor.endpoint", "")?
        .set_default(
            "conductor.life_check_timeout_secs",
            default_life_check_timeout_secs(),
        )?
        .set_default(
            "conductor.heartbeat_interval_secs",
            default_heartbeat_interval_secs(),
        )?
        .set_default("conductor.enable_peer_ping", false)?
        .set_default("database.url", "sqlite://data/conductor.db")?
        .set_default("quotas.max_clusters_per_project", 20)?
        .set_default("drivers.kubernetes.wait_interval_secs", 1)?
        .set_default("drivers.kubernetes.max_attempts", 2000)?
        .set_default("drivers.swarm.wait_interval_secs", 1)?
        .set_default("drivers.swarm.max_attempts", 2000)?
        .set_default("drivers.mesos.wait_interval_secs", 1)?
        .set_default("drivers.mesos.max_attempts", 2000)?
        .set_default("limits.max_manifest_size_bytes", 512 * 1024u64)?
        .set_default("limits.max_field_len", 255)?
        .set_default("service_down_time_secs", 180)?
        .build()?
        .try_deserialize()?;

    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            conductor: ConductorConfig {
                topic: "conductor".into(),
                host: "c1".into(),
                port: 9512,
                endpoint: String::new(),
                life_check_timeout_secs: 4,
                heartbeat_interval_secs: 10,
                enable_peer_ping: false,
            },
            database: DatabaseConfig {
                url: "sqlite::memory:".into(),
            },
            quotas: QuotasConfig {
                max_clusters_per_project: 20,
            },
            drivers: DriversConfig {
                kubernetes: DriverPacing {
                    wait_interval_secs: 1,
                    max_attempts: 2000,
                },
                swarm: DriverPacing {
                    wait_interval_secs: 1,
                    max_attempts: 2000,
                },
                mesos: DriverPacing {
                    wait_interval_secs: 1,
                    max_attempts: 2000,
                },
            },
            limits: LimitsConfig {
                max_manifest_size_bytes: 512 * 1024,
                max_field_len: 255,
            },
            service_down_time_secs: 180,
        }
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_short_service_down_time() {
        let mut cfg = base_config();
        cfg.service_down_time_secs = 15;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("twice"), "unexpected error: {err}");
    }

    #[test]
    fn validate_rejects_zero_poll_budget() {
        let mut cfg = base_config();
        cfg.drivers.swarm.max_attempts = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn endpoint_derives_from_host_and_port() {
        let cfg = base_config();
        assert_eq!(cfg.endpoint(), "http://c1:9512");

        let mut cfg = base_config();
        cfg.conductor.endpoint = "http://edge.example:9999/".into();
        assert_eq!(cfg.endpoint(), "http://edge.example:9999");
    }
}
