use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// Centralized, validated-once configuration. Loaded from defaults, then an
/// optional `config.toml`, then the environment (highest precedence), the
/// same "layered config" shape the rest of the ambient stack follows for
/// logging and error handling: one authoritative struct, not scattered
/// `env::var` calls at each use site.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    pub database_path: String,
    pub max_message_size: usize,
    pub rate_limit_per_second: f64,
    pub rate_limit_burst: u32,
    pub session_ttl_hours: i64,
    pub max_connections_total: usize,
    pub max_connections_per_user: usize,
    pub max_group_members: usize,
    pub min_key_packages: i64,
    pub rp_id: String,
    pub rp_origin: String,
    pub log_level: String,
    pub metrics_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            database_path: "sovereign.db".to_string(),
            max_message_size: 65536,
            rate_limit_per_second: 30.0,
            rate_limit_burst: 10,
            session_ttl_hours: 720,
            max_connections_total: 10_000,
            max_connections_per_user: 5,
            max_group_members: 256,
            min_key_packages: 5,
            rp_id: "localhost".to_string(),
            rp_origin: "https://localhost".to_string(),
            log_level: if cfg!(debug_assertions) { "info" } else { "warn" }.to_string(),
            metrics_enabled: false,
        }
    }
}

impl Config {
    /// Loads configuration: built-in defaults, then `config.toml` if present,
    /// then environment variables (prefix `SOVEREIGN_`), in ascending
    /// precedence. A zero-config in-memory run (tests) needs neither file
    /// nor env.
    pub fn load() -> anyhow::Result<Self> {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("config.toml"))
            .merge(Env::prefixed("SOVEREIGN_"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.max_message_size > 0, "max_message_size must be positive");
        anyhow::ensure!(
            self.max_connections_per_user > 0,
            "max_connections_per_user must be positive"
        );
        anyhow::ensure!(self.rate_limit_burst > 0, "rate_limit_burst must be positive");
        Ok(())
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            database_path: ":memory:".to_string(),
            ..Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn env_overrides_defaults() {
        std::env::set_var("SOVEREIGN_LISTEN_ADDR", "127.0.0.1:9090");
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Env::prefixed("SOVEREIGN_"))
            .extract()
            .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9090");
        std::env::remove_var("SOVEREIGN_LISTEN_ADDR");
    }
}
