use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/relayd/relayd.toml";
const ENV_CONFIG_PATH: &str = "RELAYD_CONFIG";

/// Overrides the health-endpoint socket path (spec §6, "Environment
/// variables"). The health endpoint itself is daemon scaffolding, not
/// part of the bookkeeping core; see `health` below.
pub const HEALTH_SOCK_PATH_ENV: &str = "HEALTH_SOCK_PATH";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `RELAYD_CONFIG` environment variable. If the file is missing or
    /// fails to parse, defaults are returned.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        match fs::read_to_string(PathBuf::from(path)) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    #[serde(default = "default_trace_root")]
    pub trace_root: String,
    #[serde(default = "default_idle_sweep_secs")]
    pub idle_sweep_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trace_root: default_trace_root(),
            idle_sweep_secs: default_idle_sweep_secs(),
        }
    }
}

fn default_trace_root() -> String {
    "/var/lib/relayd/traces".to_string()
}

fn default_idle_sweep_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    #[serde(default = "default_health_sock_path")]
    pub sock_path: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            sock_path: default_health_sock_path(),
        }
    }
}

fn default_health_sock_path() -> String {
    std::env::var(HEALTH_SOCK_PATH_ENV).unwrap_or_else(|_| "/run/relayd/health.sock".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parse_config_defaults() {
        let toml = r#"
[runtime]
trace_root = "/srv/relayd/traces"
idle_sweep_secs = 60
[health]
sock_path = "/run/relayd/health.sock"
"#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.runtime.trace_root, "/srv/relayd/traces");
        assert_eq!(cfg.runtime.idle_sweep_secs, 60);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        unsafe {
            std::env::set_var(ENV_CONFIG_PATH, "/nonexistent/relayd.toml");
        }
        let cfg = Config::load();
        assert_eq!(cfg.runtime.idle_sweep_secs, 30);
        unsafe {
            std::env::remove_var(ENV_CONFIG_PATH);
        }
    }

    #[test]
    fn env_override_is_honored() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[runtime]\ntrace_root = \"/tmp/x\"").unwrap();
        unsafe {
            std::env::set_var(ENV_CONFIG_PATH, file.path());
        }
        let cfg = Config::load();
        assert_eq!(cfg.runtime.trace_root, "/tmp/x");
        unsafe {
            std::env::remove_var(ENV_CONFIG_PATH);
        }
    }
}
