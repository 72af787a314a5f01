use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

/// Coordinator settings. Timeouts and limits match the behavior the web
/// frontend depends on; see the event stream contract in `coordinator`.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// host:port of each shard backend.
    pub backends: Vec<String>,
    /// Directory for spill and page files, one subdirectory per query id.
    pub results_root: PathBuf,
    pub results_per_page: usize,
    pub results_per_package: usize,
    pub packages_per_page: usize,
    /// Completed queries are garbage-collected beyond this many live states.
    pub max_live_queries: usize,
    pub connect_timeout: Duration,
    /// Per-read inactivity deadline on a backend stream.
    pub read_deadline: Duration,
    /// A query state younger than this is reused for an identical query.
    pub staleness: Duration,
    /// Fraction of the results partition that must stay free.
    pub headroom_fraction: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            backends: Vec::new(),
            results_root: PathBuf::from("/tmp/codescout-results"),
            results_per_page: 10,
            results_per_package: 2,
            packages_per_page: 5,
            max_live_queries: 10,
            connect_timeout: Duration::from_secs(5),
            read_deadline: Duration::from_secs(10),
            staleness: Duration::from_secs(30 * 60),
            headroom_fraction: 0.2,
        }
    }
}

/// Explicit overrides that binaries pass to `load_coordinator_config`.
/// Keep this small; binaries can expand for extra fields.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub backends: Option<Vec<String>>,
    pub results_root: Option<PathBuf>,
    pub read_deadline_seconds: Option<u64>,
    pub connect_timeout_seconds: Option<u64>,
}

/// Load and merge a config from: defaults <- config file <- env vars <-
/// explicit overrides. Invalid env values are ignored.
pub fn load_coordinator_config(
    mut base: CoordinatorConfig,
    opts: ConfigOverrides,
) -> Result<CoordinatorConfig> {
    if let Some(path) = opts.config_path.as_ref() {
        if path.exists() {
            let s = fs::read_to_string(path)?;
            let v: toml::Value = toml::from_str(&s)?;
            if let Some(bs) = v.get("backends").and_then(|x| x.as_array()) {
                base.backends = bs
                    .iter()
                    .filter_map(|b| b.as_str().map(String::from))
                    .collect();
            }
            if let Some(r) = v.get("results_root").and_then(|x| x.as_str()) {
                base.results_root = PathBuf::from(r);
            }
            if let Some(n) = v.get("results_per_page").and_then(|x| x.as_integer()) {
                base.results_per_page = n as usize;
            }
            if let Some(n) = v.get("read_deadline_seconds").and_then(|x| x.as_integer()) {
                base.read_deadline = Duration::from_secs(n as u64);
            }
            if let Some(n) = v.get("connect_timeout_seconds").and_then(|x| x.as_integer()) {
                base.connect_timeout = Duration::from_secs(n as u64);
            }
        }
    }

    // env vars override file
    if let Ok(bs) = std::env::var("CODESCOUT_BACKENDS") {
        base.backends = bs
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Ok(r) = std::env::var("CODESCOUT_RESULTS_ROOT") {
        base.results_root = PathBuf::from(r);
    }
    if let Ok(v) = std::env::var("CODESCOUT_READ_DEADLINE_SECONDS") {
        if let Ok(n) = v.parse::<u64>() {
            base.read_deadline = Duration::from_secs(n);
        }
    }
    if let Ok(v) = std::env::var("CODESCOUT_CONNECT_TIMEOUT_SECONDS") {
        if let Ok(n) = v.parse::<u64>() {
            base.connect_timeout = Duration::from_secs(n);
        }
    }

    // explicit overrides win
    if let Some(bs) = opts.backends {
        base.backends = bs;
    }
    if let Some(r) = opts.results_root {
        base.results_root = r;
    }
    if let Some(n) = opts.read_deadline_seconds {
        base.read_deadline = Duration::from_secs(n);
    }
    if let Some(n) = opts.connect_timeout_seconds {
        base.connect_timeout = Duration::from_secs(n);
    }

    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::EnvFilter;

    fn init_test_logging() {
        static INIT: std::sync::Once = std::sync::Once::new();
        INIT.call_once(|| {
            let filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
            tracing_subscriber::fmt().with_env_filter(filter).init();
        });
    }

    fn clear_env() {
        std::env::remove_var("CODESCOUT_BACKENDS");
        std::env::remove_var("CODESCOUT_RESULTS_ROOT");
        std::env::remove_var("CODESCOUT_READ_DEADLINE_SECONDS");
        std::env::remove_var("CODESCOUT_CONNECT_TIMEOUT_SECONDS");
    }

    #[test]
    #[serial_test::serial]
    fn file_env_override_precedence() {
        init_test_logging();
        clear_env();

        let tmp = tempfile::NamedTempFile::new().expect("tempfile");
        let toml = r#"
backends = ["file-backend:26082"]
read_deadline_seconds = 7
"#;
        fs::write(tmp.path(), toml).unwrap();

        std::env::set_var("CODESCOUT_BACKENDS", "env-backend:26082");

        let opts = ConfigOverrides {
            config_path: Some(tmp.path().to_path_buf()),
            read_deadline_seconds: Some(33),
            ..Default::default()
        };
        let got = load_coordinator_config(CoordinatorConfig::default(), opts).expect("load");
        // env overrides file for backends, explicit override wins for deadline
        assert_eq!(got.backends, vec!["env-backend:26082".to_string()]);
        assert_eq!(got.read_deadline.as_secs(), 33);

        clear_env();
    }

    #[test]
    #[serial_test::serial]
    fn file_values_apply_without_env() {
        init_test_logging();
        clear_env();

        let tmp = tempfile::NamedTempFile::new().expect("tempfile");
        let toml = r#"
backends = ["a:26082", "b:26082"]
results_root = "/srv/results"
results_per_page = 25
connect_timeout_seconds = 2
"#;
        fs::write(tmp.path(), toml).unwrap();

        let opts = ConfigOverrides {
            config_path: Some(tmp.path().to_path_buf()),
            ..Default::default()
        };
        let got = load_coordinator_config(CoordinatorConfig::default(), opts).expect("load");
        assert_eq!(got.backends.len(), 2);
        assert_eq!(got.results_root, PathBuf::from("/srv/results"));
        assert_eq!(got.results_per_page, 25);
        assert_eq!(got.connect_timeout.as_secs(), 2);
    }

    #[test]
    #[serial_test::serial]
    fn invalid_env_is_ignored() {
        init_test_logging();
        clear_env();

        let tmp = tempfile::NamedTempFile::new().expect("tempfile");
        fs::write(tmp.path(), "read_deadline_seconds = 12\n").unwrap();
        std::env::set_var("CODESCOUT_READ_DEADLINE_SECONDS", "not-a-number");

        let opts = ConfigOverrides {
            config_path: Some(tmp.path().to_path_buf()),
            ..Default::default()
        };
        let got = load_coordinator_config(CoordinatorConfig::default(), opts).expect("load");
        assert_eq!(got.read_deadline.as_secs(), 12);

        clear_env();
    }
}
