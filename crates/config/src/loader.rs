use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use {
    aegis_common::lock,
    anyhow::Context,
    tracing::{debug, info, warn},
};

use crate::{env_subst::substitute_env, schema::AegisConfig};

/// Config file names, checked in order within each directory.
const CONFIG_FILENAMES: &[&str] = &["aegis.toml", "aegis.yaml", "aegis.yml", "aegis.json"];

static CONFIG_DIR_OVERRIDE: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Restrict discovery to `path`. The working directory and the user config
/// directory are skipped while an override is set.
pub fn set_config_dir(path: PathBuf) {
    *lock(&CONFIG_DIR_OVERRIDE) = Some(path);
}

pub fn clear_config_dir() {
    *lock(&CONFIG_DIR_OVERRIDE) = None;
}

fn config_dir_override() -> Option<PathBuf> {
    lock(&CONFIG_DIR_OVERRIDE).clone()
}

/// Read, substitute, parse and validate a config file of any supported
/// format.
pub fn load_config(path: &Path) -> anyhow::Result<AegisConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config = parse_config(&substitute_env(&raw), path)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    let errors = config.validate();
    if !errors.is_empty() {
        anyhow::bail!("invalid config {}: {}", path.display(), errors.join("; "));
    }
    Ok(config)
}

/// Load the first config file found, or defaults when there is none.
///
/// A file that exists but fails to load is an error rather than a silent
/// fallback, so a typo cannot start the gateway with default limits.
pub fn discover_and_load() -> anyhow::Result<AegisConfig> {
    match find_config_file() {
        Some(path) => {
            info!(path = %path.display(), "loading config");
            load_config(&path)
        },
        None => {
            debug!("no config file found, using defaults");
            Ok(AegisConfig::default())
        },
    }
}

fn first_existing(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Search order: override dir only if set, else `./`, then
/// `~/.config/aegis/`.
pub fn find_config_file() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        return first_existing(&dir);
    }
    first_existing(Path::new(".")).or_else(|| user_config_dir().and_then(|d| first_existing(&d)))
}

fn user_config_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().join(".config").join("aegis"))
}

/// The override, or `~/.config/aegis/`.
pub fn config_dir() -> Option<PathBuf> {
    config_dir_override().or_else(user_config_dir)
}

/// An existing config file, or where a new TOML one would be written.
pub fn find_or_default_config_path() -> PathBuf {
    find_config_file().unwrap_or_else(|| {
        config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("aegis.toml")
    })
}

/// Write `config` as TOML to `path`, creating parent directories. Refuses
/// to overwrite unless `force` is set.
pub fn save_config(config: &AegisConfig, path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists", path.display());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let text = toml::to_string_pretty(config).context("serialize config")?;
    std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), "wrote config");
    Ok(())
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<AegisConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        other => {
            warn!(path = %path.display(), "unsupported config extension");
            anyhow::bail!("unsupported config format: .{other}")
        },
    }
}

#[cfg(test)]
#[allow(unsafe_code)] // edition 2024 requires unsafe for std::env::set_var in tests
mod tests {
    use std::sync::Mutex as StdMutex;

    use {super::*, aegis_ratelimit::Tier};

    // The override is process-global; serialize the tests that touch it.
    static DIR_LOCK: StdMutex<()> = StdMutex::new(());

    #[test]
    fn loads_toml_with_env_substitution() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aegis.toml");
        unsafe { std::env::set_var("AEGIS_TEST_REDIS_URL", "redis://cache:6379") };
        std::fs::write(
            &path,
            r#"
[server]
port = 9000

[breakers.openrouter]
failure_threshold = 3
timeout_ms = 10000

[rate_limit.tiers.free]
window_ms = 1000
max_requests = 2

[cache]
redis_url = "${AEGIS_TEST_REDIS_URL}"

[websocket]
allowed_origins = ["https://app.example.com"]
"#,
        )
        .unwrap();

        let cfg = load_config(&path).unwrap();
        unsafe { std::env::remove_var("AEGIS_TEST_REDIS_URL") };
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.bind, "127.0.0.1");
        assert_eq!(cfg.breakers["openrouter"].failure_threshold, 3);
        assert_eq!(cfg.breakers["openrouter"].success_threshold, 2);
        assert_eq!(cfg.cache.redis_url.as_deref(), Some("redis://cache:6379"));
        let tiers = cfg.rate_limit.tier_table().unwrap();
        assert_eq!(tiers.limit(Tier::Free).max_requests, 2);
        assert_eq!(cfg.websocket.allowed_origins.len(), 1);
        assert_eq!(cfg.websocket.subscription_limits.pro, Some(10));
    }

    #[test]
    fn loads_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("aegis.yaml");
        std::fs::write(&yaml, "server:\n  port: 7001\n").unwrap();
        assert_eq!(load_config(&yaml).unwrap().server.port, 7001);

        let json = dir.path().join("aegis.json");
        std::fs::write(&json, r#"{"cache": {"default_ttl_secs": 42}}"#).unwrap();
        assert_eq!(load_config(&json).unwrap().cache.default_ttl_secs, 42);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aegis.toml");
        std::fs::write(&path, "[breakers.db]\nfailure_threshold = 0\n").unwrap();
        let err = load_config(&path).unwrap_err().to_string();
        assert!(err.contains("breakers.db"), "{err}");

        let ini = dir.path().join("aegis.ini");
        std::fs::write(&ini, "").unwrap();
        assert!(load_config(&ini).is_err());
    }

    #[test]
    fn discovery_honours_override() {
        let _guard = DIR_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        set_config_dir(dir.path().to_path_buf());

        assert!(find_config_file().is_none());
        assert_eq!(discover_and_load().unwrap(), AegisConfig::default());
        assert_eq!(find_or_default_config_path(), dir.path().join("aegis.toml"));

        std::fs::write(dir.path().join("aegis.yml"), "server:\n  port: 7002\n").unwrap();
        assert_eq!(discover_and_load().unwrap().server.port, 7002);

        clear_config_dir();
    }

    #[test]
    fn save_round_trips_and_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("aegis.toml");
        let mut cfg = AegisConfig::default();
        cfg.server.port = 9100;
        save_config(&cfg, &path, false).unwrap();
        assert!(save_config(&cfg, &path, false).is_err());
        assert_eq!(load_config(&path).unwrap(), cfg);
    }
}
