//! Settings loading.
//!
//! Later sources override earlier ones key by key: a file that sets only
//! `server.port` keeps every other default.

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Json};
use figment::Figment;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::Settings;

/// Environment prefix. Nested keys are separated by `__`.
pub const ENV_PREFIX: &str = "PARLEY_";

/// `~/.parley`, or `/tmp/.parley` without a home directory.
pub fn parley_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".parley")
}

/// Default settings file location.
pub fn settings_path() -> PathBuf {
    parley_dir().join("settings.json")
}

/// The provider stack for a given settings file. A missing file is skipped.
pub fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Json::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Load settings.
///
/// An explicit path must exist; the default path is optional.
pub fn load_settings(explicit: Option<&Path>) -> Result<Settings> {
    let path = match explicit {
        Some(p) if !p.exists() => return Err(SettingsError::NotFound(p.to_path_buf())),
        Some(p) => p.to_path_buf(),
        None => settings_path(),
    };
    debug!(path = %path.display(), exists = path.exists(), "loading settings");

    let settings: Settings = figment(&path).extract()?;
    validate(&settings)?;
    Ok(settings)
}

fn validate(settings: &Settings) -> Result<()> {
    if settings.rate_limit.quota == 0 {
        return Err(SettingsError::InvalidValue(
            "rate_limit.quota must be positive".into(),
        ));
    }
    if settings.rate_limit.window_secs == 0 {
        return Err(SettingsError::InvalidValue(
            "rate_limit.window_secs must be positive".into(),
        ));
    }
    if settings.engine.max_rounds == 0 {
        return Err(SettingsError::InvalidValue(
            "engine.max_rounds must be at least 1".into(),
        ));
    }
    if settings.engine.backlog_capacity == 0 || settings.server.client_queue_capacity == 0 {
        return Err(SettingsError::InvalidValue(
            "queue capacities must be positive".into(),
        ));
    }
    let mut seen = std::collections::HashSet::new();
    for entry in &settings.auth.tokens {
        if entry.token.is_empty() || !seen.insert(entry.token.as_str()) {
            return Err(SettingsError::InvalidValue(format!(
                "auth token for user '{}' is empty or duplicated",
                entry.user_id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use parley_core::backend::Framing;
    use parley_telemetry::LogFormat;

    #[test]
    fn missing_default_file_gives_defaults() {
        Jail::expect_with(|jail| {
            let path = jail.directory().join("absent.json");
            let settings: Settings = figment(&path).extract()?;
            assert_eq!(settings.server.port, 8080);
            assert_eq!(settings.rate_limit.quota, 100);
            Ok(())
        });
    }

    #[test]
    fn explicit_missing_file_is_error() {
        let err = load_settings(Some(Path::new("/definitely/not/here.json"))).unwrap_err();
        assert!(matches!(err, SettingsError::NotFound(_)));
    }

    #[test]
    fn file_overrides_defaults_per_key() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "settings.json",
                r#"{
                    "server": { "port": 9100 },
                    "engine": { "max_rounds": 5 },
                    "model": { "framing": "ndjson", "api_key": "sk-file" },
                    "auth": { "tokens": [ { "user_id": "alice", "token": "t-alice" } ] },
                    "telemetry": { "format": "pretty" }
                }"#,
            )?;
            let settings = load_settings(Some(Path::new("settings.json")))
                .map_err(|e| e.to_string())?;
            assert_eq!(settings.server.port, 9100);
            assert_eq!(settings.server.host, "127.0.0.1");
            assert_eq!(settings.engine.max_rounds, 5);
            assert_eq!(settings.engine.turn_timeout_secs, 120);
            assert_eq!(settings.model.framing, Framing::Ndjson);
            assert!(settings.model.api_key().is_some());
            assert_eq!(settings.auth.tokens[0].user_id, "alice");
            assert_eq!(settings.telemetry.format, LogFormat::Pretty);
            Ok(())
        });
    }

    #[test]
    fn env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("settings.json", r#"{ "rate_limit": { "quota": 10 } }"#)?;
            jail.set_env("PARLEY_RATE_LIMIT__QUOTA", "25");
            jail.set_env("PARLEY_SERVER__PORT", "7000");
            jail.set_env("PARLEY_TOOLS__SEARCH_API_KEY", "brave");
            let settings = load_settings(Some(Path::new("settings.json")))
                .map_err(|e| e.to_string())?;
            assert_eq!(settings.rate_limit.quota, 25);
            assert_eq!(settings.server.port, 7000);
            assert!(settings.tools.search_api_key().is_some());
            Ok(())
        });
    }

    #[test]
    fn invalid_values_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("settings.json", r#"{ "rate_limit": { "quota": 0 } }"#)?;
            let err = load_settings(Some(Path::new("settings.json"))).unwrap_err();
            assert!(matches!(err, SettingsError::InvalidValue(_)));
            Ok(())
        });
    }

    #[test]
    fn duplicate_tokens_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "settings.json",
                r#"{ "auth": { "tokens": [
                    { "user_id": "a", "token": "same" },
                    { "user_id": "b", "token": "same" }
                ] } }"#,
            )?;
            let err = load_settings(Some(Path::new("settings.json"))).unwrap_err();
            assert!(err.to_string().contains("user 'b'"));
            Ok(())
        });
    }

    #[test]
    fn malformed_file_is_load_error() {
        Jail::expect_with(|jail| {
            jail.create_file("settings.json", r#"{ "server": { "port": "high" } }"#)?;
            let err = load_settings(Some(Path::new("settings.json"))).unwrap_err();
            assert!(matches!(err, SettingsError::Load(_)));
            Ok(())
        });
    }
}
