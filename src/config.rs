#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_SAVETUBE_PORT: u16 = 8080;
pub const DEFAULT_SAVETUBE_HOST: &str = "127.0.0.1";

/// Resolved listen address plus the optional static frontend root.
///
/// `www_root` stays `None` when no frontend bundle is deployed next to the
/// backend; the server then answers only the API routes.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub host: String,
    pub port: u16,
    pub www_root: Option<PathBuf>,
}

pub fn load_runtime_settings() -> Result<RuntimeSettings> {
    resolve_runtime_settings(RuntimeOverrides::default())
}

/// Values that beat both the process environment and the `.env` file.
/// Populated from command-line flags by the binaries.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub www_root: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_settings_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeSettings> {
    build_runtime_settings_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeSettings> {
    let host = overrides
        .host
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() { None } else { Some(trimmed) }
        })
        .or_else(|| lookup_value("SAVETUBE_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SAVETUBE_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("SAVETUBE_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_SAVETUBE_PORT);
    let www_root = overrides
        .www_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("WWW_ROOT", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from);
    Ok(RuntimeSettings {
        host,
        port,
        www_root,
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn settings_from(contents: &str) -> RuntimeSettings {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_settings(&vars, |_| None).unwrap()
    }

    #[test]
    fn load_settings_reads_port() {
        let settings = settings_from("SAVETUBE_PORT=\"4242\"\n");
        assert_eq!(settings.port, 4242);
    }

    #[test]
    fn load_settings_defaults_when_file_empty() {
        let settings = settings_from("");
        assert_eq!(settings.port, DEFAULT_SAVETUBE_PORT);
        assert_eq!(settings.host, DEFAULT_SAVETUBE_HOST);
        assert!(settings.www_root.is_none());
    }

    #[test]
    fn load_settings_reads_host_and_www_root() {
        let settings = settings_from("SAVETUBE_HOST=\"0.0.0.0\"\nWWW_ROOT=\"/www/savetube\"\n");
        assert_eq!(settings.host, "0.0.0.0");
        assert_eq!(settings.www_root, Some(PathBuf::from("/www/savetube")));
    }

    #[test]
    fn build_settings_prefers_env_over_file() {
        let vars = read_env_file(make_config("SAVETUBE_HOST=\"file-host\"\n").path()).unwrap();
        let settings = build_runtime_settings(&vars, |key| {
            if key == "SAVETUBE_HOST" {
                Some("env-host".to_string())
            } else {
                None
            }
        })
        .unwrap();
        assert_eq!(settings.host, "env-host");
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export WWW_ROOT="/www"
            SAVETUBE_HOST='0.0.0.0'
            SAVETUBE_PORT =  "9090"
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("WWW_ROOT").unwrap(), "/www");
        assert_eq!(vars.get("SAVETUBE_HOST").unwrap(), "0.0.0.0");
        assert_eq!(vars.get("SAVETUBE_PORT").unwrap(), "9090");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn build_settings_override_precedence() {
        let mut vars = HashMap::new();
        vars.insert("SAVETUBE_HOST".to_string(), "file-host".to_string());
        vars.insert("SAVETUBE_PORT".to_string(), "7000".to_string());
        vars.insert("WWW_ROOT".to_string(), "/file-www".to_string());

        let overrides = RuntimeOverrides {
            host: Some("override-host".into()),
            port: Some(9000),
            www_root: None,
            env_path: None,
        };

        let settings = build_runtime_settings_with_overrides(
            &vars,
            |key| {
                if key == "WWW_ROOT" {
                    Some("/env-www".to_string())
                } else if key == "SAVETUBE_PORT" {
                    Some("8000".to_string())
                } else {
                    None
                }
            },
            overrides,
        )
        .unwrap();

        assert_eq!(settings.host, "override-host");
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.www_root, Some(PathBuf::from("/env-www")));
    }

    #[test]
    fn build_settings_ignores_blank_host() {
        let vars = HashMap::new();
        let settings = build_runtime_settings_with_overrides(
            &vars,
            |_| None,
            RuntimeOverrides {
                host: Some("   ".into()),
                ..RuntimeOverrides::default()
            },
        )
        .unwrap();
        assert_eq!(settings.host, DEFAULT_SAVETUBE_HOST);
    }

    #[test]
    fn build_settings_invalid_port_defaults() {
        let vars = read_env_file(make_config("SAVETUBE_PORT=\"nope\"\n").path()).unwrap();
        let settings = build_runtime_settings(&vars, |_| None).unwrap();
        assert_eq!(settings.port, DEFAULT_SAVETUBE_PORT);
    }
}
