use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};

use crate::sandbox::{LocalHostConfig, RemoteSandboxConfig, SandboxRuntimeConfig};

const REMOTE_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Server configuration loaded from environment variables.
pub struct Config {
    pub port: u16,
    pub sentry_dsn: Option<String>,
    pub environment: String,
    /// Base64-encoded 32-byte key for the credential vault.
    pub encryption_key: String,
    pub data_dir: PathBuf,
    pub sandbox: SandboxRuntimeConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a Config from raw string values (as they would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        let port = get("PORT").and_then(|v| v.parse().ok()).unwrap_or(8081);
        let sentry_dsn = get("SENTRY_DSN");
        let environment = get("ENVIRONMENT").unwrap_or_else(|| "local".to_string());

        let Some(encryption_key) = get("DBRELAY_ENCRYPTION_KEY") else {
            bail!("DBRELAY_ENCRYPTION_KEY is not set (base64 of 32 random bytes)");
        };

        let data_dir = get("DBRELAY_DATA_DIR").map(PathBuf::from).unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".dbrelay")
        });

        let sandbox = match get("SANDBOX_BACKEND").as_deref().unwrap_or("local") {
            "local" => SandboxRuntimeConfig::LocalHost(LocalHostConfig {
                root_dir: get("SANDBOX_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| data_dir.join("sandboxes")),
                ..LocalHostConfig::default()
            }),
            "remote" => {
                let Some(api_base_url) = get("SANDBOX_API_URL") else {
                    bail!("SANDBOX_API_URL is required when SANDBOX_BACKEND=remote");
                };
                SandboxRuntimeConfig::Remote(RemoteSandboxConfig {
                    api_base_url,
                    api_token: get("SANDBOX_API_TOKEN"),
                    request_timeout: REMOTE_REQUEST_TIMEOUT,
                })
            }
            other => bail!("unknown SANDBOX_BACKEND '{other}' (expected 'local' or 'remote')"),
        };

        Ok(Config {
            port,
            sentry_dsn,
            environment,
            encryption_key,
            data_dir,
            sandbox,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<Config> {
        let mut vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        vars.entry("DBRELAY_ENCRYPTION_KEY".into()).or_insert_with(|| "a2V5".into());
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn test_config_invalid_port_uses_default() {
        let config = config(&[("PORT", "not-a-number")]).unwrap();
        assert_eq!(config.port, 8081);
    }

    #[test]
    fn test_config_valid_port() {
        let config = config(&[("PORT", "3000")]).unwrap();
        assert_eq!(config.port, 3000);
    }

    #[test]
    fn test_config_empty_sentry_dsn_is_none() {
        let config = config(&[("SENTRY_DSN", "")]).unwrap();
        assert!(config.sentry_dsn.is_none());
    }

    #[test]
    fn test_config_present_sentry_dsn() {
        let config = config(&[("SENTRY_DSN", "https://sentry.io/123")]).unwrap();
        assert_eq!(config.sentry_dsn.as_deref(), Some("https://sentry.io/123"));
    }

    #[test]
    fn test_config_default_environment() {
        let config = config(&[]).unwrap();
        assert_eq!(config.environment, "local");
    }

    #[test]
    fn test_config_missing_encryption_key_fails() {
        let err = Config::from_lookup(|_| None).err().unwrap();
        assert!(err.to_string().contains("DBRELAY_ENCRYPTION_KEY"));
    }

    #[test]
    fn test_config_local_sandbox_defaults_under_data_dir() {
        let config = config(&[("DBRELAY_DATA_DIR", "/var/lib/dbrelay")]).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/dbrelay"));
        let SandboxRuntimeConfig::LocalHost(local) = config.sandbox else {
            panic!("expected local sandbox backend");
        };
        assert_eq!(local.root_dir, PathBuf::from("/var/lib/dbrelay/sandboxes"));
    }

    #[test]
    fn test_config_remote_sandbox() {
        let config = config(&[
            ("SANDBOX_BACKEND", "remote"),
            ("SANDBOX_API_URL", "https://sandboxes.example.com"),
            ("SANDBOX_API_TOKEN", "tok"),
        ])
        .unwrap();
        let SandboxRuntimeConfig::Remote(remote) = config.sandbox else {
            panic!("expected remote sandbox backend");
        };
        assert_eq!(remote.api_base_url, "https://sandboxes.example.com");
        assert_eq!(remote.api_token.as_deref(), Some("tok"));
    }

    #[test]
    fn test_config_remote_without_url_fails() {
        assert!(config(&[("SANDBOX_BACKEND", "remote")]).is_err());
    }

    #[test]
    fn test_config_unknown_backend_fails() {
        let err = config(&[("SANDBOX_BACKEND", "firecracker")]).err().unwrap();
        assert!(err.to_string().contains("firecracker"));
    }
}
