//! Server configuration loaded from environment variables.
//!
//! Secrets have no usable default; everything else falls back to values
//! suitable for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use courier_api::RelayConfig;
use courier_crypto::keys::key_from_base64;

/// Secrets that were never changed from an example file.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me",
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Env: `COURIER_HOST` / `COURIER_PORT`
    pub host: String,
    pub port: u16,

    /// Env: `COURIER_DB_PATH`
    pub db_path: PathBuf,

    /// Secondary store. Unset disables mirroring.
    /// Env: `COURIER_MIRROR_DB_PATH`
    pub mirror_db_path: Option<PathBuf>,

    /// Env: `COURIER_APP_SECRET`
    pub app_secret: String,
    /// Env: `COURIER_VERIFY_TOKEN`
    pub verify_token: String,
    /// Env: `COURIER_API_TOKEN`
    pub api_token: String,
    /// Base64 AES-256 key for sealed send credentials.
    /// Env: `COURIER_CREDENTIAL_KEY`
    pub credential_key: String,

    /// Env: `COURIER_GRAPH_BASE_URL`
    pub graph_base_url: String,
    /// Env: `COURIER_MEDIA_ROOT`
    pub media_root: PathBuf,
    /// Env: `COURIER_PUBLIC_MEDIA_URL`
    pub public_media_url: String,

    pub send_timeout: Duration,
    pub crm_timeout: Duration,
    pub effect_workers: usize,
    pub effect_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let relay = RelayConfig::default();
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            db_path: PathBuf::from("courier.db"),
            mirror_db_path: None,
            app_secret: String::new(),
            verify_token: String::new(),
            api_token: String::new(),
            credential_key: String::new(),
            graph_base_url: relay.graph_base_url,
            media_root: relay.media_root,
            public_media_url: relay.public_media_url,
            send_timeout: relay.send_timeout,
            crm_timeout: relay.crm_timeout,
            effect_workers: relay.effect_workers,
            effect_queue: relay.effect_queue,
        }
    }
}

impl ServerConfig {
    /// Load from the process environment. Call after `dotenvy::dotenv()`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key lookup, falling back to defaults, then validate.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(host) = var("COURIER_HOST") {
            config.host = host;
        }
        if let Some(port) = var("COURIER_PORT") {
            config.port = port
                .parse()
                .with_context(|| format!("COURIER_PORT is not a port: {port}"))?;
        }
        if let Some(path) = var("COURIER_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        config.mirror_db_path = var("COURIER_MIRROR_DB_PATH").map(PathBuf::from);

        config.app_secret = var("COURIER_APP_SECRET").unwrap_or_default();
        config.verify_token = var("COURIER_VERIFY_TOKEN").unwrap_or_default();
        config.api_token = var("COURIER_API_TOKEN").unwrap_or_default();
        config.credential_key = var("COURIER_CREDENTIAL_KEY").unwrap_or_default();

        if let Some(url) = var("COURIER_GRAPH_BASE_URL") {
            config.graph_base_url = url;
        }
        if let Some(path) = var("COURIER_MEDIA_ROOT") {
            config.media_root = PathBuf::from(path);
        }
        if let Some(url) = var("COURIER_PUBLIC_MEDIA_URL") {
            config.public_media_url = url;
        }

        if let Some(secs) = var("COURIER_SEND_TIMEOUT_SECS") {
            let secs = parse_number("COURIER_SEND_TIMEOUT_SECS", &secs)?;
            config.send_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = var("COURIER_CRM_TIMEOUT_SECS") {
            let secs = parse_number("COURIER_CRM_TIMEOUT_SECS", &secs)?;
            config.crm_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = var("COURIER_EFFECT_WORKERS") {
            config.effect_workers = parse_number("COURIER_EFFECT_WORKERS", &n)?;
        }
        if let Some(n) = var("COURIER_EFFECT_QUEUE") {
            config.effect_queue = parse_number("COURIER_EFFECT_QUEUE", &n)?;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("COURIER_APP_SECRET", &self.app_secret),
            ("COURIER_VERIFY_TOKEN", &self.verify_token),
            ("COURIER_API_TOKEN", &self.api_token),
            ("COURIER_CREDENTIAL_KEY", &self.credential_key),
        ] {
            if value.is_empty() {
                bail!("{name} must be set");
            }
            if PLACEHOLDER_SECRETS.contains(&value.as_str()) {
                bail!("{name} still holds a placeholder value, set a real secret");
            }
        }
        if self.effect_workers == 0 || self.effect_queue == 0 {
            bail!("COURIER_EFFECT_WORKERS and COURIER_EFFECT_QUEUE must be at least 1");
        }
        self.vault_key()?;
        Ok(())
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.host, self.port))
    }

    /// Decoded credential-vault key.
    pub fn vault_key(&self) -> Result<[u8; 32]> {
        key_from_base64(&self.credential_key).context("COURIER_CREDENTIAL_KEY")
    }

    pub fn into_relay_config(self) -> RelayConfig {
        RelayConfig {
            app_secret: self.app_secret,
            verify_token: self.verify_token,
            api_token: self.api_token,
            graph_base_url: self.graph_base_url,
            media_root: self.media_root,
            public_media_url: self.public_media_url,
            send_timeout: self.send_timeout,
            crm_timeout: self.crm_timeout,
            effect_workers: self.effect_workers,
            effect_queue: self.effect_queue,
        }
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    match value.trim().parse() {
        Ok(n) => Ok(n),
        Err(_) => bail!("{name} is not a number: {value}"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use courier_crypto::keys::key_to_base64;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let mut vars: HashMap<String, String> = [
            ("COURIER_APP_SECRET", "app"),
            ("COURIER_VERIFY_TOKEN", "verify"),
            ("COURIER_API_TOKEN", "api"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        vars.insert("COURIER_CREDENTIAL_KEY".into(), key_to_base64(&[9u8; 32]));
        for (k, v) in pairs {
            vars.insert(k.to_string(), v.to_string());
        }
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_secrets_are_set() {
        let config = ServerConfig::from_lookup(env(&[])).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.db_path, PathBuf::from("courier.db"));
        assert!(config.mirror_db_path.is_none());
        assert_eq!(config.send_timeout, Duration::from_secs(15));
        assert_eq!(config.effect_workers, 4);
        assert_eq!(config.vault_key().unwrap(), [9u8; 32]);
    }

    #[test]
    fn overrides_are_read() {
        let config = ServerConfig::from_lookup(env(&[
            ("COURIER_PORT", "8080"),
            ("COURIER_MIRROR_DB_PATH", "mirror.db"),
            ("COURIER_SEND_TIMEOUT_SECS", "3"),
            ("COURIER_EFFECT_QUEUE", "8"),
        ]))
        .unwrap();
        assert_eq!(config.addr().unwrap(), "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.mirror_db_path, Some(PathBuf::from("mirror.db")));

        let relay = config.into_relay_config();
        assert_eq!(relay.send_timeout, Duration::from_secs(3));
        assert_eq!(relay.effect_queue, 8);
        assert_eq!(relay.api_token, "api");
    }

    #[test]
    fn missing_secret_is_refused() {
        let err = ServerConfig::from_lookup(env(&[("COURIER_API_TOKEN", "")])).unwrap_err();
        assert!(err.to_string().contains("COURIER_API_TOKEN"));
    }

    #[test]
    fn placeholder_secret_is_refused() {
        let err = ServerConfig::from_lookup(env(&[("COURIER_APP_SECRET", "dev-secret-change-me")]))
            .unwrap_err();
        assert!(err.to_string().contains("placeholder"));
    }

    #[test]
    fn malformed_key_is_refused() {
        assert!(ServerConfig::from_lookup(env(&[("COURIER_CREDENTIAL_KEY", "short")])).is_err());
    }

    #[test]
    fn bad_number_is_refused() {
        assert!(ServerConfig::from_lookup(env(&[("COURIER_PORT", "eighty")])).is_err());
    }
}
