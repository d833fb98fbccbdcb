//! Environment configuration.
//!
//! Secrets support the `<KEY>_FILE` indirection so file-based secret
//! mounts work without shell plumbing; plain env values have `\n` escape
//! sequences converted to real newlines (needed for PEM keys stored as
//! single-line env vars).

use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::tunnel::TunnelSettings;

#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
}

impl RedisSettings {
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForgeSettings {
    pub app_id: u64,
    pub private_key: String,
}

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub log_level: String,
    pub trust_proxy: bool,
    pub cors_origin: Option<String>,
    /// Recognized for the outer rate-limit layer; the controller itself
    /// does not enforce it.
    pub rate_limit_max: u32,
    pub webhook_secret: String,
    pub redis: RedisSettings,
    pub job_concurrency: usize,
    pub job_max_attempts: u32,
    pub container_health_timeout: Duration,
    pub preview_url_attempts: u32,
    pub preview_url_delay: Duration,
    pub preview_url_request_timeout: Duration,
    pub service_ready_attempts: u32,
    pub service_ready_delay: Duration,
    pub tunnel: TunnelSettings,
    /// Absent when comment posting is not configured; comments are then
    /// skipped (they are best-effort anyway).
    pub forge: Option<ForgeSettings>,
    pub engine_binary: String,
    pub build_file: String,
    pub container_port: u16,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub record_ttl: Duration,
    pub sweep_interval: Duration,
    pub sweep_max_age: Duration,
    pub stall_window: Duration,
    pub clone_timeout: Duration,
    pub build_timeout: Duration,
    pub run_timeout: Duration,
    pub tmp_root: PathBuf,
}

/// Read a required secret.
///
/// For a key like "WEBHOOK_SECRET":
/// 1. If WEBHOOK_SECRET_FILE is set, read from that path.
/// 2. Otherwise read the WEBHOOK_SECRET env var directly, converting `\n`
///    escapes to newlines.
fn read_secret(key: &str) -> Result<String> {
    let file_key = format!("{key}_FILE");

    if let Ok(path) = env::var(&file_key) {
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {key} from file: {path}"))?;
        Ok(contents.trim_end().to_string())
    } else {
        let value = env::var(key)
            .with_context(|| format!("{key} or {file_key} environment variable is required"))?;
        Ok(value.replace("\\n", "\n"))
    }
}

/// Read an optional secret with the same `_FILE` indirection. An
/// explicitly set but unreadable file is an error, not a silent `None`.
fn read_secret_optional(key: &str) -> Result<Option<String>> {
    let file_key = format!("{key}_FILE");

    let value = if let Ok(path) = env::var(&file_key) {
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {key} from file: {path}"))?;
        Some(contents)
    } else {
        env::var(key).ok()
    };

    Ok(value.and_then(|s| {
        let trimmed = s.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }))
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{key} is invalid: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &str, default_ms: u64) -> Result<Duration> {
    Ok(Duration::from_millis(env_parse(key, default_ms)?))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let webhook_secret = read_secret("WEBHOOK_SECRET")?;

        let redis = RedisSettings {
            host: env_or("REDIS_HOST", "127.0.0.1"),
            port: env_parse("REDIS_PORT", 6379u16)?,
            password: read_secret_optional("REDIS_PASSWORD")?,
            db: env_parse("REDIS_DB", 0i64)?,
        };

        // Forge credentials are optional as a pair; a private key can come
        // from FORGE_PRIVATE_KEY, FORGE_PRIVATE_KEY_PATH, or the _FILE form.
        let forge = match read_secret_optional("FORGE_APP_ID")? {
            Some(raw_id) => {
                let app_id = raw_id
                    .parse::<u64>()
                    .context("FORGE_APP_ID must be a valid number")?;
                let private_key = match env::var("FORGE_PRIVATE_KEY_PATH") {
                    Ok(path) => fs::read_to_string(&path)
                        .with_context(|| {
                            format!("failed to read FORGE_PRIVATE_KEY from file: {path}")
                        })?
                        .trim_end()
                        .to_string(),
                    Err(_) => read_secret("FORGE_PRIVATE_KEY")?,
                };
                Some(ForgeSettings {
                    app_id,
                    private_key,
                })
            }
            None => None,
        };

        let tunnel = TunnelSettings {
            binary: env_or("TUNNEL_BIN", "cloudflared"),
            protocol: env_or("TUNNEL_PROTOCOL", "http2"),
            startup_timeout: env_millis("TUNNEL_STARTUP_TIMEOUT_MS", 30_000)?,
            name: read_secret_optional("TUNNEL_NAME")?,
            credentials_path: read_secret_optional("TUNNEL_CREDENTIALS_PATH")?,
        };

        let port_range_start = env_parse("PORT_RANGE_START", 5001u16)?;
        let port_range_end = env_parse("PORT_RANGE_END", 5999u16)?;
        anyhow::ensure!(
            port_range_start <= port_range_end,
            "PORT_RANGE_START must not exceed PORT_RANGE_END"
        );

        Ok(Config {
            port: env_parse("PORT", 3000u16)?,
            log_level: env_or("LOG_LEVEL", "info"),
            trust_proxy: env_parse("TRUST_PROXY", false)?,
            cors_origin: env::var("CORS_ORIGIN").ok().filter(|s| !s.is_empty()),
            rate_limit_max: env_parse("RATE_LIMIT_MAX", 100u32)?,
            webhook_secret,
            redis,
            job_concurrency: env_parse("JOB_CONCURRENCY", 3usize)?,
            job_max_attempts: env_parse("JOB_MAX_ATTEMPTS", 3u32)?,
            container_health_timeout: env_millis("CONTAINER_HEALTH_TIMEOUT_MS", 5_000)?,
            preview_url_attempts: env_parse("PREVIEW_URL_ATTEMPTS", 6u32)?,
            preview_url_delay: env_millis("PREVIEW_URL_DELAY_MS", 2_000)?,
            preview_url_request_timeout: env_millis("PREVIEW_URL_REQUEST_TIMEOUT_MS", 8_000)?,
            service_ready_attempts: env_parse("SERVICE_READY_ATTEMPTS", 15u32)?,
            service_ready_delay: env_millis("SERVICE_READY_DELAY_MS", 2_000)?,
            tunnel,
            forge,
            engine_binary: env_or("CONTAINER_ENGINE_BIN", "docker"),
            build_file: env_or("BUILD_FILE", "Dockerfile"),
            container_port: env_parse("CONTAINER_PORT", 3000u16)?,
            port_range_start,
            port_range_end,
            record_ttl: Duration::from_secs(env_parse("DEPLOYMENT_TTL_DAYS", 7u64)? * 24 * 3600),
            sweep_interval: Duration::from_secs(env_parse("SWEEP_INTERVAL_HOURS", 6u64)? * 3600),
            sweep_max_age: Duration::from_secs(env_parse("SWEEP_MAX_AGE_HOURS", 24u64)? * 3600),
            stall_window: env_millis("JOB_STALL_WINDOW_MS", 30_000)?,
            clone_timeout: Duration::from_secs(5 * 60),
            build_timeout: Duration::from_secs(10 * 60),
            run_timeout: Duration::from_secs(60),
            tmp_root: env::var("TMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| env::temp_dir()),
        })
    }
}

#[cfg(test)]
impl Config {
    /// Baseline config for tests: tiny timeouts, no forge, stub-friendly.
    pub fn test_defaults(tmp: &std::path::Path) -> Self {
        Config {
            port: 0,
            log_level: "debug".into(),
            trust_proxy: false,
            cors_origin: None,
            rate_limit_max: 100,
            webhook_secret: "test-webhook-secret".into(),
            redis: RedisSettings {
                host: "127.0.0.1".into(),
                port: 6379,
                password: None,
                db: 0,
            },
            job_concurrency: 1,
            job_max_attempts: 3,
            container_health_timeout: Duration::from_millis(500),
            preview_url_attempts: 1,
            preview_url_delay: Duration::from_millis(1),
            preview_url_request_timeout: Duration::from_millis(200),
            service_ready_attempts: 1,
            service_ready_delay: Duration::from_millis(1),
            tunnel: TunnelSettings {
                binary: "false".into(),
                startup_timeout: Duration::from_secs(2),
                ..TunnelSettings::default()
            },
            forge: None,
            engine_binary: "true".into(),
            build_file: "Dockerfile".into(),
            container_port: 3000,
            port_range_start: 15901,
            port_range_end: 15999,
            record_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(3600),
            sweep_max_age: Duration::from_secs(3600),
            stall_window: Duration::from_secs(30),
            clone_timeout: Duration::from_secs(60),
            build_timeout: Duration::from_secs(60),
            run_timeout: Duration::from_secs(30),
            tmp_root: tmp.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn read_secret_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "secret-value").unwrap();

        env::set_var("EZ_TEST_SECRET_FILE", file.path());
        env::remove_var("EZ_TEST_SECRET");

        let result = read_secret("EZ_TEST_SECRET").unwrap();
        assert_eq!(result, "secret-value");

        env::remove_var("EZ_TEST_SECRET_FILE");
    }

    #[test]
    fn read_secret_from_env_converts_escaped_newlines() {
        env::remove_var("EZ_TEST_PEM_FILE");
        env::set_var("EZ_TEST_PEM", "line1\\nline2\\nline3");

        let result = read_secret("EZ_TEST_PEM").unwrap();
        assert_eq!(result, "line1\nline2\nline3");

        env::remove_var("EZ_TEST_PEM");
    }

    #[test]
    fn read_secret_file_takes_precedence() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "file-value").unwrap();

        env::set_var("EZ_TEST_PREC_FILE", file.path());
        env::set_var("EZ_TEST_PREC", "env-value");

        let result = read_secret("EZ_TEST_PREC").unwrap();
        assert_eq!(result, "file-value");

        env::remove_var("EZ_TEST_PREC_FILE");
        env::remove_var("EZ_TEST_PREC");
    }

    #[test]
    fn read_secret_optional_none_when_missing_or_blank() {
        env::remove_var("EZ_TEST_OPT_FILE");
        env::remove_var("EZ_TEST_OPT");
        assert_eq!(read_secret_optional("EZ_TEST_OPT").unwrap(), None);

        env::set_var("EZ_TEST_OPT", "   ");
        assert_eq!(read_secret_optional("EZ_TEST_OPT").unwrap(), None);
        env::remove_var("EZ_TEST_OPT");
    }

    #[test]
    fn read_secret_optional_errors_when_file_unreadable() {
        env::set_var("EZ_TEST_BADF_FILE", "/nonexistent/path/to/secret");
        env::remove_var("EZ_TEST_BADF");

        let result = read_secret_optional("EZ_TEST_BADF");
        assert!(result.is_err());

        env::remove_var("EZ_TEST_BADF_FILE");
    }

    #[test]
    fn redis_url_with_and_without_password() {
        let mut settings = RedisSettings {
            host: "redis.internal".into(),
            port: 6380,
            password: None,
            db: 2,
        };
        assert_eq!(settings.url(), "redis://redis.internal:6380/2");

        settings.password = Some("hunter2".into());
        assert_eq!(settings.url(), "redis://:hunter2@redis.internal:6380/2");
    }

    #[test]
    fn env_millis_parses_and_defaults() {
        env::remove_var("EZ_TEST_MS");
        assert_eq!(
            env_millis("EZ_TEST_MS", 2_000).unwrap(),
            Duration::from_secs(2)
        );
        env::set_var("EZ_TEST_MS", "750");
        assert_eq!(
            env_millis("EZ_TEST_MS", 2_000).unwrap(),
            Duration::from_millis(750)
        );
        env::set_var("EZ_TEST_MS", "not-a-number");
        assert!(env_millis("EZ_TEST_MS", 2_000).is_err());
        env::remove_var("EZ_TEST_MS");
    }
}
