use std::fmt;

use camino::Utf8PathBuf;
use directories::ProjectDirs;
use serde::Serialize;

use crate::error::UploadError;

pub const DEFAULT_BASE_URL: &str = "https://sandbox.qbench.net/api";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Sandbox,
    Production,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Sandbox => write!(f, "sandbox"),
            Environment::Production => write!(f, "production"),
        }
    }
}

/// Process-wide settings, built once at start-up and passed down by reference.
#[derive(Clone)]
pub struct Settings {
    pub environment: Environment,
    pub qbench_base_url: String,
    pub qbench_client_id: String,
    pub qbench_client_secret: String,
    pub qbench_token_url: Option<String>,
    pub skip_processed_tests: bool,
    pub dry_run: bool,
    pub audit_dir: Option<Utf8PathBuf>,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("environment", &self.environment)
            .field("qbench_base_url", &self.qbench_base_url)
            .field("qbench_client_id", &self.qbench_client_id)
            .field("qbench_client_secret", &"<redacted>")
            .field("qbench_token_url", &self.qbench_token_url)
            .field("skip_processed_tests", &self.skip_processed_tests)
            .field("dry_run", &self.dry_run)
            .field("audit_dir", &self.audit_dir)
            .finish()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            environment: Environment::Sandbox,
            qbench_base_url: DEFAULT_BASE_URL.to_string(),
            qbench_client_id: String::new(),
            qbench_client_secret: String::new(),
            qbench_token_url: None,
            skip_processed_tests: true,
            dry_run: false,
            audit_dir: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, UploadError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, UploadError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let environment = match read("POTENCY_ENVIRONMENT").as_deref() {
            None => Environment::Sandbox,
            Some(value) if value.eq_ignore_ascii_case("sandbox") => Environment::Sandbox,
            Some(value) if value.eq_ignore_ascii_case("production") => Environment::Production,
            Some(value) => {
                return Err(UploadError::InvalidSetting {
                    name: "POTENCY_ENVIRONMENT",
                    value: value.to_string(),
                });
            }
        };

        let defaults = Settings::default();
        Ok(Self {
            environment,
            qbench_base_url: read("QBENCH_BASE_URL").unwrap_or(defaults.qbench_base_url),
            qbench_client_id: read("QBENCH_CLIENT_ID").unwrap_or_default(),
            qbench_client_secret: read("QBENCH_CLIENT_SECRET").unwrap_or_default(),
            qbench_token_url: read("QBENCH_TOKEN_URL"),
            skip_processed_tests: parse_bool(
                "QBENCH_SKIP_PROCESSED_TESTS",
                read("QBENCH_SKIP_PROCESSED_TESTS"),
                defaults.skip_processed_tests,
            )?,
            dry_run: parse_bool("QBENCH_DRY_RUN", read("QBENCH_DRY_RUN"), defaults.dry_run)?,
            audit_dir: read("POTENCY_AUDIT_DIR").map(Utf8PathBuf::from),
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    /// Credentials are only needed once a run talks to QBench.
    pub fn require_credentials(&self) -> Result<(), UploadError> {
        if self.qbench_client_id.is_empty() {
            return Err(UploadError::MissingSetting("QBENCH_CLIENT_ID"));
        }
        if self.qbench_client_secret.is_empty() {
            return Err(UploadError::MissingSetting("QBENCH_CLIENT_SECRET"));
        }
        Ok(())
    }

    /// Explicit token URL, else the base URL without a trailing `/api` plus `/oauth/token`.
    pub fn token_endpoint(&self) -> String {
        if let Some(url) = &self.qbench_token_url {
            return url.clone();
        }
        let base = self.qbench_base_url.trim_end_matches('/');
        let root = base.strip_suffix("/api").unwrap_or(base);
        format!("{root}/oauth/token")
    }

    pub fn resolve_audit_dir(&self) -> Result<Utf8PathBuf, UploadError> {
        if let Some(dir) = &self.audit_dir {
            return Ok(dir.clone());
        }
        ProjectDirs::from("net", "qbench", "potency-upload")
            .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.data_dir().join("runs")).ok())
            .ok_or_else(|| UploadError::Filesystem("unable to resolve audit directory".to_string()))
    }
}

fn parse_bool(name: &'static str, value: Option<String>, default: bool) -> Result<bool, UploadError> {
    let Some(value) = value else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(UploadError::InvalidSetting { name, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_endpoint_strips_api_segment() {
        let settings = Settings {
            qbench_base_url: "https://lab.qbench.net/api/".to_string(),
            ..Settings::default()
        };
        assert_eq!(settings.token_endpoint(), "https://lab.qbench.net/oauth/token");
    }

    #[test]
    fn explicit_token_url_wins() {
        let settings = Settings {
            qbench_token_url: Some("https://auth.example/token".to_string()),
            ..Settings::default()
        };
        assert_eq!(settings.token_endpoint(), "https://auth.example/token");
    }
}
