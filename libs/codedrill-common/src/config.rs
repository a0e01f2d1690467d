// Runtime settings shared by the API and the CLI
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_CONFIG_PATH: &str = "config/codedrill.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub storage: StorageSettings,
    pub sandbox: SandboxSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_addr: String,
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub data_dir: PathBuf,
    pub sessions_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackend {
    Process,
    Docker,
}

impl FromStr for SandboxBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "process" => Ok(SandboxBackend::Process),
            "docker" => Ok(SandboxBackend::Docker),
            other => bail!("Unknown sandbox backend '{}' (expected 'process' or 'docker')", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub backend: SandboxBackend,
    pub timeout_seconds: u64,
    pub max_memory_mb: u64,
    pub cpu_limit: f32,
    pub max_processes: u32,
    pub max_output_bytes: usize,
    pub max_source_bytes: usize,
    pub max_concurrent: usize,
    pub python: String,
    pub isolate_network: bool,
    pub docker_image: String,
    pub extra_blocked_modules: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            cors_origins: vec!["http://localhost:5573".to_string()],
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/problems"),
            sessions_dir: PathBuf::from("sessions"),
        }
    }
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::Process,
            timeout_seconds: 10,
            max_memory_mb: 256,
            cpu_limit: 0.5,
            max_processes: 32,
            max_output_bytes: 4 * 1024 * 1024,
            max_source_bytes: 64 * 1024,
            max_concurrent: 4,
            python: "python3".to_string(),
            isolate_network: false,
            docker_image: "python:3.12-slim".to_string(),
            extra_blocked_modules: Vec::new(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            storage: StorageSettings::default(),
            sandbox: SandboxSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file. Missing fields fall back to defaults.
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let settings: Settings = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Load `config/codedrill.json` when present, then apply `CODEDRILL_*`
    /// environment overrides.
    pub fn load_default() -> Result<Self> {
        let path = Path::new(DEFAULT_CONFIG_PATH);
        let mut settings = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply overrides from a key lookup (the process environment in production).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CODEDRILL_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = lookup("CODEDRILL_CORS_ORIGINS") {
            self.server.cors_origins = v
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }
        if let Some(v) = lookup("CODEDRILL_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("CODEDRILL_SESSIONS_DIR") {
            self.storage.sessions_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("CODEDRILL_SANDBOX_BACKEND") {
            self.sandbox.backend = v.parse()?;
        }
        if let Some(v) = lookup("CODEDRILL_SANDBOX_TIMEOUT") {
            self.sandbox.timeout_seconds = v
                .parse()
                .with_context(|| format!("Invalid CODEDRILL_SANDBOX_TIMEOUT: {}", v))?;
        }
        if let Some(v) = lookup("CODEDRILL_SANDBOX_MAX_MEMORY_MB") {
            self.sandbox.max_memory_mb = v
                .parse()
                .with_context(|| format!("Invalid CODEDRILL_SANDBOX_MAX_MEMORY_MB: {}", v))?;
        }
        if let Some(v) = lookup("CODEDRILL_PYTHON") {
            self.sandbox.python = v;
        }
        if let Some(v) = lookup("CODEDRILL_DOCKER_IMAGE") {
            self.sandbox.docker_image = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.sandbox.timeout_seconds == 0 {
            bail!("sandbox.timeout_seconds must be greater than zero");
        }
        if self.sandbox.max_memory_mb < 16 {
            bail!("sandbox.max_memory_mb must be at least 16");
        }
        if self.sandbox.max_concurrent == 0 {
            bail!("sandbox.max_concurrent must be greater than zero");
        }
        if self.sandbox.python.trim().is_empty() {
            bail!("sandbox.python must name an interpreter");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.sandbox.timeout_seconds, 10);
        assert_eq!(settings.sandbox.max_memory_mb, 256);
        assert_eq!(settings.sandbox.backend, SandboxBackend::Process);
        assert_eq!(settings.storage.data_dir, PathBuf::from("data/problems"));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"sandbox": {{"timeout_seconds": 3, "backend": "docker"}}}}"#).unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.sandbox.timeout_seconds, 3);
        assert_eq!(settings.sandbox.backend, SandboxBackend::Docker);
        assert_eq!(settings.sandbox.max_memory_mb, 256);
        assert_eq!(settings.server.bind_addr, "0.0.0.0:8000");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = Settings::load(Path::new("/definitely/not/here.json"));
        assert!(result.is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("CODEDRILL_SANDBOX_TIMEOUT", "2"),
            ("CODEDRILL_PYTHON", "/usr/bin/python3.12"),
            ("CODEDRILL_SANDBOX_BACKEND", "Docker"),
            ("CODEDRILL_CORS_ORIGINS", "http://a.test, ,http://b.test"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(settings.sandbox.timeout_seconds, 2);
        assert_eq!(settings.sandbox.python, "/usr/bin/python3.12");
        assert_eq!(settings.sandbox.backend, SandboxBackend::Docker);
        assert_eq!(settings.server.cors_origins, vec!["http://a.test", "http://b.test"]);
    }

    #[test]
    fn test_invalid_env_value_is_rejected() {
        let mut settings = Settings::default();
        let result = settings.apply_env(|key| {
            (key == "CODEDRILL_SANDBOX_TIMEOUT").then(|| "soon".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_timeout_fails_validation() {
        let mut settings = Settings::default();
        settings.sandbox.timeout_seconds = 0;
        assert!(settings.validate().is_err());
    }
}
