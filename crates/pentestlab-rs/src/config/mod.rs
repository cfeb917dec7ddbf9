use std::{env, fs, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::models::ToolKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// Empty list means every syntactically valid target is accepted.
    pub scope_allowlist: Vec<String>,
    pub max_concurrent_scans: usize,
    pub tool_timeout_secs: u64,
    pub subscriber_buffer: usize,
    pub tools: ToolsConfig,
    pub ai: AiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub nmap_path: String,
    pub nikto_path: String,
    pub hydra_path: String,
    pub sqlmap_path: String,
    pub gobuster_path: String,
    pub nmap_default_options: String,
    pub sqlmap_default_options: String,
    pub hydra_default_service: String,
    pub hydra_default_username: String,
    pub hydra_password_list: String,
    pub gobuster_wordlist: String,
    /// Newest captured output kept per run and stream; older text is dropped.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub enabled: bool,
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path =
            env::var("PENTESTLAB_CONFIG").unwrap_or_else(|_| "config.json".to_string());
        let raw = fs::read_to_string(&path).ok();
        Self::resolve(raw.as_deref(), |key| env::var(key).ok())
            .with_context(|| format!("failed to load configuration from {path}"))
    }

    /// Layers environment overrides on top of the optional JSON file contents.
    pub fn resolve(
        file: Option<&str>,
        env_lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let mut cfg: AppConfig = match file {
            Some(raw) => serde_json::from_str(raw).context("failed to parse config file")?,
            None => Self::default(),
        };

        if let Some(v) = env_lookup("PL_HOST") {
            cfg.host = v;
        }
        if let Some(v) = env_lookup("PL_PORT") {
            cfg.port = v.parse().context("PL_PORT must be a port number")?;
        }
        if let Some(v) = env_lookup("PL_DATABASE_URL") {
            cfg.database_url = v;
        }
        if let Some(v) = env_lookup("PL_SCOPE_ALLOWLIST") {
            cfg.scope_allowlist = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = env_lookup("PL_MAX_CONCURRENT_SCANS") {
            cfg.max_concurrent_scans = v
                .parse()
                .context("PL_MAX_CONCURRENT_SCANS must be an integer")?;
        }
        if let Some(v) = env_lookup("PL_TOOL_TIMEOUT_SECS") {
            cfg.tool_timeout_secs = v.parse().context("PL_TOOL_TIMEOUT_SECS must be an integer")?;
        }
        if let Some(v) = env_lookup("PL_SUBSCRIBER_BUFFER") {
            cfg.subscriber_buffer = v.parse().context("PL_SUBSCRIBER_BUFFER must be an integer")?;
        }
        if let Some(v) = env_lookup("GROQ_API_KEY") {
            cfg.ai.api_key = v;
        }
        if let Some(v) = env_lookup("PL_AI_MODEL") {
            cfg.ai.model = v;
        }
        if let Some(v) = env_lookup("PL_AI_ENABLED") {
            cfg.ai.enabled = matches!(v.as_str(), "1" | "true" | "yes");
        }

        if cfg.max_concurrent_scans == 0 {
            anyhow::bail!("max_concurrent_scans must be at least 1");
        }
        if cfg.tools.output_limit_bytes == 0 {
            anyhow::bail!("tools.output_limit_bytes must be at least 1");
        }
        if cfg.tool_timeout_secs == 0 {
            anyhow::bail!("tool_timeout_secs must be at least 1");
        }
        Ok(cfg)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

impl ToolsConfig {
    pub fn path_for(&self, kind: ToolKind) -> &str {
        match kind {
            ToolKind::Nmap => &self.nmap_path,
            ToolKind::Nikto => &self.nikto_path,
            ToolKind::Hydra => &self.hydra_path,
            ToolKind::Sqlmap => &self.sqlmap_path,
            ToolKind::Gobuster => &self.gobuster_path,
        }
    }
}

impl AiConfig {
    pub fn is_configured(&self) -> bool {
        self.enabled && !self.api_key.is_empty()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            database_url: "sqlite://pentestlab.db".to_string(),
            scope_allowlist: vec![],
            max_concurrent_scans: 2,
            tool_timeout_secs: 600,
            subscriber_buffer: 256,
            tools: ToolsConfig::default(),
            ai: AiConfig::default(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            nmap_path: "nmap".to_string(),
            nikto_path: "nikto".to_string(),
            hydra_path: "hydra".to_string(),
            sqlmap_path: "sqlmap".to_string(),
            gobuster_path: "gobuster".to_string(),
            nmap_default_options: "-sV".to_string(),
            sqlmap_default_options: "--forms --batch".to_string(),
            hydra_default_service: "ssh".to_string(),
            hydra_default_username: "admin".to_string(),
            hydra_password_list: "/usr/share/wordlists/rockyou.txt".to_string(),
            gobuster_wordlist: "/usr/share/wordlists/dirb/common.txt".to_string(),
            output_limit_bytes: 1024 * 1024,
        }
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: String::new(),
            model: "llama3-8b-8192".to_string(),
            base_url: "https://api.groq.com/openai/v1".to_string(),
            timeout_secs: 60,
        }
    }
}
