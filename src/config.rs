use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// What to do when a webhook batch contains a message from a user without
/// an entitlement.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnauthorizedPolicy {
    /// Stop at the first unentitled user and answer the whole batch with 403.
    /// Later events in the same batch are never looked at.
    #[default]
    AbortBatch,
    /// Notify the unentitled user and move on to the next event.
    SkipEvent,
}

impl std::fmt::Display for UnauthorizedPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnauthorizedPolicy::AbortBatch => write!(f, "abort_batch"),
            UnauthorizedPolicy::SkipEvent => write!(f, "skip_event"),
        }
    }
}

impl std::str::FromStr for UnauthorizedPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "abort_batch" => Ok(UnauthorizedPolicy::AbortBatch),
            "skip_event" => Ok(UnauthorizedPolicy::SkipEvent),
            other => anyhow::bail!(
                "Unknown unauthorized policy '{}' (expected abort_batch or skip_event)",
                other
            ),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub line: LineConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub entitlements: EntitlementsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LineConfig {
    #[serde(default)]
    pub channel_access_token: String,
    #[serde(default)]
    pub channel_secret: String,
    #[serde(default = "default_line_base_url")]
    pub base_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token required on the admin endpoints. `None` leaves them open.
    #[serde(default)]
    pub admin_token: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct EntitlementsConfig {
    /// Users entitled at startup. The set resets to this list on restart.
    #[serde(default)]
    pub paid_user_ids: Vec<String>,
    #[serde(default)]
    pub on_unauthorized: UnauthorizedPolicy,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            channel_access_token: String::new(),
            channel_secret: String::new(),
            base_url: default_line_base_url(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            base_url: default_llm_base_url(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            system_prompt: default_system_prompt(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            admin_token: None,
        }
    }
}

fn default_line_base_url() -> String {
    "https://api.line.me".to_string()
}

fn default_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_max_tokens() -> u32 {
    100
}

fn default_temperature() -> f32 {
    0.7
}

fn default_system_prompt() -> String {
    "You are a fortune teller. Listen kindly to what the user tells you \
     and give them an appropriate fortune reading."
        .to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

impl Config {
    /// Load configuration: optional TOML file, then environment overrides,
    /// then validation. Fails if a required credential is missing.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let content = match path {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?,
            None => String::new(),
        };

        Self::from_sources(&content, |key| std::env::var(key).ok())
    }

    /// Build a config from TOML text and an environment lookup.
    pub fn from_sources<F>(toml_content: &str, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config file")?;
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env<F>(&mut self, env: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("LINE_CHANNEL_ACCESS_TOKEN") {
            self.line.channel_access_token = v;
        }
        if let Some(v) = var("LINE_CHANNEL_SECRET") {
            self.line.channel_secret = v;
        }
        if let Some(v) = var("LINE_API_BASE_URL") {
            self.line.base_url = v;
        }
        if let Some(v) = var("OPENAI_API_KEY") {
            self.llm.api_key = v;
        }
        if let Some(v) = var("OPENAI_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = var("OPENAI_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = var("HOST") {
            self.server.host = v;
        }
        if let Some(v) = var("PORT") {
            self.server.port = v
                .trim()
                .parse()
                .with_context(|| format!("PORT is not a valid port number: {}", v))?;
        }
        if let Some(v) = var("ADMIN_TOKEN") {
            self.server.admin_token = Some(v);
        }
        if let Some(v) = var("PAID_USER_IDS") {
            self.entitlements.paid_user_ids = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = var("UNAUTHORIZED_POLICY") {
            self.entitlements.on_unauthorized = v.parse()?;
        }

        // An empty token in the file means "no admin auth", not "empty bearer".
        self.server.admin_token = self
            .server
            .admin_token
            .take()
            .filter(|t| !t.trim().is_empty());

        Ok(())
    }

    /// Reject configs missing a credential the relay cannot work without.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.line.channel_access_token.trim().is_empty() {
            missing.push("LINE_CHANNEL_ACCESS_TOKEN");
        }
        if self.line.channel_secret.trim().is_empty() {
            missing.push("LINE_CHANNEL_SECRET");
        }
        if self.llm.api_key.trim().is_empty() {
            missing.push("OPENAI_API_KEY");
        }

        if !missing.is_empty() {
            anyhow::bail!("Missing required configuration: {}", missing.join(", "));
        }
        Ok(())
    }

    /// Socket address string the server binds to.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
