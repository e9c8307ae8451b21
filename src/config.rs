use anyhow::{bail, Context, Result};

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// HTTP listen port for the control API (env: PORT)
    pub port: u16,

    /// Lowest host port handed out to instances (env: MIN_PORT)
    pub min_port: u16,

    /// Highest host port handed out to instances (env: MAX_PORT)
    pub max_port: u16,

    /// Hostname callers use to reach instances on this host (env: DEFAULT_HOSTNAME)
    pub default_hostname: String,

    /// Path to the SQLite database file (env: DB_PATH)
    pub db_path: String,

    /// Docker socket path; unset means bollard's local defaults (env: DOCKER_SOCKET_PATH)
    pub docker_socket_path: Option<String>,

    /// Image for vLLM instances (env: VLLM_IMAGE)
    pub vllm_image: String,

    /// Image for the Ollama engine container (env: OLLAMA_IMAGE)
    pub ollama_image: String,

    /// Fallback API key applied when a request requires auth but supplies
    /// none (env: DEFAULT_API_KEY)
    pub default_api_key: Option<String>,

    /// HuggingFace access token forwarded to vLLM containers (env: HF_TOKEN)
    pub hf_token: Option<String>,

    /// Allowed CORS origin; unset means permissive dev mode (env: FRONTEND_URL)
    pub frontend_url: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            port: env_parse("PORT", 3001)?,
            min_port: env_parse("MIN_PORT", 8001)?,
            max_port: env_parse("MAX_PORT", 8100)?,
            default_hostname: std::env::var("DEFAULT_HOSTNAME")
                .unwrap_or_else(|_| "localhost".into()),
            db_path: std::env::var("DB_PATH")
                .unwrap_or_else(|_| "data/inference-manager.db".into()),
            docker_socket_path: std::env::var("DOCKER_SOCKET_PATH")
                .ok()
                .filter(|s| !s.is_empty()),
            vllm_image: std::env::var("VLLM_IMAGE")
                .unwrap_or_else(|_| "vllm/vllm-openai:latest".into()),
            ollama_image: std::env::var("OLLAMA_IMAGE")
                .unwrap_or_else(|_| "ollama/ollama:latest".into()),
            default_api_key: std::env::var("DEFAULT_API_KEY")
                .ok()
                .filter(|s| !s.is_empty()),
            hf_token: std::env::var("HF_TOKEN").ok().filter(|s| !s.is_empty()),
            frontend_url: std::env::var("FRONTEND_URL").ok().filter(|s| !s.is_empty()),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.min_port > self.max_port {
            bail!(
                "MIN_PORT ({}) must not exceed MAX_PORT ({})",
                self.min_port,
                self.max_port
            );
        }
        if self.min_port == 0 {
            bail!("MIN_PORT must be non-zero");
        }
        Ok(())
    }

    /// The inclusive host port range instances may be bound to.
    pub fn port_range(&self) -> std::ops::RangeInclusive<u16> {
        self.min_port..=self.max_port
    }
}

fn env_parse(name: &str, default: u16) -> Result<u16> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u16>()
            .with_context(|| format!("{name} must be a port number, got {raw:?}")),
        Err(_) => Ok(default),
    }
}
