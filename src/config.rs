use crate::engine::BridgeOptions;
use clap::{ArgAction, Parser};
use clap::builder::BoolishValueParser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration. Every flag falls back to its environment variable.
#[derive(Parser, Debug, Clone)]
#[command(name = "whatsapp-gateway", about = "HTTP gateway for sending WhatsApp messages")]
pub struct GatewayConfig {
    /// HTTP listen port
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0")]
    pub bind_addr: IpAddr,

    /// Shared secret expected in the `x-api-key` header. Unset or empty disables the check.
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Path prefix the routes are mounted under
    #[arg(long, env = "API_PREFIX", default_value = "/api")]
    pub api_prefix: String,

    /// Directory holding persisted session credentials
    #[arg(long, env = "WWEBJS_SESSION_DIR", default_value = ".wwebjs_auth")]
    pub session_dir: PathBuf,

    #[arg(
        long,
        env = "PUPPETEER_HEADLESS",
        default_value = "true",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub headless: bool,

    /// Extra browser arguments (comma-separated)
    #[arg(long, env = "PUPPETEER_ARGS", value_delimiter = ',', allow_hyphen_values = true)]
    pub browser_args: Vec<String>,

    #[arg(long, env = "PUPPETEER_EXECUTABLE_PATH")]
    pub executable_path: Option<String>,

    /// WebSocket endpoint of the engine bridge
    #[arg(long, env = "ENGINE_URL", default_value = "ws://127.0.0.1:3001/engine")]
    pub engine_url: String,

    /// Seconds to wait for a single engine request
    #[arg(long, env = "ENGINE_REQUEST_TIMEOUT_SECS", default_value_t = 60)]
    pub engine_request_timeout_secs: u64,

    /// Seconds a QR challenge stays valid
    #[arg(long, env = "QR_TTL_SECS", default_value_t = 120)]
    pub qr_ttl_secs: u64,

    /// Upper bound for `/qr/wait`
    #[arg(long, env = "QR_WAIT_SECS", default_value_t = 30)]
    pub qr_wait_secs: u64,
}

impl GatewayConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    pub fn qr_ttl(&self) -> Duration {
        Duration::from_secs(self.qr_ttl_secs)
    }

    pub fn qr_wait(&self) -> Duration {
        Duration::from_secs(self.qr_wait_secs)
    }

    pub fn engine_request_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_request_timeout_secs)
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|key| !key.is_empty())
    }

    pub fn bridge_options(&self) -> BridgeOptions {
        BridgeOptions {
            session_dir: self.session_dir.clone(),
            headless: self.headless,
            browser_args: self
                .browser_args
                .iter()
                .map(|arg| arg.trim())
                .filter(|arg| !arg.is_empty())
                .map(str::to_string)
                .collect(),
            executable_path: self.executable_path.clone(),
        }
    }
}
