use crate::chat::notifier::DEFAULT_PUBLISH_INTERVAL;
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";

/// Runtime configuration shared by every command.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub backend_url: String,
    pub data_dir: PathBuf,
    pub publish_interval: Duration,
}

impl AppConfig {
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ai-chat")
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            data_dir: Self::default_data_dir(),
            publish_interval: DEFAULT_PUBLISH_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    /// Base URL of the chat backend
    #[arg(long, env = "AI_CHAT_BACKEND_URL", default_value = DEFAULT_BACKEND_URL)]
    pub backend_url: String,

    /// Directory holding the chat database
    #[arg(long, env = "AI_CHAT_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Minimum milliseconds between streamed screen updates
    #[arg(long, env = "AI_CHAT_PUBLISH_INTERVAL_MS", default_value_t = 100)]
    pub publish_interval_ms: u64,
}

impl From<ConfigArgs> for AppConfig {
    fn from(args: ConfigArgs) -> Self {
        Self {
            backend_url: args.backend_url,
            data_dir: args.data_dir.unwrap_or_else(AppConfig::default_data_dir),
            publish_interval: Duration::from_millis(args.publish_interval_ms),
        }
    }
}
