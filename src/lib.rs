pub mod chat;
pub mod commands;
pub mod config;
pub mod db;
pub mod llm;
pub mod settings;

pub use chat::{ChatError, ChatSession, SendOutcome, SessionState, StopHandle};
pub use config::AppConfig;
pub use db::{ChatStore, Database, StoreError};
pub use llm::backend::BackendClient;
pub use llm::{ChatTransport, LlmError};
pub use settings::Settings;

use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Logs go to stderr; stdout carries the streamed reply.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Opens the database under the configured data directory and builds a
/// session against the configured backend.
pub fn open_session(
    config: &AppConfig,
) -> Result<(Arc<Database>, ChatSession<Database, BackendClient>), StoreError> {
    let database = Arc::new(Database::new(&config.data_dir)?);
    let settings = Settings::load(&database)?;
    let transport = Arc::new(BackendClient::new(config.backend_url.clone()));
    let session = ChatSession::new(database.clone(), transport, settings)
        .with_publish_interval(config.publish_interval);
    tracing::debug!(data_dir = %config.data_dir.display(), backend = %config.backend_url, "session ready");
    Ok((database, session))
}
