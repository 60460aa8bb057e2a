use crate::cache::CachedAssistant;
use crate::config::AppConfig;
use crate::db::connector::DbConnector;
use crate::session::SessionState;
use crate::voice::VoiceTranscriber;
use crate::web::templates::init_templates;
use minijinja::Environment;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared application state for the web server.
///
/// Conversation memory lives here explicitly; each interaction reads and
/// writes the session under its lock instead of relying on any ambient
/// re-run model.
pub struct AppState {
    pub config: AppConfig,
    pub connector: Arc<DbConnector>,
    pub assistant: CachedAssistant,
    pub session: RwLock<SessionState>,
    pub transcriber: Option<VoiceTranscriber>,
    pub template_env: Environment<'static>,
    pub startup_time: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        connector: Arc<DbConnector>,
        assistant: CachedAssistant,
        transcriber: Option<VoiceTranscriber>,
    ) -> Self {
        Self {
            config,
            connector,
            assistant,
            session: RwLock::new(SessionState::new()),
            transcriber,
            template_env: init_templates(),
            startup_time: chrono::Utc::now(),
        }
    }
}
