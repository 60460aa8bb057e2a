pub mod models;
pub mod providers;

use crate::config::AssistantConfig;
use async_trait::async_trait;
use self::models::ResultTable;
use std::error::Error;
use std::fmt;

#[derive(Debug)]
pub enum AssistantError {
    ConnectionError(String),
    ResponseError(String),
    ConfigError(String),
}

impl fmt::Display for AssistantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssistantError::ConnectionError(msg) => {
                write!(f, "assistant connection error: {}", msg)
            }
            AssistantError::ResponseError(msg) => write!(f, "assistant response error: {}", msg),
            AssistantError::ConfigError(msg) => write!(f, "assistant configuration error: {}", msg),
        }
    }
}

impl Error for AssistantError {}

/// Contract with the hosted text-to-SQL service.
///
/// Every natural-language and code-generation capability lives behind this
/// trait; the server only orchestrates the calls. An operation returning an
/// empty string / list means the service elected to produce nothing, which
/// the pipeline treats differently per stage (explicit error for SQL
/// generation, silent omission for the optional stages).
#[async_trait]
pub trait ModelService: Send + Sync {
    /// Candidate questions to suggest on an empty conversation.
    async fn generate_questions(&self, schema: &str) -> Result<Vec<String>, AssistantError>;

    /// Translates a question into SQL for the given schema. May be empty.
    async fn generate_sql(&self, question: &str, schema: &str) -> Result<String, AssistantError>;

    /// Judges whether a generated statement is valid, runnable SQL.
    async fn is_sql_valid(&self, sql: &str) -> Result<bool, AssistantError>;

    /// Judges whether a chart is appropriate for this question/result pair.
    async fn should_generate_chart(
        &self,
        question: &str,
        sql: &str,
        table: &ResultTable,
    ) -> Result<bool, AssistantError>;

    /// Produces chart code for the result. May be empty.
    async fn generate_chart_code(
        &self,
        question: &str,
        sql: &str,
        table: &ResultTable,
    ) -> Result<String, AssistantError>;

    /// Turns chart code plus data into a renderable figure object.
    async fn render_chart(
        &self,
        code: &str,
        table: &ResultTable,
    ) -> Result<Option<serde_json::Value>, AssistantError>;

    /// Suggested next questions given the current exchange.
    async fn generate_followups(
        &self,
        question: &str,
        sql: &str,
        table: &ResultTable,
    ) -> Result<Vec<String>, AssistantError>;

    /// Short textual summary of the result.
    async fn generate_summary(
        &self,
        question: &str,
        table: &ResultTable,
    ) -> Result<Option<String>, AssistantError>;
}

pub struct AssistantManager {
    service: Box<dyn ModelService + Send + Sync>,
}

impl AssistantManager {
    pub fn new(config: &AssistantConfig) -> Result<Self, AssistantError> {
        let service: Box<dyn ModelService + Send + Sync> = match config.backend.as_str() {
            "hosted" => Box::new(providers::hosted::HostedModelService::new(config)?),
            _ => {
                return Err(AssistantError::ConfigError(format!(
                    "Unsupported assistant backend: {}",
                    config.backend
                )))
            }
        };

        Ok(Self::with_service(service))
    }

    pub fn with_service(service: Box<dyn ModelService + Send + Sync>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl ModelService for AssistantManager {
    async fn generate_questions(&self, schema: &str) -> Result<Vec<String>, AssistantError> {
        self.service.generate_questions(schema).await
    }

    async fn generate_sql(&self, question: &str, schema: &str) -> Result<String, AssistantError> {
        self.service.generate_sql(question, schema).await
    }

    async fn is_sql_valid(&self, sql: &str) -> Result<bool, AssistantError> {
        self.service.is_sql_valid(sql).await
    }

    async fn should_generate_chart(
        &self,
        question: &str,
        sql: &str,
        table: &ResultTable,
    ) -> Result<bool, AssistantError> {
        self.service.should_generate_chart(question, sql, table).await
    }

    async fn generate_chart_code(
        &self,
        question: &str,
        sql: &str,
        table: &ResultTable,
    ) -> Result<String, AssistantError> {
        self.service.generate_chart_code(question, sql, table).await
    }

    async fn render_chart(
        &self,
        code: &str,
        table: &ResultTable,
    ) -> Result<Option<serde_json::Value>, AssistantError> {
        self.service.render_chart(code, table).await
    }

    async fn generate_followups(
        &self,
        question: &str,
        sql: &str,
        table: &ResultTable,
    ) -> Result<Vec<String>, AssistantError> {
        self.service.generate_followups(question, sql, table).await
    }

    async fn generate_summary(
        &self,
        question: &str,
        table: &ResultTable,
    ) -> Result<Option<String>, AssistantError> {
        self.service.generate_summary(question, table).await
    }
}
