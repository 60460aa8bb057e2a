use crate::assistant::models::ResultTable;
use crate::cache::CachedAssistant;
use crate::db::connector::{ConnectorError, DbConnector};
use crate::session::{DisplayPrefs, SessionState};
use serde::Serialize;
use std::error::Error;
use std::fmt;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Rows shown in the table section before truncation kicks in.
pub const DISPLAY_ROW_LIMIT: usize = 10;

/// Follow-up candidates offered as selectable next questions.
pub const FOLLOWUP_LIMIT: usize = 5;

/// Infrastructure failures the pipeline does not absorb.
#[derive(Debug)]
pub enum PipelineError {
    Connector(ConnectorError),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Connector(err) => write!(f, "{}", err),
        }
    }
}

impl Error for PipelineError {}

impl From<ConnectorError> for PipelineError {
    fn from(err: ConnectorError) -> Self {
        PipelineError::Connector(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AskErrorKind {
    /// The service produced no SQL for the question.
    SqlGeneration,
    /// The generated SQL failed the validity check; the message carries the
    /// offending SQL as the explanation shown to the user.
    SqlRejected,
}

#[derive(Debug, Clone, Serialize)]
pub struct AskError {
    pub kind: AskErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableSection {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub total_rows: usize,
    pub truncated: bool,
}

impl TableSection {
    fn from_table(table: &ResultTable) -> Self {
        let total_rows = table.row_count();
        let truncated = total_rows > DISPLAY_ROW_LIMIT;
        let display = table.head(DISPLAY_ROW_LIMIT);
        Self {
            columns: display.columns,
            rows: display.rows,
            total_rows,
            truncated,
        }
    }
}

/// Everything one question produced. Sections are generated regardless of
/// display preferences; the prefs ride along so the client knows what to
/// render.
#[derive(Debug, Clone, Serialize)]
pub struct AskResponse {
    pub question: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AskError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<TableSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub followups: Vec<String>,
    pub prefs: DisplayPrefs,
}

impl AskResponse {
    fn new(question: &str, prefs: DisplayPrefs) -> Self {
        Self {
            question: question.to_string(),
            error: None,
            sql: None,
            table: None,
            chart_code: None,
            chart: None,
            chart_error: None,
            summary: None,
            followups: Vec::new(),
            prefs,
        }
    }

    fn with_error(mut self, kind: AskErrorKind, message: impl Into<String>) -> Self {
        self.error = Some(AskError {
            kind,
            message: message.into(),
        });
        self
    }
}

/// Runs the lifecycle of one question: generate SQL, validate, execute,
/// then conditionally chart, summarize, and suggest follow-ups. Strictly
/// sequential; the only early exits are the two explicit error states and
/// the empty-result skip.
pub async fn run_pipeline(
    assistant: &CachedAssistant,
    connector: &DbConnector,
    session: &RwLock<SessionState>,
    question: &str,
) -> Result<AskResponse, PipelineError> {
    let prefs = session.read().await.prefs();
    let response = AskResponse::new(question, prefs);

    let schema = connector.schema_summary().await?;

    // SQL generation; a failed call is the same as an empty answer
    let sql = match assistant.generate_sql(question, &schema).await {
        Ok(sql) => sql,
        Err(e) => {
            info!("SQL generation failed: {}", e);
            String::new()
        }
    };
    if sql.trim().is_empty() {
        return Ok(response.with_error(
            AskErrorKind::SqlGeneration,
            "I wasn't able to generate SQL for that question",
        ));
    }

    // Validity check; rejection halts the pipeline and the raw SQL itself
    // is the explanation shown to the user
    let valid = assistant.is_sql_valid(&sql).await.unwrap_or(false);
    if !valid {
        info!("Generated SQL rejected by validity check");
        return Ok(response.with_error(AskErrorKind::SqlRejected, sql));
    }

    let mut response = response;
    response.sql = Some(sql.clone());

    // Execution against the bound database
    let table = connector.run_sql(&sql).await?;
    session.write().await.set_table(table.clone());

    if table.is_empty() {
        // No data: table, chart, summary and follow-up stages are skipped
        debug!("Execution produced no rows, skipping downstream stages");
        return Ok(response);
    }

    response.table = Some(TableSection::from_table(&table));

    // Charting, only when the service judges it appropriate
    if assistant
        .should_generate_chart(question, &sql, &table)
        .await
        .unwrap_or(false)
    {
        let code = assistant
            .generate_chart_code(question, &sql, &table)
            .await
            .unwrap_or_default();

        if !code.trim().is_empty() {
            response.chart_code = Some(code.clone());
            match assistant.render_chart(&code, &table).await.ok().flatten() {
                Some(figure) => response.chart = Some(figure),
                None => {
                    response.chart_error = Some("I couldn't generate a chart".to_string());
                }
            }
        }
    }

    // Summary is independent of the charting outcome
    response.summary = assistant
        .generate_summary(question, &table)
        .await
        .ok()
        .flatten();

    // Follow-ups close the loop; the stored table is cleared immediately so
    // it cannot leak into the next question's rendering
    let followups = assistant
        .generate_followups(question, &sql, &table)
        .await
        .unwrap_or_default();
    session.write().await.clear_table();
    response.followups = followups.into_iter().take(FOLLOWUP_LIMIT).collect();

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::{AssistantError, AssistantManager, ModelService};
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Counters {
        validity: AtomicUsize,
        chart_decision: AtomicUsize,
        chart_code: AtomicUsize,
        render: AtomicUsize,
        followups: AtomicUsize,
        summary: AtomicUsize,
    }

    /// Model service with scripted answers and invocation counters.
    struct ScriptedService {
        sql: String,
        valid: bool,
        wants_chart: bool,
        chart_code: String,
        figure: Option<serde_json::Value>,
        followups: Vec<String>,
        summary: Option<String>,
        counters: Arc<Counters>,
    }

    impl ScriptedService {
        fn answering(sql: &str) -> Self {
            Self {
                sql: sql.to_string(),
                valid: true,
                wants_chart: false,
                chart_code: String::new(),
                figure: None,
                followups: Vec::new(),
                summary: None,
                counters: Arc::new(Counters::default()),
            }
        }
    }

    #[async_trait]
    impl ModelService for ScriptedService {
        async fn generate_questions(&self, _schema: &str) -> Result<Vec<String>, AssistantError> {
            Ok(vec![])
        }

        async fn generate_sql(
            &self,
            _question: &str,
            _schema: &str,
        ) -> Result<String, AssistantError> {
            Ok(self.sql.clone())
        }

        async fn is_sql_valid(&self, _sql: &str) -> Result<bool, AssistantError> {
            self.counters.validity.fetch_add(1, Ordering::SeqCst);
            Ok(self.valid)
        }

        async fn should_generate_chart(
            &self,
            _question: &str,
            _sql: &str,
            _table: &ResultTable,
        ) -> Result<bool, AssistantError> {
            self.counters.chart_decision.fetch_add(1, Ordering::SeqCst);
            Ok(self.wants_chart)
        }

        async fn generate_chart_code(
            &self,
            _question: &str,
            _sql: &str,
            _table: &ResultTable,
        ) -> Result<String, AssistantError> {
            self.counters.chart_code.fetch_add(1, Ordering::SeqCst);
            Ok(self.chart_code.clone())
        }

        async fn render_chart(
            &self,
            _code: &str,
            _table: &ResultTable,
        ) -> Result<Option<serde_json::Value>, AssistantError> {
            self.counters.render.fetch_add(1, Ordering::SeqCst);
            Ok(self.figure.clone())
        }

        async fn generate_followups(
            &self,
            _question: &str,
            _sql: &str,
            _table: &ResultTable,
        ) -> Result<Vec<String>, AssistantError> {
            self.counters.followups.fetch_add(1, Ordering::SeqCst);
            Ok(self.followups.clone())
        }

        async fn generate_summary(
            &self,
            _question: &str,
            _table: &ResultTable,
        ) -> Result<Option<String>, AssistantError> {
            self.counters.summary.fetch_add(1, Ordering::SeqCst);
            Ok(self.summary.clone())
        }
    }

    fn database_bytes(dir: &Path, row_count: i64) -> Vec<u8> {
        let path = dir.join("fixture.db");
        {
            let conn = rusqlite::Connection::open(&path).unwrap();
            conn.execute_batch("CREATE TABLE t (v INTEGER NOT NULL)").unwrap();
            for v in 1..=row_count {
                conn.execute("INSERT INTO t (v) VALUES (?1)", [v]).unwrap();
            }
        }
        let bytes = std::fs::read(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        bytes
    }

    fn context(
        dir: &Path,
        row_count: i64,
        service: ScriptedService,
    ) -> (CachedAssistant, DbConnector, RwLock<SessionState>, Arc<Counters>) {
        let counters = Arc::clone(&service.counters);
        let assistant = CachedAssistant::new(AssistantManager::with_service(Box::new(service)));
        let connector = DbConnector::new(
            dir.to_path_buf(),
            "http://unused.invalid/db".to_string(),
            2,
        );
        connector
            .bind_upload("fixture.db", &database_bytes(dir, row_count))
            .unwrap();
        (assistant, connector, RwLock::new(SessionState::new()), counters)
    }

    #[tokio::test]
    async fn empty_sql_generation_halts_before_any_downstream_call() {
        let dir = tempfile::tempdir().unwrap();
        let (assistant, connector, session, counters) =
            context(dir.path(), 3, ScriptedService::answering(""));

        let response = run_pipeline(&assistant, &connector, &session, "how many?")
            .await
            .unwrap();

        assert_eq!(response.error.as_ref().unwrap().kind, AskErrorKind::SqlGeneration);
        assert!(response.sql.is_none());
        assert!(response.table.is_none());
        assert!(session.read().await.table().is_none());
        assert_eq!(counters.validity.load(Ordering::SeqCst), 0);
        assert_eq!(counters.chart_decision.load(Ordering::SeqCst), 0);
        assert_eq!(counters.summary.load(Ordering::SeqCst), 0);
        assert_eq!(counters.followups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_sql_halts_with_the_sql_as_explanation() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = ScriptedService::answering("DELETE FROM t");
        service.valid = false;
        let (assistant, connector, session, counters) = context(dir.path(), 3, service);

        let response = run_pipeline(&assistant, &connector, &session, "drop it all")
            .await
            .unwrap();

        let error = response.error.unwrap();
        assert_eq!(error.kind, AskErrorKind::SqlRejected);
        assert_eq!(error.message, "DELETE FROM t");
        assert!(response.table.is_none());
        assert!(session.read().await.table().is_none());
        assert_eq!(counters.chart_decision.load(Ordering::SeqCst), 0);
        assert_eq!(counters.summary.load(Ordering::SeqCst), 0);
        assert_eq!(counters.followups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn successful_run_truncates_caps_followups_and_clears_table() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = ScriptedService::answering("SELECT v FROM t ORDER BY v");
        service.summary = Some("twelve values".to_string());
        service.followups = (1..=7).map(|i| format!("follow-up {}", i)).collect();
        let (assistant, connector, session, _counters) = context(dir.path(), 12, service);

        let response = run_pipeline(&assistant, &connector, &session, "list values")
            .await
            .unwrap();

        assert!(response.error.is_none());
        let table = response.table.unwrap();
        assert_eq!(table.total_rows, 12);
        assert_eq!(table.rows.len(), DISPLAY_ROW_LIMIT);
        assert!(table.truncated);
        assert_eq!(table.rows[0], vec![json!(1)]);

        assert_eq!(response.summary.as_deref(), Some("twelve values"));
        assert_eq!(response.followups.len(), FOLLOWUP_LIMIT);
        assert_eq!(response.followups[0], "follow-up 1");

        // The stored table must not leak into the next question
        assert!(session.read().await.table().is_none());
    }

    #[tokio::test]
    async fn small_results_are_shown_in_full() {
        let dir = tempfile::tempdir().unwrap();
        let service = ScriptedService::answering("SELECT v FROM t ORDER BY v");
        let (assistant, connector, session, _counters) = context(dir.path(), 4, service);

        let response = run_pipeline(&assistant, &connector, &session, "list values")
            .await
            .unwrap();

        let table = response.table.unwrap();
        assert_eq!(table.total_rows, 4);
        assert_eq!(table.rows.len(), 4);
        assert!(!table.truncated);
    }

    #[tokio::test]
    async fn empty_result_skips_downstream_stages() {
        let dir = tempfile::tempdir().unwrap();
        let service = ScriptedService::answering("SELECT v FROM t WHERE v < 0");
        let (assistant, connector, session, counters) = context(dir.path(), 3, service);

        let response = run_pipeline(&assistant, &connector, &session, "nothing matches")
            .await
            .unwrap();

        assert!(response.error.is_none());
        assert!(response.sql.is_some());
        assert!(response.table.is_none());
        assert!(response.summary.is_none());
        assert!(response.followups.is_empty());
        assert_eq!(counters.chart_decision.load(Ordering::SeqCst), 0);
        assert_eq!(counters.summary.load(Ordering::SeqCst), 0);
        assert_eq!(counters.followups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn chart_render_failure_yields_inline_chart_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = ScriptedService::answering("SELECT v FROM t");
        service.wants_chart = true;
        service.chart_code = "Plotly.newPlot(...)".to_string();
        service.figure = None;
        let (assistant, connector, session, counters) = context(dir.path(), 3, service);

        let response = run_pipeline(&assistant, &connector, &session, "chart it")
            .await
            .unwrap();

        assert_eq!(response.chart_code.as_deref(), Some("Plotly.newPlot(...)"));
        assert!(response.chart.is_none());
        assert_eq!(
            response.chart_error.as_deref(),
            Some("I couldn't generate a chart")
        );
        assert_eq!(counters.render.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn absent_chart_code_omits_the_chart_section_silently() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = ScriptedService::answering("SELECT v FROM t");
        service.wants_chart = true;
        service.chart_code = String::new();
        let (assistant, connector, session, counters) = context(dir.path(), 3, service);

        let response = run_pipeline(&assistant, &connector, &session, "chart it")
            .await
            .unwrap();

        assert!(response.chart_code.is_none());
        assert!(response.chart.is_none());
        assert!(response.chart_error.is_none());
        assert_eq!(counters.render.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn display_preferences_never_block_generation() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = ScriptedService::answering("SELECT v FROM t");
        service.summary = Some("still generated".to_string());
        service.followups = vec!["next?".to_string()];
        let (assistant, connector, session, _counters) = context(dir.path(), 3, service);

        let hidden = DisplayPrefs {
            show_sql: false,
            show_table: false,
            show_chart_code: false,
            show_chart: false,
            show_summary: false,
            show_followups: false,
        };
        session.write().await.set_prefs(hidden);

        let response = run_pipeline(&assistant, &connector, &session, "list values")
            .await
            .unwrap();

        // Sections are produced regardless; only rendering honors the prefs
        assert!(response.sql.is_some());
        assert!(response.table.is_some());
        assert_eq!(response.summary.as_deref(), Some("still generated"));
        assert_eq!(response.followups, vec!["next?"]);
        assert_eq!(response.prefs, hidden);
    }
}
