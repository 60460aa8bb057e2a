use crate::assistant::models::ResultTable;
use crate::assistant::{AssistantError, AssistantManager, ModelService};
use moka::sync::Cache;
use sha2::{Digest, Sha256};

/// Upper bound per memoized operation. There is no time-based
/// invalidation; a result only stops being served when its input
/// arguments change.
const OP_CACHE_CAPACITY: u64 = 512;

/// One cache per wrapped model-service operation, keyed on that
/// operation's input arguments.
struct CallCache {
    questions: Cache<String, Vec<String>>,
    sql: Cache<String, String>,
    validity: Cache<String, bool>,
    chart_decisions: Cache<String, bool>,
    chart_code: Cache<String, String>,
    charts: Cache<String, Option<serde_json::Value>>,
    followups: Cache<String, Vec<String>>,
    summaries: Cache<String, Option<String>>,
}

impl CallCache {
    fn new() -> Self {
        fn cache<V: Clone + Send + Sync + 'static>() -> Cache<String, V> {
            Cache::builder().max_capacity(OP_CACHE_CAPACITY).build()
        }

        Self {
            questions: cache(),
            sql: cache(),
            validity: cache(),
            chart_decisions: cache(),
            chart_code: cache(),
            charts: cache(),
            followups: cache(),
            summaries: cache(),
        }
    }
}

/// Memoizing front for the model service. Identical arguments invoke the
/// remote service at most once for the lifetime of the process; this is a
/// cost optimization, not a correctness mechanism. Failed calls are not
/// memoized and will be retried on the next identical request.
pub struct CachedAssistant {
    manager: AssistantManager,
    cache: CallCache,
}

impl CachedAssistant {
    pub fn new(manager: AssistantManager) -> Self {
        Self {
            manager,
            cache: CallCache::new(),
        }
    }

    pub async fn generate_questions(&self, schema: &str) -> Result<Vec<String>, AssistantError> {
        let key = digest(&[schema]);
        if let Some(hit) = self.cache.questions.get(&key) {
            return Ok(hit);
        }
        let value = self.manager.generate_questions(schema).await?;
        self.cache.questions.insert(key, value.clone());
        Ok(value)
    }

    pub async fn generate_sql(
        &self,
        question: &str,
        schema: &str,
    ) -> Result<String, AssistantError> {
        let key = digest(&[question, schema]);
        if let Some(hit) = self.cache.sql.get(&key) {
            return Ok(hit);
        }
        let value = self.manager.generate_sql(question, schema).await?;
        self.cache.sql.insert(key, value.clone());
        Ok(value)
    }

    pub async fn is_sql_valid(&self, sql: &str) -> Result<bool, AssistantError> {
        let key = digest(&[sql]);
        if let Some(hit) = self.cache.validity.get(&key) {
            return Ok(hit);
        }
        let value = self.manager.is_sql_valid(sql).await?;
        self.cache.validity.insert(key, value);
        Ok(value)
    }

    pub async fn should_generate_chart(
        &self,
        question: &str,
        sql: &str,
        table: &ResultTable,
    ) -> Result<bool, AssistantError> {
        let key = digest(&[question, sql, &table.fingerprint()]);
        if let Some(hit) = self.cache.chart_decisions.get(&key) {
            return Ok(hit);
        }
        let value = self.manager.should_generate_chart(question, sql, table).await?;
        self.cache.chart_decisions.insert(key, value);
        Ok(value)
    }

    pub async fn generate_chart_code(
        &self,
        question: &str,
        sql: &str,
        table: &ResultTable,
    ) -> Result<String, AssistantError> {
        let key = digest(&[question, sql, &table.fingerprint()]);
        if let Some(hit) = self.cache.chart_code.get(&key) {
            return Ok(hit);
        }
        let value = self.manager.generate_chart_code(question, sql, table).await?;
        self.cache.chart_code.insert(key, value.clone());
        Ok(value)
    }

    pub async fn render_chart(
        &self,
        code: &str,
        table: &ResultTable,
    ) -> Result<Option<serde_json::Value>, AssistantError> {
        let key = digest(&[code, &table.fingerprint()]);
        if let Some(hit) = self.cache.charts.get(&key) {
            return Ok(hit);
        }
        let value = self.manager.render_chart(code, table).await?;
        self.cache.charts.insert(key, value.clone());
        Ok(value)
    }

    pub async fn generate_followups(
        &self,
        question: &str,
        sql: &str,
        table: &ResultTable,
    ) -> Result<Vec<String>, AssistantError> {
        let key = digest(&[question, sql, &table.fingerprint()]);
        if let Some(hit) = self.cache.followups.get(&key) {
            return Ok(hit);
        }
        let value = self.manager.generate_followups(question, sql, table).await?;
        self.cache.followups.insert(key, value.clone());
        Ok(value)
    }

    pub async fn generate_summary(
        &self,
        question: &str,
        table: &ResultTable,
    ) -> Result<Option<String>, AssistantError> {
        let key = digest(&[question, &table.fingerprint()]);
        if let Some(hit) = self.cache.summaries.get(&key) {
            return Ok(hit);
        }
        let value = self.manager.generate_summary(question, table).await?;
        self.cache.summaries.insert(key, value.clone());
        Ok(value)
    }
}

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Counters {
        sql: AtomicUsize,
        validity: AtomicUsize,
        summaries: AtomicUsize,
    }

    struct CountingService {
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl ModelService for CountingService {
        async fn generate_questions(&self, _schema: &str) -> Result<Vec<String>, AssistantError> {
            Ok(vec![])
        }

        async fn generate_sql(
            &self,
            question: &str,
            _schema: &str,
        ) -> Result<String, AssistantError> {
            self.counters.sql.fetch_add(1, Ordering::SeqCst);
            Ok(format!("SELECT '{}'", question))
        }

        async fn is_sql_valid(&self, _sql: &str) -> Result<bool, AssistantError> {
            self.counters.validity.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }

        async fn should_generate_chart(
            &self,
            _question: &str,
            _sql: &str,
            _table: &ResultTable,
        ) -> Result<bool, AssistantError> {
            Ok(false)
        }

        async fn generate_chart_code(
            &self,
            _question: &str,
            _sql: &str,
            _table: &ResultTable,
        ) -> Result<String, AssistantError> {
            Ok(String::new())
        }

        async fn render_chart(
            &self,
            _code: &str,
            _table: &ResultTable,
        ) -> Result<Option<serde_json::Value>, AssistantError> {
            Ok(None)
        }

        async fn generate_followups(
            &self,
            _question: &str,
            _sql: &str,
            _table: &ResultTable,
        ) -> Result<Vec<String>, AssistantError> {
            Ok(vec![])
        }

        async fn generate_summary(
            &self,
            _question: &str,
            _table: &ResultTable,
        ) -> Result<Option<String>, AssistantError> {
            self.counters.summaries.fetch_add(1, Ordering::SeqCst);
            Ok(Some("summary".to_string()))
        }
    }

    fn assistant() -> (CachedAssistant, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let service = CountingService {
            counters: Arc::clone(&counters),
        };
        let assistant =
            CachedAssistant::new(AssistantManager::with_service(Box::new(service)));
        (assistant, counters)
    }

    fn table() -> ResultTable {
        ResultTable::new(vec!["n".to_string()], vec![vec![json!(1)]])
    }

    #[tokio::test]
    async fn identical_arguments_invoke_the_service_at_most_once() {
        let (assistant, counters) = assistant();

        let first = assistant.generate_sql("top artists", "schema").await.unwrap();
        let second = assistant.generate_sql("top artists", "schema").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(counters.sql.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_arguments_miss_the_cache() {
        let (assistant, counters) = assistant();

        assistant.generate_sql("top artists", "schema").await.unwrap();
        assistant.generate_sql("top albums", "schema").await.unwrap();
        assistant.generate_sql("top artists", "other schema").await.unwrap();

        assert_eq!(counters.sql.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn validity_and_summary_are_memoized_independently() {
        let (assistant, counters) = assistant();
        let table = table();

        assistant.is_sql_valid("SELECT 1").await.unwrap();
        assistant.is_sql_valid("SELECT 1").await.unwrap();
        assistant.generate_summary("q", &table).await.unwrap();
        assistant.generate_summary("q", &table).await.unwrap();

        assert_eq!(counters.validity.load(Ordering::SeqCst), 1);
        assert_eq!(counters.summaries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn digest_separates_argument_boundaries() {
        // ("ab", "c") and ("a", "bc") must not collide
        assert_ne!(digest(&["ab", "c"]), digest(&["a", "bc"]));
    }
}
