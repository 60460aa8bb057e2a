use crate::assistant::models::ResultTable;
use crate::db::db_pool::SqliteConnectionManager;
use moka::sync::Cache;
use r2d2::Pool;
use rusqlite::types::ValueRef;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::error::Error;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tempfile::TempPath;
use tracing::{debug, info};

/// Upper bound on memoized execution results.
const EXEC_CACHE_CAPACITY: u64 = 256;

#[derive(Debug)]
pub enum ConnectorError {
    IoError(std::io::Error),
    DownloadError(String),
    DatabaseError(String),
    PoolError(String),
    NoBinding,
}

impl fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectorError::IoError(err) => write!(f, "IO error: {}", err),
            ConnectorError::DownloadError(msg) => write!(f, "Download error: {}", msg),
            ConnectorError::DatabaseError(msg) => write!(f, "Database error: {}", msg),
            ConnectorError::PoolError(msg) => write!(f, "Connection pool error: {}", msg),
            ConnectorError::NoBinding => write!(f, "No database is bound to this session"),
        }
    }
}

impl Error for ConnectorError {}

impl From<std::io::Error> for ConnectorError {
    fn from(err: std::io::Error) -> Self {
        ConnectorError::IoError(err)
    }
}

impl From<rusqlite::Error> for ConnectorError {
    fn from(err: rusqlite::Error) -> Self {
        ConnectorError::DatabaseError(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BindingSource {
    Default,
    Uploaded { file_name: String },
}

/// Description of the active binding, as reported to the UI.
#[derive(Debug, Clone, Serialize)]
pub struct BindingInfo {
    pub source: String,
    pub file_name: Option<String>,
}

#[derive(Clone)]
struct Binding {
    /// Content identity: "default" for the bundled dataset, a SHA-256 hex
    /// digest for uploads. Also the execution cache key prefix.
    identity: String,
    source: BindingSource,
    path: PathBuf,
    pool: Pool<SqliteConnectionManager>,
    // Keeps the staged temp file alive for as long as it is bound
    _staged: Option<Arc<TempPath>>,
}

/// Binds the session to exactly one SQLite source and executes generated
/// SQL against it. Uploads are staged to a temporary file since the
/// execution path requires a filesystem path; the bundled default is
/// downloaded once into the data directory.
pub struct DbConnector {
    data_dir: PathBuf,
    default_url: String,
    pool_size: u32,
    http: reqwest::Client,
    binding: RwLock<Option<Binding>>,
    exec_cache: Cache<String, ResultTable>,
}

impl DbConnector {
    pub fn new(data_dir: PathBuf, default_url: String, pool_size: u32) -> Self {
        Self {
            data_dir,
            default_url,
            pool_size,
            http: reqwest::Client::new(),
            binding: RwLock::new(None),
            exec_cache: Cache::builder().max_capacity(EXEC_CACHE_CAPACITY).build(),
        }
    }

    /// Binds the well-known default dataset, downloading it on first use.
    /// A no-op when the default is already bound.
    pub async fn bind_default(&self) -> Result<BindingInfo, ConnectorError> {
        {
            let current = self.binding.read().unwrap();
            if let Some(binding) = current.as_ref() {
                if binding.source == BindingSource::Default {
                    return Ok(binding_info(binding));
                }
            }
        }

        let path = self.data_dir.join("default.sqlite");
        if !path.exists() {
            info!("Downloading default database from {}", self.default_url);
            let response = self
                .http
                .get(&self.default_url)
                .send()
                .await
                .map_err(|e| ConnectorError::DownloadError(e.to_string()))?;

            if !response.status().is_success() {
                return Err(ConnectorError::DownloadError(format!(
                    "server responded with status code: {}",
                    response.status()
                )));
            }

            let bytes = response
                .bytes()
                .await
                .map_err(|e| ConnectorError::DownloadError(e.to_string()))?;
            tokio::fs::write(&path, &bytes).await?;
        }

        let pool = build_pool(&path, self.pool_size)?;
        let binding = Binding {
            identity: "default".to_string(),
            source: BindingSource::Default,
            path,
            pool,
            _staged: None,
        };
        let info = binding_info(&binding);
        *self.binding.write().unwrap() = Some(binding);
        Ok(info)
    }

    /// Stages an uploaded database to a temporary file and binds it,
    /// superseding the current binding for the rest of the session.
    /// Rebinding with byte-identical content is a no-op.
    pub fn bind_upload(&self, file_name: &str, bytes: &[u8]) -> Result<BindingInfo, ConnectorError> {
        let identity = content_identity(bytes);

        {
            let current = self.binding.read().unwrap();
            if let Some(binding) = current.as_ref() {
                if binding.identity == identity {
                    debug!("Upload matches the active binding, reusing it");
                    return Ok(binding_info(binding));
                }
            }
        }

        let mut staged = tempfile::Builder::new()
            .prefix("textql-upload-")
            .suffix(".db")
            .tempfile_in(&self.data_dir)?;
        staged.write_all(bytes)?;
        staged.flush()?;
        let temp_path = staged.into_temp_path();
        let path = temp_path.to_path_buf();

        let pool = build_pool(&path, self.pool_size)?;
        let binding = Binding {
            identity,
            source: BindingSource::Uploaded {
                file_name: file_name.to_string(),
            },
            path,
            pool,
            _staged: Some(Arc::new(temp_path)),
        };
        let info = binding_info(&binding);
        info!("Bound uploaded database {}", file_name);
        *self.binding.write().unwrap() = Some(binding);
        Ok(info)
    }

    pub fn current_binding(&self) -> Option<BindingInfo> {
        self.binding.read().unwrap().as_ref().map(binding_info)
    }

    /// Filesystem path of the active binding. Mostly useful in tests.
    pub fn bound_path(&self) -> Option<PathBuf> {
        self.binding.read().unwrap().as_ref().map(|b| b.path.clone())
    }

    /// Executes SQL against the active binding. Results are memoized per
    /// (binding, statement) pair; an upload changes the binding identity
    /// and therefore the key space.
    pub async fn run_sql(&self, sql: &str) -> Result<ResultTable, ConnectorError> {
        let (identity, pool) = {
            let current = self.binding.read().unwrap();
            let binding = current.as_ref().ok_or(ConnectorError::NoBinding)?;
            (binding.identity.clone(), binding.pool.clone())
        };

        let key = format!("{}:{}", identity, sql);
        if let Some(hit) = self.exec_cache.get(&key) {
            debug!("Execution cache hit");
            return Ok(hit);
        }

        let sql = sql.to_string();
        let table = tokio::task::spawn_blocking(move || execute_sql(&pool, &sql))
            .await
            .map_err(|e| ConnectorError::DatabaseError(e.to_string()))??;

        self.exec_cache.insert(key, table.clone());
        Ok(table)
    }

    /// Markdown description of the bound database's tables, columns, and a
    /// few sample rows, handed to the model service as context.
    pub async fn schema_summary(&self) -> Result<String, ConnectorError> {
        let pool = {
            let current = self.binding.read().unwrap();
            let binding = current.as_ref().ok_or(ConnectorError::NoBinding)?;
            binding.pool.clone()
        };

        tokio::task::spawn_blocking(move || describe_schema(&pool))
            .await
            .map_err(|e| ConnectorError::DatabaseError(e.to_string()))?
    }
}

fn binding_info(binding: &Binding) -> BindingInfo {
    match &binding.source {
        BindingSource::Default => BindingInfo {
            source: "default".to_string(),
            file_name: None,
        },
        BindingSource::Uploaded { file_name } => BindingInfo {
            source: "uploaded".to_string(),
            file_name: Some(file_name.clone()),
        },
    }
}

fn content_identity(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn build_pool(path: &Path, size: u32) -> Result<Pool<SqliteConnectionManager>, ConnectorError> {
    let manager = SqliteConnectionManager::new(path.to_string_lossy().to_string());
    Pool::builder()
        .max_size(size)
        .build(manager)
        .map_err(|e| ConnectorError::PoolError(e.to_string()))
}

fn execute_sql(
    pool: &Pool<SqliteConnectionManager>,
    sql: &str,
) -> Result<ResultTable, ConnectorError> {
    let conn = pool.get().map_err(|e| ConnectorError::PoolError(e.to_string()))?;
    let mut stmt = conn.prepare(sql)?;

    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let column_count = columns.len();

    let mut out = Vec::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let mut record = Vec::with_capacity(column_count);
        for i in 0..column_count {
            record.push(value_to_json(row.get_ref(i)?));
        }
        out.push(record);
    }

    Ok(ResultTable::new(columns, out))
}

fn value_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(text) => serde_json::Value::String(String::from_utf8_lossy(text).to_string()),
        ValueRef::Blob(blob) => serde_json::Value::String(String::from_utf8_lossy(blob).to_string()),
    }
}

fn describe_schema(pool: &Pool<SqliteConnectionManager>) -> Result<String, ConnectorError> {
    let conn = pool.get().map_err(|e| ConnectorError::PoolError(e.to_string()))?;

    let mut summary = String::from("# DATABASE SCHEMA\n\n");

    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .filter_map(Result::ok)
        .collect();

    if tables.is_empty() {
        summary.push_str("No tables found in this database.\n");
        return Ok(summary);
    }

    for table in &tables {
        summary.push_str(&format!("## Table: {}\n\n", table));

        let mut col_stmt = conn.prepare(&format!("PRAGMA table_info(\"{}\")", table))?;
        let columns: Vec<(String, String, bool)> = col_stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(1)?,     // name
                    row.get::<_, String>(2)?,     // type
                    row.get::<_, i64>(3)? == 0,   // notnull (0 = nullable)
                ))
            })?
            .filter_map(Result::ok)
            .collect();

        summary.push_str("| Column Name | Data Type | Nullable |\n");
        summary.push_str("|------------|-----------|----------|\n");
        for (name, data_type, nullable) in &columns {
            summary.push_str(&format!(
                "| {} | {} | {} |\n",
                name,
                data_type,
                if *nullable { "YES" } else { "NO" }
            ));
        }
        summary.push('\n');

        summary.push_str("### Sample Data:\n\n");
        match execute_sql(pool, &format!("SELECT * FROM \"{}\" LIMIT 3", table)) {
            Ok(sample) => {
                summary.push_str(&format!("| {} |\n", sample.columns.join(" | ")));
                summary.push_str(&format!(
                    "|{}\n",
                    " --- |".repeat(sample.columns.len())
                ));
                for row in &sample.rows {
                    let cells: Vec<String> = row
                        .iter()
                        .map(|v| match v {
                            serde_json::Value::Null => "NULL".to_string(),
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect();
                    summary.push_str(&format!("| {} |\n", cells.join(" | ")));
                }
                summary.push('\n');
            }
            Err(_) => {
                summary.push_str("Could not retrieve sample data.\n\n");
            }
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Builds an on-disk SQLite database and returns its raw bytes.
    fn database_bytes(dir: &Path, name: &str, value: i64) -> Vec<u8> {
        let path = dir.join(name);
        {
            let conn = rusqlite::Connection::open(&path).unwrap();
            conn.execute_batch(&format!(
                "CREATE TABLE t (v INTEGER NOT NULL); INSERT INTO t (v) VALUES ({});",
                value
            ))
            .unwrap();
        }
        std::fs::read(&path).unwrap()
    }

    fn connector(dir: &Path) -> DbConnector {
        DbConnector::new(dir.to_path_buf(), "http://unused.invalid/db".to_string(), 2)
    }

    #[tokio::test]
    async fn upload_supersedes_previous_binding() {
        let dir = tempfile::tempdir().unwrap();
        let connector = connector(dir.path());

        let first = database_bytes(dir.path(), "first.db", 1);
        let second = database_bytes(dir.path(), "second.db", 2);

        connector.bind_upload("first.db", &first).unwrap();
        let table = connector.run_sql("SELECT v FROM t").await.unwrap();
        assert_eq!(table.rows, vec![vec![json!(1)]]);

        connector.bind_upload("second.db", &second).unwrap();
        let table = connector.run_sql("SELECT v FROM t").await.unwrap();
        assert_eq!(table.rows, vec![vec![json!(2)]]);
    }

    #[tokio::test]
    async fn rebinding_identical_content_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let connector = connector(dir.path());
        let bytes = database_bytes(dir.path(), "db.db", 7);

        connector.bind_upload("db.db", &bytes).unwrap();
        let staged = connector.bound_path().unwrap();

        connector.bind_upload("db.db", &bytes).unwrap();
        assert_eq!(connector.bound_path().unwrap(), staged);
    }

    #[tokio::test]
    async fn execution_results_are_memoized_per_statement() {
        let dir = tempfile::tempdir().unwrap();
        let connector = connector(dir.path());
        let bytes = database_bytes(dir.path(), "db.db", 10);
        connector.bind_upload("db.db", &bytes).unwrap();

        let before = connector.run_sql("SELECT v FROM t").await.unwrap();

        // Mutate the bound file behind the connector's back; the memoized
        // result must still be served for the identical statement.
        let bound = connector.bound_path().unwrap();
        rusqlite::Connection::open(&bound)
            .unwrap()
            .execute("UPDATE t SET v = 99", [])
            .unwrap();

        let after = connector.run_sql("SELECT v FROM t").await.unwrap();
        assert_eq!(before, after);

        // A different statement misses the cache and sees the new value
        let fresh = connector.run_sql("SELECT v AS w FROM t").await.unwrap();
        assert_eq!(fresh.rows, vec![vec![json!(99)]]);
    }

    #[tokio::test]
    async fn run_sql_without_binding_fails() {
        let dir = tempfile::tempdir().unwrap();
        let connector = connector(dir.path());
        let err = connector.run_sql("SELECT 1").await.unwrap_err();
        assert!(matches!(err, ConnectorError::NoBinding));
    }

    #[tokio::test]
    async fn schema_summary_lists_tables_and_columns() {
        let dir = tempfile::tempdir().unwrap();
        let connector = connector(dir.path());
        let bytes = database_bytes(dir.path(), "db.db", 1);
        connector.bind_upload("db.db", &bytes).unwrap();

        let summary = connector.schema_summary().await.unwrap();
        assert!(summary.contains("## Table: t"));
        assert!(summary.contains("| v | INTEGER | NO |"));
    }
}
