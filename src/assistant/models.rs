use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Tabular result of executing a generated SQL statement.
///
/// Rows keep the order the database returned them in; `columns` carries the
/// result-set column names in positional order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl ResultTable {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<serde_json::Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// A copy holding at most the first `limit` rows. Used for display
    /// truncation and for prompt previews sent to the model service.
    pub fn head(&self, limit: usize) -> ResultTable {
        ResultTable {
            columns: self.columns.clone(),
            rows: self.rows.iter().take(limit).cloned().collect(),
        }
    }

    /// Serializes the table as a JSON array of row objects, preserving
    /// original row order.
    pub fn to_json_records(&self) -> serde_json::Value {
        let records: Vec<serde_json::Value> = self
            .rows
            .iter()
            .map(|row| {
                let mut obj = serde_json::Map::new();
                for (i, column) in self.columns.iter().enumerate() {
                    let value = row.get(i).cloned().unwrap_or(serde_json::Value::Null);
                    obj.insert(column.clone(), value);
                }
                serde_json::Value::Object(obj)
            })
            .collect();
        serde_json::Value::Array(records)
    }

    /// Serializes the table as RFC 4180 CSV with a header row.
    pub fn to_csv(&self) -> Result<String, csv::Error> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            let record: Vec<String> = row.iter().map(csv_field).collect();
            writer.write_record(&record)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| csv::Error::from(std::io::Error::other(e.to_string())))?;
        Ok(String::from_utf8_lossy(&bytes).to_string())
    }

    /// Stable content hash used as a memoization key component.
    pub fn fingerprint(&self) -> String {
        let serialized = serde_json::to_string(self).unwrap_or_default();
        let digest = Sha256::digest(serialized.as_bytes());
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Compact preview handed to the model service when an operation needs
    /// to see the data itself.
    pub fn preview(&self, limit: usize) -> String {
        serde_json::to_string(&self.head(limit).to_json_records()).unwrap_or_default()
    }
}

fn csv_field(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
