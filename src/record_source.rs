use crate::types::{AgencyRecord, PipelineError, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info};

/// Supplies the ordered, finite set of records a run processes. Re-iterating
/// over the same backing dataset yields the same records.
pub trait RecordSource: Send + Sync {
    /// Human-readable name for logs.
    fn source_name(&self) -> String;

    /// Read all records. Fails with `SourceUnavailable` if the backing
    /// dataset cannot be read or contains a row that does not map to a
    /// record.
    fn records(&self) -> Result<Vec<AgencyRecord>>;
}

/// Which dataset keys map to which record fields. Keys not named here become
/// entries in the record's facts map.
#[derive(Debug, Clone)]
pub struct ColumnMapping {
    pub id: String,
    pub name: String,
    pub locale: String,
    pub category: String,
    pub source_urls: String,
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self {
            id: "id".to_string(),
            name: "name".to_string(),
            locale: "locale".to_string(),
            category: "category".to_string(),
            source_urls: "source_urls".to_string(),
        }
    }
}

impl ColumnMapping {
    fn record_from_row(&self, row: &Value, line: usize) -> Result<AgencyRecord> {
        let obj = row.as_object().ok_or_else(|| {
            PipelineError::SourceUnavailable(format!("line {line}: row is not a JSON object"))
        })?;

        let record_id = string_field(obj, &self.id).ok_or_else(|| {
            PipelineError::SourceUnavailable(format!("line {line}: missing record id ({})", self.id))
        })?;
        let name = string_field(obj, &self.name).ok_or_else(|| {
            PipelineError::SourceUnavailable(format!(
                "line {line}: record {record_id} missing name ({})",
                self.name
            ))
        })?;

        let source_urls = match obj.get(&self.source_urls) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Some(Value::String(s)) => s
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            _ => Vec::new(),
        };

        let reserved = [
            self.id.as_str(),
            self.name.as_str(),
            self.locale.as_str(),
            self.category.as_str(),
            self.source_urls.as_str(),
        ];
        let mut facts = BTreeMap::new();
        for (key, value) in obj {
            if reserved.contains(&key.as_str()) {
                continue;
            }
            if let Some(text) = scalar_to_string(value) {
                facts.insert(key.clone(), text);
            }
        }

        Ok(AgencyRecord {
            record_id,
            name,
            locale: string_field(obj, &self.locale),
            category: string_field(obj, &self.category),
            facts,
            source_urls,
        })
    }
}

fn string_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Record source backed by a JSON-lines dataset, one object per agency.
pub struct JsonlRecordSource {
    path: PathBuf,
    mapping: ColumnMapping,
}

impl JsonlRecordSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mapping: ColumnMapping::default(),
        }
    }

    pub fn with_mapping(mut self, mapping: ColumnMapping) -> Self {
        self.mapping = mapping;
        self
    }
}

impl RecordSource for JsonlRecordSource {
    fn source_name(&self) -> String {
        format!("jsonl:{}", self.path.display())
    }

    fn records(&self) -> Result<Vec<AgencyRecord>> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            PipelineError::SourceUnavailable(format!("{}: {e}", self.path.display()))
        })?;

        let mut records = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let row: Value = serde_json::from_str(line).map_err(|e| {
                PipelineError::SourceUnavailable(format!("line {}: {e}", idx + 1))
            })?;
            let record = self.mapping.record_from_row(&row, idx + 1)?;
            debug!("Loaded record {} ({})", record.record_id, record.name);
            records.push(record);
        }

        info!(
            "Loaded {} records from {}",
            records.len(),
            self.path.display()
        );
        Ok(records)
    }
}

/// In-memory record source, used by tests and embedders that already hold
/// their records.
pub struct InMemoryRecordSource {
    records: Vec<AgencyRecord>,
}

impl InMemoryRecordSource {
    pub fn new(records: Vec<AgencyRecord>) -> Self {
        Self { records }
    }
}

impl RecordSource for InMemoryRecordSource {
    fn source_name(&self) -> String {
        "in-memory".to_string()
    }

    fn records(&self) -> Result<Vec<AgencyRecord>> {
        Ok(self.records.clone())
    }
}
