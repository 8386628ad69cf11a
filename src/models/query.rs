//! Query-related data models.
//!
//! This module defines the request/result shapes for query execution and the
//! payload carried through the priority queues.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Default query timeout in seconds.
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;

/// Maximum query timeout in seconds.
pub const MAX_QUERY_TIMEOUT_SECS: u64 = 300;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Parse a JSON array of parameter values.
    pub fn parse_json_array(json: &str) -> Result<Vec<QueryParam>, serde_json::Error> {
        if json.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(json)
    }
}

/// A query to execute through an engine driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub sql_template: String,
    #[serde(default)]
    pub params: Vec<QueryParam>,
    /// Execute via a previously prepared statement with this name.
    #[serde(default)]
    pub prepared_statement_name: Option<String>,
    /// Default: 30, max: 300
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl QueryRequest {
    /// Create a new query request with default options.
    pub fn new(sql_template: impl Into<String>) -> Self {
        Self {
            sql_template: sql_template.into(),
            params: Vec::new(),
            prepared_statement_name: None,
            timeout_secs: None,
        }
    }

    /// Add a parameter to this query.
    pub fn with_param(mut self, param: QueryParam) -> Self {
        self.params.push(param);
        self
    }

    /// Execute via the named prepared statement.
    pub fn with_prepared(mut self, name: impl Into<String>) -> Self {
        self.prepared_statement_name = Some(name.into());
        self
    }

    /// Set the timeout.
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    /// Get the effective timeout (with bounds checking).
    pub fn effective_timeout_secs(&self) -> u64 {
        self.timeout_secs
            .map(|t| t.min(MAX_QUERY_TIMEOUT_SECS))
            .unwrap_or(DEFAULT_QUERY_TIMEOUT_SECS)
    }
}

/// Result of a successful query execution.
///
/// Rows are structured JSON maps; failures travel as `DbError` rather than
/// as a success flag on this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<serde_json::Map<String, JsonValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    pub execution_time_ms: u64,
}

impl QueryResult {
    /// Create an empty result (for statements returning no rows).
    pub fn empty(execution_time_ms: u64) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            rows_affected: None,
            execution_time_ms,
        }
    }

    /// Create a result for write operations (INSERT/UPDATE/DELETE).
    pub fn write_result(rows_affected: u64, execution_time_ms: u64) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            rows_affected: Some(rows_affected),
            execution_time_ms,
        }
    }

    /// Get the number of rows in the result.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Get the number of columns in the result.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Check if the result is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.rows_affected.is_none()
    }
}

/// Priority tiers served by the queue hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Lead,
    Slow,
    Medium,
    Fast,
    Cache,
}

impl QueueKind {
    /// The four worker tiers a lead queue can spawn children for.
    pub const TIERS: [QueueKind; 4] = [Self::Slow, Self::Medium, Self::Fast, Self::Cache];

    /// String form used in configuration and API path hints.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lead => "Lead",
            Self::Slow => "slow",
            Self::Medium => "medium",
            Self::Fast => "fast",
            Self::Cache => "cache",
        }
    }

    /// Select a tier from an API path hint. Unrecognized hints map to Medium.
    pub fn from_hint(hint: &str) -> QueueKind {
        match hint {
            "slow" => Self::Slow,
            "medium" => Self::Medium,
            "fast" => Self::Fast,
            "cache" => Self::Cache,
            _ => Self::Medium,
        }
    }

    /// Queue priority derived from the tier; higher is served first.
    pub fn priority(&self) -> u8 {
        match self {
            Self::Cache => 3,
            Self::Fast => 2,
            Self::Medium | Self::Lead => 1,
            Self::Slow => 0,
        }
    }

    /// Tag character used in the queue's designator label.
    pub fn tag(&self) -> char {
        match self {
            Self::Lead => 'L',
            Self::Slow => 'S',
            Self::Medium => 'M',
            Self::Fast => 'F',
            Self::Cache => 'C',
        }
    }
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payload carried through a database queue.
///
/// Serialized to JSON when enqueued (the queue primitive is
/// payload-agnostic) and deserialized on dequeue by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedQuery {
    pub query_id: String,
    pub query_template: String,
    #[serde(default)]
    pub parameter_json: Option<String>,
    pub queue_hint: QueueKind,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl QueuedQuery {
    /// Create a queued query with a fresh id.
    pub fn new(query_template: impl Into<String>, queue_hint: QueueKind) -> Self {
        Self {
            query_id: format!("q_{}", uuid::Uuid::new_v4().simple()),
            query_template: query_template.into(),
            parameter_json: None,
            queue_hint,
            submitted_at: Utc::now(),
            processed_at: None,
            retry_count: 0,
            error_message: None,
        }
    }

    /// Attach a JSON array of parameters.
    pub fn with_parameters(mut self, parameter_json: impl Into<String>) -> Self {
        self.parameter_json = Some(parameter_json.into());
        self
    }

    /// Serialize to the transport form placed on the generic queue.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from the transport form.
    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Build the engine-level request for this queued query.
    pub fn to_request(&self) -> Result<QueryRequest, serde_json::Error> {
        let params = match self.parameter_json.as_deref() {
            Some(json) => QueryParam::parse_json_array(json)?,
            None => Vec::new(),
        };
        Ok(QueryRequest {
            sql_template: self.query_template.clone(),
            params,
            prepared_statement_name: None,
            timeout_secs: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_kind_from_hint() {
        assert_eq!(QueueKind::from_hint("slow"), QueueKind::Slow);
        assert_eq!(QueueKind::from_hint("fast"), QueueKind::Fast);
        assert_eq!(QueueKind::from_hint("cache"), QueueKind::Cache);
        assert_eq!(QueueKind::from_hint("bogus"), QueueKind::Medium);
        assert_eq!(QueueKind::from_hint(""), QueueKind::Medium);
    }

    #[test]
    fn test_queue_kind_priority_ordering() {
        assert!(QueueKind::Cache.priority() > QueueKind::Fast.priority());
        assert!(QueueKind::Fast.priority() > QueueKind::Medium.priority());
        assert!(QueueKind::Medium.priority() > QueueKind::Slow.priority());
    }

    #[test]
    fn test_queued_query_payload_round_trip() {
        let query = QueuedQuery::new("SELECT * FROM orders WHERE id = $1", QueueKind::Fast)
            .with_parameters("[42]");
        let payload = query.to_payload().unwrap();
        let restored = QueuedQuery::from_payload(&payload).unwrap();
        assert_eq!(restored.query_id, query.query_id);
        assert_eq!(restored.queue_hint, QueueKind::Fast);
        assert_eq!(restored.parameter_json.as_deref(), Some("[42]"));
    }

    #[test]
    fn test_queued_query_to_request_parses_params() {
        let query = QueuedQuery::new("SELECT $1, $2, $3", QueueKind::Medium)
            .with_parameters(r#"[1, "two", null]"#);
        let request = query.to_request().unwrap();
        assert_eq!(request.params.len(), 3);
        assert!(request.params[2].is_null());
    }

    #[test]
    fn test_query_request_timeout_bounds() {
        let req = QueryRequest::new("SELECT 1").with_timeout(999);
        assert_eq!(req.effective_timeout_secs(), MAX_QUERY_TIMEOUT_SECS);
        let req = QueryRequest::new("SELECT 1");
        assert_eq!(req.effective_timeout_secs(), DEFAULT_QUERY_TIMEOUT_SECS);
    }

    #[test]
    fn test_query_result_counts() {
        let mut row = serde_json::Map::new();
        row.insert("id".to_string(), JsonValue::Number(1.into()));
        let result = QueryResult {
            columns: vec!["id".to_string()],
            rows: vec![row],
            rows_affected: None,
            execution_time_ms: 3,
        };
        assert_eq!(result.row_count(), 1);
        assert_eq!(result.column_count(), 1);
        assert!(!result.is_empty());
    }
}
