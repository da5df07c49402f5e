use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::DomainResult;

use super::column::{AggregateFunction, AggregateSpec};
use super::record::{is_blank, Record, RelationValue};

/// Opaque serialized form of a query, able to cross a process boundary.
///
/// The export pipeline never interprets it; only the [`DataSource`] that
/// produced it can rehydrate it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SerializedQuery(pub Value);

impl SerializedQuery {
    pub fn new(value: Value) -> Self {
        Self(value)
    }
}

/// A serialized query plus the projection hints the orchestrator derived
/// from the column definitions: scalar aggregates to compute up front
/// (avoiding per-row lookups during chunk processing) and relation paths
/// to eager-load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryPlan {
    pub query: SerializedQuery,
    pub aggregates: Vec<AggregateSpec>,
    pub eager_load: Vec<String>,
}

impl QueryPlan {
    pub fn new(query: SerializedQuery) -> Self {
        Self {
            query,
            aggregates: Vec::new(),
            eager_load: Vec::new(),
        }
    }
}

/// The durable entity store, seen from the export pipeline.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Count the rows the plan's query matches, respecting any row limit
    /// already present on the serialized query.
    async fn count(&self, plan: &QueryPlan) -> DomainResult<u64>;

    /// Fetch one page (1-based) of at most `chunk_size` records.
    async fn fetch_page(
        &self,
        plan: &QueryPlan,
        page: u64,
        chunk_size: usize,
    ) -> DomainResult<Vec<Record>>;

    /// Fetch records by id, preserving input order. Missing ids are
    /// silently absent from the result.
    async fn fetch_by_ids(&self, plan: &QueryPlan, ids: &[String]) -> DomainResult<Vec<Record>>;
}

/// In-memory reference implementation backed by a fixed record list.
pub struct StaticDataSource {
    rows: Vec<Record>,
    limit: Option<usize>,
}

impl StaticDataSource {
    pub fn new(rows: Vec<Record>) -> Self {
        Self { rows, limit: None }
    }

    /// Pre-existing row limit, honored by `count` and pagination.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn serialized_query(&self) -> SerializedQuery {
        SerializedQuery(json!({ "limit": self.limit }))
    }

    fn limited(&self) -> &[Record] {
        match self.limit {
            Some(limit) => &self.rows[..self.rows.len().min(limit)],
            None => &self.rows,
        }
    }

    fn project(&self, record: &Record, plan: &QueryPlan) -> Record {
        let mut projected = record.clone();
        for aggregate in &plan.aggregates {
            projected = projected
                .with_attribute(aggregate.projected_name(), compute_aggregate(record, aggregate));
        }
        projected
    }
}

#[async_trait]
impl DataSource for StaticDataSource {
    async fn count(&self, _plan: &QueryPlan) -> DomainResult<u64> {
        Ok(self.limited().len() as u64)
    }

    async fn fetch_page(
        &self,
        plan: &QueryPlan,
        page: u64,
        chunk_size: usize,
    ) -> DomainResult<Vec<Record>> {
        let rows = self.limited();
        let start = (page.saturating_sub(1) as usize).saturating_mul(chunk_size);
        let end = start.saturating_add(chunk_size).min(rows.len());
        if start >= rows.len() {
            return Ok(Vec::new());
        }
        Ok(rows[start..end].iter().map(|r| self.project(r, plan)).collect())
    }

    async fn fetch_by_ids(&self, plan: &QueryPlan, ids: &[String]) -> DomainResult<Vec<Record>> {
        let rows = self.limited();
        let mut out = Vec::new();
        for id in ids {
            if let Some(record) = rows.iter().find(|r| r.id_string().as_deref() == Some(id)) {
                out.push(self.project(record, plan));
            }
        }
        Ok(out)
    }
}

/// Compute one aggregate over a record's loaded relation, the way a real
/// store would project it into the row.
fn compute_aggregate(record: &Record, spec: &AggregateSpec) -> Value {
    let related: Vec<&Record> = match record.relation(&spec.relationship) {
        Some(RelationValue::ToMany(items)) => items.iter().collect(),
        Some(RelationValue::ToOne(Some(item))) => vec![item.as_ref()],
        _ => Vec::new(),
    };

    match spec.function {
        AggregateFunction::Count => json!(related.len()),
        AggregateFunction::Exists => json!(!related.is_empty()),
        function => {
            let column = spec.column.as_deref().unwrap_or_default();
            let numbers: Vec<f64> = related
                .iter()
                .filter_map(|r| r.attribute(column))
                .filter(|v| !is_blank(v))
                .filter_map(Value::as_f64)
                .collect();
            if numbers.is_empty() {
                return Value::Null;
            }
            let value = match function {
                AggregateFunction::Avg => numbers.iter().sum::<f64>() / numbers.len() as f64,
                AggregateFunction::Sum => numbers.iter().sum(),
                AggregateFunction::Min => numbers.iter().cloned().fold(f64::INFINITY, f64::min),
                AggregateFunction::Max => {
                    numbers.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
                }
                AggregateFunction::Count | AggregateFunction::Exists => unreachable!(),
            };
            json!(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> StaticDataSource {
        StaticDataSource::new(
            (1..=5)
                .map(|i| {
                    Record::new()
                        .with_attribute("id", i)
                        .with_attribute("name", format!("row {}", i))
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_count_respects_pre_existing_limit() {
        let plan = QueryPlan::default();
        assert_eq!(source().count(&plan).await.unwrap(), 5);
        assert_eq!(source().with_limit(3).count(&plan).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_fetch_page_slices() {
        let plan = QueryPlan::default();
        let source = source();

        let first = source.fetch_page(&plan, 1, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].id_string().unwrap(), "1");

        let last = source.fetch_page(&plan, 3, 2).await.unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].id_string().unwrap(), "5");

        assert!(source.fetch_page(&plan, 4, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_by_ids_preserves_order_and_skips_missing() {
        let plan = QueryPlan::default();
        let records = source()
            .fetch_by_ids(&plan, &["3".into(), "99".into(), "1".into()])
            .await
            .unwrap();

        let ids: Vec<String> = records.iter().filter_map(Record::id_string).collect();
        assert_eq!(ids, vec!["3", "1"]);
    }

    #[tokio::test]
    async fn test_aggregates_projected_onto_records() {
        let rows = vec![Record::new().with_attribute("id", 1).with_to_many(
            "posts",
            vec![
                Record::new().with_attribute("score", 4),
                Record::new().with_attribute("score", 8),
            ],
        )];
        let source = StaticDataSource::new(rows);
        let plan = QueryPlan {
            query: SerializedQuery::default(),
            aggregates: vec![
                AggregateSpec {
                    function: AggregateFunction::Count,
                    relationship: "posts".into(),
                    column: None,
                },
                AggregateSpec {
                    function: AggregateFunction::Avg,
                    relationship: "posts".into(),
                    column: Some("score".into()),
                },
            ],
            eager_load: vec![],
        };

        let records = source.fetch_page(&plan, 1, 10).await.unwrap();
        assert_eq!(records[0].attribute("posts_count"), Some(&json!(2)));
        assert_eq!(records[0].attribute("posts_avg_score"), Some(&json!(6.0)));
    }
}
