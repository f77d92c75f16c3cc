// src/store/qdrant.rs
// Qdrant vector backend

use async_trait::async_trait;
use qdrant_client::Qdrant;
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter as QdrantFilter,
    GetPointsBuilder, PointId, PointStruct, Range, ScrollPointsBuilder, SearchPointsBuilder,
    UpsertPointsBuilder, Value as QdrantValue, VectorParamsBuilder,
};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{ContextdError, Result};
use crate::store::backend::{CollectionInfo, Payload, ScoredPoint, StoredPoint, VectorBackend};
use crate::store::filter::{Filter, FilterOp};

/// Qdrant-backed driver.
pub struct QdrantBackend {
    client: Qdrant,
}

impl QdrantBackend {
    /// Connect to a Qdrant instance.
    pub fn connect(url: &str) -> Result<Self> {
        // Skip compatibility check to allow minor version mismatches
        let client = Qdrant::from_url(url)
            .skip_compatibility_check()
            .build()
            .map_err(|e| ContextdError::ExternalUnavailable(format!("qdrant connect: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl VectorBackend for QdrantBackend {
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<()> {
        let exists = self
            .client
            .collection_exists(name)
            .await
            .map_err(external("collection_exists"))?;
        if exists {
            return Ok(());
        }

        info!("Creating collection: {}", name);
        match self
            .client
            .create_collection(
                CreateCollectionBuilder::new(name)
                    .vectors_config(VectorParamsBuilder::new(dim as u64, Distance::Cosine)),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                // Another process may have created it between our exists
                // check and the create call.
                if e.to_string().contains("already exists") {
                    debug!("Collection {} already exists", name);
                    Ok(())
                } else {
                    Err(ContextdError::ExternalUnavailable(format!(
                        "create collection {name}: {e}"
                    )))
                }
            }
        }
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        self.client
            .collection_exists(name)
            .await
            .map_err(external("collection_exists"))
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .list_collections()
            .await
            .map_err(external("list_collections"))?;
        Ok(response
            .collections
            .into_iter()
            .map(|c| c.name)
            .collect())
    }

    async fn collection_info(&self, name: &str) -> Result<CollectionInfo> {
        let response = self
            .client
            .collection_info(name)
            .await
            .map_err(external("collection_info"))?;
        let info = response
            .result
            .ok_or_else(|| ContextdError::NotFound(format!("collection {name}")))?;
        let vector_size = info
            .config
            .and_then(|c| c.params)
            .and_then(|p| p.vectors_config)
            .and_then(|v| v.config)
            .map(|c| match c {
                qdrant_client::qdrant::vectors_config::Config::Params(p) => p.size as usize,
                _ => 0,
            })
            .unwrap_or(0);
        Ok(CollectionInfo {
            point_count: info.points_count.unwrap_or(0),
            vector_size,
        })
    }

    async fn upsert(&self, collection: &str, points: Vec<StoredPoint>) -> Result<()> {
        let qdrant_points: Vec<PointStruct> = points
            .into_iter()
            .map(|p| {
                PointStruct::new(
                    point_id(&p.id),
                    p.vector,
                    payload_to_qdrant(&p.payload),
                )
            })
            .collect();

        // wait(true) gives read-your-writes within a collection.
        self.client
            .upsert_points(UpsertPointsBuilder::new(collection, qdrant_points).wait(true))
            .await
            .map_err(external("upsert"))?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        filter: &Filter,
    ) -> Result<Vec<ScoredPoint>> {
        let mut builder =
            SearchPointsBuilder::new(collection, vector.to_vec(), limit as u64).with_payload(true);
        if let Some(qfilter) = filter_to_qdrant(filter) {
            builder = builder.filter(qfilter);
        }

        let results = self
            .client
            .search_points(builder)
            .await
            .map_err(external("search"))?;

        Ok(results
            .result
            .into_iter()
            .map(|point| ScoredPoint {
                id: point
                    .id
                    .as_ref()
                    .map(point_id_to_string)
                    .unwrap_or_default(),
                score: point.score,
                payload: qdrant_to_payload(point.payload),
            })
            .collect())
    }

    async fn get(&self, collection: &str, ids: &[String]) -> Result<Vec<StoredPoint>> {
        let qdrant_ids: Vec<PointId> = ids.iter().map(|id| point_id(id)).collect();
        let response = self
            .client
            .get_points(
                GetPointsBuilder::new(collection, qdrant_ids)
                    .with_payload(true)
                    .with_vectors(true),
            )
            .await
            .map_err(external("get"))?;

        Ok(response
            .result
            .into_iter()
            .map(|point| StoredPoint {
                id: point
                    .id
                    .as_ref()
                    .map(point_id_to_string)
                    .unwrap_or_default(),
                vector: extract_vector(point.vectors),
                payload: qdrant_to_payload(point.payload),
            })
            .collect())
    }

    async fn scroll(
        &self,
        collection: &str,
        filter: &Filter,
        limit: usize,
    ) -> Result<Vec<StoredPoint>> {
        let mut all = Vec::new();
        let mut offset: Option<PointId> = None;
        let page = 256u32;

        loop {
            let mut builder = ScrollPointsBuilder::new(collection)
                .limit(page)
                .with_payload(true)
                .with_vectors(true);
            if let Some(qfilter) = filter_to_qdrant(filter) {
                builder = builder.filter(qfilter);
            }
            if let Some(ref off) = offset {
                builder = builder.offset(off.clone());
            }

            let response = self
                .client
                .scroll(builder)
                .await
                .map_err(external("scroll"))?;
            if response.result.is_empty() {
                break;
            }

            let batch_len = response.result.len();
            offset = response.result.last().and_then(|p| p.id.clone());

            for point in response.result {
                all.push(StoredPoint {
                    id: point
                        .id
                        .as_ref()
                        .map(point_id_to_string)
                        .unwrap_or_default(),
                    vector: extract_vector(point.vectors),
                    payload: qdrant_to_payload(point.payload),
                });
                if all.len() >= limit {
                    return Ok(all);
                }
            }

            if batch_len < page as usize {
                break;
            }
        }

        Ok(all)
    }

    async fn delete_by_ids(&self, collection: &str, ids: &[String]) -> Result<()> {
        let qdrant_ids: Vec<PointId> = ids.iter().map(|id| point_id(id)).collect();
        self.client
            .delete_points(
                DeletePointsBuilder::new(collection)
                    .points(qdrant_ids)
                    .wait(true),
            )
            .await
            .map_err(external("delete"))?;
        Ok(())
    }

    async fn delete_by_filter(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let qfilter = filter_to_qdrant(filter).unwrap_or_default();
        self.client
            .delete_points(
                DeletePointsBuilder::new(collection)
                    .points(qfilter)
                    .wait(true),
            )
            .await
            .map_err(external("delete"))?;
        // Qdrant doesn't report how many points a filtered delete removed.
        Ok(0)
    }
}

fn external(operation: &'static str) -> impl Fn(qdrant_client::QdrantError) -> ContextdError {
    move |e| ContextdError::ExternalUnavailable(format!("qdrant {operation}: {e}"))
}

/// Point ids are strings on our side; uuid-shaped ids pass through, others
/// are used verbatim (Qdrant accepts UUID strings and unsigned ints).
fn point_id(id: &str) -> PointId {
    if let Ok(n) = id.parse::<u64>() {
        PointId::from(n)
    } else if uuid::Uuid::parse_str(id).is_ok() {
        PointId::from(id.to_string())
    } else {
        // Hash non-uuid string ids into a stable numeric id.
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        id.hash(&mut hasher);
        PointId::from(hasher.finish())
    }
}

fn point_id_to_string(id: &PointId) -> String {
    match &id.point_id_options {
        Some(qdrant_client::qdrant::point_id::PointIdOptions::Num(n)) => n.to_string(),
        Some(qdrant_client::qdrant::point_id::PointIdOptions::Uuid(u)) => u.clone(),
        None => String::new(),
    }
}

fn filter_to_qdrant(filter: &Filter) -> Option<QdrantFilter> {
    if filter.is_empty() {
        return None;
    }
    let mut must: Vec<Condition> = Vec::with_capacity(filter.conditions.len());
    for condition in &filter.conditions {
        let key = condition.key.clone();
        let converted = match condition.op {
            FilterOp::Eq => value_condition(&key, &condition.value),
            FilterOp::In => {
                let candidates = condition.value.as_array().cloned().unwrap_or_default();
                let mut should = QdrantFilter::default();
                should.should = candidates
                    .iter()
                    .filter_map(|v| value_condition(&key, v))
                    .collect();
                Some(Condition::from(should))
            }
            FilterOp::Gt => condition.value.as_f64().map(|v| {
                Condition::range(
                    key.clone(),
                    Range {
                        gt: Some(v),
                        ..Default::default()
                    },
                )
            }),
            FilterOp::Lt => condition.value.as_f64().map(|v| {
                Condition::range(
                    key.clone(),
                    Range {
                        lt: Some(v),
                        ..Default::default()
                    },
                )
            }),
            FilterOp::Contains => condition
                .value
                .as_str()
                .map(|v| Condition::matches_text(key.clone(), v)),
        };
        // A condition we cannot translate must not silently widen the
        // result set.
        must.push(converted?);
    }
    Some(QdrantFilter::must(must))
}

fn value_condition(key: &str, value: &Value) -> Option<Condition> {
    match value {
        Value::String(s) => Some(Condition::matches(key, s.clone())),
        Value::Bool(b) => Some(Condition::matches(key, *b)),
        Value::Number(n) => n.as_i64().map(|i| Condition::matches(key, i)),
        _ => None,
    }
}

fn payload_to_qdrant(payload: &Payload) -> std::collections::HashMap<String, QdrantValue> {
    payload
        .iter()
        .map(|(k, v)| (k.clone(), json_to_qdrant(v)))
        .collect()
}

fn json_to_qdrant(value: &Value) -> QdrantValue {
    // QdrantValue mirrors serde_json::Value; round-trip through the
    // client's own conversion.
    QdrantValue::from(value.clone())
}

fn qdrant_to_payload(
    payload: std::collections::HashMap<String, QdrantValue>,
) -> Payload {
    payload
        .into_iter()
        .map(|(k, v)| (k, qdrant_value_to_json(v)))
        .collect()
}

fn qdrant_value_to_json(value: QdrantValue) -> Value {
    value.into_json()
}

fn extract_vector(vectors: Option<qdrant_client::qdrant::VectorsOutput>) -> Vec<f32> {
    vectors
        .and_then(|v| match v.vectors_options {
            Some(qdrant_client::qdrant::vectors_output::VectorsOptions::Vector(vec)) => {
                match vec.into_vector() {
                    qdrant_client::qdrant::vector_output::Vector::Dense(dense) => Some(dense.data),
                    _ => None,
                }
            }
            _ => None,
        })
        .unwrap_or_default()
}
