//! ============================================================================
//! Qdrant Index - Vector index backed by a Qdrant collection
//! ============================================================================
//! Point ids are the durable entry ids, so re-indexing an entry overwrites
//! its point instead of duplicating it. Entries without an id get a random
//! numeric point id.
//! ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use qdrant_client::qdrant::{
    point_id::PointIdOptions, points_selector::PointsSelectorOneOf, Condition,
    CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter, PointId, PointStruct,
    ScrollPointsBuilder, SearchPointsBuilder, UpsertPointsBuilder, Value, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::index::{PayloadFilter, SearchHit, VectorIndex, VectorPayload};
use crate::types::{ResultPayload, VectorId, UNASSIGNED_ID};

/// Default collection name
pub const COLLECTION_NAME: &str = "recall_memories";

const ATTRIBUTE_PREFIX: &str = "attr.";

/// Vector index stored in a Qdrant collection
pub struct QdrantIndex {
    client: Qdrant,
    collection: String,
    dimension: usize,
    capacity: Option<usize>,
}

impl QdrantIndex {
    /// Connect to Qdrant and make sure the collection exists
    pub async fn new(url: &str, collection: &str, dimension: usize) -> Result<Self> {
        debug!("Connecting to Qdrant at {}", url);

        let client = Qdrant::from_url(url)
            .build()
            .map_err(|e| anyhow!("Failed to create Qdrant client: {}", e))?;

        let index = Self {
            client,
            collection: collection.to_string(),
            dimension,
            capacity: None,
        };
        index.ensure_collection().await?;
        Ok(index)
    }

    /// Bound the collection size; the lowest point ids are evicted first
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity.max(1));
        self
    }

    async fn ensure_collection(&self) -> Result<()> {
        let exists = self
            .client
            .collection_exists(&self.collection)
            .await
            .map_err(|e| anyhow!("Failed to check collection existence: {}", e))?;

        if !exists {
            info!("Creating collection: {}", self.collection);
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection).vectors_config(
                        VectorParamsBuilder::new(self.dimension as u64, Distance::Cosine),
                    ),
                )
                .await
                .map_err(|e| anyhow!("Failed to create collection: {}", e))?;
        } else {
            debug!("Collection {} already exists", self.collection);
        }
        Ok(())
    }

    /// Drop points until there is room for one more
    async fn make_room(&self, capacity: usize) -> Result<()> {
        let count = self.count().await?;
        if (count as usize) < capacity {
            return Ok(());
        }
        let excess = count as usize - capacity + 1;

        let scroll = self
            .client
            .scroll(
                ScrollPointsBuilder::new(&self.collection)
                    .limit(excess as u32)
                    .with_payload(false),
            )
            .await
            .map_err(|e| anyhow!("Failed to scroll for eviction: {}", e))?;

        let ids: Vec<PointId> = scroll.result.into_iter().filter_map(|p| p.id).collect();
        if ids.is_empty() {
            return Ok(());
        }
        debug!("Evicting {} points from {}", ids.len(), self.collection);
        self.client
            .delete_points(DeletePointsBuilder::new(&self.collection).points(ids))
            .await
            .map_err(|e| anyhow!("Failed to evict points: {}", e))?;
        Ok(())
    }

    /// Check if Qdrant is reachable
    pub async fn health_check(&self) -> Result<bool> {
        match self.client.health_check().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Qdrant health check failed: {}", e);
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, vector: Vec<f32>, payload: VectorPayload) -> Result<VectorId> {
        if vector.len() != self.dimension {
            return Err(anyhow!(
                "Vector dimension mismatch: expected {}, got {}",
                self.dimension,
                vector.len()
            ));
        }
        if let Some(capacity) = self.capacity {
            self.make_room(capacity).await?;
        }

        let id = match payload.entry_id {
            Some(entry_id) if entry_id >= 0 => entry_id as VectorId,
            _ => random_point_id(),
        };
        debug!("Upserting point {} for user {}", id, payload.user_id);

        let point = PointStruct::new(id, vector, to_qdrant_payload(&payload)?);
        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, vec![point]))
            .await
            .map_err(|e| anyhow!("Failed to upsert point: {}", e))?;
        Ok(id)
    }

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: &PayloadFilter,
    ) -> Result<Vec<SearchHit>> {
        if top_k == 0 {
            return Ok(vec![]);
        }

        let result = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection, query.to_vec(), top_k as u64)
                    .filter(to_qdrant_filter(filter))
                    .with_payload(true),
            )
            .await
            .map_err(|e| anyhow!("Failed to search points: {}", e))?;

        let hits: Vec<SearchHit> = result
            .result
            .into_iter()
            .filter_map(|point| {
                let vector_id = extract_numeric_id(point.id?)?;
                Some(SearchHit {
                    vector_id,
                    score: point.score,
                    payload: from_qdrant_payload(&point.payload)?,
                })
            })
            .collect();

        debug!("Found {} matching points", hits.len());
        Ok(hits)
    }

    async fn delete(&self, ids: &[VectorId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let points: Vec<PointId> = ids.iter().map(|id| PointId::from(*id)).collect();
        self.client
            .delete_points(DeletePointsBuilder::new(&self.collection).points(points))
            .await
            .map_err(|e| anyhow!("Failed to delete points: {}", e))?;
        Ok(())
    }

    async fn delete_where(&self, filter: &PayloadFilter) -> Result<u64> {
        info!("Deleting points for user {}", filter.user_id);
        let before = self.count().await?;

        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(PointsSelectorOneOf::Filter(to_qdrant_filter(filter)))
                    .wait(true),
            )
            .await
            .map_err(|e| anyhow!("Failed to delete points: {}", e))?;

        // Qdrant doesn't report a count for filter deletes
        let after = self.count().await?;
        Ok(before.saturating_sub(after))
    }

    async fn count(&self) -> Result<u64> {
        let info = self
            .client
            .collection_info(&self.collection)
            .await
            .map_err(|e| anyhow!("Failed to get collection info: {}", e))?;
        Ok(info.result.and_then(|r| r.points_count).unwrap_or(0))
    }
}

fn random_point_id() -> VectorId {
    // keep clear of the i64 range used by durable ids
    Uuid::new_v4().as_u64_pair().0 | (1 << 63)
}

fn to_qdrant_filter(filter: &PayloadFilter) -> Filter {
    let mut conditions = vec![Condition::matches("user_id", filter.user_id.clone())];
    for (key, value) in &filter.attributes {
        conditions.push(Condition::matches(
            format!("{}{}", ATTRIBUTE_PREFIX, key),
            value.clone(),
        ));
    }
    Filter::must(conditions)
}

fn to_qdrant_payload(payload: &VectorPayload) -> Result<HashMap<String, Value>> {
    let result = serde_json::to_string(&payload.result)
        .map_err(|e| anyhow!("Failed to encode result payload: {}", e))?;
    let mut map: HashMap<String, Value> = [
        ("user_id".to_string(), Value::from(payload.user_id.clone())),
        ("text".to_string(), Value::from(payload.text.clone())),
        (
            "entry_id".to_string(),
            Value::from(payload.entry_id.unwrap_or(UNASSIGNED_ID)),
        ),
        (
            "session_id".to_string(),
            Value::from(payload.session_id.clone().unwrap_or_default()),
        ),
        ("created_at".to_string(), Value::from(payload.created_at)),
        ("result".to_string(), Value::from(result)),
    ]
    .into_iter()
    .collect();

    for (key, value) in &payload.attributes {
        map.insert(
            format!("{}{}", ATTRIBUTE_PREFIX, key),
            Value::from(value.clone()),
        );
    }
    Ok(map)
}

fn from_qdrant_payload(payload: &HashMap<String, Value>) -> Option<VectorPayload> {
    let attributes: BTreeMap<String, String> = payload
        .iter()
        .filter_map(|(k, v)| {
            let key = k.strip_prefix(ATTRIBUTE_PREFIX)?;
            Some((key.to_string(), v.as_str()?.to_string()))
        })
        .collect();

    Some(VectorPayload {
        user_id: get_string(payload, "user_id")?,
        text: get_string(payload, "text").unwrap_or_default(),
        entry_id: get_i64(payload, "entry_id").filter(|id| *id >= 0),
        session_id: get_string(payload, "session_id").filter(|s| !s.is_empty()),
        created_at: get_i64(payload, "created_at").unwrap_or(0),
        result: get_string(payload, "result")
            .and_then(|r| serde_json::from_str::<ResultPayload>(&r).ok())
            .unwrap_or(ResultPayload::Empty),
        attributes,
    })
}

fn extract_numeric_id(point_id: PointId) -> Option<VectorId> {
    match point_id.point_id_options? {
        PointIdOptions::Num(n) => Some(n),
        PointIdOptions::Uuid(_) => None,
    }
}

fn get_string(payload: &HashMap<String, Value>, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(|v| v.as_str().map(|s| s.to_string()))
}

fn get_i64(payload: &HashMap<String, Value>, key: &str) -> Option<i64> {
    payload.get(key).and_then(|v| v.as_integer())
}
