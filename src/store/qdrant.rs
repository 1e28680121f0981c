use async_trait::async_trait;
use log::{ info, warn };
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

use qdrant_client::Qdrant;
use qdrant_client::qdrant::{
    Condition,
    CreateCollection,
    CreateFieldIndexCollection,
    DeletePoints,
    Distance,
    FieldType,
    Filter,
    PointId,
    PointStruct,
    PointsIdsList,
    PointsSelector,
    ScrollPoints,
    UpsertPoints,
    VectorParams,
    VectorsConfig,
    Value as QdrantValue,
    with_payload_selector::SelectorOptions as WithPayloadOptions,
    WithPayloadSelector,
};
use qdrant_client::qdrant::point_id::PointIdOptions;
use qdrant_client::qdrant::points_selector::PointsSelectorOneOf;

use crate::config::Args;
use crate::error::{ ChatStoreError, Result };
use crate::store::{ DurableStore, Props, CONVERSATIONS, MESSAGES };

const QUERY_LIMIT_CAP: usize = 1000;

/// Object CRUD on Qdrant collections, one collection per class. Records live
/// entirely in point payloads; points carry a 1-dim placeholder vector since
/// nothing here is ever searched by similarity. Every call is time-boxed.
pub struct QdrantObjectStore {
    client: Qdrant,
    collection_prefix: String,
    timeout: Duration,
}

impl QdrantObjectStore {
    pub fn new(args: &Args) -> Result<Self> {
        let client = Qdrant::from_url(&args.store_host)
            .api_key(args.store_api_key.clone())
            .build()?;

        Ok(Self {
            client,
            collection_prefix: args.store_collection_prefix.clone(),
            timeout: Duration::from_secs(args.store_timeout_secs.max(1)),
        })
    }

    fn collection_name(&self, class: &str) -> String {
        format!("{}_{}", self.collection_prefix, class)
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ChatStoreError::StoreUnavailable(
                format!("operation exceeded {}s time box", self.timeout.as_secs())
            )),
        }
    }

    async fn ensure_collection(&self, class: &str) -> Result<()> {
        let collection = self.collection_name(class);
        if self.client.collection_exists(&collection).await? {
            return Ok(());
        }

        self.client.create_collection(CreateCollection {
            collection_name: collection.clone(),
            vectors_config: Some(
                VectorsConfig::from(VectorParams {
                    size: 1,
                    distance: Distance::Dot.into(),
                    ..Default::default()
                })
            ),
            ..Default::default()
        }).await?;
        info!("Created collection: {}", collection);

        let (keyword_fields, integer_fields): (&[&str], &[&str]) = match class {
            CONVERSATIONS => (&["id", "owner", "parent_id"], &["created_at"]),
            MESSAGES => (&["id", "conversation_id"], &["timestamp"]),
            _ => (&["id"], &[]),
        };

        for field in keyword_fields {
            self.client.create_field_index(CreateFieldIndexCollection {
                collection_name: collection.clone(),
                field_name: field.to_string(),
                field_type: Some(FieldType::Keyword.into()),
                wait: Some(true),
                ..Default::default()
            }).await?;
            info!("Created '{}' index in {}", field, collection);
        }
        for field in integer_fields {
            self.client.create_field_index(CreateFieldIndexCollection {
                collection_name: collection.clone(),
                field_name: field.to_string(),
                field_type: Some(FieldType::Integer.into()),
                wait: Some(true),
                ..Default::default()
            }).await?;
            info!("Created '{}' index in {}", field, collection);
        }

        Ok(())
    }

    /// Ids must address Qdrant points, which only accept UUIDs or unsigned
    /// integers. Anything else cannot exist in this store by construction.
    fn point_id_for(id: &str) -> Option<PointId> {
        if let Ok(num) = id.parse::<u64>() {
            return Some(PointId {
                point_id_options: Some(PointIdOptions::Num(num)),
            });
        }
        if Uuid::parse_str(id).is_ok() {
            return Some(PointId {
                point_id_options: Some(PointIdOptions::Uuid(id.to_string())),
            });
        }
        None
    }

    fn payload_to_props(payload: HashMap<String, QdrantValue>) -> Props {
        let mut props = Props::new();
        for (field, value) in payload {
            match serde_json::to_value(value) {
                Ok(converted) => {
                    props.insert(field, converted);
                }
                Err(err) => warn!("Skipping payload field '{}': {}", field, err),
            }
        }
        props
    }

    async fn scroll_filtered(&self, class: &str, filter: Filter, limit: usize) -> Result<Vec<Props>> {
        self.ensure_collection(class).await?;

        let response = self.client.scroll(ScrollPoints {
            collection_name: self.collection_name(class),
            filter: Some(filter),
            limit: Some(limit.clamp(1, QUERY_LIMIT_CAP) as u32),
            with_payload: Some(WithPayloadSelector {
                selector_options: Some(WithPayloadOptions::Enable(true)),
            }),
            ..Default::default()
        }).await?;

        Ok(
            response.result
                .into_iter()
                .map(|point| Self::payload_to_props(point.payload))
                .collect()
        )
    }

    async fn upsert(&self, class: &str, id: &str, props: Props) -> Result<()> {
        // Writes must derive the point id exactly as reads and deletes do, or
        // a numeric id would be stored under a different variant than it is
        // looked up by.
        let point_id = Self::point_id_for(id).ok_or_else(|| {
            ChatStoreError::Validation(format!("id '{}' cannot address a point", id))
        })?;
        self.ensure_collection(class).await?;

        let point = PointStruct::new(point_id, vec![0.0_f32], props);
        self.client.upsert_points(UpsertPoints {
            collection_name: self.collection_name(class),
            wait: Some(true),
            points: vec![point],
            ordering: None,
            shard_key_selector: None,
        }).await?;
        Ok(())
    }

    async fn get_inner(&self, class: &str, id: &str) -> Result<Option<Props>> {
        let point_id = match Self::point_id_for(id) {
            Some(pid) => pid,
            None => {
                return Ok(None);
            }
        };
        let filter = Filter {
            must: vec![Condition::has_id(vec![point_id])],
            ..Default::default()
        };
        let mut found = self.scroll_filtered(class, filter, 1).await?;
        Ok(found.pop())
    }

    async fn delete_inner(&self, class: &str, id: &str) -> Result<bool> {
        let point_id = match Self::point_id_for(id) {
            Some(pid) => pid,
            None => {
                return Ok(true);
            }
        };
        self.ensure_collection(class).await?;

        self.client.delete_points(DeletePoints {
            collection_name: self.collection_name(class),
            wait: Some(true),
            points: Some(PointsSelector {
                points_selector_one_of: Some(PointsSelectorOneOf::Points(PointsIdsList {
                    ids: vec![point_id],
                })),
            }),
            ordering: None,
            shard_key_selector: None,
        }).await?;
        Ok(true)
    }

    async fn update_inner(&self, class: &str, id: &str, props: Props) -> Result<bool> {
        let existing = match self.get_inner(class, id).await? {
            Some(existing) => existing,
            None => {
                return Ok(false);
            }
        };
        let mut merged = existing;
        for (field, value) in props {
            merged.insert(field, value);
        }
        self.upsert(class, id, merged).await?;
        Ok(true)
    }
}

#[async_trait]
impl DurableStore for QdrantObjectStore {
    async fn create(&self, class: &str, mut props: Props) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        props.insert("id".to_string(), serde_json::Value::String(id.clone()));
        self.bounded(self.upsert(class, &id, props)).await?;
        Ok(id)
    }

    async fn create_with_id(&self, class: &str, id: &str, mut props: Props) -> Result<bool> {
        if Self::point_id_for(id).is_none() {
            warn!("Rejecting create for unaddressable id '{}' in {}", id, class);
            return Ok(false);
        }
        props.insert("id".to_string(), serde_json::Value::String(id.to_string()));
        self.bounded(self.upsert(class, id, props)).await?;
        Ok(true)
    }

    async fn get(&self, class: &str, id: &str) -> Result<Option<Props>> {
        self.bounded(self.get_inner(class, id)).await
    }

    async fn query(&self, class: &str, filter: &[(&str, &str)], limit: usize) -> Result<Vec<Props>> {
        let conditions: Vec<Condition> = filter
            .iter()
            .map(|(field, value)| Condition::matches(*field, value.to_string()))
            .collect();
        self.bounded(self.scroll_filtered(class, Filter::must(conditions), limit)).await
    }

    async fn update(&self, class: &str, id: &str, props: Props) -> Result<bool> {
        self.bounded(self.update_inner(class, id, props)).await
    }

    async fn delete(&self, class: &str, id: &str) -> Result<bool> {
        self.bounded(self.delete_inner(class, id)).await
    }

    async fn health_check(&self) -> bool {
        match tokio::time::timeout(self.timeout, self.client.health_check()).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!("Durable store health check failed: {}", e);
                false
            }
            Err(_) => {
                warn!("Durable store health check timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_ids_map_to_numeric_points() {
        let point_id = QdrantObjectStore::point_id_for("42").expect("addressable");
        assert_eq!(point_id.point_id_options, Some(PointIdOptions::Num(42)));
    }

    #[test]
    fn uuid_ids_map_to_uuid_points() {
        let id = "8f14e45f-ceea-4f3a-9a5a-d37f0ad7a2cd";
        let point_id = QdrantObjectStore::point_id_for(id).expect("addressable");
        assert_eq!(point_id.point_id_options, Some(PointIdOptions::Uuid(id.to_string())));
    }

    #[test]
    fn other_ids_are_unaddressable() {
        assert!(QdrantObjectStore::point_id_for("not-a-point").is_none());
    }
}
