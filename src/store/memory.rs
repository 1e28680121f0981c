use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{ AtomicBool, Ordering };
use uuid::Uuid;

use crate::error::{ ChatStoreError, Result };
use crate::store::{ DurableStore, Props };

const QUERY_LIMIT_CAP: usize = 1000;

/// In-memory `DurableStore` backend: one table per class. Carries an
/// availability switch so outage handling can be exercised without a real
/// backend going down.
pub struct MemoryObjectStore {
    tables: Mutex<HashMap<String, HashMap<String, Props>>>,
    available: AtomicBool,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: simulates the backend going down (every call errors) or
    /// coming back up.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<String, Props>>> {
        match self.tables.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ChatStoreError::StoreUnavailable("backend offline".to_string()))
        }
    }

    fn matches(props: &Props, filter: &[(&str, &str)]) -> bool {
        filter.iter().all(|(field, value)| {
            props.get(*field).and_then(|v| v.as_str()) == Some(*value)
        })
    }
}

#[async_trait]
impl DurableStore for MemoryObjectStore {
    async fn create(&self, class: &str, mut props: Props) -> Result<String> {
        self.check_available()?;
        let id = Uuid::new_v4().to_string();
        props.insert("id".to_string(), serde_json::Value::String(id.clone()));
        self.lock()
            .entry(class.to_string())
            .or_default()
            .insert(id.clone(), props);
        Ok(id)
    }

    async fn create_with_id(&self, class: &str, id: &str, mut props: Props) -> Result<bool> {
        self.check_available()?;
        props.insert("id".to_string(), serde_json::Value::String(id.to_string()));
        self.lock()
            .entry(class.to_string())
            .or_default()
            .insert(id.to_string(), props);
        Ok(true)
    }

    async fn get(&self, class: &str, id: &str) -> Result<Option<Props>> {
        self.check_available()?;
        Ok(self.lock().get(class).and_then(|table| table.get(id)).cloned())
    }

    async fn query(&self, class: &str, filter: &[(&str, &str)], limit: usize) -> Result<Vec<Props>> {
        self.check_available()?;
        let guard = self.lock();
        let mut found: Vec<Props> = match guard.get(class) {
            Some(table) => table
                .values()
                .filter(|props| Self::matches(props, filter))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        found.truncate(limit.clamp(1, QUERY_LIMIT_CAP));
        Ok(found)
    }

    async fn update(&self, class: &str, id: &str, props: Props) -> Result<bool> {
        self.check_available()?;
        let mut guard = self.lock();
        match guard.get_mut(class).and_then(|table| table.get_mut(id)) {
            Some(existing) => {
                for (field, value) in props {
                    existing.insert(field, value);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, class: &str, id: &str) -> Result<bool> {
        self.check_available()?;
        if let Some(table) = self.lock().get_mut(class) {
            table.remove(id);
        }
        Ok(true)
    }

    async fn health_check(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CONVERSATIONS;

    fn props_with(fields: &[(&str, &str)]) -> Props {
        let mut props = Props::new();
        for (field, value) in fields {
            props.insert(field.to_string(), serde_json::Value::String(value.to_string()));
        }
        props
    }

    #[tokio::test]
    async fn create_get_update_delete_roundtrip() {
        let store = MemoryObjectStore::new();
        let id = store
            .create(CONVERSATIONS, props_with(&[("title", "hello")])).await
            .expect("create");

        let fetched = store.get(CONVERSATIONS, &id).await.expect("get").expect("present");
        assert_eq!(fetched.get("title").and_then(|v| v.as_str()), Some("hello"));
        assert_eq!(fetched.get("id").and_then(|v| v.as_str()), Some(id.as_str()));

        assert!(store.update(CONVERSATIONS, &id, props_with(&[("title", "renamed")])).await.expect("update"));
        let fetched = store.get(CONVERSATIONS, &id).await.expect("get").expect("present");
        assert_eq!(fetched.get("title").and_then(|v| v.as_str()), Some("renamed"));

        assert!(store.delete(CONVERSATIONS, &id).await.expect("delete"));
        assert!(store.get(CONVERSATIONS, &id).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn query_filters_on_field_equality() {
        let store = MemoryObjectStore::new();
        store
            .create(CONVERSATIONS, props_with(&[("owner", "u1"), ("title", "a")])).await
            .expect("create");
        store
            .create(CONVERSATIONS, props_with(&[("owner", "u2"), ("title", "b")])).await
            .expect("create");

        let owned = store.query(CONVERSATIONS, &[("owner", "u1")], 10).await.expect("query");
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].get("title").and_then(|v| v.as_str()), Some("a"));
    }

    #[tokio::test]
    async fn unavailable_store_errors_instead_of_reporting_absence() {
        let store = MemoryObjectStore::new();
        let id = store
            .create(CONVERSATIONS, props_with(&[("title", "x")])).await
            .expect("create");

        store.set_available(false);
        assert!(!store.health_check().await);
        assert!(matches!(
            store.get(CONVERSATIONS, &id).await,
            Err(crate::error::ChatStoreError::StoreUnavailable(_))
        ));

        store.set_available(true);
        assert!(store.get(CONVERSATIONS, &id).await.expect("get").is_some());
    }
}
