//! Deletion integration tests
//!
//! Covers the cascading delete across tiers: full-tree removal, idempotence,
//! ordering against in-flight background cache writes, behavior for ids that
//! never existed, and degradation when the durable store is unreachable
//! mid-delete.

use clap::Parser;
use std::sync::Arc;

use chat_store::cache::keys::KeySpace;
use chat_store::cache::memory::MemoryCache;
use chat_store::cache::DistributedCache;
use chat_store::store::memory::MemoryObjectStore;
use chat_store::store::DurableStore;
use chat_store::{ Args, ChatStore };

fn fixture() -> (ChatStore, Arc<MemoryCache>, Arc<MemoryObjectStore>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let args = Args::parse_from([
        "chat-store",
        "--cache-type",
        "memory",
        "--store-type",
        "memory",
    ]);
    let cache = Arc::new(MemoryCache::new());
    let store = Arc::new(MemoryObjectStore::new());
    let service = ChatStore::with_backends(
        args,
        cache.clone() as Arc<dyn DistributedCache>,
        store.clone() as Arc<dyn DurableStore>
    );
    (service, cache, store)
}

/// Lets queued background cache writes land before deleting, so the purge
/// has real cache state to clear.
async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}

#[tokio::test]
async fn deleting_a_main_chat_removes_the_whole_tree() {
    let (service, _cache, _store) = fixture();

    let main = service
        .create_conversation("alice", "Main", None, false).await
        .expect("create main");
    let s1 = service
        .create_conversation("alice", "S1", Some(&main.id), false).await
        .expect("create s1");
    let s2 = service
        .create_conversation("alice", "S2", Some(&main.id), false).await
        .expect("create s2");
    let nested = service
        .create_conversation("alice", "Nested", Some(&s1.id), false).await
        .expect("create nested");
    for id in [&main.id, &s1.id, &s2.id, &nested.id] {
        service.append_message(id, "user", "content").await.expect("append");
    }
    settle().await;

    assert!(service.delete_conversation(&main.id).await);

    for id in [&main.id, &s1.id, &s2.id, &nested.id] {
        assert!(service.get_conversation(id).await.expect("get").is_none());
        assert!(service.get_context(id, 10, false).await.expect("context").is_empty());
    }
    let stats = service.hierarchy_stats(&main.id).await.expect("stats");
    assert_eq!(stats.total_sub_chats, 0);
    assert_eq!(stats.total_messages_in_tree, 0);
    assert!(service.list_user_conversations("alice", 10, true).await.expect("list").is_empty());
    assert!(service.recent_tree_messages(&main.id, 10).await.expect("recent").is_empty());
}

#[tokio::test]
async fn deleting_twice_succeeds_both_times() {
    let (service, _cache, _store) = fixture();

    let main = service
        .create_conversation("alice", "Main", None, false).await
        .expect("create");
    assert!(service.delete_conversation(&main.id).await);
    assert!(service.delete_conversation(&main.id).await);
}

#[tokio::test]
async fn delete_needs_no_settling_to_stick() {
    let (service, cache, _store) = fixture();

    let main = service
        .create_conversation("alice", "Short lived", None, false).await
        .expect("create");
    service.append_message(&main.id, "user", "hello").await.expect("append");
    assert_eq!(service.list_user_conversations("alice", 10, true).await.expect("list").len(), 1);

    // Everything above may still sit in the background write queues; none of
    // it may land after the purge.
    assert!(service.delete_conversation(&main.id).await);
    settle().await;

    let keys = KeySpace::new("chat");
    assert!(service.get_conversation(&main.id).await.expect("get").is_none());
    assert!(cache.get(&keys.metadata(&main.id)).await.is_none());
    assert!(cache.list_range(&keys.messages(&main.id), 0, -1).await.is_empty());
    assert!(service.list_user_conversations("alice", 10, true).await.expect("list").is_empty());
}

#[tokio::test]
async fn deleting_an_id_that_never_existed_succeeds() {
    let (service, _cache, _store) = fixture();
    assert!(service.delete_conversation("ghost-123").await);
}

#[tokio::test]
async fn store_outage_delete_clears_caches_and_defers_the_record() {
    let (service, cache, store) = fixture();

    let main = service
        .create_conversation("alice", "Main", None, false).await
        .expect("create");
    service.append_message(&main.id, "user", "hello").await.expect("append");
    settle().await;

    let keys = KeySpace::new("chat");
    assert!(cache.get(&keys.metadata(&main.id)).await.is_some());

    store.set_available(false);
    assert!(service.delete_conversation(&main.id).await);

    // Caches stop returning the conversation immediately.
    assert!(cache.get(&keys.metadata(&main.id)).await.is_none());
    assert!(cache.list_range(&keys.messages(&main.id), 0, -1).await.is_empty());

    // The durable record outlives the outage until a reachable delete runs.
    store.set_available(true);
    assert!(
        service
            .get_conversation(&main.id).await
            .expect("get")
            .is_some()
    );
    assert!(service.delete_conversation(&main.id).await);
    assert!(service.get_conversation(&main.id).await.expect("get").is_none());
}

#[tokio::test]
async fn deleted_conversations_do_not_resurface_after_a_cache_restart() {
    let (service, cache, _store) = fixture();

    let main = service
        .create_conversation("alice", "Main", None, false).await
        .expect("create");
    let sub = service
        .create_conversation("alice", "Sub", Some(&main.id), true).await
        .expect("create sub");
    service.append_message(&main.id, "user", "hello").await.expect("append");
    service.append_message(&sub.id, "user", "hi").await.expect("append");
    settle().await;

    assert!(service.delete_conversation(&main.id).await);

    // An empty restarted cache must not bring anything back either.
    cache.reset();
    for id in [&main.id, &sub.id] {
        assert!(service.get_conversation(id).await.expect("get").is_none());
        assert!(service.get_context(id, 10, true).await.expect("context").is_empty());
    }
    assert!(service.list_user_conversations("alice", 10, true).await.expect("list").is_empty());
}
