// Integration tests for the in-memory store's group-dedup and garbage-collection semantics.
use agentmesh::runtime::model::{Agent, AgentKind, GroupKind};
use agentmesh::runtime::store::{AgentScope, SendDirectMessageArgs, Store};
use agentmesh::runtime::store::InMemoryStore;
use chrono::Utc;
use uuid::Uuid;

fn worker(workspace: Uuid, role: &str) -> Agent {
    Agent {
        id: Uuid::new_v4(),
        workspace,
        role: role.to_string(),
        kind: AgentKind::Worker,
        auto_run: true,
        parent_id: None,
        model_profile_id: None,
        history: Vec::new(),
        created_at: Utc::now(),
        deleted_at: None,
        last_active_at: None,
    }
}

#[tokio::test]
async fn duplicate_pairwise_groups_merge_into_one_with_messages_preserved() {
    let store = InMemoryStore::new();
    let ws = Uuid::new_v4();
    let a = worker(ws, "alice");
    let b = worker(ws, "bob");
    store.insert_agent(a.clone()).await.unwrap();
    store.insert_agent(b.clone()).await.unwrap();

    let first = store
        .create_group(ws, vec![a.id, b.id], None, GroupKind::Chat)
        .await
        .unwrap();
    let second = store
        .create_group(ws, vec![a.id, b.id], None, GroupKind::Chat)
        .await
        .unwrap();
    assert_ne!(first, second, "create_group does not dedup by itself");

    store
        .send_message(first, a.id, "hello from first".to_string(), "text".to_string())
        .await
        .unwrap();
    store
        .send_message(second, b.id, "hello from second".to_string(), "text".to_string())
        .await
        .unwrap();

    let kept = store
        .merge_duplicate_exact_p2p_groups(ws, a.id, b.id, None)
        .await
        .unwrap();

    let merged = store.list_group_messages(kept, None).await.unwrap();
    assert_eq!(merged.len(), 2, "both groups' messages land in the survivor");

    let loser = if kept == first { second } else { first };
    let loser_group = store.get_group(loser).await.unwrap();
    assert!(loser_group.is_deleted(), "the losing duplicate is soft-deleted");

    let again = store
        .find_latest_exact_p2p_group_id(ws, a.id, b.id, None)
        .await
        .unwrap();
    assert_eq!(again, Some(kept), "only the survivor is found afterward");
}

#[tokio::test]
async fn send_direct_message_merges_pre_existing_duplicate_p2p_groups() {
    let store = InMemoryStore::new();
    let ws = Uuid::new_v4();
    let a = worker(ws, "alice");
    let b = worker(ws, "bob");
    store.insert_agent(a.clone()).await.unwrap();
    store.insert_agent(b.clone()).await.unwrap();

    // Two prior duplicate pairwise groups, as in spec's own dedup scenario pre-state: each side
    // started a thread before discovering the other's.
    let first = store
        .create_group(ws, vec![a.id, b.id], None, GroupKind::Chat)
        .await
        .unwrap();
    let second = store
        .create_group(ws, vec![a.id, b.id], None, GroupKind::Chat)
        .await
        .unwrap();
    store
        .send_message(first, a.id, "hello from first".to_string(), "text".to_string())
        .await
        .unwrap();
    store
        .send_message(second, b.id, "hello from second".to_string(), "text".to_string())
        .await
        .unwrap();

    let result = store
        .send_direct_message(SendDirectMessageArgs {
            workspace: ws,
            from: a.id,
            to: b.id,
            content: "hi again".to_string(),
            content_type: "text".to_string(),
            group_name: None,
            new_thread: false,
        })
        .await
        .unwrap();

    let loser = if result.group == first { second } else { first };
    assert_ne!(result.group, loser, "send resolves to the canonical survivor");
    let loser_group = store.get_group(loser).await.unwrap();
    assert!(loser_group.is_deleted(), "send_direct_message cleans up the duplicate loser");

    let survivor_messages = store.list_group_messages(result.group, None).await.unwrap();
    assert_eq!(
        survivor_messages.len(),
        3,
        "both prior messages plus the new one land in the survivor"
    );

    let still_duplicated = store
        .create_group(ws, vec![a.id, b.id], None, GroupKind::Chat)
        .await;
    // create_group itself does not dedup; the invariant only holds across sends/merges, so a
    // third raw create_group call is still allowed to produce a fresh duplicate — it is the next
    // send_direct_message that must fold it back in.
    let third = still_duplicated.unwrap();
    let result2 = store
        .send_direct_message(SendDirectMessageArgs {
            workspace: ws,
            from: b.id,
            to: a.id,
            content: "one more".to_string(),
            content_type: "text".to_string(),
            group_name: None,
            new_thread: false,
        })
        .await
        .unwrap();
    assert_ne!(result2.group, third, "the newest duplicate is also folded in, not kept separate");
    let third_group = store.get_group(third).await.unwrap();
    assert!(third_group.is_deleted());
}

#[tokio::test]
async fn bulk_soft_delete_garbage_collects_orphaned_and_all_system_groups() {
    let store = InMemoryStore::new();
    let ws = Uuid::new_v4();
    let defaults = store.ensure_workspace_defaults(ws).await.unwrap();
    let helper = worker(ws, "helper");
    store.insert_agent(helper.clone()).await.unwrap();

    let pairwise = store
        .create_group(ws, vec![helper.id, defaults.human_agent_id], None, GroupKind::Chat)
        .await
        .unwrap();

    let result = store
        .bulk_soft_delete_agents(AgentScope {
            workspace: ws,
            include_kinds: Some(vec![AgentKind::Worker]),
            exclude_kinds: None,
        })
        .await
        .unwrap();
    assert_eq!(result.affected, vec![helper.id]);

    let orphaned = store.soft_delete_orphan_groups(ws).await.unwrap();
    assert!(orphaned.affected.contains(&pairwise), "group with one deleted member becomes orphaned");

    let redundant = store.soft_delete_redundant_system_groups(ws).await.unwrap();
    assert!(
        redundant.affected.contains(&defaults.default_group_id),
        "default group left with only system participants is redundant"
    );
}
