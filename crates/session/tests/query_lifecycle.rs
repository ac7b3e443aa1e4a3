//! End-to-end query scenarios across the connector pool, aggregation engine,
//! conversation store and orchestrator.

use fista_common::config::{OrchestratorConfig, StoreConfig};
use fista_common::models::{
    BackendHit, Completion, ConversationId, Role, StreamUpdate, TaskState, TruncationReason,
};
use fista_common::{AppError, QueryNormalizer};
use fista_search::aggregation::AggregationEngine;
use fista_search::connectors::{ConnectorPool, ConnectorSettings, RetryPolicy, ScriptedConnector};
use fista_session::{ConversationStore, Orchestrator};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    orchestrator: Arc<Orchestrator>,
    store: Arc<ConversationStore>,
    pool: Arc<ConnectorPool>,
}

async fn harness(connectors: Vec<ScriptedConnector>, task_timeout_ms: u64) -> Harness {
    let pool = Arc::new(ConnectorPool::new());
    for connector in connectors {
        let mut retry = RetryPolicy::default();
        retry.max_attempts = 3;
        pool.register(
            Arc::new(connector),
            ConnectorSettings::new(Duration::from_secs(10), retry),
        )
        .await
        .unwrap();
    }

    let store = Arc::new(ConversationStore::new(StoreConfig::default()));
    let engine = Arc::new(AggregationEngine::new(pool.clone()));
    let config = OrchestratorConfig {
        task_timeout_ms,
        ..OrchestratorConfig::default()
    };
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        engine,
        QueryNormalizer::default(),
        &config,
    ));

    Harness {
        orchestrator,
        store,
        pool,
    }
}

fn hits(items: &[(&str, f64)]) -> Vec<BackendHit> {
    items
        .iter()
        .map(|(content, score)| BackendHit::new(*content, *score))
        .collect()
}

fn slow(name: &str, count: usize) -> ScriptedConnector {
    ScriptedConnector::new(name)
        .with_hits(
            (0..count)
                .map(|i| BackendHit::new(format!("{} result {}", name, i), 1.0 - i as f64 * 0.01))
                .collect(),
        )
        .with_item_delay(Duration::from_millis(100))
}

#[tokio::test]
async fn test_results_ordered_by_score_across_backends() {
    let h = harness(
        vec![
            ScriptedConnector::new("web").with_hits(hits(&[("trail B", 0.7)])),
            ScriptedConnector::new("kb").with_hits(hits(&[("trail A", 0.9)])),
        ],
        30_000,
    )
    .await;
    let c1 = ConversationId::new("c1");
    assert!(h.store.get(&c1).is_err());

    let updates: Vec<StreamUpdate> = h
        .orchestrator
        .submit_query(&c1, "best hiking trails")
        .await
        .unwrap()
        .into_stream()
        .collect()
        .await;

    let last = updates.last().unwrap();
    assert!(last.done);
    assert_eq!(last.content, "trail A\n\ntrail B");
    assert_eq!(last.state, TaskState::Completed);

    let messages = h.store.get(&c1).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "best hiking trails");
    assert_eq!(messages[1].role, Role::Agent);
    assert_eq!(messages[1].content, "trail A\n\ntrail B");
    assert!(!messages[1].partial);
    assert_eq!(messages[1].completion, Some(Completion::Complete));
    assert!(messages[0].timestamp < messages[1].timestamp);
}

#[tokio::test(start_paused = true)]
async fn test_all_backends_unavailable_yields_one_error_message() {
    let h = harness(
        vec![
            ScriptedConnector::new("web").unavailable(),
            ScriptedConnector::new("kb").unavailable(),
        ],
        30_000,
    )
    .await;
    let c1 = ConversationId::new("c1");

    let updates: Vec<StreamUpdate> = h
        .orchestrator
        .submit_query(&c1, "best hiking trails")
        .await
        .unwrap()
        .into_stream()
        .collect()
        .await;

    let last = updates.last().unwrap();
    assert_eq!(last.state, TaskState::Failed);
    assert_eq!(last.completion, Some(Completion::Failed));
    assert_eq!(last.degraded_sources.len(), 2);

    let messages = h.store.get(&c1).unwrap();
    let agent: Vec<_> = messages.iter().filter(|m| m.role == Role::Agent).collect();
    assert_eq!(agent.len(), 1);
    assert!(agent[0].content.starts_with("search failed: "));
    assert!(!agent[0].partial);
}

#[tokio::test(start_paused = true)]
async fn test_degraded_backend_does_not_fail_query() {
    let h = harness(
        vec![
            ScriptedConnector::new("web").unavailable(),
            ScriptedConnector::new("kb").with_hits(hits(&[("trail A", 0.9)])),
        ],
        30_000,
    )
    .await;
    let c1 = ConversationId::new("c1");

    let updates: Vec<StreamUpdate> = h
        .orchestrator
        .submit_query(&c1, "trails")
        .await
        .unwrap()
        .into_stream()
        .collect()
        .await;

    let last = updates.last().unwrap();
    assert_eq!(last.state, TaskState::Completed);
    assert_eq!(last.content, "trail A");
    assert_eq!(last.degraded_sources, vec!["web".to_string()]);

    let messages = h.store.get(&c1).unwrap();
    assert_eq!(messages[1].degraded_sources, vec!["web".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_truncates_and_freezes_placeholder() {
    let h = harness(vec![slow("web", 20)], 30_000).await;
    let c1 = ConversationId::new("c1");

    let mut stream = h.orchestrator.submit_query(&c1, "trails").await.unwrap();
    let message_id = stream.message_id();

    // Let a few results stream in
    let mut seen = 0;
    while seen < 3 {
        let update = stream.recv().await.unwrap();
        assert!(!update.done);
        seen += 1;
    }

    assert!(h.orchestrator.cancel(&c1).await);
    let frozen = h.store.message(&c1, &message_id).unwrap();
    assert!(!frozen.partial);
    assert_eq!(
        frozen.completion,
        Some(Completion::Truncated {
            reason: TruncationReason::Cancelled
        })
    );
    assert!(!frozen.content.is_empty());

    let mut rest = Vec::new();
    while let Some(update) = stream.recv().await {
        rest.push(update);
    }
    let last = rest.last().unwrap();
    assert!(last.done);
    assert_eq!(last.state, TaskState::Cancelled);
    assert_eq!(last.content, frozen.content);

    // Time passing after cancellation changes nothing
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.store.message(&c1, &message_id).unwrap(), frozen);
    assert_eq!(h.orchestrator.status(&c1).await, TaskState::Idle);
    assert!(!h.orchestrator.cancel(&c1).await);
}

#[tokio::test(start_paused = true)]
async fn test_new_query_supersedes_active_one() {
    let h = harness(vec![slow("web", 20)], 30_000).await;
    let c1 = ConversationId::new("c1");

    let mut first = h.orchestrator.submit_query(&c1, "first query").await.unwrap();
    let first_id = first.message_id();
    first.recv().await.unwrap();

    let second = h.orchestrator.submit_query(&c1, "second query").await.unwrap();

    // The first task finalized before the second one was started
    let first_message = h.store.message(&c1, &first_id).unwrap();
    assert!(!first_message.partial);
    assert!(first_message.completion.unwrap().is_truncated());

    let mut first_rest = Vec::new();
    while let Some(update) = first.recv().await {
        first_rest.push(update);
    }
    assert_eq!(first_rest.last().unwrap().state, TaskState::Cancelled);

    let updates: Vec<StreamUpdate> = second.into_stream().collect().await;
    assert_eq!(updates.last().unwrap().state, TaskState::Completed);

    let messages = h.store.get(&c1).unwrap();
    let contents: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(contents, vec!["first query", "second query"]);
    assert!(messages.iter().all(|m| !m.partial));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_submissions_leave_one_active_task() {
    let h = harness(vec![slow("web", 10)], 30_000).await;
    let c1 = ConversationId::new("c1");

    let mut handles = Vec::new();
    for i in 0..5 {
        let orchestrator = h.orchestrator.clone();
        let c1 = c1.clone();
        handles.push(tokio::spawn(async move {
            let stream = orchestrator
                .submit_query(&c1, &format!("query {}", i))
                .await
                .unwrap();
            stream.into_stream().collect::<Vec<_>>().await
        }));
    }

    let mut completed = 0;
    for handle in handles {
        let updates = handle.await.unwrap();
        let last = updates.last().unwrap();
        assert!(last.done);
        if last.state == TaskState::Completed {
            completed += 1;
        } else {
            assert_eq!(last.state, TaskState::Cancelled);
        }
    }
    assert_eq!(completed, 1);

    let messages = h.store.get(&c1).unwrap();
    assert_eq!(messages.len(), 10);
    assert!(messages.iter().all(|m| !m.partial));
}

#[tokio::test(start_paused = true)]
async fn test_task_timeout_truncates() {
    let h = harness(vec![slow("web", 50)], 1_000).await;
    let c1 = ConversationId::new("c1");

    let updates: Vec<StreamUpdate> = h
        .orchestrator
        .submit_query(&c1, "trails")
        .await
        .unwrap()
        .into_stream()
        .collect()
        .await;

    let last = updates.last().unwrap();
    assert_eq!(
        last.completion,
        Some(Completion::Truncated {
            reason: TruncationReason::Timeout
        })
    );
    assert!(!last.content.is_empty());

    let messages = h.store.get(&c1).unwrap();
    assert!(!messages[1].partial);
    assert_eq!(messages[1].content, last.content);
}

#[tokio::test]
async fn test_rejected_queries_create_no_task() {
    let h = harness(vec![ScriptedConnector::new("web")], 30_000).await;
    let c1 = ConversationId::new("c1");

    let too_long = "a".repeat(5000);
    let err = match h.orchestrator.submit_query(&c1, &too_long).await {
        Ok(_) => panic!("expected rejection"),
        Err(e) => e,
    };
    assert!(matches!(err, AppError::QueryTooLong { .. }));
    assert!(h.store.get(&c1).is_err());
    assert_eq!(h.orchestrator.status(&c1).await, TaskState::Idle);
}

#[tokio::test]
async fn test_disabled_backend_is_skipped() {
    let h = harness(
        vec![
            ScriptedConnector::new("web").with_hits(hits(&[("trail B", 0.7)])),
            ScriptedConnector::new("kb").with_hits(hits(&[("trail A", 0.9)])),
        ],
        30_000,
    )
    .await;
    h.pool.disable("kb").await.unwrap();
    let c1 = ConversationId::new("c1");

    let updates: Vec<StreamUpdate> = h
        .orchestrator
        .submit_query(&c1, "trails")
        .await
        .unwrap()
        .into_stream()
        .collect()
        .await;
    assert_eq!(updates.last().unwrap().content, "trail B");
}

#[tokio::test]
async fn test_get_is_idempotent() {
    let h = harness(
        vec![ScriptedConnector::new("web").with_hits(hits(&[("trail A", 0.9)]))],
        30_000,
    )
    .await;
    let c1 = ConversationId::new("c1");

    let _: Vec<StreamUpdate> = h
        .orchestrator
        .submit_query(&c1, "trails")
        .await
        .unwrap()
        .into_stream()
        .collect()
        .await;

    let first = h.store.get(&c1).unwrap();
    let second = h.store.get(&c1).unwrap();
    assert_eq!(first, second);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_finalizes_active_tasks() {
    let h = harness(vec![slow("web", 20)], 30_000).await;
    let conversations: Vec<ConversationId> =
        ["c1", "c2", "c3"].iter().map(|id| ConversationId::new(*id)).collect();

    let mut streams = Vec::new();
    for id in &conversations {
        streams.push(h.orchestrator.submit_query(id, "trails").await.unwrap());
    }

    h.orchestrator.shutdown().await;

    for id in &conversations {
        let messages = h.store.get(id).unwrap();
        assert!(messages.iter().all(|m| !m.partial));
        assert_eq!(h.orchestrator.status(id).await, TaskState::Idle);
    }
}
