//! Aggregation engine
//!
//! Fans a query out to every bound backend in parallel and merges their
//! results, as they arrive, into one ranked and deduplicated sequence.
//! Each merged batch is published as a `Delta`; the final ordering is
//! returned in the `AggregationOutcome`.

mod ranking;

pub use ranking::{
    render, Delta, DeltaInsert, RankedResult, RankedSet, ResultView, SimilarityKey,
    FRAGMENT_SEPARATOR,
};

use crate::connectors::{BoundConnector, ConnectorPool};
use chrono::Utc;
use fista_common::errors::AppError;
use fista_common::metrics;
use fista_common::models::BackendResult;
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Maximum results merged per batch
pub const DEFAULT_BATCH_LIMIT: usize = 32;

/// How an aggregation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStatus {
    Completed,
    Cancelled,
    AllBackendsFailed,
}

/// A source that did not fully contribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    pub source: String,
    pub reason: String,
}

#[derive(Debug)]
pub struct AggregationOutcome {
    pub status: AggregationStatus,
    /// Ranked results merged before the aggregation ended
    pub results: Vec<RankedResult>,
    /// Rendered text of `results`
    pub content: String,
    pub degraded: Vec<SourceFailure>,
}

impl AggregationOutcome {
    /// Human-readable summary of why every backend failed
    pub fn failure_reason(&self) -> String {
        if self.degraded.is_empty() {
            return "no backends enabled".to_string();
        }
        self.degraded
            .iter()
            .map(|f| format!("{}: {}", f.source, f.reason))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn degraded_sources(&self) -> Vec<String> {
        self.degraded.iter().map(|f| f.source.clone()).collect()
    }
}

enum SourceEvent {
    Hit(BackendResult),
    Finished {
        source: String,
        yielded: usize,
        failure: Option<String>,
    },
}

pub struct AggregationEngine {
    pool: Arc<ConnectorPool>,
    batch_limit: usize,
}

impl AggregationEngine {
    pub fn new(pool: Arc<ConnectorPool>) -> Self {
        Self {
            pool,
            batch_limit: DEFAULT_BATCH_LIMIT,
        }
    }

    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit.max(1);
        self
    }

    pub fn pool(&self) -> &Arc<ConnectorPool> {
        &self.pool
    }

    /// Run one aggregation.
    ///
    /// Deltas are sent on `deltas` in revision order. Cancelling `cancel`
    /// stops merging, drops every connector stream and returns what was
    /// merged so far.
    pub async fn run(
        &self,
        query: &str,
        backends: &[String],
        cancel: CancellationToken,
        deltas: mpsc::Sender<Delta>,
    ) -> AggregationOutcome {
        let mut set = RankedSet::new();
        let mut degraded = Vec::new();

        if cancel.is_cancelled() {
            return outcome(AggregationStatus::Cancelled, set, degraded);
        }

        let bound = self.pool.bind(backends).await;
        if bound.is_empty() {
            warn!(requested = backends.len(), "No enabled backends to query");
            return outcome(AggregationStatus::AllBackendsFailed, set, degraded);
        }

        let source_count = bound.len();
        let mut pending: HashSet<String> = bound.iter().map(|c| c.name().to_string()).collect();
        let (events_tx, mut events) = mpsc::unbounded_channel();

        // Dropping the set aborts every source task and its stream
        let mut sources = JoinSet::new();
        for connector in bound {
            sources.spawn(run_source(connector, query.to_string(), events_tx.clone()));
        }
        drop(events_tx);

        info!(sources = source_count, "Aggregation dispatched");

        let mut contributed = 0usize;
        let mut buffer = Vec::with_capacity(self.batch_limit);

        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return outcome(AggregationStatus::Cancelled, set, degraded);
                }
                n = events.recv_many(&mut buffer, self.batch_limit) => n,
            };

            if received == 0 {
                break;
            }
            if cancel.is_cancelled() {
                return outcome(AggregationStatus::Cancelled, set, degraded);
            }

            let mut batch = Vec::with_capacity(received);
            for event in buffer.drain(..) {
                match event {
                    SourceEvent::Hit(result) => batch.push(result),
                    SourceEvent::Finished {
                        source,
                        yielded,
                        failure,
                    } => {
                        pending.remove(&source);
                        if yielded > 0 || failure.is_none() {
                            contributed += 1;
                        }
                        if let Some(reason) = failure {
                            warn!(backend = %source, yielded, reason = %reason, "Source degraded");
                            degraded.push(SourceFailure { source, reason });
                        }
                    }
                }
            }

            if let Some(delta) = set.apply(batch) {
                debug!(
                    revision = delta.revision,
                    removed = delta.removed.len(),
                    inserted = delta.inserted.len(),
                    "Delta merged"
                );
                metrics::record_delta(source_count);

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return outcome(AggregationStatus::Cancelled, set, degraded);
                    }
                    sent = deltas.send(delta) => {
                        if sent.is_err() {
                            debug!("Delta receiver dropped, stopping aggregation");
                            return outcome(AggregationStatus::Cancelled, set, degraded);
                        }
                    }
                }
            }
        }

        // A source task that panicked never reports
        for source in pending {
            degraded.push(SourceFailure {
                source,
                reason: "source task aborted".to_string(),
            });
        }

        let status = if contributed == 0 {
            AggregationStatus::AllBackendsFailed
        } else {
            AggregationStatus::Completed
        };

        info!(
            status = ?status,
            results = set.len(),
            degraded = degraded.len(),
            "Aggregation finished"
        );
        outcome(status, set, degraded)
    }
}

fn outcome(
    status: AggregationStatus,
    set: RankedSet,
    degraded: Vec<SourceFailure>,
) -> AggregationOutcome {
    let content = set.render();
    AggregationOutcome {
        status,
        results: set.into_items(),
        content,
        degraded,
    }
}

fn failure_reason(error: AppError) -> String {
    match error {
        AppError::BackendUnavailable { message, .. } => message,
        other => other.to_string(),
    }
}

/// Drive one connector to completion, forwarding hits as they arrive
async fn run_source(
    connector: BoundConnector,
    query: String,
    events: mpsc::UnboundedSender<SourceEvent>,
) {
    let source = connector.name().to_string();

    let deadline = connector.deadline();
    let mut hits = match connector.open_until(&query, deadline).await {
        Ok(hits) => hits,
        Err(e) => {
            let _ = events.send(SourceEvent::Finished {
                source,
                yielded: 0,
                failure: Some(failure_reason(e)),
            });
            return;
        }
    };

    let mut yielded = 0;
    let mut failure = None;

    loop {
        match tokio::time::timeout_at(deadline, hits.next()).await {
            Ok(Some(Ok(hit))) => {
                if !hit.score.is_finite() {
                    warn!(backend = %source, "Dropping hit with non-finite score");
                    continue;
                }
                yielded += 1;
                let result = BackendResult::from_hit(source.clone(), hit, Utc::now());
                if events.send(SourceEvent::Hit(result)).is_err() {
                    return;
                }
            }
            Ok(Some(Err(e))) => {
                failure = Some(failure_reason(e));
                break;
            }
            Ok(None) => break,
            Err(_) => {
                failure = Some(format!(
                    "timed out after {}ms",
                    connector.timeout().as_millis()
                ));
                break;
            }
        }
    }

    let _ = events.send(SourceEvent::Finished {
        source,
        yielded,
        failure,
    });
}
