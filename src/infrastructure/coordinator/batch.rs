//! Micro-batching of compatible provider calls
//!
//! Misses arriving within a short window are grouped by model and template
//! and dispatched together. Responses are routed back to their individual
//! callers, who never observe the batching.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::fingerprint::RequestFingerprint;
use crate::domain::llm::{ProviderClient, ProviderResponse};
use crate::domain::DomainError;

struct BatchJob {
    fingerprint: RequestFingerprint,
    reply: oneshot::Sender<Result<ProviderResponse, DomainError>>,
}

/// Requests are only batched together when the provider would accept them as
/// one dispatch group
fn group_key(fingerprint: &RequestFingerprint) -> String {
    format!(
        "{}/{}@{}:{:?}",
        fingerprint.model_id,
        fingerprint.template_id,
        fingerprint.template_version,
        fingerprint.params
    )
}

/// Handle to the background batch collector
#[derive(Debug, Clone)]
pub struct Batcher {
    tx: mpsc::Sender<BatchJob>,
}

impl Batcher {
    /// Spawns the collector task. `window` bounds how long the first job in a
    /// batch waits for company.
    pub fn spawn(provider: Arc<dyn ProviderClient>, window: Duration) -> Self {
        let (tx, rx) = mpsc::channel::<BatchJob>(256);
        tokio::spawn(collector_loop(rx, provider, window));
        Self { tx }
    }

    pub async fn submit(
        &self,
        fingerprint: RequestFingerprint,
    ) -> Result<ProviderResponse, DomainError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = BatchJob {
            fingerprint,
            reply: reply_tx,
        };

        self.tx
            .send(job)
            .await
            .map_err(|_| DomainError::internal("batch collector is not running"))?;

        reply_rx
            .await
            .map_err(|_| DomainError::internal("batch collector dropped the request"))?
    }
}

async fn collector_loop(
    mut rx: mpsc::Receiver<BatchJob>,
    provider: Arc<dyn ProviderClient>,
    window: Duration,
) {
    while let Some(first) = rx.recv().await {
        let mut jobs = vec![first];
        let deadline = Instant::now() + window;

        while let Ok(Some(job)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            jobs.push(job);
        }

        dispatch_batch(jobs, provider.as_ref()).await;
    }

    debug!("Batch collector shutting down");
}

async fn dispatch_batch(jobs: Vec<BatchJob>, provider: &dyn ProviderClient) {
    let mut groups: HashMap<String, Vec<BatchJob>> = HashMap::new();
    for job in jobs {
        groups.entry(group_key(&job.fingerprint)).or_default().push(job);
    }

    for (key, group) in groups {
        debug!(group = %key, size = group.len(), "Dispatching batch group");

        let fingerprints: Vec<RequestFingerprint> =
            group.iter().map(|job| job.fingerprint.clone()).collect();
        let results = provider.invoke_many(&fingerprints).await;

        for (job, result) in group.into_iter().zip(results) {
            if job.reply.send(result).is_err() {
                warn!("Batch caller went away before its result arrived");
            }
        }
    }
}
