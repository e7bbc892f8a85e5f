//! Independent transactions in parallel.
//!
//! Each job gets its own page from the provider, so jobs never share a
//! session. Results come back in submission order.

use super::{TransactionController, TransactionRequest, TransactionResult};
use crate::config::ScreenConfig;
use crate::driver::PageProvider;
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct Job {
    pub label: String,
    pub screen: Arc<ScreenConfig>,
    pub request: TransactionRequest,
}

impl Job {
    pub fn new(
        label: impl Into<String>,
        screen: Arc<ScreenConfig>,
        request: TransactionRequest,
    ) -> Self {
        Self {
            label: label.into(),
            screen,
            request,
        }
    }
}

#[derive(Debug)]
pub struct JobResult {
    pub label: String,
    pub result: Result<TransactionResult>,
}

/// Run every job, at most `max_parallel` at a time.
pub async fn run_all(
    controller: Arc<TransactionController>,
    provider: Arc<dyn PageProvider>,
    jobs: Vec<Job>,
    max_parallel: usize,
) -> Vec<JobResult> {
    let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
    info!("running {} job(s), {} at a time", jobs.len(), max_parallel.max(1));

    let handles: Vec<(String, JoinHandle<Result<TransactionResult>>)> = jobs
        .into_iter()
        .map(|job| {
            let controller = Arc::clone(&controller);
            let provider = Arc::clone(&provider);
            let sem = Arc::clone(&semaphore);
            let label = job.label.clone();

            let handle = tokio::spawn(async move {
                let _permit = sem
                    .acquire()
                    .await
                    .map_err(|_| Error::Cancelled("job semaphore closed".into()))?;
                let page = provider.open_page().await?;
                controller.run(page, job.screen, job.request).await
            });
            (label, handle)
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for (label, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(Error::Script(format!("job task failed: {}", e))),
        };
        if let Err(ref e) = result {
            warn!("job '{}' failed: {}", label, e);
        }
        results.push(JobResult { label, result });
    }
    results
}
