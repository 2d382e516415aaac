//! Concurrent fan-out of identical unit requests with incremental progress.

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::{
    error::GenError,
    model::{BatchProgress, GeneratedImage, GenerationRequest},
    upstream::{GenerationResult, ImageGenerator},
};

/// Aggregate of a settled batch in which at least one unit succeeded.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub batch_id: Uuid,
    /// Successful outputs in arrival order.
    pub images: Vec<GeneratedImage>,
    pub progress: BatchProgress,
    pub failures: Vec<GenError>,
}

pub struct BatchOrchestrator {
    generator: Arc<dyn ImageGenerator>,
    concurrency: usize,
    max_batch_size: usize,
}

impl BatchOrchestrator {
    pub fn new(generator: Arc<dyn ImageGenerator>, concurrency: usize, max_batch_size: usize) -> Self {
        Self {
            generator,
            concurrency: concurrency.max(1),
            max_batch_size,
        }
    }

    pub fn generator(&self) -> &Arc<dyn ImageGenerator> {
        &self.generator
    }

    /// Run `count` unit requests and report a progress snapshot after each
    /// one settles.
    ///
    /// At most `concurrency` units are in flight at once. Units run as
    /// detached tasks, so dropping the returned future does not abort calls
    /// already issued upstream. Fails only when every unit failed, carrying
    /// the first failure to arrive.
    pub async fn generate_batch(
        &self,
        request: GenerationRequest,
        count: usize,
        mut on_progress: impl FnMut(BatchProgress) + Send,
    ) -> Result<BatchOutcome, GenError> {
        if count == 0 || count > self.max_batch_size {
            return Err(GenError::validation(format!(
                "batch size must be between 1 and {}",
                self.max_batch_size
            )));
        }

        let batch_id = Uuid::new_v4();
        tracing::info!(%batch_id, count, concurrency = self.concurrency, "batch started");

        let request = Arc::new(request);
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut pending: FuturesUnordered<_> = (0..count)
            .map(|unit| {
                let generator = Arc::clone(&self.generator);
                let request = Arc::clone(&request);
                let semaphore = Arc::clone(&semaphore);
                tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    let result = generator.invoke(&request).await;
                    if let Err(err) = &result {
                        tracing::warn!(%batch_id, unit, reason = err.reason(), error = %err, "unit failed");
                    }
                    result
                })
            })
            .collect();

        let mut progress = BatchProgress {
            completed: 0,
            succeeded: 0,
            total: count as u32,
        };
        let mut images = Vec::new();
        let mut failures = Vec::new();

        while let Some(joined) = pending.next().await {
            let result: GenerationResult = joined
                .unwrap_or_else(|e| Err(GenError::Transport(format!("unit task aborted: {e}"))));

            progress.completed += 1;
            match result {
                Ok(unit_images) => {
                    progress.succeeded += 1;
                    images.extend(unit_images);
                }
                Err(err) => failures.push(err),
            }
            on_progress(progress);
        }

        tracing::info!(
            %batch_id,
            completed = progress.completed,
            succeeded = progress.succeeded,
            "batch settled"
        );

        if progress.succeeded == 0 {
            return Err(failures
                .into_iter()
                .next()
                .unwrap_or_else(|| GenError::Parse("batch produced no results".to_string())));
        }

        Ok(BatchOutcome {
            batch_id,
            images,
            progress,
            failures,
        })
    }
}
