//! Bounded-concurrency batch runner shared by the history and analysis stages.
//!
//! Items are split into ordered chunks; everything inside a chunk runs
//! concurrently against one deadline, then the runner pauses before the next
//! chunk. A failing or late item only ever marks *itself* as failed.

use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub chunk_size: usize,
    pub chunk_timeout: Duration,
    /// Pause inserted between two chunks (not after the last one).
    pub pause: Duration,
}

impl ChunkPlan {
    pub fn new(chunk_size: usize, chunk_timeout: Duration, pause: Duration) -> Self {
        Self { chunk_size: chunk_size.max(1), chunk_timeout, pause }
    }

    pub fn batches_for(&self, items: usize) -> usize {
        items.div_ceil(self.chunk_size.max(1))
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ItemError<E> {
    #[error("{0}")]
    Failed(E),
    #[error("chunk deadline exceeded")]
    TimedOut,
}

/// Per-item results in input order, plus how many batches were dispatched.
#[derive(Debug)]
pub struct StageOutput<T, E> {
    pub results: Vec<Result<T, ItemError<E>>>,
    pub batches: usize,
}

impl<T, E> StageOutput<T, E> {
    pub fn failures(&self) -> usize {
        self.results.iter().filter(|r| r.is_err()).count()
    }

    /// Splits into `(successes, failures)` keeping input order inside each side.
    pub fn partition(self) -> (Vec<T>, Vec<ItemError<E>>) {
        let mut ok = Vec::with_capacity(self.results.len());
        let mut failed = Vec::new();
        for r in self.results {
            match r {
                Ok(v) => ok.push(v),
                Err(e) => failed.push(e),
            }
        }
        (ok, failed)
    }
}

pub async fn run_chunked<I, T, E, F, Fut>(items: Vec<I>, plan: ChunkPlan, f: F) -> StageOutput<T, E>
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let total = items.len();
    let size = plan.chunk_size.max(1);
    let mut results = Vec::with_capacity(total);
    let mut batches = 0;
    let mut iter = items.into_iter().peekable();

    while iter.peek().is_some() {
        if batches > 0 && !plan.pause.is_zero() {
            tokio::time::sleep(plan.pause).await;
        }

        let chunk: Vec<I> = iter.by_ref().take(size).collect();
        let deadline = Instant::now() + plan.chunk_timeout;
        batches += 1;
        log::debug!("chunk {batches}: dispatching {} item(s)", chunk.len());

        let pending = chunk.into_iter().map(|item| {
            let fut = f(item);
            async move {
                match tokio::time::timeout_at(deadline, fut).await {
                    Ok(Ok(v)) => Ok(v),
                    Ok(Err(e)) => Err(ItemError::Failed(e)),
                    Err(_) => Err(ItemError::TimedOut),
                }
            }
        });
        results.extend(join_all(pending).await);
    }

    StageOutput { results, batches }
}
