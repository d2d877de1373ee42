//! Bounded fan-out over the hosts of one stage.
//!
//! Every per-host operation in the engine is independent and idempotent, so
//! stages fan out through a fixed-width semaphore pool and fan results back
//! in. Output order always matches input order regardless of completion
//! order, which keeps the group's configured host order intact. Width 1
//! degrades to strictly sequential processing.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

pub async fn run_bounded<I, T, F, Fut>(width: usize, items: Vec<I>, op: F) -> Vec<T>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(width.max(1)));
    let mut handles = Vec::with_capacity(items.len());

    for item in items {
        let semaphore = semaphore.clone();
        let op = op.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("stage semaphore closed");
            op(item).await
        }));
    }

    let mut out = Vec::with_capacity(handles.len());
    for handle in handles {
        out.push(handle.await.expect("stage worker panicked"));
    }
    out
}
