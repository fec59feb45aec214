use crate::config::StepKey;
use crate::error::{Result, RolloutError};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Bounded set of concurrently running step executions.
///
/// Tasks start immediately and wait for a permit; [`TaskGroup::join`]
/// awaits them in spawn order and returns one result per step.
pub struct TaskGroup<T> {
    semaphore: Arc<Semaphore>,
    tasks: Vec<(StepKey, JoinHandle<Result<T>>)>,
}

impl<T: Send + 'static> TaskGroup<T> {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_parallel.max(1))),
            tasks: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn spawn<F>(&mut self, key: StepKey, fut: F)
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let sem = Arc::clone(&self.semaphore);
        let step = key.to_string();
        let handle = tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.map_err(|_| RolloutError::Pipeline {
                step,
                reason: "semaphore closed".to_string(),
            })?;
            fut.await
        });
        self.tasks.push((key, handle));
    }

    pub async fn join(&mut self) -> Vec<(StepKey, Result<T>)> {
        let mut results = Vec::with_capacity(self.tasks.len());
        for (key, handle) in self.tasks.drain(..) {
            let result = match handle.await {
                Ok(r) => r,
                Err(e) => Err(RolloutError::Pipeline {
                    step: key.to_string(),
                    reason: format!("task join error: {e}"),
                }),
            };
            results.push((key, result));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn join_returns_results_in_spawn_order() {
        let mut group = TaskGroup::new(4);
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            group.spawn(StepKey::new(*name, ""), async move {
                tokio::time::sleep(Duration::from_millis(10 * (3 - i as u64))).await;
                Ok(i)
            });
        }
        assert_eq!(group.len(), 3);
        let results = group.join().await;
        assert!(group.is_empty());
        let order: Vec<_> = results.iter().map(|(k, r)| (k.name.clone(), *r.as_ref().unwrap())).collect();
        assert_eq!(order, [("a".to_string(), 0), ("b".to_string(), 1), ("c".to_string(), 2)]);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut group = TaskGroup::new(2);
        for i in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            group.spawn(StepKey::new(format!("s{i}"), ""), async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }
        let results = group.join().await;
        assert_eq!(results.len(), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn errors_are_collected_per_step() {
        let mut group: TaskGroup<()> = TaskGroup::new(1);
        group.spawn(StepKey::new("ok", ""), async { Ok(()) });
        group.spawn(StepKey::new("bad", ""), async {
            Err(RolloutError::Pipeline {
                step: "bad".into(),
                reason: "exit 1".into(),
            })
        });
        let results = group.join().await;
        assert!(results[0].1.is_ok());
        assert!(results[1].1.is_err());
    }
}
