//! Bounded pool for CPU-heavy crypto and hashing work.
//!
//! Request handlers stay responsive by pushing long-running SHA-256 and
//! AES-GCM work onto blocking threads, bounded by a semaphore so a burst of
//! finalize calls cannot monopolize the blocking pool.

use std::sync::Arc;

use tokio::sync::Semaphore;

/// Default number of concurrently running crypto jobs.
pub const DEFAULT_CRYPTO_JOBS: usize = 4;

/// Semaphore-bounded `spawn_blocking` wrapper.
#[derive(Clone, Debug)]
pub struct CryptoPool {
    permits: Arc<Semaphore>,
}

impl Default for CryptoPool {
    fn default() -> Self {
        Self::new(DEFAULT_CRYPTO_JOBS)
    }
}

impl CryptoPool {
    /// Create a pool allowing `jobs` concurrent blocking tasks.
    pub fn new(jobs: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(jobs.max(1))),
        }
    }

    /// Run a CPU-bound closure on the blocking pool, waiting for a permit
    /// first. The permit is held for the duration of the closure.
    pub async fn run<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        // The semaphore is never closed, so acquire cannot fail.
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .expect("crypto pool semaphore closed");
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await
        .expect("crypto pool task panicked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn runs_closure_and_returns_value() {
        let pool = CryptoPool::new(2);
        let out = pool.run(|| 21 * 2).await;
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let pool = CryptoPool::new(1);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                pool.run(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(5));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
