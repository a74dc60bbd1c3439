use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

/// Performs one data refresh against an external system.
///
/// Integrations implement this directly, or wrap a closure with [`fetch_fn`]
/// (async) or [`blocking_fn`] (blocking vendor SDK calls).
#[async_trait]
pub trait Fetcher<T>: Send + Sync {
    async fn fetch(&self) -> anyhow::Result<T>;
}

#[async_trait]
impl<T, F> Fetcher<T> for Arc<F>
where
    F: Fetcher<T> + ?Sized,
    T: 'static,
{
    async fn fetch(&self) -> anyhow::Result<T> {
        (**self).fetch().await
    }
}

#[async_trait]
impl<T, F> Fetcher<T> for Box<F>
where
    F: Fetcher<T> + ?Sized,
    T: 'static,
{
    async fn fetch(&self) -> anyhow::Result<T> {
        (**self).fetch().await
    }
}

/// Fetcher backed by an async closure.
pub struct FnFetcher<F>(F);

/// Wrap an async closure as a [`Fetcher`].
pub fn fetch_fn<F, Fut, T>(f: F) -> FnFetcher<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<T>> + Send,
{
    FnFetcher(f)
}

#[async_trait]
impl<F, Fut, T> Fetcher<T> for FnFetcher<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<T>> + Send,
    T: 'static,
{
    async fn fetch(&self) -> anyhow::Result<T> {
        (self.0)().await
    }
}

/// Fetcher backed by a blocking closure, run on tokio's blocking pool.
pub struct BlockingFetcher<F>(Arc<F>);

/// Wrap a blocking closure as a [`Fetcher`].
pub fn blocking_fn<F, T>(f: F) -> BlockingFetcher<F>
where
    F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    T: Send + 'static,
{
    BlockingFetcher(Arc::new(f))
}

#[async_trait]
impl<F, T> Fetcher<T> for BlockingFetcher<F>
where
    F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    T: Send + 'static,
{
    async fn fetch(&self) -> anyhow::Result<T> {
        let f = self.0.clone();
        tokio::task::spawn_blocking(move || (*f)()).await?
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;

    #[tokio::test]
    async fn test_fetch_fn() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let fetcher = fetch_fn(move || {
            let counter = counter.clone();
            async move { Ok(counter.fetch_add(1, Ordering::SeqCst) + 1) }
        });

        assert_eq!(fetcher.fetch().await.unwrap(), 1);
        assert_eq!(fetcher.fetch().await.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_blocking_fn() {
        let fetcher = blocking_fn(|| {
            std::thread::sleep(std::time::Duration::from_millis(5));
            Ok::<_, anyhow::Error>("done".to_string())
        });
        assert_eq!(fetcher.fetch().await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_blocking_fn_error() {
        let fetcher = blocking_fn(|| -> anyhow::Result<u32> { anyhow::bail!("device busy") });
        let err = fetcher.fetch().await.unwrap_err();
        assert_eq!(err.to_string(), "device busy");
    }

    #[tokio::test]
    async fn test_arc_dyn_fetcher() {
        let fetcher: Arc<dyn Fetcher<u32>> = Arc::new(fetch_fn(|| async { Ok(7) }));
        assert_eq!(fetcher.fetch().await.unwrap(), 7);
    }
}
