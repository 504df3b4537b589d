//! Sequential fallback chain over unreliable async sources.
//!
//! Sources run one at a time in declared priority order. The first result the
//! caller's `meaningful` predicate accepts wins; errors, timeouts and empty
//! results are misses and the next source is tried. Low-priority providers are
//! never hit while a higher-priority one answers.

use futures_util::future::BoxFuture;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type SourceFn<'a, T> = Box<dyn FnOnce() -> BoxFuture<'a, anyhow::Result<T>> + Send + 'a>;

/// A lazily started source. Nothing runs until the chain reaches it.
pub struct Source<'a, T> {
    name: String,
    run: SourceFn<'a, T>,
}

impl<'a, T> Source<'a, T> {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'a,
    {
        Self {
            name: name.into(),
            run: Box::new(move || Box::pin(f())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSourceError {
    /// Every source missed.
    Exhausted { label: String, attempted: usize },
    Cancelled,
}

impl std::fmt::Display for DataSourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhausted { label, attempted } => {
                write!(f, "{}: exhausted {} sources", label, attempted)
            }
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for DataSourceError {}

pub struct FallbackChain<'a, T> {
    label: String,
    sources: Vec<Source<'a, T>>,
    source_timeout: Option<Duration>,
}

impl<'a, T: Send + 'a> FallbackChain<'a, T> {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            sources: Vec::new(),
            source_timeout: None,
        }
    }

    /// Per-source deadline. A source that overruns it is a miss.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.source_timeout = Some(timeout);
        self
    }

    pub fn push(&mut self, source: Source<'a, T>) {
        self.sources.push(source);
    }

    pub fn source<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'a,
    {
        self.sources.push(Source::new(name, f));
        self
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Runs the chain with an explicit acceptance predicate.
    pub async fn resolve_with<P>(
        self,
        meaningful: P,
        cancel: &CancellationToken,
    ) -> Result<T, DataSourceError>
    where
        P: Fn(&T) -> bool,
    {
        let label = self.label;
        let timeout = self.source_timeout;
        let mut attempted = 0usize;

        for Source { name, run } in self.sources {
            if cancel.is_cancelled() {
                return Err(DataSourceError::Cancelled);
            }
            attempted += 1;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DataSourceError::Cancelled),
                outcome = run_bounded(run(), timeout) => outcome,
            };

            match outcome {
                Ok(value) if meaningful(&value) => {
                    debug!(chain = %label, source = %name, attempted, "source resolved");
                    return Ok(value);
                }
                Ok(_) => {
                    debug!(chain = %label, source = %name, "empty result, trying next source");
                }
                Err(e) => {
                    debug!(chain = %label, source = %name, error = %e, "source missed, trying next");
                }
            }
        }

        Err(DataSourceError::Exhausted { label, attempted })
    }

    /// Runs the chain with the type's own `Meaningful` predicate.
    pub async fn resolve(self, cancel: &CancellationToken) -> Result<T, DataSourceError>
    where
        T: Meaningful,
    {
        self.resolve_with(|v: &T| v.is_meaningful(), cancel).await
    }
}

async fn run_bounded<T>(
    fut: BoxFuture<'_, anyhow::Result<T>>,
    timeout: Option<Duration>,
) -> anyhow::Result<T> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("timed out after {}ms", limit.as_millis())),
        },
        None => fut.await,
    }
}

/// Default acceptance rule: a value is meaningful if it carries at least one
/// non-empty leaf.
pub trait Meaningful {
    fn is_meaningful(&self) -> bool;
}

impl Meaningful for String {
    fn is_meaningful(&self) -> bool {
        !self.trim().is_empty()
    }
}

impl Meaningful for str {
    fn is_meaningful(&self) -> bool {
        !self.trim().is_empty()
    }
}

impl Meaningful for f64 {
    fn is_meaningful(&self) -> bool {
        !self.is_nan()
    }
}

impl Meaningful for f32 {
    fn is_meaningful(&self) -> bool {
        !self.is_nan()
    }
}

impl Meaningful for Decimal {
    fn is_meaningful(&self) -> bool {
        true
    }
}

macro_rules! always_meaningful {
    ($($t:ty),*) => {
        $(impl Meaningful for $t {
            fn is_meaningful(&self) -> bool {
                true
            }
        })*
    };
}

always_meaningful!(u32, u64, u128, i32, i64, i128, bool);

impl<T: Meaningful + ?Sized> Meaningful for &T {
    fn is_meaningful(&self) -> bool {
        (**self).is_meaningful()
    }
}

impl<T: Meaningful + ?Sized> Meaningful for Box<T> {
    fn is_meaningful(&self) -> bool {
        (**self).is_meaningful()
    }
}

impl<T: Meaningful> Meaningful for Option<T> {
    fn is_meaningful(&self) -> bool {
        self.as_ref().map_or(false, Meaningful::is_meaningful)
    }
}

impl<T: Meaningful> Meaningful for Vec<T> {
    fn is_meaningful(&self) -> bool {
        self.iter().any(Meaningful::is_meaningful)
    }
}

impl<K, V: Meaningful, S> Meaningful for HashMap<K, V, S> {
    fn is_meaningful(&self) -> bool {
        self.values().any(Meaningful::is_meaningful)
    }
}

impl<K, V: Meaningful> Meaningful for BTreeMap<K, V> {
    fn is_meaningful(&self) -> bool {
        self.values().any(Meaningful::is_meaningful)
    }
}

impl Meaningful for serde_json::Value {
    fn is_meaningful(&self) -> bool {
        use serde_json::Value as Json;
        match self {
            Json::Null => false,
            Json::Bool(_) => true,
            Json::Number(n) => n.as_f64().map_or(true, |f| !f.is_nan()),
            Json::String(s) => s.is_meaningful(),
            Json::Array(items) => items.iter().any(Meaningful::is_meaningful),
            Json::Object(map) => map.values().any(Meaningful::is_meaningful),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counted<T: Send + 'static>(
        calls: &Arc<AtomicUsize>,
        result: anyhow::Result<T>,
    ) -> impl FnOnce() -> BoxFuture<'static, anyhow::Result<T>> + Send + 'static {
        let calls = calls.clone();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { result })
        }
    }

    #[tokio::test]
    async fn test_first_meaningful_wins_and_stops() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let chain = FallbackChain::new("test")
            .source("a", counted(&calls, Err(anyhow::anyhow!("down"))))
            .source("b", counted(&calls, Err(anyhow::anyhow!("rate limited"))))
            .source("c", counted(&calls, Ok("v".to_string())))
            .source("d", counted(&calls, Ok("never".to_string())));

        let value = chain.resolve(&cancel).await.unwrap();
        assert_eq!(value, "v");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_empty_composites_are_misses() {
        let cancel = CancellationToken::new();
        let chain = FallbackChain::new("json")
            .source("empty-object", || async { Ok(json!({})) })
            .source("empty-array", || async { Ok(json!([])) })
            .source("nested-empty", || async { Ok(json!({"a": {"b": [null, ""]}})) })
            .source("real", || async { Ok(json!({"a": {"b": [null, 1.5]}})) });

        let value = chain.resolve(&cancel).await.unwrap();
        assert_eq!(value, json!({"a": {"b": [null, 1.5]}}));
    }

    #[tokio::test]
    async fn test_all_miss_is_exhausted() {
        let cancel = CancellationToken::new();
        let chain = FallbackChain::<Vec<String>>::new("vendors")
            .source("a", || async { Ok(vec![]) })
            .source("b", || async { Err(anyhow::anyhow!("boom")) });

        let err = chain.resolve(&cancel).await.unwrap_err();
        assert_eq!(
            err,
            DataSourceError::Exhausted {
                label: "vendors".into(),
                attempted: 2
            }
        );
    }

    #[tokio::test]
    async fn test_explicit_predicate_overrides_default() {
        let cancel = CancellationToken::new();
        let chain = FallbackChain::new("floor")
            .source("zero", || async { Ok(Decimal::ZERO) })
            .source("positive", || async { Ok(Decimal::from(2)) });

        let value = chain
            .resolve_with(|d: &Decimal| *d > Decimal::ZERO, &cancel)
            .await
            .unwrap();
        assert_eq!(value, Decimal::from(2));
    }

    #[tokio::test]
    async fn test_slow_source_times_out_as_miss() {
        let cancel = CancellationToken::new();
        let chain = FallbackChain::new("slow")
            .with_timeout(Duration::from_millis(20))
            .source("sleepy", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(1.0f64)
            })
            .source("fast", || async { Ok(2.0f64) });

        assert_eq!(chain.resolve(&cancel).await.unwrap(), 2.0);
    }

    #[tokio::test]
    async fn test_cancellation_stops_chain() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let chain = FallbackChain::new("cancelled")
            .source("a", counted(&calls, Ok("x".to_string())));

        assert_eq!(
            chain.resolve(&cancel).await.unwrap_err(),
            DataSourceError::Cancelled
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_nan_is_not_meaningful() {
        assert!(!f64::NAN.is_meaningful());
        assert!(0.0f64.is_meaningful());
        assert!(!Some(f64::NAN).is_meaningful());
        assert!(!Option::<String>::None.is_meaningful());
    }
}
