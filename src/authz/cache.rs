//! Single-flight authorization cache and the bounded certificate cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::{watch, Mutex};

use super::Error;

struct Entry {
	inserted_at: Instant,
	rx: watch::Receiver<Option<bool>>,
}

/// Caches authorization decisions keyed by client SPIFFE URI, with
/// single-flight collapsing of concurrent lookups for the same key and a
/// hard per-caller deadline.
pub struct AuthzCache {
	entries: Arc<Mutex<HashMap<String, Arc<Entry>>>>,
	ttl: Duration,
	timeout: Duration,
}

impl AuthzCache {
	pub fn new(ttl: Duration, timeout: Duration) -> Self {
		AuthzCache {
			entries: Arc::new(Mutex::new(HashMap::new())),
			ttl,
			timeout,
		}
	}

	/// Looks up `uri`, invoking `fetch` at most once per fresh window
	/// across any number of concurrent callers. `fetch` runs to
	/// completion on a detached task even if this call times out, so a
	/// slow upstream RPC still populates the cache for later callers.
	pub async fn lookup<F>(&self, uri: &str, fetch: F) -> Result<bool, Error>
	where
		F: FnOnce() -> BoxFuture<'static, Result<bool, Error>> + Send + 'static,
	{
		let entry = self.entry_for(uri, fetch).await;

		let wait = async {
			let mut rx = entry.rx.clone();
			loop {
				if let Some(decision) = *rx.borrow() {
					return decision;
				}
				if rx.changed().await.is_err() {
					return false;
				}
			}
		};

		tokio::time::timeout(self.timeout, wait)
			.await
			.map_err(|_| Error::Timeout)
	}

	async fn entry_for<F>(&self, uri: &str, fetch: F) -> Arc<Entry>
	where
		F: FnOnce() -> BoxFuture<'static, Result<bool, Error>> + Send + 'static,
	{
		let mut entries = self.entries.lock().await;
		if let Some(entry) = entries.get(uri) {
			if entry.inserted_at.elapsed() <= self.ttl {
				return entry.clone();
			}
		}

		let (tx, rx) = watch::channel(None);
		let entry = Arc::new(Entry {
			inserted_at: Instant::now(),
			rx,
		});
		entries.insert(uri.to_string(), entry.clone());
		drop(entries);

		let map = self.entries.clone();
		let uri_owned = uri.to_string();
		tokio::spawn(async move {
			let result = fetch().await;
			let decision = result.unwrap_or(false);
			let _ = tx.send(Some(decision));
			if result.is_err() {
				// Force the next lookup to re-fetch rather than trusting
				// a decision derived from an RPC failure.
				map.lock().await.remove(&uri_owned);
			}
		});

		entry
	}
}

/// Bounded, TTL'd cache from raw certificate DER bytes to whatever summary
/// `parse` extracts from it (first SAN URI, serial, ...), so repeated
/// callbacks for the same connection don't re-parse the certificate.
#[derive(Clone)]
pub struct CertCache<V: Clone + Send + Sync + 'static> {
	inner: moka::future::Cache<Vec<u8>, V>,
}

impl<V: Clone + Send + Sync + 'static> CertCache<V> {
	pub fn new(capacity: u64, ttl: Duration) -> Self {
		CertCache {
			inner: moka::future::Cache::builder()
				.max_capacity(capacity)
				.time_to_live(ttl)
				.build(),
		}
	}

	pub async fn get_or_parse<F, E>(&self, der: &[u8], parse: F) -> Result<V, E>
	where
		F: FnOnce(&[u8]) -> Result<V, E>,
	{
		if let Some(v) = self.inner.get(der).await {
			return Ok(v);
		}
		let v = parse(der)?;
		self.inner.insert(der.to_vec(), v.clone()).await;
		Ok(v)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	#[tokio::test]
	async fn concurrent_lookups_collapse_to_one_fetch() {
		let cache = AuthzCache::new(Duration::from_secs(1), Duration::from_secs(1));
		let calls = Arc::new(AtomicUsize::new(0));

		let mut handles = Vec::new();
		for _ in 0..50 {
			let calls = calls.clone();
			let cache_entries = cache.entries.clone();
			let ttl = cache.ttl;
			let timeout = cache.timeout;
			handles.push(tokio::spawn(async move {
				let cache = AuthzCache { entries: cache_entries, ttl, timeout };
				let calls = calls.clone();
				cache
					.lookup("spiffe://cluster/ns/default/sa/web", move || {
						Box::pin(async move {
							calls.fetch_add(1, Ordering::SeqCst);
							tokio::time::sleep(Duration::from_millis(20)).await;
							Ok(true)
						})
					})
					.await
			}));
		}

		for h in handles {
			assert!(h.await.unwrap().unwrap());
		}
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn timeout_returns_error_without_canceling_the_fetch() {
		let cache = AuthzCache::new(Duration::from_secs(5), Duration::from_millis(10));
		let result = cache
			.lookup("spiffe://cluster/ns/default/sa/slow", || {
				Box::pin(async move {
					tokio::time::sleep(Duration::from_millis(50)).await;
					Ok(true)
				})
			})
			.await;
		assert!(matches!(result, Err(Error::Timeout)));
	}

	#[tokio::test]
	async fn cert_cache_parses_once_per_key() {
		let cache: CertCache<Arc<str>> = CertCache::new(16, Duration::from_secs(60));
		let calls = Arc::new(AtomicUsize::new(0));
		let der = vec![1, 2, 3];

		for _ in 0..5 {
			let calls = calls.clone();
			let uri = cache
				.get_or_parse(&der, move |_| -> Result<Arc<str>, std::convert::Infallible> {
					calls.fetch_add(1, Ordering::SeqCst);
					Ok(Arc::from("spiffe://cluster/ns/default/sa/web"))
				})
				.await
				.unwrap();
			assert_eq!(&*uri, "spiffe://cluster/ns/default/sa/web");
		}
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}
}
