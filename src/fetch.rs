//! Single-flight coordination of "go fetch fresh usage data" attempts.
//!
//! At most one attempt runs at a time. Callers arriving while an attempt is in
//! flight await the same shared outcome. The attempt itself runs on its own task,
//! so it completes even if every caller stops waiting.

use crate::browser::{ContextId, PageDriver};
use crate::cache::CacheStore;
use crate::config::FetchTimings;
use crate::error::FetchError;
use crate::models::{CacheRecord, UsageSnapshot};
use crate::protocol::Request;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

pub type FetchOutcome = Result<CacheRecord, FetchError>;
type SharedOutcome = Shared<BoxFuture<'static, FetchOutcome>>;

enum FetchState {
    Idle,
    InFlight { attempt: u64, outcome: SharedOutcome },
}

/// Returns the coordinator to `Idle` when the attempt task ends, however it ends.
struct InFlightGuard<'a> {
    state: &'a Mutex<FetchState>,
    attempt: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if matches!(&*state, FetchState::InFlight { attempt, .. } if *attempt == self.attempt) {
            *state = FetchState::Idle;
        }
    }
}

pub struct FetchCoordinator<D: PageDriver> {
    driver: Arc<D>,
    store: Arc<CacheStore>,
    target_url: String,
    timings: FetchTimings,
    state: Mutex<FetchState>,
    attempts: AtomicU64,
    /// Contexts this coordinator opened and will close, keyed to the attempt
    /// that scheduled the close.
    closing: Arc<Mutex<HashMap<ContextId, u64>>>,
}

impl<D: PageDriver> FetchCoordinator<D> {
    pub fn new(
        driver: Arc<D>,
        store: Arc<CacheStore>,
        target_url: impl Into<String>,
        timings: FetchTimings,
    ) -> Self {
        Self {
            driver,
            store,
            target_url: target_url.into(),
            timings,
            state: Mutex::new(FetchState::Idle),
            attempts: AtomicU64::new(0),
            closing: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(&*self.state.lock(), FetchState::InFlight { .. })
    }

    /// Fetches fresh data, joining the in-flight attempt if there is one.
    pub async fn fetch_fresh(self: &Arc<Self>) -> FetchOutcome {
        let outcome = {
            let mut state = self.state.lock();
            match &*state {
                FetchState::InFlight { attempt, outcome } => {
                    debug!(attempt, "joining in-flight fetch");
                    outcome.clone()
                }
                FetchState::Idle => {
                    let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
                    let outcome = self.spawn_attempt(attempt);
                    *state = FetchState::InFlight {
                        attempt,
                        outcome: outcome.clone(),
                    };
                    outcome
                }
            }
        };
        outcome.await
    }

    fn spawn_attempt(self: &Arc<Self>, attempt: u64) -> SharedOutcome {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _guard = InFlightGuard {
                state: &this.state,
                attempt,
            };
            let result = this.run_attempt(attempt).await;
            match &result {
                Ok(record) => info!(attempt, captured_at = %record.captured_at, "fetch succeeded"),
                Err(e) => warn!(attempt, error = %e, "fetch failed"),
            }
            result
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(FetchError::Aborted(e.to_string())),
            }
        }
        .boxed()
        .shared()
    }

    async fn run_attempt(&self, attempt: u64) -> FetchOutcome {
        let (id, opened) = match self.driver.find_context(&self.target_url).await? {
            Some(id) => {
                // A page we opened and have not closed yet stays ours to close.
                let owned = self.closing.lock().remove(&id).is_some();
                debug!(attempt, id, owned, "reusing open usage page");
                sleep(self.timings.reuse_settle()).await;
                (id, owned)
            }
            None => {
                let id = self.driver.open_background(&self.target_url).await?;
                debug!(attempt, id, "opened usage page in background");
                if let Err(e) = self.settle_new_context(id).await {
                    self.close_now(id).await;
                    return Err(e);
                }
                (id, true)
            }
        };

        let stored = match self.extract_from(id).await {
            Ok(snapshot) => self
                .store
                .put(&snapshot, Utc::now())
                .map_err(|e| FetchError::Storage(e.to_string())),
            Err(e) => Err(e),
        };

        if opened {
            if stored.is_ok() {
                self.close_later(id, attempt);
            } else {
                self.close_now(id).await;
            }
        }
        stored
    }

    /// Load-complete plus settle delay, bounded by the load timeout. Running out
    /// of time is not a failure; extraction is attempted anyway.
    async fn settle_new_context(&self, id: ContextId) -> Result<(), FetchError> {
        let settle = async {
            self.driver.wait_until_loaded(id).await?;
            sleep(self.timings.settle()).await;
            Ok::<(), FetchError>(())
        };
        match timeout(self.timings.load_timeout(), settle).await {
            Ok(result) => result,
            Err(_) => {
                warn!(id, "usage page did not settle in time, continuing");
                Ok(())
            }
        }
    }

    async fn extract_from(&self, id: ContextId) -> Result<UsageSnapshot, FetchError> {
        let limit = self.timings.request_timeout();

        let alive = matches!(
            timeout(limit, self.driver.send(id, Request::Ping)).await,
            Ok(Ok(response)) if response.is_pong()
        );
        if !alive {
            debug!(id, "no agent answered, injecting");
            timeout(limit, self.driver.inject_agent(id))
                .await
                .map_err(|_| FetchError::Timeout("agent injection"))??;
        }

        let response = timeout(limit, self.driver.send(id, Request::GetUsageData))
            .await
            .map_err(|_| FetchError::Timeout("usage request"))??;
        response.into_usage().map_err(FetchError::Extraction)
    }

    async fn close_now(&self, id: ContextId) {
        if let Err(e) = self.driver.close(id).await {
            warn!(id, error = %e, "failed to close background page");
        }
    }

    /// Closes `id` after the close delay unless a later attempt reused it.
    fn close_later(&self, id: ContextId, attempt: u64) {
        self.closing.lock().insert(id, attempt);
        let driver = Arc::clone(&self.driver);
        let closing = Arc::clone(&self.closing);
        let delay = self.timings.close_delay();
        tokio::spawn(async move {
            sleep(delay).await;
            {
                let mut closing = closing.lock();
                if closing.get(&id) != Some(&attempt) {
                    debug!(id, attempt, "background page was reused, not closing");
                    return;
                }
                closing.remove(&id);
            }
            if let Err(e) = driver.close(id).await {
                warn!(id, error = %e, "failed to close background page");
            }
        });
    }

    /// Asks an already open usage page for its data without opening a new one.
    /// Pages waiting to be closed by this coordinator do not count.
    pub async fn extract_from_open_context(&self) -> Result<Option<UsageSnapshot>, FetchError> {
        match self.driver.find_context(&self.target_url).await? {
            Some(id) if !self.closing.lock().contains_key(&id) => {
                self.extract_from(id).await.map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Refreshes the cache from an open usage page, if one exists.
    pub async fn refresh_open_contexts(&self) -> Result<Option<CacheRecord>, FetchError> {
        let Some(snapshot) = self.extract_from_open_context().await? else {
            debug!("no usage page open, skipping periodic refresh");
            return Ok(None);
        };
        self.store
            .put(&snapshot, Utc::now())
            .map(Some)
            .map_err(|e| FetchError::Storage(e.to_string()))
    }

    /// One periodic refresh: from an open usage page when there is one,
    /// otherwise through a regular background fetch.
    pub async fn periodic_tick(self: &Arc<Self>) -> FetchOutcome {
        match self.refresh_open_contexts().await? {
            Some(record) => Ok(record),
            None => self.fetch_fresh().await,
        }
    }

    pub async fn run_periodic(self: &Arc<Self>, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match self.periodic_tick().await {
                Ok(record) => info!(captured_at = %record.captured_at, "periodic refresh stored usage"),
                Err(e) => warn!(error = %e, "periodic refresh failed"),
            }
        }
    }
}
