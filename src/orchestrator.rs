//! Decides, per page, whether to scrape live, show the cache, or ask the
//! coordinator for fresh data.

use crate::browser::{is_usage_page, PageDriver};
use crate::cache::CacheView;
use crate::config::AppConfig;
use crate::error::{AppError, ExtractError, FetchError};
use crate::extract::Extractor;
use crate::fetch::{FetchCoordinator, FetchOutcome};
use crate::models::CacheRecord;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageContext {
    pub url: String,
    /// Visible text, when the page is available to read.
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageEvent {
    Loaded(PageContext),
    Navigated(PageContext),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WidgetView {
    Live(CacheRecord),
    Cached { record: CacheRecord, stale: bool },
    NoData,
    NotFound(String),
    Error(String),
}

#[derive(Debug, Clone, Copy)]
struct AutoRefresh {
    every: Duration,
    next_due: Instant,
}

pub struct PageOrchestrator<D: PageDriver> {
    coordinator: Arc<FetchCoordinator<D>>,
    extractor: Extractor,
    target_url: String,
    freshness: chrono::Duration,
    refresh_every: Duration,
    auto_fetch_on_first_run: bool,
    auto_refresh: Option<AutoRefresh>,
    pending_fetch: Option<JoinHandle<FetchOutcome>>,
}

impl<D: PageDriver> PageOrchestrator<D> {
    pub fn new(coordinator: Arc<FetchCoordinator<D>>, cfg: &AppConfig) -> Self {
        Self {
            coordinator,
            extractor: Extractor::with_limits(cfg.min_text_len, cfg.reset_window_chars),
            target_url: cfg.target_url.clone(),
            freshness: cfg.freshness(),
            refresh_every: cfg.widget_refresh(),
            auto_fetch_on_first_run: cfg.auto_fetch_on_first_run,
            auto_refresh: None,
            pending_fetch: None,
        }
    }

    pub fn auto_refresh_active(&self) -> bool {
        self.auto_refresh.is_some()
    }

    pub async fn handle(&mut self, event: PageEvent, now: Instant) -> Result<WidgetView, AppError> {
        let (ctx, navigated) = match event {
            PageEvent::Loaded(ctx) => (ctx, false),
            PageEvent::Navigated(ctx) => (ctx, true),
        };

        if is_usage_page(&ctx.url, &self.target_url) {
            debug!(url = %ctx.url, "on usage page, extracting live");
            self.auto_refresh = Some(AutoRefresh {
                every: self.refresh_every,
                next_due: now + self.refresh_every,
            });
            return self.refresh_live(ctx.text.as_deref());
        }

        if navigated && self.auto_refresh.take().is_some() {
            debug!(url = %ctx.url, "left usage page, auto-refresh stopped");
        }
        self.show_cached().await
    }

    /// True once per elapsed auto-refresh interval while on the usage page.
    pub fn refresh_due(&mut self, now: Instant) -> bool {
        match &mut self.auto_refresh {
            Some(timer) if now >= timer.next_due => {
                timer.next_due = now + timer.every;
                true
            }
            _ => false,
        }
    }

    pub fn refresh_live(&self, text: Option<&str>) -> Result<WidgetView, AppError> {
        let Some(text) = text else {
            return Ok(WidgetView::Error("usage page text is not available".into()));
        };
        match self.extractor.extract(text) {
            Ok(snapshot) => {
                let record = self.coordinator.store().put(&snapshot, Utc::now())?;
                Ok(WidgetView::Live(record))
            }
            Err(e @ ExtractError::NotFound) => Ok(WidgetView::NotFound(e.to_string())),
            Err(e) => Ok(WidgetView::Error(e.to_string())),
        }
    }

    async fn show_cached(&mut self) -> Result<WidgetView, AppError> {
        let store = self.coordinator.store();
        let view = store.view(Utc::now(), self.freshness)?;

        if view == CacheView::Empty
            && self.auto_fetch_on_first_run
            && !store.widget_state()?.has_shown_initial_fetch
        {
            info!("first run, fetching usage data");
            store.mark_initial_fetch_shown()?;
            return Ok(match self.coordinator.fetch_fresh().await {
                Ok(record) => WidgetView::Cached {
                    record,
                    stale: false,
                },
                Err(e) => WidgetView::Error(format!("{e}; press r to retry")),
            });
        }

        Ok(match view {
            CacheView::Fresh(record) => WidgetView::Cached {
                record,
                stale: false,
            },
            CacheView::Stale(record) => {
                self.start_background_fetch();
                WidgetView::Cached {
                    record,
                    stale: true,
                }
            }
            CacheView::Empty => {
                self.start_background_fetch();
                WidgetView::NoData
            }
        })
    }

    /// Kicks off a fetch whose result lands in the cache; callers poll
    /// [`Self::take_finished_fetch`].
    pub fn start_background_fetch(&mut self) {
        if self.pending_fetch.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let coordinator = Arc::clone(&self.coordinator);
        self.pending_fetch = Some(tokio::spawn(async move { coordinator.fetch_fresh().await }));
    }

    pub async fn take_finished_fetch(&mut self) -> Option<FetchOutcome> {
        if !self.pending_fetch.as_ref()?.is_finished() {
            return None;
        }
        let handle = self.pending_fetch.take()?;
        Some(
            handle
                .await
                .unwrap_or_else(|e| Err(FetchError::Aborted(e.to_string()))),
        )
    }

    #[cfg(test)]
    pub async fn wait_pending_fetch(&mut self) -> Option<FetchOutcome> {
        let handle = self.pending_fetch.take()?;
        Some(
            handle
                .await
                .unwrap_or_else(|e| Err(FetchError::Aborted(e.to_string()))),
        )
    }
}
