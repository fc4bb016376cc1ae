use crate::browser::http::HttpPageDriver;
use crate::browser::PageDriver;
use crate::cache::CacheStore;
use crate::config::{get_session_key, AppConfig};
use crate::error::AppError;
use crate::extract::Extractor;
use crate::fetch::FetchCoordinator;
use crate::protocol::{Request, Response};
use std::path::Path;
use std::sync::Arc;

/// Background side of the app: owns the coordinator and answers protocol
/// messages addressed to it.
pub struct OverlayService<D: PageDriver> {
    coordinator: Arc<FetchCoordinator<D>>,
}

impl OverlayService<HttpPageDriver> {
    pub fn open(cfg: &AppConfig, db: &Path) -> Result<Self, AppError> {
        let session_key = match get_session_key() {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!(error = %e, "continuing without a session key");
                None
            }
        };
        let extractor = Extractor::with_limits(cfg.min_text_len, cfg.reset_window_chars);
        let driver = HttpPageDriver::new(&cfg.target_url, session_key, extractor)?;
        let store = CacheStore::open(db)?;
        Ok(Self::new(driver, store, cfg))
    }
}

impl<D: PageDriver> OverlayService<D> {
    pub fn new(driver: D, store: CacheStore, cfg: &AppConfig) -> Self {
        let coordinator = FetchCoordinator::new(
            Arc::new(driver),
            Arc::new(store),
            cfg.target_url.clone(),
            cfg.fetch.clone(),
        );
        Self {
            coordinator: Arc::new(coordinator),
        }
    }

    pub fn coordinator(&self) -> &Arc<FetchCoordinator<D>> {
        &self.coordinator
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        self.coordinator.store()
    }

    pub async fn handle_message(&self, request: Request) -> Response {
        tracing::debug!(?request, "handling message");
        match request {
            Request::Ping => Response::pong(),
            Request::FetchUsageData => Response::fetched(self.coordinator.fetch_fresh().await),
            Request::GetUsageData => match self.coordinator.extract_from_open_context().await {
                Ok(Some(snapshot)) => Response::usage(snapshot),
                Ok(None) => match self.coordinator.fetch_fresh().await {
                    Ok(record) => Response::usage(record.snapshot),
                    Err(e) => Response::failure(e.to_string()),
                },
                Err(e) => Response::failure(e.to_string()),
            },
            Request::ShowWidget | Request::HideWidget => {
                let visible = request == Request::ShowWidget;
                match self.store().set_widget_visible(visible) {
                    Ok(()) => Response::ack(),
                    Err(e) => Response::failure(e.to_string()),
                }
            }
        }
    }

    /// Flips widget visibility, treating an unset value as visible.
    pub fn toggle_widget(&self) -> Result<bool, AppError> {
        let visible = !self.store().widget_state()?.visible;
        self.store().set_widget_visible(visible)?;
        Ok(visible)
    }
}
