use crate::error::FetchError;
use crate::protocol::{Request, Response};
use async_trait::async_trait;
use url::Url;

pub mod http;

pub type ContextId = u64;

/// A browser-like host of page contexts the coordinator can drive.
#[async_trait]
pub trait PageDriver: Send + Sync + 'static {
    /// An open context already showing `url`, if any.
    async fn find_context(&self, url: &str) -> Result<Option<ContextId>, FetchError>;

    /// Opens `url` without focusing it.
    async fn open_background(&self, url: &str) -> Result<ContextId, FetchError>;

    /// Resolves once the context reports its load as complete.
    async fn wait_until_loaded(&self, id: ContextId) -> Result<(), FetchError>;

    async fn inject_agent(&self, id: ContextId) -> Result<(), FetchError>;

    async fn send(&self, id: ContextId, request: Request) -> Result<Response, FetchError>;

    async fn close(&self, id: ContextId) -> Result<(), FetchError>;
}

/// Whether `url` points at the usage page described by `target`.
pub fn is_usage_page(url: &str, target: &str) -> bool {
    match (Url::parse(url), Url::parse(target)) {
        (Ok(url), Ok(target)) => {
            url.host_str() == target.host_str()
                && url.path().trim_end_matches('/') == target.path().trim_end_matches('/')
        }
        _ => {
            let needle = target
                .trim_start_matches("https://")
                .trim_start_matches("http://");
            url.contains(needle)
        }
    }
}
