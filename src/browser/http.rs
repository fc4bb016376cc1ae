use super::{is_usage_page, ContextId, PageDriver};
use crate::error::{AppError, FetchError};
use crate::extract::Extractor;
use crate::protocol::{PageAgent, Request, Response};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use reqwest::header::{COOKIE, USER_AGENT};
use reqwest::Client;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

static HIDDEN_BLOCKS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(script|style|noscript|template)\b.*?</(script|style|noscript|template)\s*>")
        .expect("hidden block pattern")
});
static BLOCK_TAGS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<(br|/p|/div|/li|/h[1-6]|/tr|/section|/header|/footer)\b[^>]*>")
        .expect("block tag pattern")
});
static ANY_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("tag pattern"));
static BLANK_RUNS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n[ \t]*(\n[ \t]*)+").expect("blank run pattern"));

/// Approximates a page's visible text from its HTML.
pub fn html_to_text(html: &str) -> String {
    let text = HIDDEN_BLOCKS.replace_all(html, "");
    let text = BLOCK_TAGS.replace_all(&text, "\n");
    let text = ANY_TAG.replace_all(&text, "");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    BLANK_RUNS.replace_all(text.trim(), "\n").into_owned()
}

struct HttpContext {
    url: String,
    text: Option<String>,
    agent: bool,
}

/// Treats each fetched document as a page context. The session cookie is sent
/// with every load.
pub struct HttpPageDriver {
    client: Client,
    session_key: Option<String>,
    extractor: Extractor,
    contexts: Mutex<HashMap<ContextId, HttpContext>>,
    next_id: AtomicU64,
    target_url: String,
}

impl HttpPageDriver {
    pub fn new(
        target_url: &str,
        session_key: Option<String>,
        extractor: Extractor,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            session_key,
            extractor,
            contexts: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            target_url: target_url.to_string(),
        })
    }

    async fn load(&self, url: &str) -> Result<String, FetchError> {
        let mut request = self
            .client
            .get(url)
            .header(USER_AGENT, concat!("usage-overlay/", env!("CARGO_PKG_VERSION")));
        if let Some(key) = &self.session_key {
            request = request.header(COOKIE, format!("sessionKey={key}"));
        }

        let body = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| FetchError::Open(e.to_string()))?
            .text()
            .await
            .map_err(|e| FetchError::Open(e.to_string()))?;
        Ok(html_to_text(&body))
    }
}

#[async_trait]
impl PageDriver for HttpPageDriver {
    async fn find_context(&self, url: &str) -> Result<Option<ContextId>, FetchError> {
        let contexts = self.contexts.lock();
        Ok(contexts
            .iter()
            .filter(|(_, ctx)| ctx.text.is_some() && is_usage_page(&ctx.url, url))
            .map(|(id, _)| *id)
            .min())
    }

    async fn open_background(&self, url: &str) -> Result<ContextId, FetchError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.contexts.lock().insert(
            id,
            HttpContext {
                url: url.to_string(),
                text: None,
                agent: false,
            },
        );
        tracing::debug!(id, url, "opened background context");
        Ok(id)
    }

    async fn wait_until_loaded(&self, id: ContextId) -> Result<(), FetchError> {
        let url = self
            .contexts
            .lock()
            .get(&id)
            .map(|ctx| ctx.url.clone())
            .ok_or_else(|| FetchError::Communication(format!("context {id} is gone")))?;

        let text = self.load(&url).await?;
        let auto_agent = is_usage_page(&url, &self.target_url);
        tracing::debug!(id, chars = text.chars().count(), "context loaded");

        if let Some(ctx) = self.contexts.lock().get_mut(&id) {
            ctx.text = Some(text);
            ctx.agent = auto_agent;
        }
        Ok(())
    }

    async fn inject_agent(&self, id: ContextId) -> Result<(), FetchError> {
        let mut contexts = self.contexts.lock();
        let ctx = contexts
            .get_mut(&id)
            .ok_or_else(|| FetchError::Communication(format!("context {id} is gone")))?;
        if ctx.text.is_none() {
            return Err(FetchError::Communication(format!(
                "context {id} has not finished loading"
            )));
        }
        ctx.agent = true;
        Ok(())
    }

    async fn send(&self, id: ContextId, request: Request) -> Result<Response, FetchError> {
        let text = {
            let contexts = self.contexts.lock();
            match contexts.get(&id) {
                Some(HttpContext {
                    text: Some(text),
                    agent: true,
                    ..
                }) => text.clone(),
                Some(_) => {
                    return Err(FetchError::Communication(format!(
                        "no agent is listening in context {id}"
                    )))
                }
                None => return Err(FetchError::Communication(format!("context {id} is gone"))),
            }
        };
        Ok(PageAgent::new(self.extractor, &text).handle(request))
    }

    async fn close(&self, id: ContextId) -> Result<(), FetchError> {
        if self.contexts.lock().remove(&id).is_some() {
            tracing::debug!(id, "closed context");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::config::FetchTimings;
    use crate::fetch::FetchCoordinator;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::Arc;

    const USAGE_HTML: &str = "<html><body><h1>Plan usage limits</h1>\
        <div>Current session</div><div>45% 使用済み</div><p>2時間後にリセット</p>\
        <div>All models</div><div>10% 使用済み</div>\
        <p>Usage limits reset on a rolling basis. Learn more about plans and limits.</p>\
        </body></html>";

    /// Serves `USAGE_HTML` to every request on a local port.
    fn serve_usage_page() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                let reply = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                    USAGE_HTML.len(),
                    USAGE_HTML
                );
                let _ = stream.write_all(reply.as_bytes());
            }
        });
        format!("http://{addr}/settings/usage")
    }

    fn http_coordinator(target: &str) -> Arc<FetchCoordinator<HttpPageDriver>> {
        let driver = HttpPageDriver::new(target, Some("test".into()), Extractor::default()).expect("driver");
        let timings = FetchTimings {
            settle_ms: 10,
            reuse_settle_ms: 200,
            close_delay_ms: 50,
            ..FetchTimings::default()
        };
        Arc::new(FetchCoordinator::new(
            Arc::new(driver),
            Arc::new(CacheStore::open_in_memory().expect("store")),
            target,
            timings,
        ))
    }

    #[tokio::test]
    async fn back_to_back_fetches_over_http() {
        let target = serve_usage_page();
        let coord = http_coordinator(&target);

        let first = coord.fetch_fresh().await.expect("first fetch");
        let second = coord.fetch_fresh().await.expect("second fetch");

        let current = second.snapshot.current_session.expect("current session");
        assert_eq!(current.percentage, 45);
        assert_eq!(current.reset_label, "2時間後");
        assert!(second.captured_at >= first.captured_at);
    }

    #[tokio::test]
    async fn periodic_tick_over_http_updates_cache() {
        let target = serve_usage_page();
        let coord = http_coordinator(&target);
        assert!(coord.store().get().expect("get").is_none());

        let record = coord.periodic_tick().await.expect("tick");
        assert_eq!(record.snapshot.all_models.as_ref().expect("all").percentage, 10);
        assert_eq!(coord.store().get().expect("get"), Some(record));
    }

    #[test]
    fn html_to_text_keeps_inline_percentages_together() {
        let html = r#"<html><head><style>.a{}</style><script>var x = "50%";</script></head>
            <body><div>Current session</div><div><span>45</span>% 使用済み</div>
            <p>2時間後にリセット</p><p>Tom &amp; Jerry&nbsp;ok</p></body></html>"#;
        let text = html_to_text(html);
        assert!(text.contains("Current session\n45% 使用済み"));
        assert!(text.contains("2時間後にリセット"));
        assert!(text.contains("Tom & Jerry ok"));
        assert!(!text.contains("var x"));
        assert!(!text.contains("\n\n"));
    }

    #[tokio::test]
    async fn unloaded_context_cannot_be_reached() {
        let driver = HttpPageDriver::new("https://claude.ai/settings/usage", None, Extractor::default())
            .expect("driver");
        let id = driver
            .open_background("https://claude.ai/settings/usage")
            .await
            .expect("open");

        assert_eq!(driver.find_context("https://claude.ai/settings/usage").await.expect("find"), None);
        assert!(driver.send(id, Request::Ping).await.is_err());
        assert!(driver.inject_agent(id).await.is_err());

        driver.close(id).await.expect("close");
        driver.close(id).await.expect("close twice");
        assert!(matches!(
            driver.send(id, Request::Ping).await,
            Err(FetchError::Communication(_))
        ));
    }
}
