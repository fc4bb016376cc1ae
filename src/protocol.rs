//! JSON messages exchanged between the widget, the background coordinator and
//! page contexts.

use crate::error::FetchError;
use crate::extract::Extractor;
use crate::models::{CacheRecord, UsageSnapshot};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Request {
    Ping,
    GetUsageData,
    FetchUsageData,
    ShowWidget,
    HideWidget,
}

/// Flat response shape; absent fields are omitted on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pong: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<UsageSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn pong() -> Self {
        Self {
            pong: Some(true),
            ..Self::default()
        }
    }

    pub fn ack() -> Self {
        Self {
            success: Some(true),
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: Some(false),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn usage(data: UsageSnapshot) -> Self {
        Self {
            success: Some(true),
            data: Some(data),
            ..Self::default()
        }
    }

    pub fn fetched(result: Result<CacheRecord, FetchError>) -> Self {
        match result {
            Ok(record) => Self {
                success: Some(true),
                last_update: Some(record.captured_at_millis()),
                data: Some(record.snapshot),
                ..Self::default()
            },
            Err(e) => Self::failure(e.to_string()),
        }
    }

    pub fn is_pong(&self) -> bool {
        self.pong == Some(true)
    }

    pub fn into_usage(self) -> Result<UsageSnapshot, String> {
        match (self.success, self.data) {
            (Some(true), Some(data)) => Ok(data),
            _ => Err(self
                .error
                .unwrap_or_else(|| "malformed response from page".to_string())),
        }
    }
}

/// Answers requests inside a page context, over that page's visible text.
pub struct PageAgent<'a> {
    extractor: Extractor,
    text: &'a str,
}

impl<'a> PageAgent<'a> {
    pub fn new(extractor: Extractor, text: &'a str) -> Self {
        Self { extractor, text }
    }

    pub fn handle(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::pong(),
            Request::GetUsageData => match self.extractor.extract(self.text) {
                Ok(snapshot) => Response::usage(snapshot),
                Err(e) => {
                    tracing::warn!(error = %e, "extraction failed in page context");
                    Response::failure(e.to_string())
                }
            },
            other => Response::failure(format!("page context cannot handle {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requests_use_action_tag() {
        let req: Request = serde_json::from_value(json!({ "action": "getUsageData" })).expect("parse");
        assert_eq!(req, Request::GetUsageData);
        assert_eq!(
            serde_json::to_value(Request::HideWidget).expect("serialize"),
            json!({ "action": "hideWidget" })
        );
        assert!(serde_json::from_value::<Request>(json!({ "action": "nope" })).is_err());
    }

    #[test]
    fn responses_omit_absent_fields() {
        assert_eq!(serde_json::to_value(Response::pong()).expect("json"), json!({ "pong": true }));
        assert_eq!(serde_json::to_value(Response::ack()).expect("json"), json!({ "success": true }));
        assert_eq!(
            serde_json::to_value(Response::fetched(Err(FetchError::Timeout("usage request"))))
                .expect("json"),
            json!({ "success": false, "error": "usage request timed out" })
        );
    }

    #[test]
    fn page_agent_reports_extraction_errors_as_payloads() {
        let agent = PageAgent::new(Extractor::default(), "tiny");
        let response = agent.handle(Request::GetUsageData);
        assert_eq!(response.success, Some(false));
        assert!(response.into_usage().expect_err("failure").contains("too short"));
    }

    #[test]
    fn page_agent_extracts_usage() {
        let text = format!("All models 33% 使用済み 5分後にリセット{}", " ".repeat(100));
        let agent = PageAgent::new(Extractor::default(), &text);
        assert!(agent.handle(Request::Ping).is_pong());
        let data = agent.handle(Request::GetUsageData).into_usage().expect("data");
        assert_eq!(data.all_models.expect("all").reset_label, "5分後");
        assert_eq!(agent.handle(Request::ShowWidget).success, Some(false));
    }
}
