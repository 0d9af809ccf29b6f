//! Submission endpoint: accepts program source, launches it, and tears it down

use crate::error::{Error, Result};
use crate::registry::{AppRegistry, AppState};
use crate::supervisor::Supervisor;
use hyper::body::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Form/JSON field names accepted for the program source
const SOURCE_FIELDS: &[&str] = &["code", "source"];

/// Response body for `POST /apps`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionResponse {
    pub id: String,
    pub url: String,
}

/// Response body for `DELETE /apps/{id}`
#[derive(Debug, Clone, Serialize)]
pub struct TeardownResponse {
    pub id: String,
    pub state: AppState,
}

pub struct SubmissionEndpoint {
    registry: Arc<AppRegistry>,
    supervisor: Arc<Supervisor>,
    public_url: Option<String>,
}

impl SubmissionEndpoint {
    pub fn new(
        registry: Arc<AppRegistry>,
        supervisor: Arc<Supervisor>,
        public_url: Option<String>,
    ) -> Self {
        Self {
            registry,
            supervisor,
            public_url: public_url.map(|u| u.trim_end_matches('/').to_string()),
        }
    }

    /// Launch `source` as a new application and register it.
    ///
    /// `request_base` (e.g. `http://host:port`) is used for the returned URL
    /// unless a public URL is configured.
    pub async fn submit(&self, source: &str, request_base: &str) -> Result<SubmissionResponse> {
        if source.trim().is_empty() {
            return Err(Error::InvalidSubmission("submitted source is empty".to_string()));
        }

        let id = self.registry.reserve_id();
        let record = self.supervisor.start(&id, source).await?;
        let port = record.port();
        self.registry.put(record);

        let base = self.public_url.as_deref().unwrap_or(request_base);
        let url = app_url(base, &id);
        info!(app_id = %id, port, url = %url, bytes = source.len(), "Application submitted");

        Ok(SubmissionResponse { id, url })
    }

    /// Explicit teardown: stop the backend and drop the record
    pub async fn teardown(&self, id: &str) -> Result<TeardownResponse> {
        let record = self.registry.remove(id)?;
        self.supervisor.stop(&record).await;
        info!(app_id = id, state = ?record.state(), "Application torn down");
        Ok(TeardownResponse {
            id: id.to_string(),
            state: record.state(),
        })
    }
}

/// Public URL of an application's proxy route
pub fn app_url(base: &str, id: &str) -> String {
    format!("{}/apps/{}/", base.trim_end_matches('/'), id)
}

/// Pull the program source out of a submission body.
///
/// JSON bodies and urlencoded forms carry it in a `code` (or `source`)
/// field; anything else is taken as the source text itself.
pub fn extract_source(content_type: Option<&str>, body: Bytes) -> Result<String> {
    let mime = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|m| m.trim().to_ascii_lowercase())
        .unwrap_or_default();

    match mime.as_str() {
        "application/json" => {
            let value: serde_json::Value = serde_json::from_slice(&body)
                .map_err(|e| Error::InvalidSubmission(format!("invalid JSON body: {}", e)))?;
            SOURCE_FIELDS
                .iter()
                .find_map(|field| value.get(*field).and_then(|v| v.as_str()))
                .map(str::to_string)
                .ok_or_else(|| {
                    Error::InvalidSubmission("JSON body needs a string 'code' field".to_string())
                })
        }
        "application/x-www-form-urlencoded" => {
            let text = std::str::from_utf8(&body)
                .map_err(|_| Error::InvalidSubmission("form body is not UTF-8".to_string()))?;
            form_field(text, SOURCE_FIELDS)?.ok_or_else(|| {
                Error::InvalidSubmission("form body needs a 'code' field".to_string())
            })
        }
        _ => String::from_utf8(body.to_vec())
            .map_err(|_| Error::InvalidSubmission("source is not UTF-8".to_string())),
    }
}

fn form_field(body: &str, names: &[&str]) -> Result<Option<String>> {
    for pair in body.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = decode_form_component(key)?;
        if names.contains(&key.as_str()) {
            return decode_form_component(value).map(Some);
        }
    }
    Ok(None)
}

fn decode_form_component(raw: &str) -> Result<String> {
    urlencoding::decode(&raw.replace('+', " "))
        .map(|s| s.into_owned())
        .map_err(|_| Error::InvalidSubmission("form field is not valid UTF-8".to_string()))
}
