//! Model dispatch: credential check against the model table and a single
//! upstream inference call

use crate::config::{InferenceConfig, ModelConfig, ModelKind};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Request body for `POST /api/run_model`
#[derive(Debug, Clone, Deserialize)]
pub struct RunModelRequest {
    pub model: String,
    pub input: String,
    pub api_key: String,
}

/// Response body for `POST /api/run_model`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunModelResponse {
    pub output: Value,
}

/// One row of `GET /api/list_models`
#[derive(Debug, Clone, Serialize)]
pub struct ModelListing {
    pub model: String,
    #[serde(rename = "type")]
    pub kind: ModelKind,
}

pub struct ModelDispatcher {
    models: HashMap<String, ModelConfig>,
    token: String,
    chat_url: String,
    inference_base_url: String,
    http_client: reqwest::Client,
}

impl ModelDispatcher {
    pub fn new(
        models: HashMap<String, ModelConfig>,
        inference: &InferenceConfig,
        token: String,
    ) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(inference.request_timeout())
            .build()?;

        Ok(Self {
            models,
            token,
            chat_url: inference.chat_url.clone(),
            inference_base_url: inference.inference_base_url.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    /// Models in the table, sorted by id
    pub fn list_models(&self) -> Vec<ModelListing> {
        let mut listing: Vec<ModelListing> = self
            .models
            .iter()
            .map(|(model, entry)| ModelListing {
                model: model.clone(),
                kind: entry.kind,
            })
            .collect();
        listing.sort_by(|a, b| a.model.cmp(&b.model));
        listing
    }

    /// Check the caller's credential for a model
    pub fn authorize(&self, model: &str, api_key: &str) -> Result<&ModelConfig> {
        let entry = self
            .models
            .get(model)
            .ok_or_else(|| Error::UnknownModel(model.to_string()))?;
        if entry.api_key != api_key {
            warn!(model, "Rejected model request with invalid API key");
            return Err(Error::InvalidCredential);
        }
        Ok(entry)
    }

    /// Validate, call the provider once, and normalize the result
    pub async fn run(&self, req: &RunModelRequest) -> Result<RunModelResponse> {
        let entry = self.authorize(&req.model, &req.api_key)?;
        let (endpoint, payload) = self.build_request(&req.model, entry.kind, &req.input);

        debug!(model = %req.model, kind = ?entry.kind, endpoint = %endpoint, "Dispatching model request");

        let response = self
            .http_client
            .post(&endpoint)
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::UpstreamFailure(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::UpstreamFailure(e.to_string()))?;

        let result: Value = response
            .json()
            .await
            .map_err(|e| Error::UpstreamFailure(e.to_string()))?;

        let output = extract_output(entry.kind, result)?;
        Ok(RunModelResponse { output })
    }

    fn build_request(&self, model: &str, kind: ModelKind, input: &str) -> (String, Value) {
        match kind {
            ModelKind::Chat => (
                self.chat_url.clone(),
                json!({
                    "model": model,
                    "messages": [{"role": "user", "content": input}],
                    "stream": false
                }),
            ),
            ModelKind::Text => (
                format!("{}/{}", self.inference_base_url, model),
                json!({ "inputs": input }),
            ),
        }
    }
}

/// Chat models yield the first choice's message content; text models the raw JSON
fn extract_output(kind: ModelKind, result: Value) -> Result<Value> {
    match kind {
        ModelKind::Chat => result
            .pointer("/choices/0/message/content")
            .cloned()
            .ok_or_else(|| {
                Error::UpstreamFailure("response has no choices[0].message.content".to_string())
            }),
        ModelKind::Text => Ok(result),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn models() -> HashMap<String, ModelConfig> {
        let mut models = HashMap::new();
        models.insert(
            "meta-llama/Llama-3.1-8B-Instruct".to_string(),
            ModelConfig {
                api_key: "llama-key".to_string(),
                kind: ModelKind::Chat,
            },
        );
        models.insert(
            "arena".to_string(),
            ModelConfig {
                api_key: "arena-key".to_string(),
                kind: ModelKind::Text,
            },
        );
        models
    }

    fn dispatcher(base: &str) -> ModelDispatcher {
        let inference = InferenceConfig {
            chat_url: format!("{}/v1/chat/completions", base),
            inference_base_url: format!("{}/models/", base),
            ..InferenceConfig::default()
        };
        ModelDispatcher::new(models(), &inference, "test-token".to_string()).unwrap()
    }

    /// Serve one canned HTTP response and hand back the raw request
    async fn one_shot_upstream(status: u16, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = stream.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    let head = String::from_utf8_lossy(&buf[..pos]).to_lowercase();
                    let length = head
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if buf.len() >= pos + 4 + length || n == 0 {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&buf).to_string()
        });
        (base, handle)
    }

    #[test]
    fn test_list_models_sorted_without_keys() {
        let dispatcher = dispatcher("http://127.0.0.1:1");
        let listing = dispatcher.list_models();

        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].model, "arena");
        assert_eq!(listing[1].model, "meta-llama/Llama-3.1-8B-Instruct");

        let json = serde_json::to_value(&listing).unwrap();
        assert_eq!(json[0]["type"], "text");
        assert!(json[0].get("api_key").is_none());
    }

    #[test]
    fn test_authorize() {
        let dispatcher = dispatcher("http://127.0.0.1:1");

        assert!(dispatcher.authorize("arena", "arena-key").is_ok());
        assert!(matches!(
            dispatcher.authorize("arena", "wrong"),
            Err(Error::InvalidCredential)
        ));
        assert!(matches!(
            dispatcher.authorize("nope", "arena-key"),
            Err(Error::UnknownModel(_))
        ));
    }

    #[test]
    fn test_build_request_shapes() {
        let dispatcher = dispatcher("http://upstream");

        let (url, payload) = dispatcher.build_request("m", ModelKind::Chat, "hi");
        assert_eq!(url, "http://upstream/v1/chat/completions");
        assert_eq!(payload["model"], "m");
        assert_eq!(payload["messages"][0]["role"], "user");
        assert_eq!(payload["messages"][0]["content"], "hi");
        assert_eq!(payload["stream"], false);

        let (url, payload) = dispatcher.build_request("arena", ModelKind::Text, "hi");
        assert_eq!(url, "http://upstream/models/arena");
        assert_eq!(payload, json!({ "inputs": "hi" }));
    }

    #[test]
    fn test_extract_output() {
        let chat = json!({"choices": [{"message": {"content": "hello"}}]});
        assert_eq!(extract_output(ModelKind::Chat, chat).unwrap(), json!("hello"));

        let malformed = json!({"choices": []});
        assert!(matches!(
            extract_output(ModelKind::Chat, malformed),
            Err(Error::UpstreamFailure(_))
        ));

        let text = json!([{"generated_text": "x"}]);
        assert_eq!(extract_output(ModelKind::Text, text.clone()).unwrap(), text);
    }

    #[tokio::test]
    async fn test_run_chat_model() {
        let (base, upstream) =
            one_shot_upstream(200, r#"{"choices":[{"message":{"content":"pong"}}]}"#).await;
        let dispatcher = dispatcher(&base);

        let response = dispatcher
            .run(&RunModelRequest {
                model: "meta-llama/Llama-3.1-8B-Instruct".to_string(),
                input: "ping".to_string(),
                api_key: "llama-key".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(response.output, json!("pong"));

        let raw = upstream.await.unwrap();
        assert!(raw.starts_with("POST /v1/chat/completions "));
        assert!(raw.to_lowercase().contains("authorization: bearer test-token"));
        assert!(raw.contains("\"content\":\"ping\""));
    }

    #[tokio::test]
    async fn test_run_upstream_error_status() {
        let (base, upstream) = one_shot_upstream(503, r#"{"error":"loading"}"#).await;
        let dispatcher = dispatcher(&base);

        let err = dispatcher
            .run(&RunModelRequest {
                model: "arena".to_string(),
                input: "x".to_string(),
                api_key: "arena-key".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UpstreamFailure(_)));
        assert!(err.to_string().starts_with("Inference failed:"));

        let raw = upstream.await.unwrap();
        assert!(raw.starts_with("POST /models/arena "));
    }

    #[tokio::test]
    async fn test_run_rejects_before_upstream_call() {
        let dispatcher = dispatcher("http://127.0.0.1:1");
        let err = dispatcher
            .run(&RunModelRequest {
                model: "arena".to_string(),
                input: "x".to_string(),
                api_key: "bad".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCredential));
    }
}
