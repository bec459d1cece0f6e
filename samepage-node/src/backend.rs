//! HTTP backend: every call is a JSON POST of `{method, ...}` to the API url.

use std::time::Duration;

use samepage_core::boundary::UnmarkedMessage;
use samepage_core::{
    Backend, BackendError, LogicalMessage, Notebook, NotebookId, QuotaResource, QuotaStatus,
    Target,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpBackend {
    client: reqwest::blocking::Client,
    api_url: String,
    notebook: NotebookId,
    token: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnqueueResponse {
    message_uuid: Uuid,
}

#[derive(Deserialize)]
struct UnmarkedResponse {
    messages: Vec<UnmarkedMessage>,
}

/// A stored message: `data` is the payload as JSON text.
#[derive(Deserialize)]
struct LoadedMessage {
    data: String,
    source: Notebook,
    operation: String,
}

#[derive(Deserialize)]
struct QuotaResponse {
    status: QuotaStatus,
}

impl HttpBackend {
    pub fn new(api_url: &str, notebook: NotebookId, token: &str) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            notebook,
            token: token.to_string(),
        })
    }

    fn call<T: DeserializeOwned>(&self, method: &str, mut body: Value) -> Result<T, BackendError> {
        if let Value::Object(map) = &mut body {
            map.insert("method".into(), json!(method));
            map.insert("notebookUuid".into(), json!(self.notebook));
            map.insert("token".into(), json!(self.token));
        }
        tracing::debug!(%method, "backend request");
        let response = self
            .client
            .post(&self.api_url)
            .json(&body)
            .send()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(if status.is_server_error() {
                BackendError::Unavailable(format!("{}: {}", status, text))
            } else {
                BackendError::Rejected(format!("{}: {}", status, text))
            });
        }
        response
            .json::<T>()
            .map_err(|e| BackendError::Rejected(format!("{} response: {}", method, e)))
    }
}

impl Backend for HttpBackend {
    fn issue_or_validate_token(&mut self, notebook: NotebookId, token: &str) -> Result<String, BackendError> {
        let method = if token.is_empty() { "issue-token" } else { "validate-token" };
        let r: TokenResponse = self.call(method, json!({ "notebookUuid": notebook, "token": token }))?;
        self.token = r.token.clone();
        Ok(r.token)
    }

    fn enqueue_message(
        &mut self,
        source: &Notebook,
        target: NotebookId,
        operation: &str,
        payload: &Value,
    ) -> Result<Uuid, BackendError> {
        let r: EnqueueResponse = self.call(
            "enqueue-message",
            json!({
                "source": source,
                "target": target,
                "operation": operation,
                "data": payload.to_string(),
            }),
        )?;
        Ok(r.message_uuid)
    }

    fn fetch_unmarked_messages(&mut self, _: NotebookId) -> Result<Vec<UnmarkedMessage>, BackendError> {
        let r: UnmarkedResponse = self.call("get-unmarked-messages", json!({}))?;
        Ok(r.messages)
    }

    fn load_message(&mut self, message: Uuid) -> Result<LogicalMessage, BackendError> {
        let r: LoadedMessage = self.call("load-message", json!({ "messageUuid": message }))?;
        to_logical(message, r, self.notebook)
    }

    fn mark_message_read(&mut self, message: Uuid) -> Result<(), BackendError> {
        let _: Value = self.call("mark-message-read", json!({ "messageUuid": message }))?;
        Ok(())
    }

    fn enforce_quota(&mut self, _: NotebookId, resource: QuotaResource) -> Result<QuotaStatus, BackendError> {
        let r: QuotaResponse = self.call("enforce-quota", json!({ "resource": resource }))?;
        Ok(r.status)
    }
}

fn to_logical(id: Uuid, loaded: LoadedMessage, me: NotebookId) -> Result<LogicalMessage, BackendError> {
    let payload: Value = serde_json::from_str(&loaded.data)
        .map_err(|e| BackendError::Rejected(format!("message {} data: {}", id, e)))?;
    let mut message = LogicalMessage::new(&loaded.operation, payload, Target::Notebook(me))
        .from_notebook(loaded.source);
    message.id = id;
    Ok(message)
}
