use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::debug;

use crate::config::SyncConfig;
use crate::diagnostics::DiagnosticSink;
use crate::error::{SyncError, SyncResult};
use crate::types::*;

/// Read side of the backend used for reconciliation. Split out so views and
/// the store can be driven by an in-process source in tests.
#[async_trait]
pub trait CanonicalSource: Send + Sync {
    /// Full retained event history, unfiltered.
    async fn list_events(&self) -> SyncResult<Vec<Event>>;
    async fn list_agents(&self) -> SyncResult<Vec<Agent>>;
    async fn list_relations(&self) -> SyncResult<Vec<Relation>>;

    async fn list_conversations(&self) -> SyncResult<Vec<Conversation>> {
        Ok(Vec::new())
    }
}

/// HTTP collaborator client for the simulation backend.
///
/// Every failed request is reported to the diagnostic sink with the request
/// path as its source. A 401 surfaces as [`SyncError::Unauthorized`] and is
/// never retried here.
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl ApiClient {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            diagnostics,
        }
    }

    pub fn from_config(config: &SyncConfig, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        Self::new(config.api_url.clone(), config.token.clone(), diagnostics)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn request<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> SyncResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let text = self.send(method, path, body).await?;
        let text = if text.trim().is_empty() { "null" } else { text.as_str() };
        serde_json::from_str(text).map_err(|e| {
            let err = SyncError::Parse(format!("{path}: {e}"));
            self.diagnostics.report(path, &err.to_string(), None);
            err
        })
    }

    async fn send<B>(&self, method: Method, path: &str, body: Option<&B>) -> SyncResult<String>
    where
        B: Serialize + ?Sized,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!(method = %method, url = %url, "Backend request");

        let mut builder = self.client.request(method, &url);
        if let Some(ref token) = self.token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let resp = match builder.send().await {
            Ok(resp) => resp,
            Err(e) => {
                let message = e.to_string();
                self.diagnostics.report(path, &message, None);
                return Err(SyncError::fetch(path, message));
            }
        };

        let status = resp.status();
        let body = match resp.text().await {
            Ok(body) => body,
            Err(e) => {
                let message = e.to_string();
                self.diagnostics.report(
                    path,
                    &message,
                    Some(serde_json::json!({ "status": status.as_u16() })),
                );
                return Err(SyncError::Fetch {
                    path: path.to_string(),
                    status: Some(status.as_u16()),
                    message,
                });
            }
        };
        if status.is_success() {
            return Ok(body);
        }

        let detail = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(String::from));
        let message = detail
            .or_else(|| status.canonical_reason().map(String::from))
            .unwrap_or_else(|| "Request failed".into());
        self.diagnostics.report(
            path,
            &message,
            Some(serde_json::json!({ "status": status.as_u16(), "body": body })),
        );

        if status == StatusCode::UNAUTHORIZED {
            return Err(SyncError::Unauthorized { path: path.into() });
        }
        Err(SyncError::Fetch {
            path: path.into(),
            status: Some(status.as_u16()),
            message,
        })
    }

    pub async fn get_agent(&self, id: &str) -> SyncResult<Agent> {
        self.request::<(), _>(Method::GET, &format!("/api/agents/{}", id), None)
            .await
    }

    pub async fn create_agent(&self, req: &CreateAgentRequest) -> SyncResult<Agent> {
        self.request(Method::POST, "/api/agents", Some(req)).await
    }

    pub async fn delete_agent(&self, id: &str) -> SyncResult<()> {
        self.send::<()>(Method::DELETE, &format!("/api/agents/{}", id), None)
            .await
            .map(|_| ())
    }

    /// Post a message to one agent; returns the resulting event.
    pub async fn post_agent_message(&self, id: &str, payload: &MessagePayload) -> SyncResult<Event> {
        self.request(Method::POST, &format!("/api/agents/{}/message", id), Some(payload))
            .await
    }

    /// Post a message into a conversation; returns the events it produced.
    pub async fn post_conversation_message(
        &self,
        conversation_id: &str,
        payload: &MessagePayload,
    ) -> SyncResult<Vec<Event>> {
        self.request(
            Method::POST,
            &format!("/api/group-chats/{}/message", conversation_id),
            Some(payload),
        )
        .await
    }

    pub async fn list_conversations(&self) -> SyncResult<Vec<Conversation>> {
        self.request::<(), _>(Method::GET, "/api/group-chats", None).await
    }

    pub async fn control_simulation(&self, req: &ControlRequest) -> SyncResult<SimulationStatus> {
        self.request(Method::POST, "/api/simulation/control", Some(req))
            .await
    }
}

#[async_trait]
impl CanonicalSource for ApiClient {
    async fn list_events(&self) -> SyncResult<Vec<Event>> {
        let events: Option<Vec<Event>> =
            self.request::<(), _>(Method::GET, "/api/events", None).await?;
        Ok(events.unwrap_or_default())
    }

    async fn list_agents(&self) -> SyncResult<Vec<Agent>> {
        let agents: Option<Vec<Agent>> =
            self.request::<(), _>(Method::GET, "/api/agents", None).await?;
        Ok(agents.unwrap_or_default())
    }

    async fn list_relations(&self) -> SyncResult<Vec<Relation>> {
        let relations: Option<Vec<Relation>> =
            self.request::<(), _>(Method::GET, "/api/relations", None).await?;
        Ok(relations.unwrap_or_default())
    }

    async fn list_conversations(&self) -> SyncResult<Vec<Conversation>> {
        ApiClient::list_conversations(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticLog;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and hand back the raw request.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            request
        });
        (format!("http://{}", addr), handle)
    }

    #[tokio::test]
    async fn test_list_events_sends_bearer() {
        let (url, server) = serve_once(
            "200 OK",
            r#"[{"id":"e1","description":"hello","timestamp":"2025-01-01T00:00:00"}]"#,
        )
        .await;
        let diagnostics = Arc::new(DiagnosticLog::default());
        let client = ApiClient::new(url, Some("tok-123".into()), diagnostics.clone());

        let events = client.list_events().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].description, "hello");

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /api/events"));
        assert!(request.to_lowercase().contains("authorization: bearer tok-123"));
        assert!(diagnostics.is_empty());
    }

    #[tokio::test]
    async fn test_unauthorized_is_reported_not_retried() {
        let (url, server) = serve_once("401 Unauthorized", r#"{"detail":"Could not validate credentials"}"#).await;
        let diagnostics = Arc::new(DiagnosticLog::default());
        let client = ApiClient::new(url, None, diagnostics.clone());

        let err = client.list_agents().await.unwrap_err();
        assert!(matches!(err, SyncError::Unauthorized { .. }));
        server.await.unwrap();

        let entries = diagnostics.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].source, "/api/agents");
        assert_eq!(entries[0].message, "Could not validate credentials");
        assert_eq!(entries[0].context.as_ref().unwrap()["status"], 401);
    }

    #[tokio::test]
    async fn test_server_error_becomes_fetch_error() {
        let (url, server) = serve_once("500 Internal Server Error", "{}").await;
        let diagnostics = Arc::new(DiagnosticLog::default());
        let client = ApiClient::new(url, None, diagnostics.clone());

        match client.list_relations().await {
            Err(SyncError::Fetch { path, status, .. }) => {
                assert_eq!(path, "/api/relations");
                assert_eq!(status, Some(500));
            }
            other => panic!("Expected fetch error, got {:?}", other),
        }
        server.await.unwrap();
        assert_eq!(diagnostics.len(), 1);
    }

    #[tokio::test]
    async fn test_connection_refused_is_fetch_error() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let diagnostics = Arc::new(DiagnosticLog::default());
        let client = ApiClient::new(format!("http://{}", addr), None, diagnostics.clone());
        let err = client.list_events().await.unwrap_err();
        assert_eq!(err.kind(), "fetch");
        assert_eq!(diagnostics.entries()[0].source, "/api/events");
    }

    #[tokio::test]
    async fn test_truncated_body_is_fetch_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await.unwrap();
            // Promises 500 bytes, sends a fragment, then hangs up
            let response = "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 500\r\nconnection: close\r\n\r\n[{\"id\":\"e1\"";
            socket.write_all(response.as_bytes()).await.unwrap();
        });

        let diagnostics = Arc::new(DiagnosticLog::default());
        let client = ApiClient::new(format!("http://{}", addr), None, diagnostics.clone());
        let err = client.list_events().await.unwrap_err();
        assert_eq!(err.kind(), "fetch");
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics.entries()[0].source, "/api/events");
    }

    #[tokio::test]
    async fn test_delete_agent_accepts_empty_body() {
        let (url, server) = serve_once("204 No Content", "").await;
        let client = ApiClient::new(url, None, Arc::new(DiagnosticLog::default()));
        client.delete_agent("a1").await.unwrap();
        let request = server.await.unwrap();
        assert!(request.starts_with("DELETE /api/agents/a1"));
    }
}
