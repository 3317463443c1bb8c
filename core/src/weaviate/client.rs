//! Connection management for the vector database

use super::query::{AggregateQuery, SearchQuery};
use crate::config::Settings;
use crate::error::{ClientError, Result};
use crate::output::JsonObject;
use reqwest::{Method, RequestBuilder};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard};
use std::time::{Duration, Instant};

/// Collection that stores preprocessed collection summaries
pub const METADATA_COLLECTION: &str = "ELYSIA_METADATA__";

/// Header for a third-party vectoriser key, e.g. `openai_api_key` -> `X-OpenAI-Api-Key`
pub fn api_key_header(key_name: &str) -> Option<&'static str> {
    let normalised = key_name.to_lowercase().replace("apikey", "api_key");
    let header = match normalised.as_str() {
        "anthropic_api_key" => "X-Anthropic-Api-Key",
        "anyscale_api_key" => "X-Anyscale-Api-Key",
        "aws_access_key" => "X-Aws-Access-Key",
        "aws_secret_key" => "X-Aws-Secret-Key",
        "cohere_api_key" => "X-Cohere-Api-Key",
        "databricks_token" => "X-Databricks-Token",
        "friendli_token" => "X-Friendli-Api-Key",
        "vertex_api_key" => "X-Goog-Vertex-Api-Key",
        "studio_api_key" => "X-Goog-Studio-Api-Key",
        "huggingface_api_key" => "X-HuggingFace-Api-Key",
        "jinaai_api_key" => "X-JinaAI-Api-Key",
        "mistral_api_key" => "X-Mistral-Api-Key",
        "nvidia_api_key" => "X-Nvidia-Api-Key",
        "openai_api_key" => "X-OpenAI-Api-Key",
        "azure_api_key" => "X-Azure-Api-Key",
        "voyage_api_key" => "X-Voyage-Api-Key",
        "xai_api_key" => "X-Xai-Api-Key",
        _ => return None,
    };
    Some(header)
}

/// Cluster address, credentials and vectoriser headers
#[derive(Debug, Clone, Default)]
struct Connection {
    wcd_url: String,
    wcd_api_key: String,
    headers: BTreeMap<String, String>,
}

impl Connection {
    fn new(wcd_url: String, wcd_api_key: String) -> Self {
        Self {
            wcd_url: wcd_url.trim_end_matches('/').to_string(),
            wcd_api_key,
            headers: BTreeMap::new(),
        }
    }

    fn log_state(&self) {
        match (self.wcd_url.is_empty(), self.wcd_api_key.is_empty()) {
            (true, true) => tracing::warn!(
                "WCD_URL and WCD_API_KEY are not set. All Weaviate functionality will be disabled."
            ),
            (true, false) => {
                tracing::warn!("WCD_URL is not set. All Weaviate functionality will be disabled.")
            }
            (false, true) => tracing::warn!(
                "WCD_API_KEY is not set. All Weaviate functionality will be disabled."
            ),
            (false, false) => tracing::debug!("Weaviate client initialised for {}", self.wcd_url),
        }
    }

    fn with_api_keys(mut self, api_keys: &BTreeMap<String, String>) -> Self {
        for (name, value) in api_keys {
            if let Some(header) = api_key_header(name) {
                self.headers.insert(header.to_string(), value.clone());
            }
        }
        self
    }

    fn is_client(&self) -> bool {
        !self.wcd_url.is_empty() && !self.wcd_api_key.is_empty()
    }
}

/// Shared handle to a vector database cluster.
///
/// Without a URL and API key the manager is inert: `is_client()` is false and
/// every request fails with [`ClientError::NotConfigured`]. Retrieval tools use
/// this to report themselves unavailable.
///
/// The connection can be swapped in place with [`ClientManager::reset_keys`],
/// so trees holding the same `Arc` pick up new credentials.
pub struct ClientManager {
    http: reqwest::Client,
    connection: RwLock<Connection>,
    client_timeout: Duration,
    last_used: Mutex<Instant>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ClientManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientManager")
            .field("wcd_url", &self.url())
            .field("is_client", &self.is_client())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ClientManager {
    pub fn new<U: Into<String>, K: Into<String>>(wcd_url: U, wcd_api_key: K) -> Self {
        let connection = Connection::new(wcd_url.into(), wcd_api_key.into());
        connection.log_state();
        Self {
            http: reqwest::Client::new(),
            connection: RwLock::new(connection),
            client_timeout: Duration::from_secs(3 * 60),
            last_used: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        }
    }

    /// A manager with no cluster behind it
    pub fn not_configured() -> Self {
        Self::new("", "")
    }

    /// Credentials, timeout and vectoriser keys from settings
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.wcd_url.clone(), settings.wcd_api_key.clone())
            .with_client_timeout(Duration::from_secs(settings.client_timeout * 60))
            .with_api_keys(&settings.api_keys)
    }

    pub fn with_client_timeout(mut self, client_timeout: Duration) -> Self {
        self.client_timeout = client_timeout;
        self
    }

    /// Forward known third-party keys as vectoriser headers
    pub fn with_api_keys(mut self, api_keys: &BTreeMap<String, String>) -> Self {
        let connection = self
            .connection
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        *connection = std::mem::take(connection).with_api_keys(api_keys);
        self
    }

    /// Point the manager at a new cluster and reopen it.
    ///
    /// Requests already built keep the old connection.
    pub fn reset_keys(
        &self,
        wcd_url: &str,
        wcd_api_key: &str,
        api_keys: &BTreeMap<String, String>,
    ) {
        let connection =
            Connection::new(wcd_url.to_string(), wcd_api_key.to_string()).with_api_keys(api_keys);
        connection.log_state();
        *self.connection.write().unwrap_or_else(PoisonError::into_inner) = connection;
        self.closed.store(false, Ordering::SeqCst);
        self.touch();
    }

    /// Reset the connection from settings when its cluster fields differ
    pub fn sync_settings(&self, settings: &Settings) -> bool {
        let changed = {
            let current = self.connection();
            let wanted = Connection::new(settings.wcd_url.clone(), settings.wcd_api_key.clone())
                .with_api_keys(&settings.api_keys);
            current.wcd_url != wanted.wcd_url
                || current.wcd_api_key != wanted.wcd_api_key
                || current.headers != wanted.headers
        };
        if changed {
            self.reset_keys(&settings.wcd_url, &settings.wcd_api_key, &settings.api_keys);
        }
        changed
    }

    fn connection(&self) -> RwLockReadGuard<'_, Connection> {
        self.connection.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_client(&self) -> bool {
        self.connection().is_client()
    }

    pub fn url(&self) -> String {
        self.connection().wcd_url.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop serving requests
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) && self.is_client() {
            tracing::info!("Closed Weaviate client for {}", self.url());
        }
    }

    /// Whether the client has not been used for longer than the client timeout
    pub fn is_idle(&self) -> bool {
        self.last_used
            .lock()
            .map(|last| last.elapsed() > self.client_timeout)
            .unwrap_or(false)
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_used.lock() {
            *last = Instant::now();
        }
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let connection = self.connection();
        if !connection.is_client() {
            return Err(ClientError::NotConfigured.into());
        }
        if self.is_closed() {
            return Err(ClientError::Closed.into());
        }
        self.touch();

        let mut builder = self
            .http
            .request(method, format!("{}{}", connection.wcd_url, path))
            .bearer_auth(&connection.wcd_api_key);
        for (header, value) in &connection.headers {
            builder = builder.header(header.as_str(), value.as_str());
        }
        Ok(builder)
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Value> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Request {
                status: status.as_u16(),
                message,
            }
            .into());
        }
        Ok(response.json().await?)
    }

    /// Run a GraphQL query and return its `data`
    pub async fn graphql(&self, query: &str) -> Result<Value> {
        tracing::debug!("GraphQL: {}", query);
        let builder = self
            .request(Method::POST, "/v1/graphql")?
            .json(&json!({ "query": query }));
        let mut body = self.send(builder).await?;

        if let Some(errors) = body.get("errors").and_then(Value::as_array) {
            if !errors.is_empty() {
                let message = errors
                    .iter()
                    .filter_map(|e| e.get("message").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(ClientError::Query { message }.into());
            }
        }
        Ok(body.get_mut("data").map(Value::take).unwrap_or(Value::Null))
    }

    /// Names of every collection in the cluster, except the metadata collection
    pub async fn list_collections(&self) -> Result<Vec<String>> {
        let schema = self.send(self.request(Method::GET, "/v1/schema")?).await?;
        Ok(schema
            .get("classes")
            .and_then(Value::as_array)
            .map(|classes| {
                classes
                    .iter()
                    .filter_map(|c| c.get("class").and_then(Value::as_str))
                    .filter(|name| *name != METADATA_COLLECTION)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    pub async fn collection_exists(&self, name: &str) -> Result<bool> {
        Ok(self
            .list_collections_including_metadata()
            .await?
            .iter()
            .any(|c| c.eq_ignore_ascii_case(name)))
    }

    async fn list_collections_including_metadata(&self) -> Result<Vec<String>> {
        let schema = self.send(self.request(Method::GET, "/v1/schema")?).await?;
        Ok(schema
            .get("classes")
            .and_then(Value::as_array)
            .map(|classes| {
                classes
                    .iter()
                    .filter_map(|c| c.get("class").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Property names of `class`, which must be spelled as the schema has it
    pub async fn collection_properties(&self, class: &str) -> Result<Vec<String>> {
        let path = format!("/v1/schema/{}", class);
        let schema = self.send(self.request(Method::GET, &path)?).await?;
        Ok(schema
            .get("properties")
            .and_then(Value::as_array)
            .map(|props| {
                props
                    .iter()
                    .filter_map(|p| p.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Preprocessed metadata for the named collections, keyed by lowercased name.
    ///
    /// Collections without a metadata record are absent from the result.
    pub async fn fetch_metadata(&self, names: &[String]) -> Result<BTreeMap<String, JsonObject>> {
        if names.is_empty() || !self.collection_exists(METADATA_COLLECTION).await? {
            return Ok(BTreeMap::new());
        }

        let path = format!("/v1/objects?class={}&limit=9999", METADATA_COLLECTION);
        let body = self.send(self.request(Method::GET, &path)?).await?;

        let wanted: Vec<String> = names.iter().map(|n| n.to_lowercase()).collect();
        let mut out = BTreeMap::new();
        for object in body
            .get("objects")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let Some(properties) = object.get("properties").and_then(Value::as_object) else {
                continue;
            };
            let Some(name) = properties.get("name").and_then(Value::as_str) else {
                continue;
            };
            let name = name.to_lowercase();
            if wanted.contains(&name) {
                out.insert(name, properties.clone());
            }
        }
        Ok(out)
    }

    /// Run a planned search
    pub async fn search(&self, query: &SearchQuery, properties: &[String]) -> Result<Vec<JsonObject>> {
        let data = self.graphql(&query.to_graphql(properties)?).await?;
        Ok(query.parse_response(&data))
    }

    /// Run a planned aggregation
    pub async fn aggregate(&self, query: &AggregateQuery) -> Result<Vec<JsonObject>> {
        let data = self.graphql(&query.to_graphql()).await?;
        Ok(query.parse_response(&data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::weaviate::SearchType;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn schema_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/schema"))
            .and(header("authorization", "Bearer wcd-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "classes": [
                    {"class": "Articles"},
                    {"class": "ELYSIA_METADATA__"}
                ]
            })))
            .mount(&server)
            .await;
        server
    }

    #[test]
    fn test_api_key_header() {
        assert_eq!(api_key_header("OPENAI_APIKEY"), Some("X-OpenAI-Api-Key"));
        assert_eq!(api_key_header("cohere_api_key"), Some("X-Cohere-Api-Key"));
        assert_eq!(api_key_header("unknown_api_key"), None);
    }

    #[tokio::test]
    async fn test_not_configured() {
        let manager = ClientManager::not_configured();
        assert!(!manager.is_client());
        let err = manager.list_collections().await.unwrap_err();
        assert!(matches!(err, Error::Client(ClientError::NotConfigured)));
    }

    #[tokio::test]
    async fn test_list_collections() {
        let server = schema_server().await;
        let manager = ClientManager::new(server.uri(), "wcd-key");

        assert_eq!(manager.list_collections().await.unwrap(), vec!["Articles"]);
        assert!(manager.collection_exists("articles").await.unwrap());
        assert!(!manager.collection_exists("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_client_refuses_requests() {
        let server = schema_server().await;
        let manager = ClientManager::new(server.uri(), "wcd-key");
        manager.close().await;
        let err = manager.list_collections().await.unwrap_err();
        assert!(matches!(err, Error::Client(ClientError::Closed)));
    }

    #[tokio::test]
    async fn test_reset_keys_switches_cluster() {
        let server = schema_server().await;
        let manager = ClientManager::not_configured();
        manager.close().await;

        let mut api_keys = BTreeMap::new();
        api_keys.insert("openai_api_key".to_string(), "sk-test".to_string());
        manager.reset_keys(&server.uri(), "wcd-key", &api_keys);

        assert!(manager.is_client());
        assert!(!manager.is_closed());
        assert_eq!(manager.list_collections().await.unwrap(), vec!["Articles"]);

        let received = server.received_requests().await.unwrap();
        assert_eq!(received[0].headers["x-openai-api-key"], "sk-test");
    }

    #[test]
    fn test_sync_settings_only_resets_on_change() {
        let mut settings = Settings::new();
        settings.wcd_url = "http://cluster-a/".to_string();
        settings.wcd_api_key = "key".to_string();
        let manager = ClientManager::from_settings(&settings);

        assert!(!manager.sync_settings(&settings));
        settings.wcd_url = "http://cluster-b".to_string();
        assert!(manager.sync_settings(&settings));
        assert_eq!(manager.url(), "http://cluster-b");
    }

    #[tokio::test]
    async fn test_fetch_metadata() {
        let server = schema_server().await;
        Mock::given(method("GET"))
            .and(path("/v1/objects"))
            .and(query_param("class", METADATA_COLLECTION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "objects": [
                    {"properties": {"name": "Articles", "summary": "news", "length": 10}},
                    {"properties": {"name": "Other", "summary": "x"}}
                ]
            })))
            .mount(&server)
            .await;

        let manager = ClientManager::new(server.uri(), "wcd-key");
        let metadata = manager
            .fetch_metadata(&["articles".to_string(), "unprocessed".to_string()])
            .await
            .unwrap();

        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata["articles"]["summary"], "news");
    }

    #[tokio::test]
    async fn test_search_and_graphql_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/graphql"))
            .and(body_partial_json(json!({
                "query": "{ Get { Articles(limit: 2) { title _additional { id } } } }"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"Get": {"Articles": [{"title": "hello", "_additional": {"id": "u1"}}]}}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": [{"message": "no such property"}]
            })))
            .mount(&server)
            .await;

        let manager = ClientManager::new(server.uri(), "wcd-key");
        let query = SearchQuery {
            collection: "articles".to_string(),
            search_type: SearchType::Fetch,
            search_query: None,
            limit: 2,
            sort_by: None,
            class_name: None,
        };
        let objects = manager.search(&query, &["title".to_string()]).await.unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0]["uuid"], "u1");

        let err = manager.graphql("{ bad }").await.unwrap_err();
        assert!(matches!(err, Error::Client(ClientError::Query { ref message }) if message == "no such property"));
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
            .mount(&server)
            .await;

        let manager = ClientManager::new(server.uri(), "bad-key");
        let err = manager.list_collections().await.unwrap_err();
        assert!(matches!(err, Error::Client(ClientError::Request { status: 401, .. })));
    }
}
