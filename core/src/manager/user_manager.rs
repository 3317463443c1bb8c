//! Users of one process, each with their own trees, settings and client

use super::{ManagerConfig, TreeManager, TreeOptions};
use crate::config::{ConfigureOptions, Settings};
use crate::error::{ManagerError, Result};
use crate::output::{FrontendPayload, FrontendReturner, Update};
use crate::tree::{ProcessRequest, Tree};
use crate::weaviate::ClientManager;
use chrono::{DateTime, Days, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};

/// Requests counted against the daily limit
#[derive(Debug, Clone, Copy)]
struct RequestWindow {
    count: u32,
    reset_time: DateTime<Utc>,
}

fn next_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .checked_add_days(Days::new(1))
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now)
}

impl RequestWindow {
    fn new() -> Self {
        Self {
            count: 0,
            reset_time: next_midnight(Utc::now()),
        }
    }

    /// Count a request; `Err(reset_time)` once `max` is used up for the day
    fn try_acquire(&mut self, max: u32) -> std::result::Result<(), DateTime<Utc>> {
        let now = Utc::now();
        if now >= self.reset_time {
            self.count = 0;
            self.reset_time = next_midnight(now);
        }
        if self.count >= max {
            return Err(self.reset_time);
        }
        self.count += 1;
        Ok(())
    }
}

/// Everything the manager keeps for one user
pub struct LocalUser {
    pub user_id: String,
    pub tree_manager: TreeManager,
    pub client_manager: Arc<ClientManager>,
    settings: RwLock<Settings>,
    last_request: StdMutex<Instant>,
    requests: StdMutex<RequestWindow>,
}

impl LocalUser {
    fn touch(&self) {
        if let Ok(mut last) = self.last_request.lock() {
            *last = Instant::now();
        }
    }

    fn idle_for(&self) -> std::time::Duration {
        self.last_request
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    pub async fn settings(&self) -> Settings {
        self.settings.read().await.clone()
    }

    /// Requests made since the last daily reset
    pub fn request_count(&self) -> u32 {
        self.requests.lock().map(|w| w.count).unwrap_or_default()
    }
}

/// All users of this process
pub struct UserManager {
    manager_config: ManagerConfig,
    users: RwLock<HashMap<String, Arc<LocalUser>>>,
}

impl UserManager {
    pub fn new(manager_config: ManagerConfig) -> Self {
        Self {
            manager_config,
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Manager configured from the environment
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(ManagerConfig::from_env()?))
    }

    pub fn manager_config(&self) -> &ManagerConfig {
        &self.manager_config
    }

    pub async fn user_exists(&self, user_id: &str) -> bool {
        self.users.read().await.contains_key(user_id)
    }

    /// Add a user unless present; `None` settings are read from the environment
    pub async fn add_user_local(&self, user_id: &str, settings: Option<Settings>) -> Result<Arc<LocalUser>> {
        if let Some(user) = self.users.read().await.get(user_id) {
            user.touch();
            return Ok(user.clone());
        }

        let settings = match settings {
            Some(settings) => settings,
            None => Settings::from_env()?,
        };
        let client_manager = Arc::new(ClientManager::from_settings(&settings));
        let tree_manager = TreeManager::new(user_id, settings.clone())
            .with_tree_timeout(self.manager_config.tree_timeout)
            .with_client_manager(client_manager.clone());

        let user = Arc::new(LocalUser {
            user_id: user_id.to_string(),
            tree_manager,
            client_manager,
            settings: RwLock::new(settings),
            last_request: StdMutex::new(Instant::now()),
            requests: StdMutex::new(RequestWindow::new()),
        });

        let mut users = self.users.write().await;
        let user = users.entry(user_id.to_string()).or_insert(user).clone();
        tracing::info!("Added user {}", user_id);
        Ok(user)
    }

    pub async fn get_user_local(&self, user_id: &str) -> Result<Arc<LocalUser>> {
        let user = self
            .users
            .read()
            .await
            .get(user_id)
            .cloned()
            .ok_or_else(|| ManagerError::UserNotFound {
                user_id: user_id.to_string(),
            })?;
        user.touch();
        Ok(user)
    }

    /// Update a user's settings, and the defaults for that user's new trees
    pub async fn configure(&self, user_id: &str, options: ConfigureOptions) -> Result<()> {
        let user = self.get_user_local(user_id).await?;
        user.settings.write().await.configure(options.clone())?;
        user.tree_manager.configure(None, options).await
    }

    pub async fn initialise_tree(
        &self,
        user_id: &str,
        conversation_id: &str,
        options: TreeOptions,
    ) -> Result<Arc<Mutex<Tree>>> {
        let user = self.get_user_local(user_id).await?;
        Ok(user.tree_manager.add_tree(conversation_id, options).await)
    }

    pub async fn get_tree(&self, user_id: &str, conversation_id: &str) -> Result<Arc<Mutex<Tree>>> {
        let user = self.get_user_local(user_id).await?;
        user.tree_manager.get_tree(conversation_id).await
    }

    /// True when the user or the conversation is gone, or the tree has been idle too long
    pub async fn check_tree_timeout(&self, user_id: &str, conversation_id: &str) -> bool {
        let Some(user) = self.users.read().await.get(user_id).cloned() else {
            return true;
        };
        user.tree_manager.check_tree_timeout(conversation_id).await
    }

    /// True when the user is gone or has been idle longer than the user timeout
    pub async fn check_user_timeout(&self, user_id: &str) -> bool {
        match self.users.read().await.get(user_id) {
            Some(user) => user.idle_for() > self.manager_config.user_timeout,
            None => true,
        }
    }

    /// Run a query for a user.
    ///
    /// Timed-out trees and users, and users over their daily limit, get a
    /// single error payload instead of a tree run.
    pub fn process_tree(
        &self,
        user_id: &str,
        conversation_id: &str,
        request: ProcessRequest,
    ) -> BoxStream<'_, Result<FrontendPayload>> {
        let user_id = user_id.to_string();
        let conversation_id = conversation_id.to_string();
        Box::pin(async_stream::stream! {
            let returner = FrontendReturner::new(&user_id, &conversation_id, &request.query_id, 0);

            let Some(user) = self.users.read().await.get(&user_id).cloned() else {
                tracing::warn!("Query {} for unknown user {}", request.query_id, user_id);
                yield Ok(returner.update(&Update::UserTimeoutError));
                return;
            };
            if self.check_tree_timeout(&user_id, &conversation_id).await {
                yield Ok(returner.update(&Update::TreeTimeoutError));
                return;
            }
            if self.manager_config.rate_limiting {
                let acquired = user
                    .requests
                    .lock()
                    .map(|mut window| window.try_acquire(self.manager_config.max_requests_per_day))
                    .unwrap_or(Ok(()));
                if let Err(reset_time) = acquired {
                    tracing::info!("User {} reached the daily request limit", user_id);
                    yield Ok(returner.update(&Update::RateLimitError { reset_time }));
                    return;
                }
            }
            user.touch();

            let mut outputs = user.tree_manager.process_tree(&conversation_id, request);
            while let Some(output) = outputs.next().await {
                user.touch();
                yield output;
            }
        })
    }

    /// Evict idle trees of every user
    pub async fn check_all_trees_timeout(&self) {
        let users: Vec<Arc<LocalUser>> = self.users.read().await.values().cloned().collect();
        for user in users {
            user.tree_manager.check_all_trees_timeout().await;
        }
    }

    /// Evict idle users and close their clients. Returns the evicted ids.
    pub async fn check_all_users_timeout(&self) -> Vec<String> {
        let expired: Vec<Arc<LocalUser>> = {
            let mut users = self.users.write().await;
            let ids: Vec<String> = users
                .iter()
                .filter(|(_, user)| user.idle_for() > self.manager_config.user_timeout)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| users.remove(id)).collect()
        };

        for user in &expired {
            user.client_manager.close().await;
            tracing::info!("Removed user {} after inactivity", user.user_id);
        }
        expired.iter().map(|u| u.user_id.clone()).collect()
    }

    pub async fn close_all_clients(&self) {
        let users: Vec<Arc<LocalUser>> = self.users.read().await.values().cloned().collect();
        for user in users {
            user.client_manager.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::llm::mock::MockLlmClient;
    use crate::tree::BranchInitialisation;
    use std::time::Duration;

    fn routed_tree(conversation_id: &str) -> Tree {
        let lm = Arc::new(MockLlmClient::new());
        Tree::new(Settings::new())
            .with_initialisation(BranchInitialisation::Empty)
            .with_ids("user", conversation_id)
            .with_lms(lm.clone(), lm)
    }

    async fn run(manager: &UserManager, conversation_id: &str) -> Vec<FrontendPayload> {
        let request = ProcessRequest::new("Hello").with_training_route("text_response");
        manager
            .process_tree("user", conversation_id, request)
            .map(|o| o.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_missing_user_and_tree() {
        let manager = UserManager::new(ManagerConfig::default());
        assert!(matches!(
            manager.get_user_local("user").await,
            Err(Error::Manager(ManagerError::UserNotFound { .. }))
        ));

        manager.add_user_local("user", Some(Settings::new())).await.unwrap();
        assert!(manager.get_user_local("user").await.is_ok());
        assert!(matches!(
            manager.get_tree("user", "c1").await,
            Err(Error::Manager(ManagerError::TreeNotFound { .. }))
        ));

        manager
            .initialise_tree("user", "c1", TreeOptions::new().low_memory(true))
            .await
            .unwrap();
        let tree = manager.get_tree("user", "c1").await.unwrap();
        assert!(tree.lock().await.low_memory);
    }

    #[tokio::test]
    async fn test_process_tree() {
        let manager = UserManager::new(ManagerConfig::default());
        let user = manager.add_user_local("user", Some(Settings::new())).await.unwrap();
        user.tree_manager.insert_tree("c1", routed_tree("c1")).await;

        let payloads = run(&manager, "c1").await;
        assert!(payloads.last().unwrap().is_completed());
        assert!(payloads.iter().all(|p| p.conversation_id == "c1"));
    }

    #[tokio::test]
    async fn test_timeouts_yield_error_payloads() {
        let manager = UserManager::new(ManagerConfig::default());

        let payloads = run(&manager, "c1").await;
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].payload_type, "user_timeout_error");

        manager.add_user_local("user", Some(Settings::new())).await.unwrap();
        let payloads = run(&manager, "c1").await;
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].payload_type, "tree_timeout_error");
        assert_eq!(payloads[0].user_id, "user");
    }

    #[tokio::test]
    async fn test_rate_limit() {
        let manager = UserManager::new(ManagerConfig::default().with_rate_limit(1));
        let user = manager.add_user_local("user", Some(Settings::new())).await.unwrap();
        user.tree_manager.insert_tree("c1", routed_tree("c1")).await;

        assert!(run(&manager, "c1").await.last().unwrap().is_completed());
        let payloads = run(&manager, "c1").await;
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].payload_type, "rate_limit_error");
        assert!(payloads[0].payload["reset_time"].is_string());
        assert_eq!(user.request_count(), 1);
    }

    #[test]
    fn test_request_window_resets() {
        let mut window = RequestWindow::new();
        assert!(window.try_acquire(1).is_ok());
        assert!(window.try_acquire(1).is_err());

        window.reset_time = Utc::now() - chrono::Duration::seconds(1);
        assert!(window.try_acquire(1).is_ok());
        assert!(window.reset_time > Utc::now());
    }

    #[tokio::test]
    async fn test_user_timeout_eviction() {
        let manager = UserManager::new(
            ManagerConfig::default()
                .with_user_timeout(Duration::ZERO)
                .with_tree_timeout(Duration::ZERO),
        );
        let user = manager.add_user_local("user", Some(Settings::new())).await.unwrap();
        manager.initialise_tree("user", "c1", TreeOptions::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(manager.check_tree_timeout("user", "c1").await);
        manager.check_all_trees_timeout().await;
        assert!(!user.tree_manager.tree_exists("c1").await);

        assert!(manager.check_user_timeout("user").await);
        assert_eq!(manager.check_all_users_timeout().await, vec!["user".to_string()]);
        assert!(!manager.user_exists("user").await);
        assert!(manager.check_user_timeout("user").await);
    }

    #[tokio::test]
    async fn test_configure_user() {
        let manager = UserManager::new(ManagerConfig::default());
        manager.add_user_local("user", Some(Settings::new())).await.unwrap();
        manager
            .configure("user", ConfigureOptions::default().base("gpt-4o-mini", "openai"))
            .await
            .unwrap();

        let user = manager.get_user_local("user").await.unwrap();
        assert_eq!(user.settings().await.base_model.as_deref(), Some("gpt-4o-mini"));
        let tree = manager.initialise_tree("user", "c1", TreeOptions::new()).await.unwrap();
        assert_eq!(tree.lock().await.settings().base_model.as_deref(), Some("gpt-4o-mini"));

        assert!(manager
            .configure("user", ConfigureOptions::default().base("llama3", "ollama"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_configure_cluster_reaches_existing_trees() {
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/schema"))
            .and(header("authorization", "Bearer new-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "classes": [{"class": "ArticleComments"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let manager = UserManager::new(ManagerConfig::default());
        manager.add_user_local("user", Some(Settings::new())).await.unwrap();
        let tree = manager.initialise_tree("user", "c1", TreeOptions::new()).await.unwrap();
        assert!(!tree.lock().await.client_manager().is_client());

        let options = ConfigureOptions {
            wcd_url: Some(server.uri()),
            wcd_api_key: Some("new-key".to_string()),
            ..Default::default()
        };
        manager.configure("user", options).await.unwrap();

        let user = manager.get_user_local("user").await.unwrap();
        assert_eq!(user.client_manager.url(), server.uri());
        let client_manager = tree.lock().await.client_manager().clone();
        assert_eq!(
            client_manager.list_collections().await.unwrap(),
            vec!["ArticleComments".to_string()]
        );
    }
}
