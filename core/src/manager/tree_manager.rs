//! Trees of one user, keyed by conversation id

use super::ManagerConfig;
use crate::config::{ConfigureOptions, Settings};
use crate::error::{ManagerError, Result};
use crate::output::FrontendPayload;
use crate::tree::{BranchInitialisation, ProcessRequest, Tree};
use crate::weaviate::ClientManager;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

/// Per-tree overrides for [`TreeManager::add_tree`]; unset fields use the manager defaults
#[derive(Debug, Clone, Default)]
pub struct TreeOptions {
    pub settings: Option<Settings>,
    pub style: Option<String>,
    pub agent_description: Option<String>,
    pub end_goal: Option<String>,
    pub branch_initialisation: Option<BranchInitialisation>,
    pub low_memory: bool,
}

impl TreeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn style<S: Into<String>>(mut self, style: S) -> Self {
        self.style = Some(style.into());
        self
    }

    pub fn agent_description<S: Into<String>>(mut self, agent_description: S) -> Self {
        self.agent_description = Some(agent_description.into());
        self
    }

    pub fn end_goal<S: Into<String>>(mut self, end_goal: S) -> Self {
        self.end_goal = Some(end_goal.into());
        self
    }

    pub fn branch_initialisation(mut self, branch_initialisation: BranchInitialisation) -> Self {
        self.branch_initialisation = Some(branch_initialisation);
        self
    }

    pub fn low_memory(mut self, low_memory: bool) -> Self {
        self.low_memory = low_memory;
        self
    }
}

#[derive(Debug, Clone)]
struct TreeDefaults {
    settings: Settings,
    style: Option<String>,
    agent_description: Option<String>,
    end_goal: Option<String>,
    branch_initialisation: BranchInitialisation,
}

/// A tree plus its bookkeeping. The tree mutex is held for the whole of a
/// query, so a second query on the same conversation waits for the first.
struct TreeSlot {
    tree: Arc<Mutex<Tree>>,
    last_request: StdMutex<Instant>,
}

impl TreeSlot {
    fn new(tree: Tree) -> Self {
        Self {
            tree: Arc::new(Mutex::new(tree)),
            last_request: StdMutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_request.lock() {
            *last = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_request
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }
}

/// Conversations of a single user
pub struct TreeManager {
    user_id: String,
    tree_timeout: Duration,
    client_manager: Option<Arc<ClientManager>>,
    defaults: RwLock<TreeDefaults>,
    trees: RwLock<HashMap<String, Arc<TreeSlot>>>,
}

impl TreeManager {
    /// Manager whose trees default to `settings` and the one-branch layout
    pub fn new<S: Into<String>>(user_id: S, settings: Settings) -> Self {
        Self {
            user_id: user_id.into(),
            tree_timeout: ManagerConfig::default().tree_timeout,
            client_manager: None,
            defaults: RwLock::new(TreeDefaults {
                settings,
                style: None,
                agent_description: None,
                end_goal: None,
                branch_initialisation: BranchInitialisation::OneBranch,
            }),
            trees: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_tree_timeout(mut self, tree_timeout: Duration) -> Self {
        self.tree_timeout = tree_timeout;
        self
    }

    /// Share one vector-database client between every tree of this user
    pub fn with_client_manager(mut self, client_manager: Arc<ClientManager>) -> Self {
        self.client_manager = Some(client_manager);
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub async fn tree_exists(&self, conversation_id: &str) -> bool {
        self.trees.read().await.contains_key(conversation_id)
    }

    pub async fn conversation_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.trees.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Create a tree for `conversation_id` unless one exists already
    pub async fn add_tree(&self, conversation_id: &str, options: TreeOptions) -> Arc<Mutex<Tree>> {
        if let Some(slot) = self.trees.read().await.get(conversation_id) {
            return slot.tree.clone();
        }

        let defaults = self.defaults.read().await.clone();
        let mut tree = Tree::new(options.settings.unwrap_or(defaults.settings))
            .with_initialisation(
                options
                    .branch_initialisation
                    .unwrap_or(defaults.branch_initialisation),
            )
            .with_ids(&self.user_id, conversation_id)
            .with_low_memory(options.low_memory);
        if let Some(client_manager) = &self.client_manager {
            tree = tree.with_client_manager(client_manager.clone());
        }
        if let Some(style) = options.style.or(defaults.style) {
            tree.change_style(style);
        }
        if let Some(agent_description) = options.agent_description.or(defaults.agent_description) {
            tree.change_agent_description(agent_description);
        }
        if let Some(end_goal) = options.end_goal.or(defaults.end_goal) {
            tree.change_end_goal(end_goal);
        }

        self.insert_tree(conversation_id, tree).await
    }

    /// Register an already built tree, replacing any tree under the same id
    pub async fn insert_tree(&self, conversation_id: &str, tree: Tree) -> Arc<Mutex<Tree>> {
        let slot = Arc::new(TreeSlot::new(tree));
        let handle = slot.tree.clone();
        self.trees
            .write()
            .await
            .insert(conversation_id.to_string(), slot);
        tracing::debug!("Added tree {} for user {}", conversation_id, self.user_id);
        handle
    }

    async fn slot(&self, conversation_id: &str) -> Result<Arc<TreeSlot>> {
        self.trees
            .read()
            .await
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| {
                ManagerError::TreeNotFound {
                    conversation_id: conversation_id.to_string(),
                }
                .into()
            })
    }

    pub async fn get_tree(&self, conversation_id: &str) -> Result<Arc<Mutex<Tree>>> {
        Ok(self.slot(conversation_id).await?.tree.clone())
    }

    pub async fn remove_tree(&self, conversation_id: &str) -> bool {
        self.trees.write().await.remove(conversation_id).is_some()
    }

    /// Update the settings of one tree, or the defaults for new trees
    pub async fn configure(&self, conversation_id: Option<&str>, options: ConfigureOptions) -> Result<()> {
        match conversation_id {
            None => {
                let mut defaults = self.defaults.write().await;
                defaults.settings.configure(options)?;
                if let Some(client_manager) = &self.client_manager {
                    if client_manager.sync_settings(&defaults.settings) {
                        tracing::info!(
                            "Weaviate client for user {} now points at {}",
                            self.user_id,
                            client_manager.url()
                        );
                    }
                }
                Ok(())
            }
            Some(conversation_id) => {
                let tree = self.get_tree(conversation_id).await?;
                let mut tree = tree.lock().await;
                let mut settings = tree.settings().clone();
                settings.configure(options)?;
                tree.set_settings(settings);
                Ok(())
            }
        }
    }

    pub async fn settings(&self, conversation_id: Option<&str>) -> Result<Settings> {
        match conversation_id {
            None => Ok(self.defaults.read().await.settings.clone()),
            Some(conversation_id) => {
                let tree = self.get_tree(conversation_id).await?;
                let settings = tree.lock().await.settings().clone();
                Ok(settings)
            }
        }
    }

    pub async fn change_style(&self, style: &str, conversation_id: Option<&str>) -> Result<()> {
        match conversation_id {
            None => self.defaults.write().await.style = Some(style.to_string()),
            Some(id) => self.get_tree(id).await?.lock().await.change_style(style),
        }
        Ok(())
    }

    pub async fn change_agent_description(
        &self,
        agent_description: &str,
        conversation_id: Option<&str>,
    ) -> Result<()> {
        match conversation_id {
            None => self.defaults.write().await.agent_description = Some(agent_description.to_string()),
            Some(id) => self
                .get_tree(id)
                .await?
                .lock()
                .await
                .change_agent_description(agent_description),
        }
        Ok(())
    }

    pub async fn change_end_goal(&self, end_goal: &str, conversation_id: Option<&str>) -> Result<()> {
        match conversation_id {
            None => self.defaults.write().await.end_goal = Some(end_goal.to_string()),
            Some(id) => self.get_tree(id).await?.lock().await.change_end_goal(end_goal),
        }
        Ok(())
    }

    pub async fn change_branch_initialisation(
        &self,
        branch_initialisation: &str,
        conversation_id: Option<&str>,
    ) -> Result<()> {
        match conversation_id {
            None => {
                self.defaults.write().await.branch_initialisation = branch_initialisation.parse()?;
            }
            Some(id) => {
                self.get_tree(id)
                    .await?
                    .lock()
                    .await
                    .set_branch_initialisation(branch_initialisation)?;
            }
        }
        Ok(())
    }

    /// Run a query on a conversation's tree, waiting for any query already running on it
    pub fn process_tree(
        &self,
        conversation_id: &str,
        request: ProcessRequest,
    ) -> BoxStream<'_, Result<FrontendPayload>> {
        let conversation_id = conversation_id.to_string();
        Box::pin(async_stream::stream! {
            let slot = match self.slot(&conversation_id).await {
                Ok(slot) => slot,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            slot.touch();

            let mut tree = slot.tree.clone().lock_owned().await;
            tracing::debug!("Tree {} is processing query {}", conversation_id, request.query_id);
            let mut outputs = tree.process(request);
            while let Some(output) = outputs.next().await {
                slot.touch();
                yield output;
            }
        })
    }

    /// True when the tree is missing or has been idle longer than the tree timeout
    pub async fn check_tree_timeout(&self, conversation_id: &str) -> bool {
        match self.trees.read().await.get(conversation_id) {
            Some(slot) => slot.idle_for() > self.tree_timeout,
            None => true,
        }
    }

    /// Evict idle trees; trees in the middle of a query are kept. Returns the evicted ids.
    pub async fn check_all_trees_timeout(&self) -> Vec<String> {
        let mut trees = self.trees.write().await;
        let expired: Vec<String> = trees
            .iter()
            .filter(|(_, slot)| slot.idle_for() > self.tree_timeout && slot.tree.try_lock().is_ok())
            .map(|(id, _)| id.clone())
            .collect();

        for conversation_id in &expired {
            trees.remove(conversation_id);
            tracing::info!(
                "Removed tree {} for user {} after inactivity",
                conversation_id,
                self.user_id
            );
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::llm::mock::MockLlmClient;

    fn manager() -> TreeManager {
        TreeManager::new("user", Settings::new())
    }

    fn routed_tree(conversation_id: &str) -> Tree {
        let lm = Arc::new(MockLlmClient::new());
        Tree::new(Settings::new())
            .with_initialisation(BranchInitialisation::Empty)
            .with_ids("user", conversation_id)
            .with_lms(lm.clone(), lm)
    }

    #[tokio::test]
    async fn test_missing_tree_fails() {
        let manager = manager();
        assert!(matches!(
            manager.get_tree("nope").await,
            Err(Error::Manager(ManagerError::TreeNotFound { .. }))
        ));
        assert!(manager.check_tree_timeout("nope").await);
        assert!(manager.change_style("Brief", Some("nope")).await.is_err());
    }

    #[tokio::test]
    async fn test_add_tree_uses_defaults() {
        let manager = manager();
        manager.change_style("Brief", None).await.unwrap();
        manager.change_end_goal("Answer everything", None).await.unwrap();

        let tree = manager.add_tree("c1", TreeOptions::new().low_memory(true)).await;
        let tree = tree.lock().await;
        assert_eq!(tree.user_id, "user");
        assert_eq!(tree.conversation_id, "c1");
        assert_eq!(tree.branch_initialisation(), BranchInitialisation::OneBranch);
        assert_eq!(tree.tree_data.atlas.style, "Brief");
        assert_eq!(tree.tree_data.atlas.end_goal, "Answer everything");
        assert!(tree.low_memory);
    }

    #[tokio::test]
    async fn test_add_tree_overrides() {
        let manager = manager();
        let mut settings = Settings::new();
        settings
            .configure(ConfigureOptions::default().base("gpt-4o-mini", "openai"))
            .unwrap();

        manager
            .add_tree(
                "c1",
                TreeOptions::new()
                    .settings(settings)
                    .style("Pirate")
                    .branch_initialisation(BranchInitialisation::Empty),
            )
            .await;
        manager.add_tree("c2", TreeOptions::new()).await;

        let tree = manager.get_tree("c1").await.unwrap();
        let tree = tree.lock().await;
        assert_eq!(tree.settings().base_model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(tree.tree_data.atlas.style, "Pirate");
        assert_eq!(tree.branch_initialisation(), BranchInitialisation::Empty);

        let defaults = manager.settings(Some("c2")).await.unwrap();
        assert_eq!(defaults.base_model, None);
        assert_eq!(manager.conversation_ids().await, vec!["c1", "c2"]);
    }

    #[tokio::test]
    async fn test_add_tree_keeps_existing() {
        let manager = manager();
        manager.add_tree("c1", TreeOptions::new().style("First")).await;
        manager.add_tree("c1", TreeOptions::new().style("Second")).await;
        let tree = manager.get_tree("c1").await.unwrap();
        assert_eq!(tree.lock().await.tree_data.atlas.style, "First");
    }

    #[tokio::test]
    async fn test_configure_one_tree() {
        let manager = manager();
        manager.add_tree("c1", TreeOptions::new()).await;
        manager
            .configure(Some("c1"), ConfigureOptions::default().complex("gpt-4o", "openai"))
            .await
            .unwrap();

        assert_eq!(
            manager.settings(Some("c1")).await.unwrap().complex_model.as_deref(),
            Some("gpt-4o")
        );
        assert_eq!(manager.settings(None).await.unwrap().complex_model, None);
    }

    #[tokio::test]
    async fn test_configure_one_tree_cluster() {
        let shared = Arc::new(ClientManager::not_configured());
        let manager = manager().with_client_manager(shared.clone());
        manager.add_tree("c1", TreeOptions::new()).await;
        manager.add_tree("c2", TreeOptions::new()).await;

        let options = ConfigureOptions {
            wcd_url: Some("http://localhost:8080".to_string()),
            wcd_api_key: Some("key".to_string()),
            ..Default::default()
        };
        manager.configure(Some("c1"), options).await.unwrap();

        let c1 = manager.get_tree("c1").await.unwrap();
        let c1 = c1.lock().await;
        assert!(c1.client_manager().is_client());
        assert_eq!(c1.client_manager().url(), "http://localhost:8080");

        let c2 = manager.get_tree("c2").await.unwrap();
        assert!(Arc::ptr_eq(c2.lock().await.client_manager(), &shared));
        assert!(!shared.is_client());
    }

    #[tokio::test]
    async fn test_change_branch_initialisation() {
        let manager = manager();
        manager.add_tree("c1", TreeOptions::new()).await;
        manager.change_branch_initialisation("empty", Some("c1")).await.unwrap();
        manager.change_branch_initialisation("multi_branch", None).await.unwrap();
        assert!(manager.change_branch_initialisation("bush", None).await.is_err());

        let tree = manager.get_tree("c1").await.unwrap();
        assert_eq!(tree.lock().await.branch_initialisation(), BranchInitialisation::Empty);
        let tree = manager.add_tree("c2", TreeOptions::new()).await;
        assert_eq!(tree.lock().await.branch_initialisation(), BranchInitialisation::MultiBranch);
    }

    #[tokio::test]
    async fn test_process_tree_streams_payloads() {
        let manager = manager();
        manager.insert_tree("c1", routed_tree("c1")).await;

        let request = ProcessRequest::new("Hello").with_training_route("text_response");
        let outputs: Vec<_> = manager.process_tree("c1", request).collect().await;
        assert!(outputs.last().unwrap().as_ref().unwrap().is_completed());

        let missing: Vec<_> = manager
            .process_tree("c2", ProcessRequest::new("Hello"))
            .collect()
            .await;
        assert!(matches!(
            missing[0],
            Err(Error::Manager(ManagerError::TreeNotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_timeout_eviction() {
        let manager = manager().with_tree_timeout(Duration::ZERO);
        manager.add_tree("c1", TreeOptions::new()).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(manager.check_tree_timeout("c1").await);
        assert_eq!(manager.check_all_trees_timeout().await, vec!["c1".to_string()]);
        assert!(!manager.tree_exists("c1").await);
    }

    #[tokio::test]
    async fn test_busy_tree_is_not_evicted() {
        let manager = manager().with_tree_timeout(Duration::ZERO);
        let tree = manager.add_tree("c1", TreeOptions::new()).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let _busy = tree.lock().await;
        assert!(manager.check_all_trees_timeout().await.is_empty());
        assert!(manager.tree_exists("c1").await);
    }

    #[tokio::test]
    async fn test_fresh_tree_is_kept() {
        let manager = manager();
        manager.add_tree("c1", TreeOptions::new()).await;
        assert!(!manager.check_tree_timeout("c1").await);
        assert!(manager.check_all_trees_timeout().await.is_empty());
    }
}
