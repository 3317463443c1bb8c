//! The decision tree: branches, tools and the query loop

use crate::config::Settings;
use crate::error::{Error, Result, ToolError, TreeError};
use crate::history::{HistoryRecorder, QueryHistory};
use crate::llm::{complete_json, LlmClient, LmTimer, TimedLlmClient};
use crate::output::{FrontendPayload, FrontendReturner, JsonObject, Text, TreeUpdate, Update};
use crate::prompts;
use crate::tools::builtin::{
    FinalTextResponseTool, SummarizeTool, TextResponseTool, FINAL_TEXT_RESPONSE, TEXT_RESPONSE,
};
use crate::tools::retrieval::{AggregateTool, QueryTool};
use crate::tools::{Tool, ToolContext, ToolOutput};
use crate::tree::branches::{
    find_root, successive_actions, tree_view, BranchInitialisation, BASE_BRANCH, BASE_INSTRUCTION,
    ONE_BRANCH_INSTRUCTION, SEARCH_BRANCH, SEARCH_DESCRIPTION, SEARCH_INSTRUCTION,
};
use crate::tree::decision::{Decision, DecisionNode, DecisionOption, NodeChoices};
use crate::tree::tree_data::DECISION_NODE_TASK;
use crate::tree::{Atlas, CollectionData, TreeData};
use crate::weaviate::ClientManager;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default number of extra passes through the tree per query
pub const DEFAULT_RECURSION_LIMIT: usize = 5;

const RECURSION_LIMIT_WARNING: &str = "Decision tree reached recursion limit!";

/// One user query
#[derive(Debug, Clone, Default)]
pub struct ProcessRequest {
    pub user_prompt: String,
    /// Empty means every collection the client can see
    pub collection_names: Vec<String>,
    /// `/`-separated option names that replace the decision agent
    pub training_route: String,
    pub query_id: String,
}

impl ProcessRequest {
    pub fn new<S: Into<String>>(user_prompt: S) -> Self {
        Self {
            user_prompt: user_prompt.into(),
            query_id: uuid::Uuid::new_v4().to_string(),
            ..Default::default()
        }
    }

    pub fn with_collection_names(mut self, collection_names: Vec<String>) -> Self {
        self.collection_names = collection_names;
        self
    }

    pub fn with_training_route<S: Into<String>>(mut self, training_route: S) -> Self {
        self.training_route = training_route.into();
        self
    }

    pub fn with_query_id<S: Into<String>>(mut self, query_id: S) -> Self {
        self.query_id = query_id.into();
        self
    }
}

/// A branch to add with [`Tree::add_branch`]
#[derive(Debug, Clone)]
pub struct BranchSpec {
    pub id: String,
    pub instruction: String,
    /// Shown to the agent choosing this branch; required unless root
    pub description: String,
    pub root: bool,
    pub from_branch_id: Option<String>,
    pub status: Option<String>,
}

impl BranchSpec {
    pub fn root<I: Into<String>, S: Into<String>>(id: I, instruction: S) -> Self {
        Self {
            id: id.into(),
            instruction: instruction.into(),
            description: String::new(),
            root: true,
            from_branch_id: None,
            status: None,
        }
    }

    pub fn child<I, S, D, F>(id: I, instruction: S, description: D, from_branch_id: F) -> Self
    where
        I: Into<String>,
        S: Into<String>,
        D: Into<String>,
        F: Into<String>,
    {
        Self {
            id: id.into(),
            instruction: instruction.into(),
            description: description.into(),
            root: false,
            from_branch_id: Some(from_branch_id.into()),
            status: None,
        }
    }

    pub fn with_status<S: Into<String>>(mut self, status: S) -> Self {
        self.status = Some(status.into());
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TreeExport {
    user_id: String,
    conversation_id: String,
    branch_initialisation: BranchInitialisation,
    #[serde(default)]
    low_memory: bool,
    #[serde(default)]
    tree_index: Option<usize>,
    settings: Settings,
    tree_data: TreeData,
}

#[derive(Debug, Deserialize)]
struct FollowUps {
    #[serde(default)]
    suggestions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Title {
    title: String,
}

fn option_for_tool(tool: &dyn Tool) -> DecisionOption {
    let spec = tool.spec();
    DecisionOption {
        id: spec.name.clone(),
        description: spec.description.clone(),
        inputs: spec.inputs_json(),
        action: Some(spec.name.clone()),
        end: spec.end,
        status: spec.status.clone(),
        next: None,
    }
}

/// A decision tree answering queries for one conversation
pub struct Tree {
    pub user_id: String,
    pub conversation_id: String,
    /// Skip tree-data snapshots in the query history
    pub low_memory: bool,
    pub tree_data: TreeData,
    branch_initialisation: BranchInitialisation,
    settings: Settings,
    decision_nodes: BTreeMap<String, DecisionNode>,
    tools: HashMap<String, Arc<dyn Tool>>,
    root: Option<String>,
    tree_index: Option<usize>,
    query_id_to_prompt: BTreeMap<String, String>,
    prompt_to_query_id: BTreeMap<String, String>,
    decision_history: Vec<String>,
    action_information: Vec<JsonObject>,
    history: HistoryRecorder,
    client_manager: Arc<ClientManager>,
    base_lm: Option<Arc<dyn LlmClient>>,
    complex_lm: Option<Arc<dyn LlmClient>>,
    base_lm_timer: Arc<LmTimer>,
    complex_lm_timer: Arc<LmTimer>,
}

impl Tree {
    /// A tree with the default branch layout
    pub fn new(settings: Settings) -> Self {
        let mut tree = Self {
            user_id: uuid::Uuid::new_v4().to_string(),
            conversation_id: uuid::Uuid::new_v4().to_string(),
            low_memory: false,
            tree_data: TreeData::new(CollectionData::default(), Atlas::default())
                .with_recursion_limit(DEFAULT_RECURSION_LIMIT),
            branch_initialisation: BranchInitialisation::Default,
            client_manager: Arc::new(ClientManager::from_settings(&settings)),
            settings,
            decision_nodes: BTreeMap::new(),
            tools: HashMap::new(),
            root: None,
            tree_index: None,
            query_id_to_prompt: BTreeMap::new(),
            prompt_to_query_id: BTreeMap::new(),
            decision_history: Vec::new(),
            action_information: Vec::new(),
            history: HistoryRecorder::new(),
            base_lm: None,
            complex_lm: None,
            base_lm_timer: Arc::new(LmTimer::new("base_lm")),
            complex_lm_timer: Arc::new(LmTimer::new("complex_lm")),
        };
        tree.apply_initialisation(BranchInitialisation::Default);
        tree
    }

    pub fn with_ids<U: Into<String>, C: Into<String>>(mut self, user_id: U, conversation_id: C) -> Self {
        self.user_id = user_id.into();
        self.conversation_id = conversation_id.into();
        self
    }

    pub fn with_initialisation(mut self, initialisation: BranchInitialisation) -> Self {
        self.apply_initialisation(initialisation);
        self
    }

    /// Use these clients instead of building them from the settings
    pub fn with_lms(mut self, base: Arc<dyn LlmClient>, complex: Arc<dyn LlmClient>) -> Self {
        self.base_lm = Some(Arc::new(TimedLlmClient::new(base, self.base_lm_timer.clone())));
        self.complex_lm = Some(Arc::new(TimedLlmClient::new(complex, self.complex_lm_timer.clone())));
        self
    }

    pub fn with_client_manager(mut self, client_manager: Arc<ClientManager>) -> Self {
        self.client_manager = client_manager;
        self
    }

    pub fn with_atlas(mut self, atlas: Atlas) -> Self {
        self.tree_data.atlas = atlas;
        self
    }

    pub fn with_recursion_limit(mut self, recursion_limit: usize) -> Self {
        self.tree_data.recursion_limit = recursion_limit;
        self
    }

    pub fn with_low_memory(mut self, low_memory: bool) -> Self {
        self.low_memory = low_memory;
        self
    }

    /// Mirror the query history to a JSON file
    pub fn with_history_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.history = HistoryRecorder::with_file(path);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn client_manager(&self) -> &Arc<ClientManager> {
        &self.client_manager
    }

    /// Replace the settings; models are rebuilt on the next query.
    ///
    /// New cluster credentials give this tree its own client.
    pub fn set_settings(&mut self, settings: Settings) {
        if settings.wcd_url != self.settings.wcd_url
            || settings.wcd_api_key != self.settings.wcd_api_key
            || settings.api_keys != self.settings.api_keys
        {
            self.client_manager = Arc::new(ClientManager::from_settings(&settings));
        }
        self.settings = settings;
        self.base_lm = None;
        self.complex_lm = None;
    }

    pub fn branch_initialisation(&self) -> BranchInitialisation {
        self.branch_initialisation
    }

    pub fn tree_index(&self) -> Option<usize> {
        self.tree_index
    }

    pub fn history(&self) -> &HistoryRecorder {
        &self.history
    }

    pub fn base_lm_timer(&self) -> &LmTimer {
        &self.base_lm_timer
    }

    pub fn complex_lm_timer(&self) -> &LmTimer {
        &self.complex_lm_timer
    }

    pub fn query_prompt(&self, query_id: &str) -> Option<&str> {
        self.query_id_to_prompt.get(query_id).map(String::as_str)
    }

    /// Latest query id asked with `prompt`
    pub fn query_id(&self, prompt: &str) -> Option<&str> {
        self.prompt_to_query_id.get(prompt).map(String::as_str)
    }

    /// Tools run for the latest query, in order
    pub fn decision_history(&self) -> &[String] {
        &self.decision_history
    }

    pub fn branch(&self, branch_id: &str) -> Option<&DecisionNode> {
        self.decision_nodes.get(branch_id)
    }

    pub fn branch_ids(&self) -> Vec<&str> {
        self.decision_nodes.keys().map(String::as_str).collect()
    }

    pub fn tool(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Registered tool names, sorted
    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Nested view of the branches, `null` without a root
    pub fn tree(&self) -> Value {
        match &self.root {
            Some(root) => tree_view(&self.decision_nodes, root),
            None => Value::Null,
        }
    }

    /// Drop all branches and tools except the final responder
    pub fn clear_tree(&mut self) {
        self.decision_nodes.clear();
        self.tools.clear();
        self.root = None;
        let final_response: Arc<dyn Tool> = Arc::new(FinalTextResponseTool::new());
        self.tools.insert(FINAL_TEXT_RESPONSE.to_string(), final_response);
    }

    /// Rebuild the branches from a preset layout name
    pub fn set_branch_initialisation(&mut self, initialisation: &str) -> Result<()> {
        let initialisation = initialisation.parse()?;
        self.apply_initialisation(initialisation);
        Ok(())
    }

    fn apply_initialisation(&mut self, initialisation: BranchInitialisation) {
        self.clear_tree();
        self.branch_initialisation = initialisation;

        let text_response: Arc<dyn Tool> = Arc::new(TextResponseTool::new());
        let (base, tools): (DecisionNode, Vec<(String, Arc<dyn Tool>)>) = match initialisation {
            BranchInitialisation::Default | BranchInitialisation::MultiBranch => {
                let mut base = DecisionNode::new(BASE_BRANCH, BASE_INSTRUCTION, true);
                let mut search = DecisionNode::new(SEARCH_BRANCH, SEARCH_INSTRUCTION, false);
                let query: Arc<dyn Tool> = Arc::new(QueryTool::new());
                let aggregate: Arc<dyn Tool> = Arc::new(AggregateTool::new());
                search.add_option(option_for_tool(query.as_ref()));
                search.add_option(option_for_tool(aggregate.as_ref()));
                self.decision_nodes.insert(SEARCH_BRANCH.to_string(), search);

                let summarize: Arc<dyn Tool> = Arc::new(SummarizeTool::new());
                base.add_option(option_for_tool(summarize.as_ref()));
                base.add_option(option_for_tool(text_response.as_ref()));
                base.add_option(DecisionOption {
                    id: SEARCH_BRANCH.to_string(),
                    description: SEARCH_DESCRIPTION.to_string(),
                    inputs: Value::Object(JsonObject::new()),
                    action: None,
                    end: false,
                    status: "Searching the knowledge base...".to_string(),
                    next: Some(SEARCH_BRANCH.to_string()),
                });
                (
                    base,
                    vec![
                        (SEARCH_BRANCH.to_string(), query),
                        (SEARCH_BRANCH.to_string(), aggregate),
                        (BASE_BRANCH.to_string(), summarize),
                        (BASE_BRANCH.to_string(), text_response),
                    ],
                )
            }
            BranchInitialisation::OneBranch => {
                let mut base = DecisionNode::new(BASE_BRANCH, ONE_BRANCH_INSTRUCTION, true);
                let tools: Vec<Arc<dyn Tool>> = vec![
                    Arc::new(QueryTool::new()),
                    Arc::new(AggregateTool::new()),
                    Arc::new(SummarizeTool::new()),
                    text_response,
                ];
                for tool in &tools {
                    base.add_option(option_for_tool(tool.as_ref()));
                }
                (
                    base,
                    tools.into_iter().map(|t| (BASE_BRANCH.to_string(), t)).collect(),
                )
            }
            BranchInitialisation::Empty => {
                let mut base = DecisionNode::new(BASE_BRANCH, ONE_BRANCH_INSTRUCTION, true);
                base.add_option(option_for_tool(text_response.as_ref()));
                (base, vec![(BASE_BRANCH.to_string(), text_response)])
            }
        };

        self.decision_nodes.insert(BASE_BRANCH.to_string(), base);
        for (_, tool) in tools {
            self.tools.insert(tool.name().to_string(), tool);
        }
        self.root = Some(BASE_BRANCH.to_string());
    }

    /// Attach a tool to a branch
    pub fn add_tool(&mut self, branch_id: &str, tool: Arc<dyn Tool>) -> Result<()> {
        let node = self
            .decision_nodes
            .get_mut(branch_id)
            .ok_or_else(|| TreeError::BranchNotFound {
                branch_id: branch_id.to_string(),
            })?;
        node.add_option(option_for_tool(tool.as_ref()));
        self.tools.insert(tool.name().to_string(), tool);
        Ok(())
    }

    /// Detach a tool from a branch; it is forgotten once no branch uses it
    pub fn remove_tool(&mut self, branch_id: &str, tool_name: &str) -> Result<()> {
        let node = self
            .decision_nodes
            .get_mut(branch_id)
            .ok_or_else(|| TreeError::BranchNotFound {
                branch_id: branch_id.to_string(),
            })?;
        if node.remove_option(tool_name).is_none() {
            return Err(ToolError::NotFound {
                name: tool_name.to_string(),
            }
            .into());
        }

        let still_used = self
            .decision_nodes
            .values()
            .any(|n| n.options.iter().any(|o| o.action.as_deref() == Some(tool_name)));
        if !still_used && tool_name != FINAL_TEXT_RESPONSE {
            self.tools.remove(tool_name);
        }
        Ok(())
    }

    pub fn add_branch(&mut self, spec: BranchSpec) -> Result<()> {
        if spec.root {
            if let Some(existing) = self.root.as_ref().filter(|r| **r != spec.id) {
                return Err(TreeError::MultipleRoots {
                    first: existing.clone(),
                    second: spec.id,
                }
                .into());
            }
            if !spec.description.is_empty() || spec.from_branch_id.is_some() {
                tracing::warn!(
                    "Description and from_branch_id are not used for the root branch '{}'",
                    spec.id
                );
            }
        } else {
            if spec.description.is_empty() {
                return Err(TreeError::InvalidBranch {
                    message: "Description is required for non-root branches.".to_string(),
                }
                .into());
            }
            let Some(from) = spec.from_branch_id.as_deref().filter(|f| !f.is_empty()) else {
                return Err(TreeError::InvalidBranch {
                    message: "`from_branch_id` is required for non-root branches.".to_string(),
                }
                .into());
            };
            let parent = self
                .decision_nodes
                .get_mut(from)
                .ok_or_else(|| TreeError::BranchNotFound {
                    branch_id: from.to_string(),
                })?;
            parent.add_option(DecisionOption {
                id: spec.id.clone(),
                description: spec.description.clone(),
                inputs: Value::Object(JsonObject::new()),
                action: None,
                end: false,
                status: spec
                    .status
                    .clone()
                    .unwrap_or_else(|| format!("Running {}", spec.id)),
                next: Some(spec.id.clone()),
            });
        }

        if spec.root {
            self.root = Some(spec.id.clone());
        }
        self.decision_nodes.insert(
            spec.id.clone(),
            DecisionNode::new(spec.id, spec.instruction, spec.root),
        );
        Ok(())
    }

    /// Remove a branch and every option leading to it
    pub fn remove_branch(&mut self, branch_id: &str) -> Result<()> {
        if self.decision_nodes.remove(branch_id).is_none() {
            return Err(TreeError::BranchNotFound {
                branch_id: branch_id.to_string(),
            }
            .into());
        }
        for node in self.decision_nodes.values_mut() {
            node.options.retain(|o| o.next.as_deref() != Some(branch_id));
        }
        if self.root.as_deref() == Some(branch_id) {
            self.root = None;
        }
        Ok(())
    }

    /// Remove branches without options, and the options that lead to them
    fn remove_empty_branches(&mut self) -> Vec<String> {
        let empty: Vec<String> = self
            .decision_nodes
            .values()
            .filter(|n| n.options.is_empty() && !n.root)
            .map(|n| n.id.clone())
            .collect();

        for branch_id in &empty {
            tracing::warn!(
                "Removing empty branch: {}. No tools are attached to this branch, so it has been removed.",
                branch_id
            );
            self.decision_nodes.remove(branch_id);
            for node in self.decision_nodes.values_mut() {
                node.options.retain(|o| o.next.as_deref() != Some(branch_id.as_str()));
            }
        }
        empty
    }

    pub fn change_style<S: Into<String>>(&mut self, style: S) {
        self.tree_data.atlas.style = style.into();
    }

    pub fn change_agent_description<S: Into<String>>(&mut self, agent_description: S) {
        self.tree_data.atlas.agent_description = agent_description.into();
    }

    pub fn change_end_goal<S: Into<String>>(&mut self, end_goal: S) {
        self.tree_data.atlas.end_goal = end_goal.into();
    }

    /// Base and complex clients, built from the settings on first use
    fn lms(&mut self) -> Result<(Arc<dyn LlmClient>, Arc<dyn LlmClient>)> {
        let base = match &self.base_lm {
            Some(lm) => lm.clone(),
            None => {
                let lm: Arc<dyn LlmClient> = Arc::new(TimedLlmClient::new(
                    self.settings.base_lm()?,
                    self.base_lm_timer.clone(),
                ));
                self.base_lm = Some(lm.clone());
                lm
            }
        };
        let complex = match &self.complex_lm {
            Some(lm) => lm.clone(),
            None => {
                let lm: Arc<dyn LlmClient> = Arc::new(TimedLlmClient::new(
                    self.settings.complex_lm()?,
                    self.complex_lm_timer.clone(),
                ));
                self.complex_lm = Some(lm.clone());
                lm
            }
        };
        Ok((base, complex))
    }

    fn soft_reset(&mut self) {
        self.tree_data.num_trees_completed = 0;
        self.tree_data.soft_reset();
        self.decision_history.clear();
        self.action_information.clear();
        self.tree_index = Some(self.tree_index.map_or(0, |i| i + 1));
    }

    fn returner(&self, query_id: &str) -> FrontendReturner {
        FrontendReturner::new(
            &self.user_id,
            &self.conversation_id,
            query_id,
            self.tree_index.unwrap_or_default(),
        )
    }

    /// Prepare tree state for a new prompt; returns the training route
    async fn start_query(&mut self, request: &ProcessRequest) -> Result<VecDeque<String>> {
        self.soft_reset();

        self.query_id_to_prompt
            .insert(request.query_id.clone(), request.user_prompt.clone());
        self.prompt_to_query_id
            .insert(request.user_prompt.clone(), request.query_id.clone());
        self.tree_data.user_prompt = request.user_prompt.clone();
        self.tree_data
            .update_conversation_history("user", &request.user_prompt);
        self.tree_data.atlas.refresh_datetime();

        let mut collection_names = request.collection_names.clone();
        if collection_names.is_empty() && self.client_manager.is_client() {
            collection_names = self.client_manager.list_collections().await?;
        }
        let collection_names: Vec<String> =
            collection_names.iter().map(|c| c.to_lowercase()).collect();
        self.tree_data
            .set_collection_names(&collection_names, &self.client_manager)
            .await?;

        self.remove_empty_branches();

        if self.base_lm.is_none() || self.complex_lm.is_none() {
            self.settings.check_base_lm()?;
            self.settings.check_complex_lm()?;
        }

        Ok(request
            .training_route
            .split('/')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Defaults for missing inputs; `{value: x}` inputs become `x`
    fn function_inputs(&self, tool_name: &str, mut inputs: JsonObject) -> JsonObject {
        let Some(tool) = self.tools.get(tool_name) else {
            return JsonObject::new();
        };
        for (name, default) in tool.get_default_inputs() {
            inputs.entry(name).or_insert(default);
        }
        for value in inputs.values_mut() {
            if let Value::Object(obj) = value {
                if let Some(inner) = obj.get("value").cloned() {
                    *value = inner;
                }
            }
        }
        inputs
    }

    /// Which options of `node` the agent may pick right now
    async fn node_choices(&self, node: &DecisionNode) -> NodeChoices {
        let mut choices = NodeChoices {
            successive_actions: successive_actions(&self.decision_nodes, &node.id),
            ..Default::default()
        };
        for option in &node.options {
            let Some(tool_name) = option.action.as_deref() else {
                match &option.next {
                    Some(next) if !self.branch_available(next).await => {
                        choices.unavailable.insert(
                            option.id.clone(),
                            "None of the tools in this branch can run right now.".to_string(),
                        );
                    }
                    _ => choices.available.push(option.id.clone()),
                }
                continue;
            };
            match self.tools.get(tool_name) {
                Some(tool) if tool.is_tool_available(&self.tree_data, &self.client_manager).await => {
                    choices.available.push(option.id.clone());
                }
                Some(tool) => {
                    choices
                        .unavailable
                        .insert(option.id.clone(), tool.spec().available_at.clone());
                }
                None => {
                    tracing::warn!("Option {} refers to unknown tool {}", option.id, tool_name);
                }
            }
        }
        choices
    }

    /// Whether any tool below `branch_id` is available
    async fn branch_available(&self, branch_id: &str) -> bool {
        let mut pending = vec![branch_id.to_string()];
        let mut seen = HashSet::new();
        while let Some(id) = pending.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            let Some(node) = self.decision_nodes.get(&id) else {
                continue;
            };
            for option in &node.options {
                if let Some(next) = &option.next {
                    pending.push(next.clone());
                }
                let Some(tool) = option.action.as_deref().and_then(|name| self.tools.get(name)) else {
                    continue;
                };
                if tool.is_tool_available(&self.tree_data, &self.client_manager).await {
                    return true;
                }
            }
        }
        false
    }

    /// Fold one tool output into the tree state; returns what to stream back
    fn evaluate_output(
        &mut self,
        tool_name: &str,
        output: ToolOutput,
        returner: &FrontendReturner,
    ) -> Option<FrontendPayload> {
        let prompt = self.tree_data.user_prompt.clone();
        let iteration = self.tree_data.num_trees_completed;

        match output {
            ToolOutput::Result(result) => {
                self.tree_data.environment.add(tool_name, &result, false);

                let mut information = JsonObject::new();
                information.insert("action_name".into(), tool_name.into());
                information.extend(result.metadata.clone());
                self.action_information.push(information);

                let mut fields = JsonObject::new();
                fields.insert("parsed_info".into(), result.llm_parse().into());
                fields.insert("action".into(), Value::Bool(true));
                self.tree_data
                    .update_tasks_completed(&prompt, tool_name, iteration, fields);

                returner.result(&result)
            }
            ToolOutput::Text(text) => {
                self.tree_data
                    .update_conversation_history("assistant", &text.content());
                Some(returner.text(&text))
            }
            ToolOutput::Update(update) => {
                if let Update::Error { text } = &update {
                    tracing::warn!("Tool {} reported an error: {}", tool_name, text);
                    self.tree_data.add_error(tool_name, text.clone());
                    let mut fields = JsonObject::new();
                    fields.insert("error".into(), Value::Bool(true));
                    self.tree_data
                        .update_tasks_completed(&prompt, tool_name, iteration, fields);
                }
                Some(returner.update(&update))
            }
            ToolOutput::TreeUpdate(update) => Some(returner.tree_update(&update, false)),
        }
    }

    /// Run a tool against a snapshot of the tree data, folding its outputs back in
    fn run_tool(
        &mut self,
        tool: Arc<dyn Tool>,
        inputs: JsonObject,
        reasoning: String,
        returner: FrontendReturner,
        lms: (Arc<dyn LlmClient>, Arc<dyn LlmClient>),
    ) -> BoxStream<'_, FrontendPayload> {
        Box::pin(async_stream::stream! {
            let tool_name = tool.name().to_string();
            let prompt = self.tree_data.user_prompt.clone();
            let iteration = self.tree_data.num_trees_completed;

            let mut fields = JsonObject::new();
            fields.insert("reasoning".into(), reasoning.clone().into());
            fields.insert("inputs".into(), Value::Object(inputs.clone()));
            self.tree_data.update_tasks_completed(&prompt, &tool_name, iteration, fields);
            self.tree_data.previous_reasoning.insert(tool_name.clone(), reasoning);
            self.tree_data.set_current_task(tool_name.clone());

            let ctx = ToolContext::new(
                Arc::new(self.tree_data.clone()),
                inputs,
                lms.0,
                lms.1,
                self.client_manager.clone(),
            );

            tracing::info!("Running tool: {}", tool_name);
            let mut outputs = tool.call(ctx);
            let mut errored = false;
            while let Some(output) = outputs.next().await {
                let output = output.unwrap_or_else(|e| {
                    tracing::error!("Tool {} failed: {}", tool_name, e);
                    ToolOutput::error(e.to_string())
                });
                if matches!(output, ToolOutput::Update(Update::Error { .. })) {
                    errored = true;
                }
                if let Some(payload) = self.evaluate_output(&tool_name, output, &returner) {
                    yield payload;
                }
            }

            if !errored {
                self.tree_data.clear_error(&tool_name);
            }
        })
    }

    /// Answer a prompt, streaming frontend payloads as the tree works
    pub fn process(&mut self, request: ProcessRequest) -> BoxStream<'_, Result<FrontendPayload>> {
        Box::pin(async_stream::stream! {
            let started = Instant::now();

            let mut route = match self.start_query(&request).await {
                Ok(route) => route,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let lms = match self.lms() {
                Ok(lms) => lms,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            if !route.is_empty() {
                tracing::info!("Route that will be used: {:?}", route);
            }
            tracing::info!("User prompt: {}", request.user_prompt);

            let returner = self.returner(&request.query_id);
            let mut rules_fired: HashSet<String> = HashSet::new();

            loop {
                let Some(mut node_id) = self.root.clone() else {
                    yield Err(Error::from(TreeError::NoRoot));
                    return;
                };
                let mut completed;
                let mut force_text_response;
                let mut last_option_end;

                loop {
                    let Some(node) = self.decision_nodes.get(&node_id).cloned() else {
                        yield Err(Error::from(TreeError::BranchNotFound { branch_id: node_id }));
                        return;
                    };

                    // rules fire at most once per prompt, before the agent decides
                    for option in &node.options {
                        let Some(tool) = option
                            .action
                            .as_deref()
                            .filter(|name| !rules_fired.contains(*name))
                            .and_then(|name| self.tools.get(name).cloned())
                        else {
                            continue;
                        };
                        let (fire, rule_inputs) = tool.run_if_true(&self.tree_data, &self.client_manager).await;
                        if !fire {
                            continue;
                        }
                        rules_fired.insert(tool.name().to_string());
                        let mut inputs = tool.get_default_inputs();
                        inputs.extend(rule_inputs);
                        let reasoning = format!("Rule for {} was met", tool.name());
                        {
                            let mut run = self.run_tool(tool, inputs, reasoning, returner.clone(), lms.clone());
                            while let Some(payload) = run.next().await {
                                yield Ok(payload);
                            }
                        }
                    }

                    self.tree_data.set_current_task(DECISION_NODE_TASK);
                    let decided: Result<Decision> = if !route.is_empty() {
                        node.decide_from_route(&mut route)
                    } else {
                        let choices = self.node_choices(&node).await;
                        node.decide(&self.tree_data, lms.0.as_ref(), &choices).await
                    };
                    let decision = match decided {
                        Ok(decision) => decision,
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    };
                    let Some(option) = node.option(&decision.function_name).cloned() else {
                        yield Err(Error::from(TreeError::InvalidDecision {
                            node: node.id.clone(),
                            function_name: decision.function_name.clone(),
                        }));
                        return;
                    };

                    // the agent wants to stop, but this option will not answer the user
                    force_text_response = !option.end && decision.end_actions;
                    last_option_end = option.end;
                    let last_in_tree = option.next.is_none();

                    yield Ok(returner.tree_update(
                        &TreeUpdate::new(&node.id, &decision.function_name, &decision.reasoning, true),
                        last_in_tree,
                    ));
                    yield Ok(returner.update(&Update::status(option.status.clone())));
                    if decision.function_name != TEXT_RESPONSE && !decision.message_update.is_empty() {
                        let text = Text::response(decision.message_update.clone());
                        self.tree_data.update_conversation_history("assistant", &text.content());
                        yield Ok(returner.text(&text));
                    }

                    let inputs = self.function_inputs(&decision.function_name, decision.function_inputs.clone());

                    completed = decision.function_name == TEXT_RESPONSE || decision.end_actions;
                    if self.tree_data.num_trees_completed > self.tree_data.recursion_limit {
                        tracing::warn!(
                            "Recursion limit reached! ({})",
                            self.tree_data.num_trees_completed
                        );
                        yield Ok(returner.update(&Update::warning(RECURSION_LIMIT_WARNING)));
                        completed = true;
                    }

                    if decision.impossible {
                        tracing::info!("Decision agent judged the task impossible: {}", decision.reasoning);
                        completed = true;
                        force_text_response = true;
                        break;
                    }

                    tracing::debug!(
                        "Node: {} Decision: {} Reasoning: {}",
                        node.id,
                        decision.function_name,
                        decision.reasoning
                    );
                    self.decision_history.push(decision.function_name.clone());

                    if let Some(tool_name) = option.action.as_deref() {
                        let Some(tool) = self.tools.get(tool_name).cloned() else {
                            yield Err(Error::from(ToolError::NotFound { name: tool_name.to_string() }));
                            return;
                        };
                        {
                            let mut run = self.run_tool(
                                tool,
                                inputs,
                                decision.reasoning.clone(),
                                returner.clone(),
                                lms.clone(),
                            );
                            while let Some(payload) = run.next().await {
                                yield Ok(payload);
                            }
                        }
                    }

                    match option.next {
                        Some(next) if !completed => node_id = next,
                        _ => break,
                    }
                }

                self.tree_data.num_trees_completed += 1;
                if !completed {
                    tracing::debug!(
                        "Restarting tree (Recursion: {}/{})...",
                        self.tree_data.num_trees_completed,
                        self.tree_data.recursion_limit
                    );
                    continue;
                }

                if !last_option_end || force_text_response {
                    if let Some(tool) = self.tools.get(FINAL_TEXT_RESPONSE).cloned() {
                        let mut run = self.run_tool(
                            tool,
                            JsonObject::new(),
                            "Respond to the user with what has been found".to_string(),
                            returner.clone(),
                            lms.clone(),
                        );
                        while let Some(payload) = run.next().await {
                            yield Ok(payload);
                        }
                    }
                }

                if let Err(e) = self.save_history(&request.query_id, started.elapsed()).await {
                    tracing::warn!("Failed to save history for {}: {}", request.query_id, e);
                }
                yield Ok(returner.update(&Update::Completed));

                tracing::info!("Model identified overall goal as completed!");
                tracing::debug!("Time taken: {:.2} seconds", started.elapsed().as_secs_f64());
                tracing::info!("Tasks completed: {:?}", self.decision_history);
                break;
            }
        })
    }

    /// Record what the tree did for `query_id`
    pub async fn save_history(&self, query_id: &str, elapsed: Duration) -> Result<()> {
        let model = |lm: &Option<Arc<dyn LlmClient>>, configured: &Option<String>| {
            lm.as_ref()
                .map(|lm| lm.model_name().to_string())
                .or_else(|| configured.clone())
                .unwrap_or_default()
        };

        let entry = QueryHistory {
            query_id: query_id.to_string(),
            user_prompt: self
                .query_id_to_prompt
                .get(query_id)
                .cloned()
                .unwrap_or_default(),
            num_trees_completed: self.tree_data.num_trees_completed,
            tree_data: (!self.low_memory).then(|| self.tree_data.to_json()),
            action_information: self.action_information.clone(),
            decision_history: self.decision_history.clone(),
            base_lm_used: model(&self.base_lm, &self.settings.base_model),
            complex_lm_used: model(&self.complex_lm, &self.settings.complex_model),
            time_taken_seconds: elapsed.as_secs_f64(),
            initialisation: self.branch_initialisation.to_string(),
            recorded_at: chrono::Utc::now(),
        };
        self.history.record(entry).await
    }

    /// Suggest questions the user might ask next
    pub async fn get_follow_up_suggestions(
        &mut self,
        context: Option<&str>,
        num_suggestions: usize,
    ) -> Result<Vec<String>> {
        let (base, _) = self.lms()?;
        let mut data = prompts::tree_context(&self.tree_data);
        data.insert("context".into(), context.unwrap_or("").into());
        data.insert("num_suggestions".into(), num_suggestions.into());

        let messages = prompts::messages(&self.tree_data.atlas, prompts::FOLLOW_UP, &data)?;
        let reply: FollowUps = complete_json(base.as_ref(), messages, None).await?;
        Ok(reply.suggestions.into_iter().take(num_suggestions).collect())
    }

    /// Short title for the conversation so far
    pub async fn create_conversation_title(&mut self) -> Result<String> {
        let (base, _) = self.lms()?;
        let data = prompts::tree_context(&self.tree_data);
        let messages = prompts::messages(&self.tree_data.atlas, prompts::TITLE, &data)?;
        let reply: Title = complete_json(base.as_ref(), messages, None).await?;
        Ok(reply.title.trim().to_string())
    }

    /// Serialisable state: ids, layout, settings and tree data.
    ///
    /// Custom tools are not exported; an imported tree gets its preset layout back.
    pub fn export_to_json(&self) -> Result<Value> {
        let export = TreeExport {
            user_id: self.user_id.clone(),
            conversation_id: self.conversation_id.clone(),
            branch_initialisation: self.branch_initialisation,
            low_memory: self.low_memory,
            tree_index: self.tree_index,
            settings: self.settings.clone(),
            tree_data: self.tree_data.clone(),
        };
        Ok(serde_json::to_value(export)?)
    }

    pub fn import_from_json(value: Value) -> Result<Self> {
        let export: TreeExport =
            serde_json::from_value(value).map_err(|e| TreeError::InvalidExport {
                message: e.to_string(),
            })?;

        let mut tree = Tree::new(export.settings)
            .with_initialisation(export.branch_initialisation)
            .with_ids(export.user_id, export.conversation_id)
            .with_low_memory(export.low_memory);
        tree.tree_data = export.tree_data;
        tree.tree_index = export.tree_index;
        Ok(tree)
    }

    /// Export to a JSON file
    pub async fn export_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, serde_json::to_string_pretty(&self.export_to_json()?)?).await?;
        Ok(())
    }

    pub async fn import_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::import_from_json(serde_json::from_str(&content)?)
    }

    /// Root branch id, checked against the branches
    pub fn root(&self) -> Result<String> {
        find_root(&self.decision_nodes)
    }
}
