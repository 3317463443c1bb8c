//! Decision nodes: one branch of the tree and the agent that picks among its options

use crate::error::{Result, TreeError};
use crate::llm::{complete_json, LlmClient};
use crate::output::JsonObject;
use crate::prompts;
use crate::tree::TreeData;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};

/// One choice at a decision node: a tool, or a sub-branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionOption {
    pub id: String,
    pub description: String,
    /// Input schema shown to the agent
    #[serde(default)]
    pub inputs: Value,
    /// Tool run when chosen; `None` for branches
    #[serde(default)]
    pub action: Option<String>,
    /// Whether the tree may stop after this option
    pub end: bool,
    pub status: String,
    /// Branch entered after this option
    #[serde(default)]
    pub next: Option<String>,
}

/// A branch of the tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionNode {
    pub id: String,
    pub instruction: String,
    #[serde(default)]
    pub root: bool,
    /// In insertion order
    #[serde(default)]
    pub options: Vec<DecisionOption>,
}

fn object_or_empty<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<JsonObject, D::Error> {
    Ok(Option::<JsonObject>::deserialize(deserializer)?.unwrap_or_default())
}

/// What the decision agent chose
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub function_name: String,
    #[serde(default, deserialize_with = "object_or_empty")]
    pub function_inputs: JsonObject,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub impossible: bool,
    #[serde(default)]
    pub end_actions: bool,
    #[serde(default)]
    pub message_update: String,
}

/// Options the agent may see at a node
#[derive(Debug, Clone, Default)]
pub struct NodeChoices {
    pub available: Vec<String>,
    /// option -> why it cannot be picked
    pub unavailable: BTreeMap<String, String>,
    /// option -> what it leads to
    pub successive_actions: Value,
}

impl DecisionNode {
    pub fn new<I: Into<String>, S: Into<String>>(id: I, instruction: S, root: bool) -> Self {
        Self {
            id: id.into(),
            instruction: instruction.into(),
            root,
            options: Vec::new(),
        }
    }

    /// Add or replace an option
    pub fn add_option(&mut self, option: DecisionOption) {
        match self.options.iter_mut().find(|o| o.id == option.id) {
            Some(existing) => *existing = option,
            None => self.options.push(option),
        }
    }

    pub fn remove_option(&mut self, id: &str) -> Option<DecisionOption> {
        let index = self.options.iter().position(|o| o.id == id)?;
        Some(self.options.remove(index))
    }

    pub fn option(&self, id: &str) -> Option<&DecisionOption> {
        self.options.iter().find(|o| o.id == id)
    }

    pub fn option_ids(&self) -> Vec<String> {
        self.options.iter().map(|o| o.id.clone()).collect()
    }

    /// Options in the shape shown to the agent
    fn options_json(&self, ids: &[String]) -> Value {
        let options: JsonObject = self
            .options
            .iter()
            .filter(|o| ids.contains(&o.id))
            .map(|o| {
                (
                    o.id.clone(),
                    json!({
                        "function_name": o.id,
                        "description": o.description,
                        "inputs": o.inputs,
                    }),
                )
            })
            .collect();
        Value::Object(options)
    }

    /// Take the next step of a training route instead of asking the agent
    pub fn decide_from_route(&self, route: &mut VecDeque<String>) -> Result<Decision> {
        let options = self.option_ids();
        let step = route.pop_front().unwrap_or_default();
        if !options.contains(&step) {
            return Err(TreeError::InvalidRoute { step, options }.into());
        }

        let remaining: Vec<&str> = route.iter().map(String::as_str).collect();
        Ok(Decision {
            reasoning: format!("Decided to run {} from route {:?}", step, remaining),
            function_name: step,
            function_inputs: JsonObject::new(),
            impossible: false,
            end_actions: route.is_empty(),
            message_update: String::new(),
        })
    }

    /// Ask the decision agent to pick one of `choices.available`
    pub async fn decide(
        &self,
        tree_data: &TreeData,
        lm: &dyn LlmClient,
        choices: &NodeChoices,
    ) -> Result<Decision> {
        if choices.available.is_empty() {
            return Err(TreeError::NoOptions {
                node: self.id.clone(),
            }
            .into());
        }

        let mut data = prompts::tree_context(tree_data);
        data.insert("instruction".into(), self.instruction.clone().into());
        data.insert(
            "available_actions".into(),
            prompts::to_prompt_json(&self.options_json(&choices.available)).into(),
        );
        data.insert(
            "unavailable_actions".into(),
            prompts::to_prompt_json(&choices.unavailable).into(),
        );
        data.insert(
            "successive_actions".into(),
            prompts::to_prompt_json(&choices.successive_actions).into(),
        );
        data.insert(
            "previous_errors".into(),
            prompts::to_prompt_json(&tree_data.get_errors()).into(),
        );

        let messages = prompts::messages(&tree_data.atlas, prompts::DECISION, &data)?;
        let mut decision: Decision = complete_json(lm, messages, None).await?;

        let option = self
            .option(&decision.function_name)
            .filter(|o| choices.available.contains(&o.id))
            .ok_or_else(|| TreeError::InvalidDecision {
                node: self.id.clone(),
                function_name: decision.function_name.clone(),
            })?;
        decision.end_actions = decision.end_actions && option.end;

        tracing::debug!(
            "Decision at {}: {} ({})",
            self.id,
            decision.function_name,
            decision.reasoning
        );
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::llm::mock::MockLlmClient;

    fn option(id: &str, end: bool, next: Option<&str>) -> DecisionOption {
        DecisionOption {
            id: id.to_string(),
            description: format!("{} description", id),
            inputs: json!({}),
            action: if next.is_some() { None } else { Some(id.to_string()) },
            end,
            status: format!("Running {}...", id),
            next: next.map(str::to_string),
        }
    }

    fn node() -> DecisionNode {
        let mut node = DecisionNode::new("base", "Choose a tool", true);
        node.add_option(option("text_response", true, None));
        node.add_option(option("search", false, Some("search")));
        node
    }

    fn choices(available: &[&str]) -> NodeChoices {
        NodeChoices {
            available: available.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_options_keep_insertion_order() {
        let mut node = node();
        node.add_option(option("text_response", false, None));
        assert_eq!(node.option_ids(), vec!["text_response", "search"]);
        assert!(!node.option("text_response").unwrap().end);

        assert!(node.remove_option("search").is_some());
        assert!(node.remove_option("search").is_none());
    }

    #[test]
    fn test_decide_from_route() {
        let node = node();
        let mut route: VecDeque<String> = ["search", "query"].iter().map(|s| s.to_string()).collect();

        let decision = node.decide_from_route(&mut route).unwrap();
        assert_eq!(decision.function_name, "search");
        assert!(!decision.end_actions);
        assert_eq!(route.len(), 1);

        let mut route: VecDeque<String> = VecDeque::from(vec!["text_response".to_string()]);
        assert!(node.decide_from_route(&mut route).unwrap().end_actions);

        let mut route: VecDeque<String> = VecDeque::from(vec!["nope".to_string()]);
        let err = node.decide_from_route(&mut route).unwrap_err();
        assert!(matches!(err, Error::Tree(TreeError::InvalidRoute { .. })));
    }

    #[tokio::test]
    async fn test_decide_ands_end_flag() {
        let lm = MockLlmClient::with_json_replies([json!({
            "function_name": "search",
            "function_inputs": null,
            "reasoning": "need data",
            "impossible": false,
            "end_actions": true,
            "message_update": "Looking..."
        })]);

        let decision = node()
            .decide(&TreeData::default(), &lm, &choices(&["text_response", "search"]))
            .await
            .unwrap();

        assert_eq!(decision.function_name, "search");
        assert!(decision.function_inputs.is_empty());
        assert!(!decision.end_actions);
        assert!(lm.prompt_of(0).contains("Choose a tool"));
    }

    #[tokio::test]
    async fn test_decide_rejects_unavailable_choice() {
        let lm = MockLlmClient::with_json_replies([json!({"function_name": "search"})]);
        let err = node()
            .decide(&TreeData::default(), &lm, &choices(&["text_response"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Tree(TreeError::InvalidDecision { .. })));
    }

    #[tokio::test]
    async fn test_decide_without_options() {
        let lm = MockLlmClient::new();
        let err = node()
            .decide(&TreeData::default(), &lm, &choices(&[]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Tree(TreeError::NoOptions { .. })));
        assert_eq!(lm.num_calls(), 0);
    }
}
