//! Preset tree layouts and the tree view

use crate::error::{Result, TreeError};
use crate::tree::decision::DecisionNode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const BASE_BRANCH: &str = "base";
pub const SEARCH_BRANCH: &str = "search";

pub const BASE_INSTRUCTION: &str = "Choose a base-level task based on the user's prompt and available information. \
    You can search, which includes aggregating or querying information, if you need to retrieve \
    information from the collections. Summarise if the environment already holds what the user \
    needs. Respond directly if no more actions are needed.";

pub const ONE_BRANCH_INSTRUCTION: &str = "Choose a task based on the user's prompt and the available information. \
    Use the tools to retrieve or aggregate data when needed, and respond to the user once the \
    request is answered.";

pub const SEARCH_INSTRUCTION: &str = "Choose between querying the knowledge base with a search, or aggregating \
    information with statistics over the collections.";

pub const SEARCH_DESCRIPTION: &str = "Search the knowledge base. Querying retrieves specific objects, \
    aggregation computes statistics over a collection. Choose this when the user's request needs data \
    that is not already in the environment.";

/// Preset layout of branches and tools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchInitialisation {
    /// Base branch with summarize and text_response, plus a search branch with query and aggregate
    #[default]
    Default,
    /// Same layout as `Default`
    MultiBranch,
    /// Every tool on the base branch
    OneBranch,
    /// Base branch with text_response only
    Empty,
}

impl BranchInitialisation {
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchInitialisation::Default => "default",
            BranchInitialisation::MultiBranch => "multi_branch",
            BranchInitialisation::OneBranch => "one_branch",
            BranchInitialisation::Empty => "empty",
        }
    }
}

impl FromStr for BranchInitialisation {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "default" => Ok(BranchInitialisation::Default),
            "multi_branch" => Ok(BranchInitialisation::MultiBranch),
            "one_branch" => Ok(BranchInitialisation::OneBranch),
            "empty" => Ok(BranchInitialisation::Empty),
            other => Err(TreeError::UnknownInitialisation {
                name: other.to_string(),
            }
            .into()),
        }
    }
}

impl fmt::Display for BranchInitialisation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single root branch, if there is exactly one
pub fn find_root(nodes: &BTreeMap<String, DecisionNode>) -> Result<String> {
    let mut roots = nodes.values().filter(|n| n.root);
    let Some(first) = roots.next() else {
        return Err(TreeError::NoRoot.into());
    };
    if let Some(second) = roots.next() {
        return Err(TreeError::MultipleRoots {
            first: first.id.clone(),
            second: second.id.clone(),
        }
        .into());
    }
    Ok(first.id.clone())
}

fn title_case(id: &str) -> String {
    id.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Nested view of the tree from `node_id`, as shown in the frontend
pub fn tree_view(nodes: &BTreeMap<String, DecisionNode>, node_id: &str) -> Value {
    fn build(nodes: &BTreeMap<String, DecisionNode>, node_id: &str, description: &str, depth: usize) -> Value {
        let Some(node) = nodes.get(node_id) else {
            return Value::Null;
        };
        let mut options = serde_json::Map::new();
        for option in &node.options {
            let child = match &option.next {
                // a branch pointing back up would recurse forever
                Some(next) if depth < nodes.len() => build(nodes, next, &option.description, depth + 1),
                _ => json!({
                    "name": title_case(&option.id),
                    "id": option.id,
                    "description": option.description,
                    "instruction": "",
                    "reasoning": "",
                    "options": {},
                }),
            };
            options.insert(option.id.clone(), child);
        }
        json!({
            "name": title_case(&node.id),
            "id": node.id,
            "description": description,
            "instruction": node.instruction,
            "reasoning": "",
            "options": options,
        })
    }

    build(nodes, node_id, "", 0)
}

/// For each option of `node_id` that leads to a branch, the options of that branch, recursively
pub fn successive_actions(nodes: &BTreeMap<String, DecisionNode>, node_id: &str) -> Value {
    fn build(nodes: &BTreeMap<String, DecisionNode>, node_id: &str, depth: usize) -> Value {
        let mut out = serde_json::Map::new();
        let Some(node) = nodes.get(node_id) else {
            return Value::Object(out);
        };
        for option in &node.options {
            if let Some(next) = option.next.as_deref().filter(|_| depth < nodes.len()) {
                out.insert(option.id.clone(), build(nodes, next, depth + 1));
            } else if depth > 0 {
                out.insert(option.id.clone(), json!({}));
            }
        }
        Value::Object(out)
    }

    build(nodes, node_id, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::tree::decision::DecisionOption;

    fn option(id: &str, next: Option<&str>) -> DecisionOption {
        DecisionOption {
            id: id.to_string(),
            description: format!("{} tool", id),
            inputs: json!({}),
            action: next.is_none().then(|| id.to_string()),
            end: next.is_none(),
            status: String::new(),
            next: next.map(str::to_string),
        }
    }

    fn nodes() -> BTreeMap<String, DecisionNode> {
        let mut base = DecisionNode::new(BASE_BRANCH, BASE_INSTRUCTION, true);
        base.add_option(option("text_response", None));
        base.add_option(option(SEARCH_BRANCH, Some(SEARCH_BRANCH)));
        let mut search = DecisionNode::new(SEARCH_BRANCH, SEARCH_INSTRUCTION, false);
        search.add_option(option("query", None));
        search.add_option(option("aggregate", None));

        BTreeMap::from([(BASE_BRANCH.to_string(), base), (SEARCH_BRANCH.to_string(), search)])
    }

    #[test]
    fn test_initialisation_names() {
        assert_eq!("one_branch".parse::<BranchInitialisation>().unwrap(), BranchInitialisation::OneBranch);
        assert_eq!(" Default ".parse::<BranchInitialisation>().unwrap(), BranchInitialisation::Default);
        assert!(matches!(
            "two_branch".parse::<BranchInitialisation>(),
            Err(Error::Tree(TreeError::UnknownInitialisation { .. }))
        ));
        assert_eq!(BranchInitialisation::MultiBranch.to_string(), "multi_branch");
    }

    #[test]
    fn test_find_root() {
        let mut nodes = nodes();
        assert_eq!(find_root(&nodes).unwrap(), BASE_BRANCH);

        nodes.get_mut(SEARCH_BRANCH).unwrap().root = true;
        assert!(matches!(find_root(&nodes), Err(Error::Tree(TreeError::MultipleRoots { .. }))));

        assert!(matches!(find_root(&BTreeMap::new()), Err(Error::Tree(TreeError::NoRoot))));
    }

    #[test]
    fn test_tree_view() {
        let view = tree_view(&nodes(), BASE_BRANCH);
        assert_eq!(view["id"], "base");
        assert_eq!(view["name"], "Base");
        assert_eq!(view["options"]["text_response"]["name"], "Text Response");
        assert_eq!(view["options"]["search"]["instruction"], SEARCH_INSTRUCTION);
        assert_eq!(view["options"]["search"]["description"], "search tool");
        assert!(view["options"]["search"]["options"]["query"].is_object());
    }

    #[test]
    fn test_successive_actions() {
        let actions = successive_actions(&nodes(), BASE_BRANCH);
        assert_eq!(actions, json!({"search": {"query": {}, "aggregate": {}}}));
    }
}
