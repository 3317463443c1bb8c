//! Decision tree state and the query loop

pub mod atlas;
pub mod branches;
pub mod collection_data;
pub mod decision;
pub mod engine;
pub mod environment;
pub mod tree_data;

pub use atlas::{Atlas, DatetimeReference};
pub use branches::{BranchInitialisation, BASE_BRANCH, SEARCH_BRANCH};
pub use collection_data::CollectionData;
pub use decision::{Decision, DecisionNode, DecisionOption, NodeChoices};
pub use engine::{BranchSpec, ProcessRequest, Tree, DEFAULT_RECURSION_LIMIT};
pub use environment::{Environment, EnvironmentEntry, SELF_INFO};
pub use tree_data::{ConversationMessage, PromptTasks, TreeData, DECISION_NODE_TASK};
