//! Handlebars templates for every LLM call the tree makes

use crate::error::{Error, Result};
use crate::llm::LlmMessage;
use crate::output::JsonObject;
use crate::tree::{Atlas, TreeData};
use handlebars::Handlebars;
use serde::Serialize;
use std::sync::OnceLock;

pub const SYSTEM: &str = "system";
pub const DECISION: &str = "decision";
pub const FINAL_RESPONSE: &str = "final_response";
pub const SUMMARIZE: &str = "summarize";
pub const QUERY_PLAN: &str = "query_plan";
pub const AGGREGATE_PLAN: &str = "aggregate_plan";
pub const FOLLOW_UP: &str = "follow_up";
pub const TITLE: &str = "title";

const SYSTEM_TEMPLATE: &str = "\
You are part of an agentic system. {{agent_description}}

Style: {{style}}
End goal: {{end_goal}}

Current datetime: {{current_datetime}} ({{current_day_of_week}}, {{current_time_of_day}}).";

const DECISION_TEMPLATE: &str = "\
You are a routing agent inside a decision tree. Pick the single best next action for the user.

Instruction for this branch:
{{instruction}}

User prompt:
{{user_prompt}}

Conversation history:
{{conversation_history}}

Tasks completed so far:
{{tasks_completed}}

{{tree_count}}

Available collections:
{{collection_information}}

Available actions (choose exactly one `function_name` from these):
{{available_actions}}

Unavailable actions (these cannot be chosen right now):
{{unavailable_actions}}

What each action leads to:
{{successive_actions}}

Errors from previous attempts (avoid repeating them, try a different approach or explain the problem):
{{previous_errors}}

Environment (objects retrieved so far):
{{environment}}

Respond with a single JSON object with the keys:
- \"function_name\": string, one of the available actions
- \"function_inputs\": object, inputs for the chosen action matching its input schema
- \"reasoning\": string, why this action
- \"impossible\": boolean, true if the task cannot be done with the available actions and data
- \"end_actions\": boolean, true if the user's request will be fully answered after this action
- \"message_update\": string, a short message to the user about what you are doing";

const FINAL_RESPONSE_TEMPLATE: &str = "\
Write the final reply to the user. Use the environment and the tasks completed to answer.
If something failed or was impossible, say so plainly.

User prompt:
{{user_prompt}}

Conversation history:
{{conversation_history}}

Tasks completed:
{{tasks_completed}}

Environment:
{{environment}}

Reply with the message text only.";

const SUMMARIZE_TEMPLATE: &str = "\
Summarise the information in the environment as it relates to the user prompt.

User prompt:
{{user_prompt}}

Conversation history:
{{conversation_history}}

Environment:
{{environment}}

Respond with a JSON object with the keys \"title\" (a short title) and \"summary\" (the summary text).";

const QUERY_PLAN_TEMPLATE: &str = "\
Plan a search against the vector database to help answer the user.

User prompt:
{{user_prompt}}

Tasks completed:
{{tasks_completed}}

Collections (metadata, field names and display types):
{{collection_information}}

Display types per collection:
{{return_types}}

Previous errors for this tool:
{{previous_errors}}

Respond with a JSON object with the keys:
- \"collection_name\": one of the collections above
- \"search_type\": one of \"hybrid\", \"keyword\", \"semantic\", \"fetch\"
- \"search_query\": the search terms (may be empty for fetch)
- \"limit\": number of objects to return
- \"sort_by\": optional {\"property\": string, \"ascending\": boolean}
- \"display_type\": one of the display types for that collection, or \"generic\"
- \"impossible\": boolean, true if no collection can answer this
- \"reasoning\": string";

const AGGREGATE_PLAN_TEMPLATE: &str = "\
Plan an aggregation over the vector database to help answer the user.

User prompt:
{{user_prompt}}

Tasks completed:
{{tasks_completed}}

Collections (metadata and field names):
{{collection_information}}

Previous errors for this tool:
{{previous_errors}}

Respond with a JSON object with the keys:
- \"collection_name\": one of the collections above
- \"group_by\": optional property to group by
- \"properties\": list of {\"property\": string, \"metrics\": list of metric names}.
  Metric names: count, mean, median, maximum, minimum, sum, mode, top_occurrences
- \"impossible\": boolean
- \"reasoning\": string";

const FOLLOW_UP_TEMPLATE: &str = "\
Suggest {{num_suggestions}} short follow-up questions the user could ask next.

User prompt:
{{user_prompt}}

Conversation history:
{{conversation_history}}

Environment:
{{environment}}

Context:
{{context}}

Respond with a JSON object {\"suggestions\": [string, ...]}.";

const TITLE_TEMPLATE: &str = "\
Give this conversation a short title of at most six words.

Conversation history:
{{conversation_history}}

Respond with a JSON object {\"title\": string}.";

fn registry() -> &'static Handlebars<'static> {
    static REGISTRY: OnceLock<Handlebars<'static>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut hb = Handlebars::new();
        hb.register_escape_fn(handlebars::no_escape);
        let templates = [
            (SYSTEM, SYSTEM_TEMPLATE),
            (DECISION, DECISION_TEMPLATE),
            (FINAL_RESPONSE, FINAL_RESPONSE_TEMPLATE),
            (SUMMARIZE, SUMMARIZE_TEMPLATE),
            (QUERY_PLAN, QUERY_PLAN_TEMPLATE),
            (AGGREGATE_PLAN, AGGREGATE_PLAN_TEMPLATE),
            (FOLLOW_UP, FOLLOW_UP_TEMPLATE),
            (TITLE, TITLE_TEMPLATE),
        ];
        for (name, template) in templates {
            if let Err(e) = hb.register_template_string(name, template) {
                tracing::error!("Failed to register prompt template {}: {}", name, e);
            }
        }
        hb
    })
}

/// Render a registered template
pub fn render<T: Serialize>(name: &str, data: &T) -> Result<String> {
    if !registry().has_template(name) {
        return Err(Error::Generic(format!("Unknown prompt template: {}", name)));
    }
    Ok(registry().render(name, data)?)
}

/// System message carrying the atlas persona
pub fn system_message(atlas: &Atlas) -> Result<LlmMessage> {
    let text = render(
        SYSTEM,
        &serde_json::json!({
            "agent_description": atlas.agent_description,
            "style": atlas.style,
            "end_goal": atlas.end_goal,
            "current_datetime": atlas.datetime_reference.current_datetime,
            "current_day_of_week": atlas.datetime_reference.current_day_of_week,
            "current_time_of_day": atlas.datetime_reference.current_time_of_day,
        }),
    )?;
    Ok(LlmMessage::system(text))
}

/// `[system, user]` for a task prompt
pub fn messages<T: Serialize>(atlas: &Atlas, name: &str, data: &T) -> Result<Vec<LlmMessage>> {
    Ok(vec![system_message(atlas)?, LlmMessage::user(render(name, data)?)])
}

/// Template fields every tree prompt shares
pub fn tree_context(tree_data: &TreeData) -> JsonObject {
    let mut data = JsonObject::new();
    data.insert("user_prompt".into(), tree_data.user_prompt.clone().into());
    data.insert(
        "conversation_history".into(),
        to_prompt_json(&tree_data.conversation_history).into(),
    );
    data.insert("tasks_completed".into(), tree_data.tasks_completed_string().into());
    data.insert("tree_count".into(), tree_data.tree_count_string().into());
    data.insert(
        "collection_information".into(),
        to_prompt_json(&tree_data.output_collection_metadata(false)).into(),
    );
    data.insert(
        "environment".into(),
        to_prompt_json(&tree_data.environment.llm_view()).into(),
    );
    data
}

/// Pretty JSON for embedding in a prompt
pub fn to_prompt_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_does_not_escape() {
        let text = render(
            TITLE,
            &json!({"conversation_history": "[{\"role\": \"user\", \"content\": \"a < b\"}]"}),
        )
        .unwrap();
        assert!(text.contains("a < b"));
        assert!(text.contains("\"role\""));
    }

    #[test]
    fn test_system_message_has_atlas() {
        let mut atlas = Atlas::default();
        atlas.style = "Pirate speak".to_string();
        let message = system_message(&atlas).unwrap();
        assert!(message.content.contains("Pirate speak"));
        assert!(message.content.contains("No end goal provided."));
    }

    #[test]
    fn test_unknown_template() {
        assert!(render("nope", &json!({})).is_err());
    }
}
