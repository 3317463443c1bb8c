//! Persona and goal given to every agent in the tree

use chrono::Local;
use serde::{Deserialize, Serialize};

/// Style, description and end goal of the assistant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atlas {
    /// Writing style and tone
    pub style: String,
    /// Theme of the program the agent is part of
    pub agent_description: String,
    /// What counts as done
    pub end_goal: String,
    #[serde(default)]
    pub datetime_reference: DatetimeReference,
}

/// When "now" is, for relative dates in user prompts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatetimeReference {
    pub current_datetime: String,
    pub current_day_of_week: String,
    pub current_time_of_day: String,
}

impl Default for DatetimeReference {
    fn default() -> Self {
        Self::now()
    }
}

impl DatetimeReference {
    pub fn now() -> Self {
        let date = Local::now();
        Self {
            current_datetime: date.to_rfc3339(),
            current_day_of_week: date.format("%A").to_string(),
            current_time_of_day: date.format("%I:%M %p").to_string(),
        }
    }
}

impl Default for Atlas {
    fn default() -> Self {
        Self {
            style: "No style provided.".to_string(),
            agent_description: "No description provided.".to_string(),
            end_goal: "No end goal provided.".to_string(),
            datetime_reference: DatetimeReference::now(),
        }
    }
}

impl Atlas {
    /// Refresh the datetime reference before a new query
    pub fn refresh_datetime(&mut self) {
        self.datetime_reference = DatetimeReference::now();
    }
}
