//! Built-in conversational tools

pub mod summarize;
pub mod text_response;

pub use summarize::{SummarizeTool, SummarizeToolFactory, SUMMARIZE};
pub use text_response::{
    FinalTextResponseTool, FinalTextResponseToolFactory, TextResponseTool, TextResponseToolFactory,
    FINAL_TEXT_RESPONSE, TEXT_RESPONSE,
};
