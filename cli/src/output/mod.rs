//! Terminal rendering of streamed tree payloads

pub mod cli_handler;

pub use cli_handler::CliOutputHandler;
