//! Backend implementations.

pub mod claude_adapter;
pub mod cli_backend;
pub mod cursor_adapter;
pub mod mock_agent;

pub use claude_adapter::claude_profile;
pub use cli_backend::{AgentSettings, CliBackend, CliProfile};
pub use cursor_adapter::cursor_profile;
pub use mock_agent::{MockBackend, MockResponse};
