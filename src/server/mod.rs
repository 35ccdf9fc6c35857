//! Front-end MCP server: request dispatch and the stdio session loop.

pub mod dispatcher;
pub mod session;

pub use dispatcher::Dispatcher;
pub use session::{serve, SessionEnd};
