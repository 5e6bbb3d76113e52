//! Process-level wiring shared by the binary's commands.

pub mod context;
pub mod error;

pub use context::AppContext;
pub use error::AppError;
