//! rusty-gate - a permission-gated persistent shell for AI agents
//!
//! This library provides the pieces behind the `rusty-gate` binary:
//! - A persistent PTY shell driven through a sentinel protocol, with an
//!   adaptive idle/max timeout per command
//! - Permission buckets (allow / ask / block) persisted as JSON
//! - A dangerous-pattern filter that no allowance can bypass
//! - Rate-limited, audited safety overrides and human approvals
//! - A JSON-lines tool endpoint exposing it all
//!
//! # Example
//!
//! ```no_run
//! use rusty_gate::config::Config;
//! use rusty_gate::gate::CommandGate;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let mut gate = CommandGate::from_config(&config)?;
//!
//!     let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//!     let printer = tokio::spawn(async move {
//!         while let Some(line) = rx.recv().await {
//!             println!("> {}", line);
//!         }
//!     });
//!
//!     let result = gate.submit("ls -la", Some(tx)).await?;
//!     println!("success: {}", result.success);
//!     printer.await?;
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod config;
pub mod error;
pub mod gate;
pub mod security;
pub mod server;
pub mod shell;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use error::{ErrorKind, GateError};
pub use gate::{CommandGate, CommandResult};
pub use security::PermissionBucket;
pub use shell::{ShellSession, TimeoutReason};
