//! # corral
//!
//! Session supervisor for interactive agent CLIs.
//!
//! Spawn agent processes, feed them input, interrupt or kill them, restart
//! them under the same id, and keep the last few hundred lines each one
//! printed. A periodic health check keeps every session's status honest
//! about whether its process is still alive.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use corral::{CreateOptions, NativePlatform, Supervisor, SupervisorConfig};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> corral::Result<()> {
//! let sup = Supervisor::new(SupervisorConfig::default(), Arc::new(NativePlatform::new("claude")));
//! let _health = sup.spawn_health_monitor();
//!
//! let session = sup
//! 	.create_session(CreateOptions {
//! 		name: Some("api".into()),
//! 		working_dir: Some("/tmp".into()),
//! 		..Default::default()
//! 	})
//! 	.await?;
//!
//! sup.send_input(&session.id, "summarise the README").await;
//! println!("{}", sup.get_output(&session.id, Some(20)).await);
//! sup.cleanup().await;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod events;
pub mod output;
pub mod platform;
pub mod registry;
pub mod session;
pub mod supervisor;
pub mod types;

pub use error::{Result, SupervisorError};
pub use events::{EventBus, SessionEvent};
pub use output::{OutputBuffer, OUTPUT_CAPACITY};
pub use platform::{InterruptStrategy, NativePlatform, Platform, SpawnOptions};
pub use supervisor::{Supervisor, SupervisorConfig};
pub use types::*;
