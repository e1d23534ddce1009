pub mod app;
pub mod cli;
pub mod config;
pub mod consistency;
pub mod display;
pub mod error;
pub mod ipc;
pub mod poll;
pub mod process;
pub mod server;
pub mod session;
pub mod subject;
pub mod telemetry;
pub mod window;

pub use config::{HarnessConfig, PollPolicy, RetryBudget};
pub use error::{HarnessError, HarnessResult};
pub use session::{HarnessSession, TeardownReport};
