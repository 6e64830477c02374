//! Browser agent loop.
//!
//! Drives a browser toward a natural-language task by repeatedly observing
//! the page, asking a decision oracle what to do, executing the answer and
//! waiting for the page to settle. The browser, the oracle and the checklist
//! matcher are traits; the `agent` binary wires in headless Chrome and an
//! OpenAI-compatible model.

pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod escalation;
pub mod events;
pub mod history;
pub mod oracle;
pub mod progress;
pub mod runs;
pub mod session;
pub mod stability;
pub mod state;
pub mod telemetry;
pub mod types;

pub use config::{AgentConfig, Budgets, LoopConfig};
pub use controller::{AgentLoop, RunReport, RunRequest};
pub use driver::{BrowserDriver, SessionFactory};
pub use error::{ConfigError, DriverError, OracleError, SessionError};
pub use events::{EventSink, RunEvent};
pub use oracle::{DecideMode, DecideRequest, Decision, DecisionOracle, KeywordMatcher, ProgressMatcher};
pub use runs::{RunManager, RunStatus, RunSummary};
pub use session::{SessionManager, SessionRegistry};
pub use state::TerminationReason;
pub use types::{Action, ActionResult, Observation};
