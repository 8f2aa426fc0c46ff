//! Live mock-interview session orchestrator.
//!
//! Reconciles five independent signal sources into one authoritative
//! session state:
//!
//! - the duplex question/answer exchange channel ([`exchange`])
//! - the speech-to-text capture stream ([`speech`])
//! - the visual proctoring stream and browser visibility events ([`proctoring`])
//! - the countdown timer ([`timer`])
//!
//! ## Design
//! - One [`session::SessionMachine`] owns every session field; other
//!   components read snapshots or issue commands through it
//! - [`orchestrator::SessionOrchestrator`] is the single serialization point:
//!   producers post [`orchestrator::SessionInput`]s into one channel
//! - Only the [`policy::PolicyEngine`] may turn a condition into termination
//! - [`persistence::PersistenceManager`] snapshots on a debounce and on
//!   page-hide, and restores (or expires) sessions on load

pub mod clock;
pub mod config;
pub mod error;
pub mod exchange;
pub mod hint;
pub mod logging;
pub mod media;
pub mod model;
pub mod orchestrator;
pub mod persistence;
pub mod policy;
pub mod proctoring;
pub mod session;
pub mod speech;
pub mod timer;

pub use config::SessionConfig;
pub use error::{Result, SessionError};
pub use orchestrator::{SessionHandle, SessionInput, SessionNotice, SessionOrchestrator};
pub use session::{ActiveStage, Phase};
