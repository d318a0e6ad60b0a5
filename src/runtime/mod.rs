//! Multi-agent collaboration runtime.
//!
//! A per-agent cooperative scheduler ([`runner`]) driven through a fixed tool-dispatch table
//! ([`dispatch`]) over streaming model calls ([`stream`]), backed by a storage-agnostic contract
//! ([`store`], [`model`]), coordinated process-wide by a singleton façade ([`facade`]) and a task
//! supervisor ([`supervisor`]) that enforces wall-clock/turn/token/repetition budgets on a
//! collaboration run.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod event_bus;
pub mod facade;
pub mod model;
pub mod runner;
pub mod skill;
pub mod store;
pub mod stream;
pub mod supervisor;

pub use config::RuntimeConfig;
pub use error::{RuntimeError, RuntimeResult, StopReason};
pub use facade::RuntimeFacade;
pub use supervisor::{StartTaskParams, TaskSupervisor};
