#![forbid(unsafe_code)]

//! Event-triggered workflow pipelines.
//!
//! A workflow is a YAML document naming a trigger event, an optional guard
//! expression, and a sequence of action steps. When the session publishes a
//! matching event, the runner executes the steps strictly sequentially,
//! appending each step's output to a shared `steps` context that later
//! renders can read.

pub mod action;
pub mod context;
pub mod engine;
pub mod error;
pub mod render;
pub mod workflow;

pub use action::{Action, ActionFactory, ActionParams, CatalogActionFactory, LogAction};
pub use context::{ContextMap, ContextProvider, StaticProvider, StepOutputs};
pub use engine::{event_contexts, WorkflowEngine};
pub use error::WorkflowError;
pub use render::{is_falsy, Renderer};
pub use workflow::{Step, Workflow};
