pub mod config;
pub mod errors;
pub mod events;
pub mod grimoire;
pub mod template;
pub mod types;

pub use config::Config;
pub use errors::ErrorKind;
pub use grimoire::{Grimoire, OnMaxIterations, Step, StepAction, StepKind};
pub use template::TemplateContext;
pub use types::{
    Agent, AgentStatus, DeliveryStatus, Event, Id, Question, StepResult, Task, TaskStatus,
    TaskType, Workflow, WorkflowStatus,
};
