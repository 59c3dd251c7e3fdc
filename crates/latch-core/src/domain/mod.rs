//! Domain model: ids, typed variables, external tasks and outcomes.

pub mod ids;
pub mod outcome;
pub mod task;
pub mod variables;

pub use ids::{TaskId, WorkerId};
pub use outcome::{BusinessError, Failure, Outcome};
pub use task::ExternalTask;
pub use variables::{VariableValue, Variables};
