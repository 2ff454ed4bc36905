pub mod assignment;
pub mod heartbeat;
pub mod plan;
pub mod result_doc;
pub mod session;
pub mod slot;
pub mod task;

pub use assignment::{AgentRole, AssignmentRecord};
pub use heartbeat::Heartbeat;
pub use plan::Plan;
pub use result_doc::{ResultDocument, ResultStatus, TestResults};
pub use session::{SessionMetadata, SessionOutcome};
pub use slot::{Phase, Slot};
pub use task::{
    Complexity, DependencyEdge, DependencyKind, IssueType, Task, TaskStatus, ATTEMPTS_LABEL_PREFIX,
};
