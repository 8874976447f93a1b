//! Jobs: the job model, the manager that runs them, and completion notifications.

pub mod manager;
pub mod model;
pub mod notify;

pub use manager::JobManager;
pub use model::{
    ConversationQuery, CreateJob, Job, JobCompletion, JobFilter, JobStatus, JobSummary,
};
pub use notify::{JobNotification, LogNotifier, Notifier, RelayNotifier};
