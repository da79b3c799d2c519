// Background jobs

pub mod scheduler;
pub mod sweeper;

pub use scheduler::{JobError, JobExecutionLog, JobResult, JobScheduler, JobStatus};
pub use sweeper::ExpirySweeperJob;
