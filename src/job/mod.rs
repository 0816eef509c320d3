mod result;
mod status;
mod submission;

pub use result::{ExecutionFailure, JobResult, TIMEOUT_EXIT_CODE};
pub use status::JobStatus;
pub use submission::{
    CODE_DIR_VAR, Job, JobSubmission, OUTPUT_DIR_VAR, RESERVED_VARS, Script, SubmissionError,
    check_label,
};
