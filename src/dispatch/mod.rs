//! Job dispatch.
//!
//! A submitted job goes through these steps:
//!
//! 1. [`TargetResolver`] turns the target spec into node names
//! 2. [`check_quorum`] decides whether enough of them are up
//! 3. The start command is sealed with the server's signing key
//! 4. One [`JobNodeRun`] per target is created in `created`
//! 5. The sealed command is sent as a bus query to exactly those nodes, and
//!    each acknowledgement moves its run to `running` (or `nacked`)
//!
//! Run reports and output chunks then arrive as bus events and are applied
//! by [`Dispatcher::handle_inbound`]. A background task times out runs that
//! pass their job's deadline. The job's overall status is never stored; it
//! is derived from the run states by [`aggregate`] on every read.

pub mod aggregate;
pub mod dispatcher;
pub mod job;
pub mod quorum;
pub mod resolve;
pub mod run;

pub use aggregate::{aggregate, JobStatus, RunBreakdown};
pub use dispatcher::{
    run_timeout_checker, CancelOutcome, Dispatcher, EventOutcome, JobFilter, JobPage, JobSummary,
    JobView, OutputBatch, RunDetail, RunSummary,
};
pub use job::{Job, SubmitRequest, TargetSpec};
pub use quorum::{check_quorum, Quorum, QuorumCheck};
pub use resolve::{KnownNodeResolver, TargetResolver};
pub use run::{JobNodeRun, OutputChunk, RunState};
