//! The six cooperating agents.
//!
//! Every agent has the same shape: `async fn run(&PipelineContext, &mut
//! PipelineState) -> Result<(), StageError>`. An `Ok` return with errors
//! pushed onto the state is a degraded-but-continuing stage; an `Err`
//! return is handled by the supervisor according to its fatality.

pub mod compliance;
pub mod divergence;
pub mod drafting;
pub mod extraction;
pub mod quantitative;
pub mod reconciliation;
