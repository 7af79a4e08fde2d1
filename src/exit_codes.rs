//! Exit code policy for sqlmend.
//!
//! Every invocation is a one-shot batch job, so automation only needs to know
//! whether the run reached its intended state:
//! - `0` = Success (including runs where every statement was already applied)
//! - `1` = Failure (fatal database error, failed post-condition, missing or
//!   invalid configuration)
//! - `2` = Usage error (invalid command line, reported by clap)

/// Exit code: run completed
pub const SUCCESS: i32 = 0;

/// Exit code: fatal error or configuration error
pub const FAILURE: i32 = 1;

/// Exit code: invalid command-line usage
pub const USAGE: i32 = 2;
