//! Command-line entry points.

pub mod jobs;
pub mod run;
pub mod schema;
pub mod text;
