//! Configuration for a lockrun session.
//!
//! Settings come from three layers, lowest first: built-in defaults, an
//! optional YAML file (`--config` / `LOCKRUN_CONFIG`), then flags and their
//! environment variables. Validation runs once on the merged result.

mod model;
mod operations;


pub use model::Config;
