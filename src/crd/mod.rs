//! Custom Resource Definitions for the Database operator
//!
//! This module defines the `Database` CRD and the vocabulary used in its status.

mod database;
pub mod types;


pub use database::{parse_schedule, Database, DatabaseSpec, DatabaseStatus, SpecValidationError};
pub use types::*;
