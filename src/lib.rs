//! database-operator: Kubernetes operator for Database custom resources
//!
//! Watches `Database` objects (`databases.example.com/v1alpha1`) and converges
//! each one to a ConfigMap, a data volume, a StatefulSet and a Service running
//! the requested engine, reporting progress through the status subresource.

pub mod controller;
pub mod crd;
pub mod error;
pub mod store;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
