#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Cluster API infrastructure provider for DataCrunch
//!
//! This crate provides the `DataCrunchCluster` and `DataCrunchMachine` custom
//! resources and the controllers that reconcile them against the DataCrunch
//! cloud API.

pub mod crds;
pub mod tasks;

pub use tasks::{run_controllers, ControllerConfig, Error, Result};
