//! Cloud provider abstractions.
//!
//! This module defines the [`CloudClient`] trait and its DataCrunch implementation.

pub mod datacrunch;
mod traits;

pub use traits::{
    CloudClient, CloudError, CreateInstanceRequest, Credentials, ErrorKind, Image, Instance,
    InstanceState, LoadBalancer, LoadBalancerSpec, OsVolume, SshKey,
};

pub use datacrunch::DataCrunch;
