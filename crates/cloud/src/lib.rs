//! DataCrunch GPU cloud integration for the Cluster API provider.
//!
//! This crate wraps the DataCrunch REST API behind the [`CloudClient`] trait:
//!
//! - **Instances** - create, inspect, start, stop and delete GPU instances
//! - **Images** - list and look up OS images
//! - **SSH keys** - list, register and remove keys
//! - **Load balancers** - declared for the provider contract, not offered by the API
//!
//! ## Authentication
//!
//! The client uses the OAuth2 client-credentials grant. A bearer token is
//! fetched lazily on the first call and reused until its recorded expiry;
//! there is no background refresh.
//!
//! ## Example
//!
//! ```ignore
//! use capdc_cloud::{CloudClient, CreateInstanceRequest, Credentials, DataCrunch};
//!
//! let client = DataCrunch::new(Credentials::new(client_id, client_secret))?;
//!
//! let instance = client
//!     .create_instance(CreateInstanceRequest::new("worker-0", "1xH100", "ubuntu-22.04-cuda-12.1"))
//!     .await?;
//!
//! client.delete_instance(&instance.id).await?;
//! ```

pub mod providers;

pub use providers::{
    datacrunch, CloudClient, CloudError, CreateInstanceRequest, Credentials, DataCrunch,
    ErrorKind, Image, Instance, InstanceState, LoadBalancer, LoadBalancerSpec, OsVolume, SshKey,
};
