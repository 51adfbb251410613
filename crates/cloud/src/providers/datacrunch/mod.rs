//! DataCrunch GPU cloud provider.
//!
//! Implements the [`CloudClient`](crate::CloudClient) trait against the
//! DataCrunch REST API (`https://api.datacrunch.io/v1`).
//!
//! ## Example
//!
//! ```ignore
//! use capdc_cloud::{CloudClient, Credentials, DataCrunch};
//!
//! let client = DataCrunch::new(
//!     Credentials::new(client_id, client_secret).with_base_url("http://localhost:8080/v1"),
//! )?;
//!
//! let images = client.list_images().await?;
//! ```

mod client;
mod models;

pub use client::{DataCrunch, DEFAULT_BASE_URL};
