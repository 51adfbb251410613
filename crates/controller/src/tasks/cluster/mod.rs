pub mod controller;

pub use controller::{reconcile_data_crunch_cluster, reconcile_delete, reconcile_normal, ClusterScope};
