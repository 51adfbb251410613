pub mod controller;
pub mod instance;

pub use controller::{reconcile_data_crunch_machine, reconcile_delete, reconcile_normal, MachineScope};
