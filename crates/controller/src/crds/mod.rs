pub mod capi;
pub mod cluster;
pub mod conditions;
pub mod machine;

pub use cluster::*;
pub use conditions::{Condition, ConditionSeverity};
pub use machine::*;
