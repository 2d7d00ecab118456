#![forbid(unsafe_code)]

pub mod alert;
pub mod common;
pub mod device;
pub mod observation;
pub mod persona;
pub mod presence;

pub use common::{ContractViolation, SchemaVersion, Validate};
