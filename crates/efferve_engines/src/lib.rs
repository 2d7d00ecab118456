#![forbid(unsafe_code)]

pub mod alert;
pub mod capture;
pub mod classifier;
pub mod outbound;
pub mod presence;
