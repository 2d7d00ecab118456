#![forbid(unsafe_code)]

pub mod alerts;
pub mod clock;
pub mod config;
pub mod detector;
pub mod dispatcher;
pub mod persons;
pub mod pipeline;
pub mod registry;
pub mod rules;
pub mod shutdown;
pub mod source;
pub mod supervisor;
