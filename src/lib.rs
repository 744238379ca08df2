pub mod config;
pub mod constants;
pub mod error;
pub mod loader;
pub mod logging;
pub mod observability;
pub mod pipeline;
pub mod storage;
pub mod table;

// Domain data shapes shared by the normalize and load steps
pub mod domain;
