pub mod artifact;
pub mod collector;
pub mod processing;
pub mod run;
pub mod sources;
