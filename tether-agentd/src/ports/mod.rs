pub mod canonicalizer;
pub mod command_runner;
pub mod executor;
