pub mod canonicalizer;
pub mod executor;
