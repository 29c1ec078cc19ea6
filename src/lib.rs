pub mod buffer;
pub mod config;
pub mod processor;
pub mod replay;
