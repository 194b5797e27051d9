pub mod buffer;
pub mod config;
pub mod connector;
pub mod error;
pub mod relay;
pub mod resolver;
