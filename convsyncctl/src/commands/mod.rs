pub mod config;
pub mod harvest;
