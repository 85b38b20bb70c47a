pub mod agents;
pub mod cli;
pub mod config;
pub mod doctor;
pub mod error;
pub mod pipeline;
pub mod provider;
pub mod server;
pub mod telemetry;
pub mod tools;

#[cfg(test)]
mod tests;
