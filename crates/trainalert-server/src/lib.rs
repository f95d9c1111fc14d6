//! Alert engine server: wires the rule evaluator, alert state, bridge and
//! notification dispatcher into background loops driven by one
//! cancellation token.

pub mod bridge;
pub mod config;
pub mod retention;
pub mod scheduler;
pub mod service;

#[cfg(test)]
mod tests;
