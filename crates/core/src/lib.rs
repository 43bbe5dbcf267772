pub mod action;
pub mod actuator;
pub mod controller;
pub mod error;
pub mod logger;
pub mod perception;
pub mod queue;
pub mod safety;
pub mod sandbox;
pub mod session;
pub mod settings;
pub mod sleep;
pub mod transform;
pub mod transport;
pub mod types;
