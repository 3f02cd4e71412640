//! MQTT module - client, command gateway, state publisher and discovery

mod client;
mod discovery;
mod gateway;
mod publisher;
mod tls;
mod topics;

pub use client::{run_event_loop, IncomingMessage, MqttClient};
pub use discovery::DiscoveryBuilder;
pub use gateway::run_gateway;
pub use publisher::Publisher;

#[cfg(test)]
pub use gateway::parse_command;
