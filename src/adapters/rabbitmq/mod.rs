//! RabbitMQ adapters.
//!
//! [`RabbitMq`] publishes with broker confirmation and consumes on a
//! background task returned as a cancellable [`Consumption`].

mod client;
mod config;
mod consumer;

pub use client::RabbitMq;
pub use config::RabbitMqConfig;
pub use consumer::{BrokerMessage, ConsumeOptions, Consumption};
pub use lapin::ExchangeKind;
