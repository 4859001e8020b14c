//! Broker layer
//!
//! This module provides:
//! - [`Broker`]: the operation contract the engine requires from the shared
//!   store (push, weighted pop, delayed set, health check, ack/retry/archive)
//! - [`BrokerConnector`]: session factory used by the supervisor to replace
//!   a broken session with a fresh one
//! - [`InMemoryBroker`] for tests and local development
//! - [`RedisBroker`] for production

mod client;
mod memory;
mod redis;

pub use client::{Broker, BrokerConnector, BrokerError, DequeuedJob, QueueWeights};
pub use memory::InMemoryBroker;
pub use redis::{RedisBroker, RedisConnector};
