//! NATS request/reply ingress for the brokerage core

pub mod subscriber;

pub use subscriber::{NatsSubscriber, Reply, ReplyError};
