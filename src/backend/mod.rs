//! Backend adapters implementing the `Broker` contract

pub mod memory;
pub mod nats;
