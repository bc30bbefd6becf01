//! Entities, value objects and the ports the application layer depends on.

pub mod account;
pub mod endorsement;
pub mod events;
pub mod ports;
pub mod transaction;
