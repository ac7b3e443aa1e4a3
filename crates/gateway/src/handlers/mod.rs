//! API handlers module

pub mod backends;
pub mod conversations;
pub mod health;
