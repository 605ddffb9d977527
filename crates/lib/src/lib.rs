//! Tether core library: keeps a client connected to a backend process and turns
//! the backend's streamed output into ordered application events.

pub mod bus;
pub mod config;
pub mod connection;
pub mod health;
pub mod pending;
pub mod stream;
pub mod supervisor;
