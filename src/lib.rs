// lib.rs
pub mod aggregate;
pub mod chroms;
pub mod client;
pub mod error;
pub mod hits;
pub mod import;
pub mod loader;
pub mod locks;
pub mod overlap;
pub mod protocol;
pub mod server;
pub mod store;
