pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod protocol;
pub mod socket;
