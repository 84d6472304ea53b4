//! pty-warden - supervisor that keeps pty sessions alive across client restarts.

pub mod client;
pub mod config;
pub mod protocol;
pub mod pty;
pub mod server;
pub mod transport;
