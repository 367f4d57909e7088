//! Background workers that run alongside the HTTP server.

pub mod offline_sweep;
