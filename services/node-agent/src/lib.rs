//! gluon node agent library
//!
//! The node agent runs on each host in the fleet. It enrolls itself with
//! the control plane, then loops forever: heartbeating, pulling its config
//! bundle and reconciling WireGuard/FRR/SSH state to match it, executing
//! admin-dispatched commands, and arbitrating its role in the Kubernetes
//! cluster.
//!
//! ## Modules
//!
//! - `config`: on-disk agent identity and enrollment state
//! - `client`: HTTP client for the control plane's agent-facing surface
//! - `enroll`: two-phase enrollment (submit, then poll until approved)
//! - `network`: WireGuard keypair management and interface discovery
//! - `reconciler`: fetches and applies config bundles
//! - `heartbeat`: periodic liveness/telemetry reporting and command pickup
//! - `exec`: bounded execution of admin-dispatched commands
//! - `kubernetes`: cluster bootstrap/join arbitration loop
//! - `state`: local JSON snapshots used to avoid redundant uploads/applies

pub mod client;
pub mod config;
pub mod enroll;
pub mod exec;
pub mod heartbeat;
pub mod kubernetes;
pub mod network;
pub mod reconciler;
pub mod state;

pub use client::ControlPlaneClient;
pub use config::Config;
