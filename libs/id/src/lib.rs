//! # gluon-id
//!
//! Opaque integer ID types for gluon fleet-manager entities.
//!
//! All identifiers in this system are opaque integers issued by the store
//! (Postgres `BIGSERIAL` primary keys). Each entity kind gets its own newtype so
//! a `NodeId` can never be accidentally passed where an `IpPoolId` is expected,
//! while the wire representation stays a plain JSON number.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;
