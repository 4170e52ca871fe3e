//! Relational catalogue for memoh.
//!
//! The catalogue is the source of truth for which snapshot is version N of
//! a user's container. Production runs against Postgres ([`PgCatalogue`]);
//! tests run against the in-memory implementation ([`MemoryCatalogue`]).

pub mod catalogue;
pub mod memory;
pub mod postgres;
pub mod types;

pub use catalogue::{Catalogue, VersionTransaction};
pub use memory::MemoryCatalogue;
pub use postgres::PgCatalogue;
pub use types::{
    ContainerRow, ContainerStatus, EventRow, NewContainer, SnapshotRow, UserRow, VersionRow,
};
