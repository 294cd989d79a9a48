//! Document database core.
//!
//! Collections are declared through a GraphQL-style schema definition,
//! compiled into [`schema::CollectionDescription`]s with bidirectional
//! relation metadata. Every mutation becomes a set of content-addressed
//! commits in the per-document Merkle-DAG (`keel-crdt`), reconciled through
//! per-field CRDTs; queries lower into a pull-based plan-node tree
//! ([`planner`]) running over the materialized state. [`Database`] ties the
//! layers together and feeds the update-event bus subscriptions listen on.

pub mod collection;
pub mod db;
pub mod error;
pub mod events;
pub mod mapper;
pub mod planner;
pub mod request;
pub mod schema;
pub mod value;

pub use collection::{derive_dockey, StoreCtx, DOCKEY_PREFIX};
pub use db::{Database, ExecResult, RequestOutcome};
pub use error::{DbError, Result};
pub use events::UpdateEvent;
pub use value::{Doc, Value};
