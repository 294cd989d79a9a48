//! HTTP query surface.
//!
//! Routes: `/` and `/ping` liveness, `/graphql` for queries, mutations and
//! streaming subscriptions, `/schema/load` for SDL registration,
//! `/blocks/:cid` for raw commit blocks, `/dump` and `/peerid` diagnostics.

pub mod handlers;
pub mod response;

pub use handlers::{router, AppState};
