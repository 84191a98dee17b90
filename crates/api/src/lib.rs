//! HTTP surface for the Herald delivery engine.

pub mod routes;
pub mod state;
