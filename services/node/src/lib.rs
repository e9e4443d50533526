//! Node service library crate.
//!
//! Configuration and tenant seeding for the `ember-node` binary, exposed
//! for integration tests.
pub mod config;
pub mod seed;
