//! Test utilities and helpers for relaymesh
//!
//! Fixtures for control plane state plus stand-ins for the shared counter
//! store and the exit node probe. Used by unit tests and by the integration
//! tests under `tests/`.

mod doubles;
mod fixtures;

pub use doubles::{FailingCounterStore, StaticProbe};
pub use fixtures::{client, exit_node, provisioned_site, site, MeshFixture, FIXTURE_ORG};
