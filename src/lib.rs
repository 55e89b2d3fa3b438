//! Partner onboarding — registration wizard, identity verification and
//! resumable gym provisioning.

pub mod config;
pub mod error;
pub mod flow;
pub mod http;
pub mod identity;
pub mod pipeline;
pub mod recovery;
pub mod review;
pub mod routes;
pub mod store;
pub mod wizard;

pub use error::{Error, Result};
