//! Common test infrastructure
//!
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::TestJobServer;
//!
//! #[tokio::test]
//! async fn test_create_job() {
//!     let server = TestJobServer::new();
//!     let job = server.create(JobType::LDAP_SYNC);
//!     assert_eq!(job.status, JobStatus::Pending);
//! }
//! ```

mod constants;
mod harness;

// Public API - this is what tests import
#[allow(unused_imports)]
pub use constants::*;
pub use harness::TestJobServer;
