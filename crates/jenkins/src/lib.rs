//! CiHub remote client adapter for Jenkins nodes.
//!
//! Implements the [`hub::RemoteClient`] trait over the Jenkins JSON API
//! (`/api/json` with `tree=` selectors), the progressive console endpoint, and
//! the Pipeline REST API (`wfapi`). Additional families (GitLab, Buildkite, ...)
//! are added as sibling crates without any change to `hub` or `engine`.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** HTTP transport, URL construction, CSRF crumbs, response
//! parsing, status-code classification, and bounded read retries all live
//! here. The engine sees only [`hub::RemoteClient`] and [`hub::RemoteError`].
//!
//! ## Retry discipline
//!
//! Reads are repeated on transport failure up to
//! [`JenkinsConfig::max_retries`] times with linear back-off. Mutations
//! (`build`, `stop`, `doDelete`, view edits) are sent exactly once.

mod client;
mod wire;

pub use client::{JenkinsClient, JenkinsConfig, JenkinsError};
