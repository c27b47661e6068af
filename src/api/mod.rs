//! REST client for the Taiga v1 API.
//!
//! Every outbound request - authentication and CRUD alike - passes
//! through the retry envelope, so transient failures are absorbed with
//! one uniform policy. Responses are passed back to the tool layer as raw
//! JSON; the bridge does not model Taiga's domain entities locally.

pub mod client;

pub use client::{ApiClient, LoginResponse, UserInfo};
