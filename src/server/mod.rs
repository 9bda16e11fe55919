//! HTTP server exposing cache administration and a lookup endpoint.
//!
//! - [`admin_api`]: Request/response types and route handlers

pub mod admin_api;
