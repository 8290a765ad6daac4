//! Mise API Library
//!
//! HTTP handlers, authorization client and application setup for the video pipeline.

mod api_doc;
mod handlers;
mod telemetry;
mod utils;

pub mod auth;
pub mod error;
pub mod setup;
pub mod state;

pub use error::{ErrorResponse, HttpAppError};
