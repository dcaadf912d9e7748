//! Web front end for gallery-dl: lists media URLs of a post, or downloads the
//! media and keeps it around for a short retention window.

pub mod config;
pub mod credentials;
pub mod error;
pub mod fetcher;
pub mod retention;
pub mod server;
pub mod throttle;
