#![forbid(unsafe_code)]

//! Shared library behind the ytbshow binaries.
//!
//! The HTTP backend builds an [`extractor::Extractor`] from
//! [`config::RuntimeSettings`]; the cache admin CLI only needs
//! [`cache::DiskCache`].

pub mod cache;
pub mod classify;
pub mod config;
pub mod error;
pub mod extractor;
pub mod fallback;
pub mod formats;
pub mod provider;
pub mod retry;
pub mod security;
pub mod transcode;
pub mod youtube;

pub use error::{Error, Result, UpstreamError};
