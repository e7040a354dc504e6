//! strata - layered image builds and launches
//!
//! A build descriptor is executed step by step on top of a base snapshot.
//! Every filesystem-changing step yields an immutable layer addressed by a
//! digest of its parent and inputs, so unchanged steps are served from the
//! layer cache. The final chain plus launch metadata forms an image, which
//! the launcher materializes and runs as an isolated process.

pub mod base;
pub mod builder;
pub mod cache;
pub mod cli;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod digest;
pub mod error;
pub mod image;
pub mod launcher;
pub mod layer;
pub mod paths;
pub mod sandbox;
pub mod ui;

pub use error::{StrataError, StrataResult};
