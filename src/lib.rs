//! Build container-based OS variants and manage atomic deployments.
//!
//! Two halves share this crate:
//!
//! - **Build side** - Variants are `variants/*.Containerfile` specs layered on
//!   `rootfs.Containerfile`, fingerprinted ([`hash`]) and built through the
//!   container engine ([`image`], [`build`]).
//! - **Host side** - The running system is a set of tree-store deployments
//!   ([`deployment`], [`tree_store`]); [`upgrade`] rebuilds the local
//!   Systemfile and deploys it.
//!
//! # Architecture
//!
//! ```text
//! Settings ──────────────┐ (built once, passed by reference)
//!                        │
//! variant ── hash ── build ── image::ImageBackend ── podman / skopeo
//!                                   │
//! upgrade ── tree_store ── ostree   │
//!    │          │                   │
//!    └── system::SystemProbe ── deployment::StatusSource
//! ```
//!
//! Every external program runs through [`process::Runner`]; components take
//! it (or [`image::ImageBackend`]) by reference so tests can record calls
//! instead of executing them.

pub mod build;
pub mod deployment;
pub mod error;
pub mod hash;
pub mod image;
pub mod preflight;
pub mod process;
pub mod settings;
pub mod system;
pub mod tree_store;
pub mod upgrade;
pub mod variant;

#[cfg(test)]
mod testutil;

pub use error::Error;
pub use settings::Settings;
