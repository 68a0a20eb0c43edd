//! Core library of the unikit toolchain: discovery, packaging,
//! distribution and root-filesystem construction for unikernel images.
//!
//! The entry point is [`runtime::Runtime`], which owns the persisted
//! configuration, the runtime directory and the table of package
//! backends, and hands out the [`pack::Umbrella`] that fans package
//! operations across them. Rootfs archives are produced by
//! [`initrd::build`], and long-running operations are supervised by
//! [`supervisor::ProcessTree`].
//!
//! The CLI, terminal widgets and cloud control planes live elsewhere;
//! their seams here are the [`common::CommandRunner`] capability for
//! external processes, the [`pack::Chooser`] capability for
//! interactive selection, and the supervisor's renderer options.

pub mod common;
pub mod config;
pub mod engine;
pub mod initrd;
pub mod manifest;
pub mod oci;
pub mod pack;
pub mod runtime;
pub mod supervisor;

pub use config::Config;
pub use runtime::Runtime;
