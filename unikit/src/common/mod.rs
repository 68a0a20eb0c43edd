pub mod fs;

mod runner;

pub use runner::{CommandRunner, HostRunner};
