//! TrustFS key tool: generates server key files, mints tickets into ticket
//! files and inspects or validates existing tickets.

pub mod cli;

pub use cli::{Cli, Command};
