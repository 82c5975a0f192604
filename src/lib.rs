#[cfg(test)]
#[macro_use]
extern crate quickcheck;

pub mod auth;
pub mod chroot;
pub mod config;
pub mod environment;
pub mod format_detail;
pub mod keyfile;
pub mod locations;
pub mod lock;
pub mod logger;
pub mod personality;
pub mod run_parts;
pub mod session;
pub mod user;
pub mod utils;
