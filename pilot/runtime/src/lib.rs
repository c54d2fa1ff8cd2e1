#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Command-line entry points: the discovery server and the proxy agent.

mod admin;
mod api;
mod args;
mod seed;

pub use self::args::Args;
