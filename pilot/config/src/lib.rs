#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod aggregate;
mod controller;
mod memory;
#[cfg(test)]
mod testutil;

pub use self::{
    aggregate::{Aggregate, AggregateCache, AggregateStore},
    controller::{sweep, Controller},
    memory::MemoryStore,
};
