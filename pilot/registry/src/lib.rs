#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod aggregate;
mod file;
mod memory;

pub use self::{
    aggregate::Aggregate,
    file::{LoadError, RegistryFile, ServiceEntry},
    memory::{InstanceSpec, MemoryRegistry},
};
