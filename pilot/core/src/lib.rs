#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod registry;
pub mod service;
pub mod tags;
pub mod validation;

pub use self::{
    config::{
        Config, ConfigHandler, ConfigStore, ConfigStoreCache, DecodeError, Descriptor, Event,
        Message, MessageType, Revision, Schema, Spec,
    },
    error::{Error, ErrorKind, Result, ValidationError},
    registry::{
        Controller, InstanceHandler, Registry, ServiceAccounts, ServiceDiscovery, ServiceHandler,
    },
    service::{
        parse_service_key, service_key, NetworkEndpoint, Port, PortList, Protocol, Service,
        ServiceInstance,
    },
    tags::{Tags, TagsList},
};
pub use ahash::AHashSet as HashSet;
