//! Test-only configuration types.

use pilot_core::{Descriptor, Message, MessageType, Schema, Spec, ValidationError};
use serde::{Deserialize, Serialize};

pub const WIDGET: &str = "widget";
pub const DERIVED: &str = "derived";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Widget {
    pub name: String,
    pub size: u32,
}

/// A type produced by some other source; the store lists it but refuses
/// writes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Derived {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Gizmo {
    pub name: String,
}

impl MessageType for Widget {
    const NAME: &'static str = "test.Widget";
}

impl Spec for Widget {
    fn key(&self) -> String {
        self.name.clone()
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.size == 0 {
            return Err("size must be positive".into());
        }
        Ok(())
    }
}

impl MessageType for Derived {
    const NAME: &'static str = "test.Derived";
}

impl Spec for Derived {
    fn key(&self) -> String {
        self.name.clone()
    }

    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

impl MessageType for Gizmo {
    const NAME: &'static str = "test.Gizmo";
}

impl Spec for Gizmo {
    fn key(&self) -> String {
        self.name.clone()
    }

    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

pub fn descriptor() -> Descriptor {
    Descriptor::new([
        Schema::of::<Widget>(WIDGET, "widgets"),
        Schema::of::<Derived>(DERIVED, "deriveds").internal(),
    ])
}

pub fn gizmo_descriptor() -> Descriptor {
    Descriptor::new([Schema::of::<Gizmo>("gizmo", "gizmos")])
}

pub fn widget(name: &str, size: u32) -> Message {
    Message::encode(&Widget {
        name: name.to_string(),
        size,
    })
    .unwrap()
}

pub fn derived(name: &str) -> Message {
    Message::encode(&Derived {
        name: name.to_string(),
    })
    .unwrap()
}

pub fn gizmo(name: &str) -> Message {
    Message::encode(&Gizmo {
        name: name.to_string(),
    })
    .unwrap()
}

/// A message no test descriptor knows about.
pub fn unknown() -> Message {
    Message {
        name: "test.Unknown".to_string(),
        value: serde_json::json!({"name": "x"}),
    }
}

pub fn init_tracing() -> tracing::subscriber::DefaultGuard {
    tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::TRACE)
            .finish(),
    )
}
