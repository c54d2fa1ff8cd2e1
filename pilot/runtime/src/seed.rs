use anyhow::{Context, Result};
use pilot_core::{ConfigStore, Message};
use serde::Deserialize;
use tracing::debug;

/// One document of a seed file.
#[derive(Debug, Deserialize)]
struct Seed {
    #[serde(rename = "type")]
    ty: String,
    spec: serde_json::Value,
}

/// Posts every `{type, spec}` document of a multi-document YAML file.
pub(crate) fn load(store: &dyn ConfigStore, yaml: &str) -> Result<usize> {
    let mut count = 0;
    for (i, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let value = serde_yaml::Value::deserialize(doc)
            .with_context(|| format!("document {i} is not valid YAML"))?;
        if value.is_null() {
            continue;
        }
        let Seed { ty, spec } =
            serde_yaml::from_value(value).with_context(|| format!("invalid document {i}"))?;
        let schema = store
            .descriptor()
            .get(&ty)
            .with_context(|| format!("document {i} has unknown type {ty:?}"))?;
        let message = Message {
            name: schema.message_name.to_string(),
            value: spec,
        };
        let revision = store
            .post(message)
            .with_context(|| format!("failed to store document {i}"))?;
        debug!(r#type = %ty, %revision, "Seeded config");
        count += 1;
    }
    Ok(count)
}
