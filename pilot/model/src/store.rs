use crate::{ingress::IngressRule, policy::DestinationPolicy, rule::RouteRule};
use pilot_core::{
    ConfigStore, Descriptor, Message, Schema, ServiceInstance, Spec, Tags,
};
use std::sync::Arc;
use tracing::warn;

pub const ROUTE_RULE: &str = "route-rule";
pub const INGRESS_RULE: &str = "ingress-rule";
pub const DESTINATION_POLICY: &str = "destination-policy";

/// The configuration types served by the mesh control plane.
pub fn descriptors() -> Descriptor {
    Descriptor::new([
        Schema::of::<RouteRule>(ROUTE_RULE, "route-rules"),
        Schema::of::<IngressRule>(INGRESS_RULE, "ingress-rules"),
        Schema::of::<DestinationPolicy>(DESTINATION_POLICY, "destination-policies"),
    ])
}

/// Typed, selector-oriented access to the mesh configuration types of a
/// store.
///
/// Objects that fail to decode are skipped with a warning; the store
/// validates content on write, so this only happens when a back-end is
/// edited out of band.
#[derive(Clone)]
pub struct IstioConfigStore(Arc<dyn ConfigStore>);

// === impl IstioConfigStore ===

impl IstioConfigStore {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self(store)
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.0
    }

    /// All route rules, sorted by key.
    pub fn route_rules(&self) -> Vec<RouteRule> {
        self.list(ROUTE_RULE)
    }

    /// The route rules whose match condition applies to traffic originating
    /// from any of `instances`, highest precedence first. Rules with equal
    /// precedence are ordered by key.
    pub fn route_rules_by_source(&self, instances: &[ServiceInstance]) -> Vec<RouteRule> {
        // `list` yields rules sorted by key, so a stable sort on precedence
        // keeps ties in key order.
        let mut rules = self
            .route_rules()
            .into_iter()
            .filter(|rule| match &rule.match_ {
                None => true,
                Some(m) => instances.iter().any(|instance| {
                    let source_ok = match &m.source {
                        Some(source) => *source == instance.service.hostname,
                        None => true,
                    };
                    source_ok && m.source_tags.subset_of(&instance.tags)
                }),
            })
            .collect::<Vec<_>>();
        rules.sort_by(|a, b| b.precedence.cmp(&a.precedence));
        rules
    }

    /// All ingress rules, sorted by key.
    pub fn ingress_rules(&self) -> Vec<IngressRule> {
        self.list(INGRESS_RULE)
    }

    pub fn destination_policies(&self) -> Vec<DestinationPolicy> {
        self.list(DESTINATION_POLICY)
    }

    /// The version policy of `destination` whose tags equal `tags`.
    pub fn destination_policy(
        &self,
        destination: &str,
        tags: &Tags,
    ) -> Option<crate::policy::DestinationVersionPolicy> {
        let (content, _) = self.0.get(DESTINATION_POLICY, destination)?;
        let policy = decode::<DestinationPolicy>(DESTINATION_POLICY, destination, &content)?;
        policy.get(tags).cloned()
    }

    fn list<T: Spec>(&self, ty: &str) -> Vec<T> {
        let configs = match self.0.list(ty) {
            Ok(configs) => configs,
            Err(error) => {
                warn!(%error, r#type = ty, "Failed to list configuration");
                return Vec::new();
            }
        };
        configs
            .iter()
            .filter_map(|c| decode(ty, &c.key, &c.content))
            .collect()
    }
}

fn decode<T: Spec>(ty: &str, key: &str, content: &Message) -> Option<T> {
    match content.decode::<T>() {
        Ok(spec) => Some(spec),
        Err(error) => {
            warn!(%error, r#type = ty, key, "Skipping undecodable configuration");
            None
        }
    }
}
