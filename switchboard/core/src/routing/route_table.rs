//! Route Table
//!
//! Ordered list of routes mapping a target address to a preferred protocol.
//! Routes only influence protocol selection; `transformation_rules` are
//! carried as data and never applied to payloads.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transport::ProtocolKind;

/// A rule preferring `target_protocol` for messages to `target_address`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageRoute {
    /// Protocol messages arrive on
    pub source_protocol: ProtocolKind,

    /// Protocol to deliver on
    pub target_protocol: ProtocolKind,

    /// Originating address, informational
    #[serde(default)]
    pub source_address: String,

    /// Recipient this route applies to
    pub target_address: String,

    /// Opaque transformation rules
    #[serde(default)]
    pub transformation_rules: BTreeMap<String, Value>,
}

impl MessageRoute {
    /// Route messages for `target_address` over `target_protocol`
    pub fn new(
        source_protocol: ProtocolKind,
        target_protocol: ProtocolKind,
        source_address: impl Into<String>,
        target_address: impl Into<String>,
    ) -> Self {
        Self {
            source_protocol,
            target_protocol,
            source_address: source_address.into(),
            target_address: target_address.into(),
            transformation_rules: BTreeMap::new(),
        }
    }

    /// Attach one transformation rule
    pub fn with_rule(mut self, key: impl Into<String>, rule: Value) -> Self {
        self.transformation_rules.insert(key.into(), rule);
        self
    }

    /// Whether this route applies to `target`
    pub fn matches(&self, target: &str) -> bool {
        self.target_address == target
    }
}

/// Routes in insertion order
#[derive(Clone, Debug, Default)]
pub struct RouteTable {
    routes: Vec<MessageRoute>,
}

impl RouteTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a route; earlier routes win
    pub fn add(&mut self, route: MessageRoute) {
        tracing::debug!(
            recipient = %route.target_address,
            protocol = %route.target_protocol,
            "Route added"
        );
        self.routes.push(route);
    }

    /// Routes applying to `target`, in insertion order
    pub fn matching<'a>(&'a self, target: &'a str) -> impl Iterator<Item = &'a MessageRoute> + 'a {
        self.routes.iter().filter(move |route| route.matches(target))
    }

    /// All routes
    pub fn routes(&self) -> &[MessageRoute] {
        &self.routes
    }

    /// Number of routes
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
