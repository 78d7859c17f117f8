//! Message type registry.
//!
//! Each message type is registered once with its ancestor chain resolved
//! up front, so dispatch consults plain data instead of walking types.

use std::collections::HashMap;

use tracing::debug;

use super::{short_type_name, Message, ROOT_MESSAGE_TYPE};

/// Registered type with its precomputed chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTypeInfo {
    /// Fully-qualified name.
    pub full_name: String,
    /// Last segment of the full name.
    pub name: String,
    /// The type followed by its ancestors, nearest first, root excluded.
    pub chain: Vec<String>,
}

impl MessageTypeInfo {
    pub fn of<M: Message>() -> Self {
        let mut chain = Vec::with_capacity(M::BASE_TYPES.len() + 1);
        chain.push(M::TYPE_NAME.to_string());
        chain.extend(
            M::BASE_TYPES
                .iter()
                .filter(|t| **t != ROOT_MESSAGE_TYPE)
                .map(|t| t.to_string()),
        );
        Self {
            full_name: M::TYPE_NAME.to_string(),
            name: short_type_name(M::TYPE_NAME).to_string(),
            chain,
        }
    }

    /// Ancestors only.
    pub fn ancestors(&self) -> &[String] {
        &self.chain[1..]
    }
}

/// Type binder for inbound type names.
#[derive(Debug, Clone, Default)]
pub struct MessageRegistry {
    types: HashMap<String, MessageTypeInfo>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a message type. Registering twice is a no-op.
    pub fn register<M: Message>(&mut self) -> &MessageTypeInfo {
        self.types.entry(M::TYPE_NAME.to_string()).or_insert_with(|| {
            let info = MessageTypeInfo::of::<M>();
            debug!(message_type = %info.full_name, chain = ?info.chain, "Registered message type");
            info
        })
    }

    /// Resolve a type name from headers.
    ///
    /// Exact full-name matches win; otherwise a short name is accepted when
    /// exactly one registered type carries it.
    pub fn resolve(&self, type_name: &str) -> Option<&MessageTypeInfo> {
        if let Some(info) = self.types.get(type_name) {
            return Some(info);
        }
        let short = short_type_name(type_name);
        let mut matches = self.types.values().filter(|info| info.name == short);
        match (matches.next(), matches.next()) {
            (Some(info), None) => Some(info),
            _ => None,
        }
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
