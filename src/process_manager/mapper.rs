//! Correlation mapping between messages and stored saga data.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;

use tracing::debug;

use super::ProcessManagerData;
use crate::message::Message;

/// Comparable correlation value extracted from a message.
pub type CorrelationKey = String;

struct Mapping<D, M> {
    key_for: Box<dyn Fn(&M) -> CorrelationKey + Send + Sync>,
    matches: Box<dyn Fn(&D, &CorrelationKey) -> bool + Send + Sync>,
}

/// Per message type correlation rules for one saga.
///
/// A message type has at most one mapping. Types without one fall back to
/// comparing the message's correlation id with the data's.
pub struct ProcessManagerPropertyMapper<D> {
    mappings: HashMap<&'static str, Box<dyn Any + Send + Sync>>,
    _data: PhantomData<fn(&D)>,
}

impl<D: ProcessManagerData> Default for ProcessManagerPropertyMapper<D> {
    fn default() -> Self {
        Self {
            mappings: HashMap::new(),
            _data: PhantomData,
        }
    }
}

impl<D: ProcessManagerData> ProcessManagerPropertyMapper<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Correlate `M` by `key_for(message)`, matched against stored data
    /// with `matches(data, key)`. Replaces any earlier mapping for `M`.
    pub fn map<M, K, F>(&mut self, key_for: K, matches: F) -> &mut Self
    where
        M: Message,
        K: Fn(&M) -> CorrelationKey + Send + Sync + 'static,
        F: Fn(&D, &CorrelationKey) -> bool + Send + Sync + 'static,
    {
        let mapping: Mapping<D, M> = Mapping {
            key_for: Box::new(key_for),
            matches: Box::new(matches),
        };
        if self
            .mappings
            .insert(M::TYPE_NAME, Box::new(mapping))
            .is_some()
        {
            debug!(message_type = M::TYPE_NAME, "Replaced correlation mapping");
        }
        self
    }

    pub fn has_mapping(&self, message_type: &str) -> bool {
        self.mappings.contains_key(message_type)
    }

    fn mapping<M: Message>(&self) -> Option<&Mapping<D, M>> {
        self.mappings
            .get(M::TYPE_NAME)
            .and_then(|m| m.downcast_ref::<Mapping<D, M>>())
    }

    pub fn correlation_key_for<M: Message>(&self, message: &M) -> CorrelationKey {
        match self.mapping::<M>() {
            Some(mapping) => (mapping.key_for)(message),
            None => message.correlation_id().to_string(),
        }
    }

    pub fn matches_stored_key<M: Message>(&self, data: &D, key: &CorrelationKey) -> bool {
        match self.mapping::<M>() {
            Some(mapping) => (mapping.matches)(data, key),
            None => data.correlation_id().to_string() == *key,
        }
    }

    /// Predicate selecting the stored data `message` belongs to.
    pub fn matcher_for<'a, M: Message>(
        &'a self,
        message: &M,
    ) -> impl Fn(&D) -> bool + Send + Sync + 'a {
        let key = self.correlation_key_for(message);
        move |data: &D| self.matches_stored_key::<M>(data, &key)
    }
}
