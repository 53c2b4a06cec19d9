//! Type-indexed adapter registry.
//!
//! A read-mostly table guarded by a read-write lock; lookups take the read
//! side, `register`/`unregister` the write side. The registry never assumes an
//! adapter implements any optional contract — getters verify the capability
//! and error with [`ChannelError::Capability`] when it is missing.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::{Map, Value};

use crate::adapter::Adapter;
use crate::descriptor::{ChannelType, Descriptor};
use crate::error::ChannelError;
use crate::message::Target;

/// Process-wide adapter table, normally initialized at startup and mutated
/// only through [`register`](Registry::register) /
/// [`unregister`](Registry::unregister).
#[derive(Default)]
pub struct Registry {
    adapters: RwLock<HashMap<ChannelType, Arc<dyn Adapter>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, adapter: Arc<dyn Adapter>) {
        let ty = adapter.channel_type();
        let mut table = self.adapters.write().expect("registry poisoned");
        table.insert(ty, adapter);
    }

    pub fn unregister(&self, channel_type: &ChannelType) -> Option<Arc<dyn Adapter>> {
        let mut table = self.adapters.write().expect("registry poisoned");
        table.remove(channel_type)
    }

    pub fn get(&self, channel_type: &ChannelType) -> Option<Arc<dyn Adapter>> {
        let table = self.adapters.read().expect("registry poisoned");
        table.get(channel_type).cloned()
    }

    /// Trims, lowercases, and verifies the type is registered.
    pub fn parse_type(&self, raw: &str) -> Result<ChannelType, ChannelError> {
        let ty = ChannelType::new(raw);
        if ty.is_empty() {
            return Err(ChannelError::Unsupported(raw.to_string()));
        }
        let table = self.adapters.read().expect("registry poisoned");
        if table.contains_key(&ty) {
            Ok(ty)
        } else {
            Err(ChannelError::Unsupported(raw.to_string()))
        }
    }

    /// Registered types, sorted for stable iteration.
    pub fn types(&self) -> Vec<ChannelType> {
        let table = self.adapters.read().expect("registry poisoned");
        let mut out: Vec<ChannelType> = table.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn descriptor(&self, channel_type: &ChannelType) -> Result<Descriptor, ChannelError> {
        self.require(channel_type).map(|a| a.descriptor())
    }

    /// Canonicalizes a credential map. Empty input yields an empty map;
    /// adapters without a normalizer pass the input through.
    pub fn normalize_config(
        &self,
        channel_type: &ChannelType,
        input: &Map<String, Value>,
    ) -> Result<Map<String, Value>, ChannelError> {
        let adapter = self.require(channel_type)?;
        if input.is_empty() {
            return Ok(Map::new());
        }
        match adapter.config_normalizer() {
            Some(n) => n.normalize_config(input),
            None => Ok(input.clone()),
        }
    }

    /// Canonicalizes a per-user config map, same contract as
    /// [`normalize_config`](Registry::normalize_config).
    pub fn normalize_user_config(
        &self,
        channel_type: &ChannelType,
        input: &Map<String, Value>,
    ) -> Result<Map<String, Value>, ChannelError> {
        let adapter = self.require(channel_type)?;
        if input.is_empty() {
            return Ok(Map::new());
        }
        match adapter.config_normalizer() {
            Some(n) => n.normalize_user_config(input),
            None => Ok(input.clone()),
        }
    }

    /// Builds a delivery target from a user binding config.
    pub fn resolve_target(
        &self,
        channel_type: &ChannelType,
        user_config: &Map<String, Value>,
    ) -> Result<Target, ChannelError> {
        let adapter = self.require(channel_type)?;
        match adapter.target_resolver() {
            Some(r) => r.resolve_target(user_config),
            None => Err(self.missing(channel_type, "target resolution")),
        }
    }

    /// Pre-send canonicalization; identity when the adapter supplies none.
    /// Idempotent either way.
    pub fn normalize_target(
        &self,
        channel_type: &ChannelType,
        target: &Target,
    ) -> Result<Target, ChannelError> {
        let adapter = self.require(channel_type)?;
        Ok(match adapter.target_resolver() {
            Some(r) => r.normalize_target(target),
            None => target.clone(),
        })
    }

    /// Matches a stored binding config against criteria. Without an adapter
    /// matcher, criteria must be an equal subset of the config.
    pub fn match_binding(
        &self,
        channel_type: &ChannelType,
        config: &Map<String, Value>,
        criteria: &Map<String, Value>,
    ) -> Result<bool, ChannelError> {
        let adapter = self.require(channel_type)?;
        Ok(match adapter.binding_matcher() {
            Some(m) => m.match_binding(config, criteria),
            None => criteria.iter().all(|(k, v)| config.get(k) == Some(v)),
        })
    }

    pub fn get_receiver(&self, channel_type: &ChannelType) -> Result<Arc<dyn Adapter>, ChannelError> {
        self.capability(channel_type, "receiving", |a| a.receiver().is_some())
    }

    pub fn get_sender(&self, channel_type: &ChannelType) -> Result<Arc<dyn Adapter>, ChannelError> {
        self.capability(channel_type, "sending", |a| a.sender().is_some())
    }

    pub fn get_stream_sender(
        &self,
        channel_type: &ChannelType,
    ) -> Result<Arc<dyn Adapter>, ChannelError> {
        self.capability(channel_type, "streaming", |a| a.stream_sender().is_some())
    }

    pub fn get_directory(
        &self,
        channel_type: &ChannelType,
    ) -> Result<Arc<dyn Adapter>, ChannelError> {
        self.capability(channel_type, "directory lookup", |a| a.directory().is_some())
    }

    pub fn get_processing_status(
        &self,
        channel_type: &ChannelType,
    ) -> Result<Arc<dyn Adapter>, ChannelError> {
        self.capability(channel_type, "processing status", |a| {
            a.processing_status().is_some()
        })
    }

    fn require(&self, channel_type: &ChannelType) -> Result<Arc<dyn Adapter>, ChannelError> {
        self.get(channel_type)
            .ok_or_else(|| ChannelError::Unsupported(channel_type.to_string()))
    }

    fn capability(
        &self,
        channel_type: &ChannelType,
        what: &str,
        probe: impl Fn(&dyn Adapter) -> bool,
    ) -> Result<Arc<dyn Adapter>, ChannelError> {
        let adapter = self.require(channel_type)?;
        if probe(adapter.as_ref()) {
            Ok(adapter)
        } else {
            Err(self.missing(channel_type, what))
        }
    }

    fn missing(&self, channel_type: &ChannelType, what: &str) -> ChannelError {
        ChannelError::Capability {
            channel: channel_type.to_string(),
            capability: what.to_string(),
        }
    }
}
