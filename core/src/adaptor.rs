//! Channel adaptors.
//!
//! An adaptor carries the protocol-specific behavior of a channel: decoding inbound bytes,
//! encoding outbound data, and reacting to session lifecycle events. The dispatcher builds exactly
//! one adaptor at startup from the identifier in the [RuntimeConfig](crate::config::RuntimeConfig)
//! and shares it with every lane through the [TaskContext](crate::TaskContext).
//!
//! Implementations are registered up front with an [AdaptorRegistry] rather than looked up by
//! type name at runtime:
//!
//! ```rust
//! use lanes_core::adaptor::{AdaptorRegistry, ChannelAdaptor};
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! impl ChannelAdaptor for Echo {
//!     fn name(&self) -> &str {
//!         "echo"
//!     }
//! }
//!
//! let mut registry = AdaptorRegistry::new();
//! registry.register("echo", |_cfg| Ok(Arc::new(Echo)));
//! assert!(registry.contains("echo"));
//! ```

use crate::config::RuntimeConfig;
use crate::memory::Buffer;
use crate::task::ChannelSession;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;

/// Protocol behavior shared by all lanes. Every hook has a pass-through default.
pub trait ChannelAdaptor: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Called when the I/O layer opens a session.
    fn on_open(&self, _session: &dyn ChannelSession) -> Result<()> {
        Ok(())
    }

    /// Consumes bytes read from the session.
    fn on_read(&self, _session: &dyn ChannelSession, _input: &Buffer) -> Result<()> {
        Ok(())
    }

    /// Fills `output` with bytes to write to the session. Returns the number of bytes written.
    fn on_write(&self, _session: &dyn ChannelSession, _output: &mut Buffer) -> Result<usize> {
        Ok(0)
    }

    /// Called after the session is closed.
    fn on_close(&self, _session: &dyn ChannelSession) {}
}

/// Adaptor that accepts everything and produces nothing.
#[derive(Debug, Default)]
pub struct NoopAdaptor;

impl ChannelAdaptor for NoopAdaptor {
    fn name(&self) -> &str {
        "noop"
    }
}

/// Builds an adaptor from the runtime configuration.
pub type AdaptorFactory =
    Box<dyn Fn(&RuntimeConfig) -> Result<Arc<dyn ChannelAdaptor>> + Send + Sync>;

/// Maps adaptor identifiers to factories.
pub struct AdaptorRegistry {
    factories: HashMap<String, AdaptorFactory>,
}

impl AdaptorRegistry {
    /// Creates a registry with the built-in `noop` adaptor.
    pub fn new() -> Self {
        let mut registry = AdaptorRegistry {
            factories: HashMap::new(),
        };
        registry.register("noop", |_cfg| Ok(Arc::new(NoopAdaptor)));
        registry
    }

    /// Registers `factory` under `name`, replacing any previous registration.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&RuntimeConfig) -> Result<Arc<dyn ChannelAdaptor>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Looks up the factory for `name` and runs it. Returns `None` if nothing is registered under
    /// `name`.
    pub(crate) fn build(
        &self,
        name: &str,
        config: &RuntimeConfig,
    ) -> Option<Result<Arc<dyn ChannelAdaptor>>> {
        self.factories.get(name).map(|factory| factory(config))
    }
}

impl Default for AdaptorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AdaptorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("AdaptorRegistry")
            .field("adaptors", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_config;
    use anyhow::anyhow;

    struct Named(String);

    impl ChannelAdaptor for Named {
        fn name(&self) -> &str {
            &self.0
        }
    }

    #[test]
    fn core_registry_builds_registered_adaptor() {
        let mut registry = AdaptorRegistry::new();
        registry.register("named", |cfg| Ok(Arc::new(Named(cfg.lanes.name_prefix.clone()))));
        let config = default_config();

        let adaptor = registry.build("named", &config).unwrap().unwrap();
        assert_eq!(adaptor.name(), "channel-handler");
        let noop = registry.build("noop", &config).unwrap().unwrap();
        assert_eq!(noop.name(), "noop");
        assert!(registry.build("missing", &config).is_none());
    }

    #[test]
    fn core_registry_surfaces_factory_errors() {
        let mut registry = AdaptorRegistry::new();
        registry.register("broken", |_cfg| Err(anyhow!("missing certificate")));
        let result = registry.build("broken", &default_config()).unwrap();
        assert!(result.is_err());
    }
}
