//! Registry mapping stored type tags back to concrete values
//!
//! Steps, ports, tokens and workflows are persisted with a caller-chosen type
//! tag next to their serialized params. The store never interprets the tag;
//! the engine registers one factory per tag and rebuilds its objects from the
//! stored `(tag, params)` pair.

use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Factory function type for rebuilding a value from stored params
pub type Factory<T> = Box<dyn Fn(&Value) -> Result<T, serde_json::Error> + Send + Sync>;

/// Closed mapping from type tag to factory
///
/// # Example
///
/// ```
/// use lineage_store::registry::TypeRegistry;
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct CommandStep {
///     command: String,
/// }
///
/// enum Step {
///     Command(CommandStep),
/// }
///
/// let mut registry = TypeRegistry::new();
/// registry.register("CommandStep", |params| {
///     serde_json::from_value::<CommandStep>(params.clone()).map(Step::Command)
/// });
///
/// let step = registry
///     .create("CommandStep", &serde_json::json!({"command": "ls"}))
///     .unwrap();
/// assert!(matches!(step, Step::Command(c) if c.command == "ls"));
/// ```
pub struct TypeRegistry<T> {
    factories: HashMap<String, Factory<T>>,
}

impl<T> Default for TypeRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TypeRegistry<T> {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory for `tag`, replacing any previous one
    pub fn register<F>(&mut self, tag: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> Result<T, serde_json::Error> + Send + Sync + 'static,
    {
        self.factories.insert(tag.into(), Box::new(factory));
    }

    /// Register a type deserialized directly from its params
    pub fn register_deserialize<U>(&mut self, tag: impl Into<String>)
    where
        T: 'static,
        U: DeserializeOwned + Into<T> + 'static,
    {
        self.register(tag, |params: &Value| {
            serde_json::from_value::<U>(params.clone()).map(Into::into)
        });
    }

    /// Check if a tag is registered
    pub fn contains(&self, tag: &str) -> bool {
        self.factories.contains_key(tag)
    }

    /// Rebuild a value from its stored tag and params
    pub fn create(&self, tag: &str, params: &Value) -> Result<T, RegistryError> {
        let factory = self
            .factories
            .get(tag)
            .ok_or_else(|| RegistryError::UnknownType(tag.to_string()))?;

        factory(params).map_err(|source| RegistryError::Deserialization {
            tag: tag.to_string(),
            source,
        })
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Get all registered tags
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(|s| s.as_str())
    }
}

impl<T> fmt::Debug for TypeRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("tags", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Tag not registered
    #[error("unknown type tag: {0}")]
    UnknownType(String),

    /// Stored params do not match the registered type
    #[error("failed to rebuild {tag}: {source}")]
    Deserialization {
        tag: String,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Deserialize)]
    struct FilePort {
        path: String,
    }

    #[derive(Debug, PartialEq, Deserialize)]
    struct ChannelPort {
        capacity: u32,
    }

    #[derive(Debug, PartialEq)]
    enum Port {
        File(FilePort),
        Channel(ChannelPort),
    }

    impl From<FilePort> for Port {
        fn from(p: FilePort) -> Self {
            Port::File(p)
        }
    }

    impl From<ChannelPort> for Port {
        fn from(p: ChannelPort) -> Self {
            Port::Channel(p)
        }
    }

    fn registry() -> TypeRegistry<Port> {
        let mut registry = TypeRegistry::new();
        registry.register_deserialize::<FilePort>("FilePort");
        registry.register_deserialize::<ChannelPort>("ChannelPort");
        registry
    }

    #[test]
    fn test_register_and_create() {
        let registry = registry();
        assert!(registry.contains("FilePort"));
        assert!(!registry.contains("Port"));
        assert_eq!(registry.len(), 2);

        let port = registry
            .create("ChannelPort", &json!({"capacity": 8}))
            .expect("should rebuild port");
        assert_eq!(port, Port::Channel(ChannelPort { capacity: 8 }));
    }

    #[test]
    fn test_unknown_tag() {
        let result = registry().create("SocketPort", &json!({}));
        assert!(matches!(result, Err(RegistryError::UnknownType(t)) if t == "SocketPort"));
    }

    #[test]
    fn test_invalid_params() {
        // Missing required field
        let result = registry().create("FilePort", &json!({}));
        assert!(matches!(
            result,
            Err(RegistryError::Deserialization { tag, .. }) if tag == "FilePort"
        ));
    }

    #[test]
    fn test_register_replaces_factory() {
        let mut registry = registry();
        registry.register("FilePort", |_| {
            Ok(Port::File(FilePort {
                path: "/dev/null".to_string(),
            }))
        });

        let port = registry.create("FilePort", &json!({"path": "/tmp/x"})).unwrap();
        assert_eq!(
            port,
            Port::File(FilePort {
                path: "/dev/null".to_string()
            })
        );
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_registry_debug() {
        let debug_str = format!("{:?}", registry());
        assert!(debug_str.contains("FilePort"));
        assert!(debug_str.contains("ChannelPort"));
    }

    #[test]
    fn test_tags_iterator() {
        let mut tags: Vec<_> = registry().tags().map(str::to_string).collect();
        tags.sort();
        assert_eq!(tags, vec!["ChannelPort", "FilePort"]);
    }
}
