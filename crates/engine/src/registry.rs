use std::collections::HashSet;

use tracing::{debug, info};

use crate::definition::{Detector, EventDefinition, Handler};

/// Ordered, append-only set of event definitions.
///
/// Registration order is the order detectors are evaluated in and the order
/// detection results are reported in.
pub struct EventRegistry {
    definitions: Vec<EventDefinition>,
    names: HashSet<String>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self {
            definitions: Vec::new(),
            names: HashSet::new(),
        }
    }

    /// Register a definition. Returns error if the name is already registered.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        detector: impl Detector + 'static,
        handler: impl Handler + 'static,
    ) -> Result<(), RegistryError> {
        self.insert(EventDefinition::new(name, detector, handler))
    }

    /// Register an already-built definition.
    pub fn insert(&mut self, definition: EventDefinition) -> Result<(), RegistryError> {
        if definition.name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if !self.names.insert(definition.name.clone()) {
            return Err(RegistryError::DuplicateName(definition.name));
        }
        info!(event = %definition.name, position = self.definitions.len(), "Registered event definition");
        self.definitions.push(definition);
        Ok(())
    }

    /// All definitions in registration order.
    pub fn candidates(&self) -> &[EventDefinition] {
        &self.definitions
    }

    /// Definitions allowed by `listened_events`, still in registration order.
    /// `None` allows everything.
    pub fn candidates_for(&self, listened_events: Option<&[String]>) -> Vec<EventDefinition> {
        match listened_events {
            None => self.definitions.clone(),
            Some(allow) => {
                for name in allow {
                    if !self.names.contains(name) {
                        debug!(event = %name, "listened event has no registered definition");
                    }
                }
                self.definitions
                    .iter()
                    .filter(|d| allow.iter().any(|a| a == &d.name))
                    .cloned()
                    .collect()
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.definitions.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Event definition '{0}' is already registered")]
    DuplicateName(String),

    #[error("Event definition name must not be empty")]
    EmptyName,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{detector_fn, handler_fn};

    fn register(registry: &mut EventRegistry, name: &str) -> Result<(), RegistryError> {
        registry.register(
            name,
            detector_fn(|_, _, _| Ok(true)),
            handler_fn(|_, _, _| Ok(Vec::new())),
        )
    }

    #[test]
    fn test_register_preserves_order() {
        let mut registry = EventRegistry::new();
        for name in ["orders.cancelled", "users.created", "orders.shipped"] {
            register(&mut registry, name).unwrap();
        }

        assert_eq!(registry.len(), 3);
        assert_eq!(
            registry.names(),
            vec!["orders.cancelled", "users.created", "orders.shipped"]
        );
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = EventRegistry::new();
        register(&mut registry, "orders.cancelled").unwrap();
        assert!(matches!(
            register(&mut registry, "orders.cancelled"),
            Err(RegistryError::DuplicateName(name)) if name == "orders.cancelled"
        ));
        assert!(matches!(register(&mut registry, " "), Err(RegistryError::EmptyName)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_allow_list_keeps_registration_order() {
        let mut registry = EventRegistry::new();
        for name in ["a", "b", "c"] {
            register(&mut registry, name).unwrap();
        }

        let allow = vec!["c".to_string(), "a".to_string(), "missing".to_string()];
        let selected: Vec<String> = registry
            .candidates_for(Some(&allow))
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(selected, vec!["a", "c"]);
        assert_eq!(registry.candidates_for(None).len(), 3);
    }
}
