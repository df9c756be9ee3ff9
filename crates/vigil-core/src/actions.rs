//! Catalogue of fallback actions run while a loop is degraded.

use crate::error::SupervisorError;
use anyhow::Result;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use vigil_types::{ActionCategory, ErrorContext};

type Handler = dyn Fn(&ActionContext) -> Result<bool> + Send + Sync;

/// What a fallback action gets to see about the episode it runs in.
#[derive(Debug, Clone, Default)]
pub struct ActionContext {
    pub reason: String,
    pub available_resources: Vec<String>,
    pub values: ErrorContext,
}

impl ActionContext {
    pub fn new(reason: impl Into<String>, available_resources: Vec<String>) -> Self {
        Self {
            reason: reason.into(),
            available_resources,
            values: ErrorContext::new(),
        }
    }
}

pub struct AlternativeAction {
    name: String,
    category: ActionCategory,
    required_resources: Vec<String>,
    handler: Box<Handler>,
    last_success: Mutex<Option<bool>>,
}

impl std::fmt::Debug for AlternativeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlternativeAction")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("required_resources", &self.required_resources)
            .field("last_success", &self.last_success())
            .finish()
    }
}

impl AlternativeAction {
    /// `handler` returns `Ok(true)` when the action did something useful.
    pub fn new<F>(name: impl Into<String>, category: ActionCategory, handler: F) -> Self
    where
        F: Fn(&ActionContext) -> Result<bool> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            category,
            required_resources: Vec::new(),
            handler: Box::new(handler),
            last_success: Mutex::new(None),
        }
    }

    pub fn requires<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_resources
            .extend(resources.into_iter().map(Into::into));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> ActionCategory {
        self.category
    }

    pub fn required_resources(&self) -> &[String] {
        &self.required_resources
    }

    /// `None` until the action has run once.
    pub fn last_success(&self) -> Option<bool> {
        *self
            .last_success
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn can_execute(&self, available_resources: &[String]) -> bool {
        self.required_resources
            .iter()
            .all(|r| available_resources.contains(r))
    }

    /// Run the handler. Errors and panics are logged and reported as `false`.
    pub fn execute(&self, context: &ActionContext) -> bool {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (self.handler)(context)));
        let success = match outcome {
            Ok(Ok(success)) => success,
            Ok(Err(err)) => {
                tracing::warn!(action = %self.name, "alternative action failed: {err:#}");
                false
            }
            Err(_) => {
                tracing::warn!(action = %self.name, "alternative action panicked");
                false
            }
        };
        *self
            .last_success
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(success);
        success
    }
}

/// Append-only, shared catalogue in registration order.
#[derive(Debug, Default)]
pub struct ActionRegistry {
    actions: RwLock<Vec<Arc<AlternativeAction>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, action: AlternativeAction) -> Result<Arc<AlternativeAction>> {
        let mut actions = self
            .actions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if actions.iter().any(|a| a.name == action.name) {
            return Err(SupervisorError::DuplicateAction(action.name).into());
        }
        let action = Arc::new(action);
        actions.push(action.clone());
        Ok(action)
    }

    pub fn get(&self, name: &str) -> Option<Arc<AlternativeAction>> {
        self.read().into_iter().find(|a| a.name == name)
    }

    pub fn by_category(&self, category: ActionCategory) -> Vec<Arc<AlternativeAction>> {
        self.read()
            .into_iter()
            .filter(|a| a.category == category)
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<AlternativeAction>> {
        self.read()
    }

    pub fn len(&self) -> usize {
        self.actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Vec<Arc<AlternativeAction>> {
        self.actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str, category: ActionCategory) -> AlternativeAction {
        AlternativeAction::new(name, category, |_| Ok(true))
    }

    #[test]
    fn can_execute_requires_every_resource() {
        let action = noop("sync_docs", ActionCategory::Documentation).requires(["docs", "git"]);

        assert!(action.can_execute(&["git".to_string(), "docs".to_string(), "x".to_string()]));
        assert!(!action.can_execute(&["docs".to_string()]));
        assert!(noop("free", ActionCategory::Planning).can_execute(&[]));
    }

    #[test]
    fn execute_records_last_success() {
        let action = AlternativeAction::new("check", ActionCategory::Diagnostics, |ctx| {
            Ok(ctx.reason == "disk full")
        });
        assert_eq!(action.last_success(), None);

        assert!(action.execute(&ActionContext::new("disk full", vec![])));
        assert_eq!(action.last_success(), Some(true));

        assert!(!action.execute(&ActionContext::new("other", vec![])));
        assert_eq!(action.last_success(), Some(false));
    }

    #[test]
    fn execute_swallows_errors_and_panics() {
        let failing = AlternativeAction::new("fail", ActionCategory::Cleanup, |_| {
            anyhow::bail!("cleanup target missing")
        });
        assert!(!failing.execute(&ActionContext::default()));

        let panicking = AlternativeAction::new("panic", ActionCategory::Cleanup, |_| {
            panic!("handler bug")
        });
        assert!(!panicking.execute(&ActionContext::default()));
        assert_eq!(panicking.last_success(), Some(false));
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let registry = ActionRegistry::new();
        registry
            .register(noop("a", ActionCategory::Analysis))
            .expect("first");

        let err = registry
            .register(noop("a", ActionCategory::Planning))
            .expect_err("duplicate");

        assert!(matches!(
            err.downcast_ref::<SupervisorError>(),
            Some(SupervisorError::DuplicateAction(name)) if name == "a"
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn registry_lookups() {
        let registry = ActionRegistry::new();
        for (name, category) in [
            ("plan", ActionCategory::Planning),
            ("doc", ActionCategory::Documentation),
            ("doc2", ActionCategory::Documentation),
        ] {
            registry.register(noop(name, category)).expect("register");
        }

        assert_eq!(
            registry.get("doc").expect("doc").category(),
            ActionCategory::Documentation
        );
        assert!(registry.get("missing").is_none());
        let docs: Vec<String> = registry
            .by_category(ActionCategory::Documentation)
            .iter()
            .map(|a| a.name().to_string())
            .collect();
        assert_eq!(docs, vec!["doc", "doc2"]);
        assert_eq!(registry.all().len(), 3);
    }
}
