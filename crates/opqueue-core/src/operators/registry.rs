use std::collections::HashMap;
use std::sync::Arc;

use super::{Operator, Typed, TypedOperator};
use crate::domain::{DelegateError, Result};

/// Registry of operators (uri -> operator).
///
/// Built during initialization (mutable), shared read-only afterwards
/// behind an `Arc`, so lookups need no lock.
#[derive(Default)]
pub struct OperatorRegistry {
    operators: HashMap<String, Arc<dyn Operator>>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self {
            operators: HashMap::new(),
        }
    }

    /// Register an operator under its URI. A second registration of the same
    /// URI is an error.
    pub fn register(&mut self, operator: Arc<dyn Operator>) -> Result<()> {
        let uri = operator.uri();
        if self.operators.contains_key(&uri) {
            return Err(DelegateError::DuplicateOperator(uri));
        }
        self.operators.insert(uri, operator);
        Ok(())
    }

    pub fn register_typed<O: TypedOperator>(&mut self, operator: O) -> Result<()> {
        self.register(Arc::new(Typed::new(operator)))
    }

    pub fn get(&self, uri: &str) -> Option<Arc<dyn Operator>> {
        self.operators.get(uri).cloned()
    }

    pub fn resolve(&self, uri: &str) -> Result<Arc<dyn Operator>> {
        self.get(uri)
            .ok_or_else(|| DelegateError::OperatorNotFound(uri.to_string()))
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.operators.contains_key(uri)
    }

    /// Registered URIs, sorted.
    pub fn uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = self.operators.keys().cloned().collect();
        uris.sort();
        uris
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }
}
