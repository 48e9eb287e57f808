//! Function registry: named collections of remotely callable functions.
//!
//! A `Collection` groups functions under one namespace. The `Registry` maps
//! collection names to collections and is append-only; a duplicate name is
//! rejected and never merged into the existing collection.

use crate::error::{CallError, FunctionError};
use crate::server::ClientId;
use crate::value::{Value, ValueType};
use crate::{IpcError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Result returned by a function implementation.
pub type FunctionResult = std::result::Result<Vec<Value>, FunctionError>;

type Callback = Arc<dyn Fn(ClientId, &[Value]) -> FunctionResult + Send + Sync>;

/// A named function with a fixed signature, bound to its implementation.
///
/// Cloning is cheap; the callback is shared.
#[derive(Clone)]
pub struct Function {
    name: String,
    params: Vec<ValueType>,
    returns: Vec<ValueType>,
    callback: Callback,
}

impl Function {
    pub fn new<F>(
        name: impl Into<String>,
        params: Vec<ValueType>,
        returns: Vec<ValueType>,
        callback: F,
    ) -> Self
    where
        F: Fn(ClientId, &[Value]) -> FunctionResult + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            params,
            returns,
            callback: Arc::new(callback),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[ValueType] {
        &self.params
    }

    pub fn returns(&self) -> &[ValueType] {
        &self.returns
    }

    /// Check the arguments, run the implementation and check what it returned.
    ///
    /// Failures and panics inside the implementation become `HandlerFailure`.
    pub fn invoke(
        &self,
        client: ClientId,
        args: &[Value],
    ) -> std::result::Result<Vec<Value>, CallError> {
        check_signature(&self.params, args)
            .map_err(|reason| CallError::argument(format!("{}: {}", self.name, reason)))?;

        let outcome = catch_unwind(AssertUnwindSafe(|| (self.callback)(client, args)));
        let values = match outcome {
            Ok(Ok(values)) => values,
            Ok(Err(err)) => return Err(err.into()),
            Err(panic) => {
                return Err(CallError::handler_failure(format!(
                    "{} panicked: {}",
                    self.name,
                    panic_message(panic.as_ref())
                )))
            }
        };

        check_signature(&self.returns, &values).map_err(|reason| {
            CallError::handler_failure(format!("{} returned bad values: {}", self.name, reason))
        })?;
        Ok(values)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("returns", &self.returns)
            .finish_non_exhaustive()
    }
}

fn check_signature(expected: &[ValueType], values: &[Value]) -> std::result::Result<(), String> {
    if expected.len() != values.len() {
        return Err(format!(
            "expected {} value(s), got {}",
            expected.len(),
            values.len()
        ));
    }
    for (index, (ty, value)) in expected.iter().zip(values).enumerate() {
        if !ty.accepts(value) {
            return Err(format!(
                "value {} should be {}, got {}",
                index,
                ty,
                value.value_type()
            ));
        }
    }
    Ok(())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A named group of functions; function names are unique within it.
#[derive(Debug, Clone)]
pub struct Collection {
    name: String,
    functions: Vec<Function>,
}

impl Collection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Functions in registration order.
    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn add_function(&mut self, function: Function) -> Result<()> {
        if self.function(&function.name).is_some() {
            return Err(IpcError::DuplicateName {
                kind: "function",
                name: format!("{}.{}", self.name, function.name),
            });
        }
        self.functions.push(function);
        Ok(())
    }

    /// Builder form of `add_function`.
    ///
    /// A function whose name is already present is dropped with a warning and
    /// the first one stays. Use `add_function` when a clash must be an error.
    ///
    /// ```
    /// use ipcx::{Collection, Function, Value, ValueType};
    ///
    /// let collection = Collection::new("sys")
    ///     .with_function(Function::new("ping", vec![], vec![ValueType::String], |_, _| {
    ///         Ok(vec![Value::from("pong")])
    ///     }))
    ///     .with_function(Function::new("ping", vec![], vec![], |_, _| Ok(vec![])));
    ///
    /// assert_eq!(collection.functions().len(), 1);
    /// assert_eq!(collection.functions()[0].returns(), &[ValueType::String][..]);
    /// ```
    pub fn with_function(mut self, function: Function) -> Self {
        if let Err(e) = self.add_function(function) {
            tracing::warn!("Ignoring function: {}", e);
        }
        self
    }
}

/// Collection name -> collection.
#[derive(Debug, Default)]
pub struct Registry {
    collections: BTreeMap<String, Collection>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a collection. Fails without touching the registry on a name clash.
    pub fn register(&mut self, collection: Collection) -> Result<()> {
        if self.collections.contains_key(&collection.name) {
            return Err(IpcError::DuplicateName {
                kind: "collection",
                name: collection.name,
            });
        }
        self.collections.insert(collection.name.clone(), collection);
        Ok(())
    }

    pub fn lookup(
        &self,
        collection: &str,
        function: &str,
    ) -> std::result::Result<Function, CallError> {
        let found = self
            .collections
            .get(collection)
            .ok_or_else(|| CallError::not_found(format!("unknown collection '{}'", collection)))?;
        found.function(function).cloned().ok_or_else(|| {
            CallError::not_found(format!("unknown function '{}.{}'", collection, function))
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    pub fn clear(&mut self) {
        self.collections.clear();
    }
}
