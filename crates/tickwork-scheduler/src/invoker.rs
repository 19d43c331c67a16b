//! Name-based callback invocation.
//!
//! Tasks only carry a function *name* across the persistence boundary. An
//! [`Invoker`] turns that name plus the stored string arguments back into a
//! call. [`FunctionRegistry`] is the stock implementation: callbacks are
//! registered up front under a name with a declared arity.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{InvocationError, RegistrationError};

/// Resolves a function name and runs it with positional string arguments.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Whether `function` names something this invoker can run.
    fn resolves(&self, function: &str) -> bool;

    async fn invoke(&self, function: &str, args: &[String]) -> Result<(), InvocationError>;
}

pub type CallbackFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;
type Callback = Arc<dyn Fn(Vec<String>) -> CallbackFuture + Send + Sync>;

struct Registered {
    arity: usize,
    callback: Callback,
}

/// Registry mapping function names to async callbacks.
pub struct FunctionRegistry {
    functions: RwLock<HashMap<String, Registered>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self {
            functions: RwLock::new(HashMap::new()),
        }
    }

    /// Register `callback` under `name`, taking exactly `arity` arguments.
    ///
    /// The callback receives the arguments in the order they were scheduled
    /// with. An `Err(reason)` from the callback is reported as
    /// [`InvocationError::Failed`].
    pub fn register<F, Fut>(&self, name: &str, arity: usize, callback: F) -> Result<(), RegistrationError>
    where
        F: Fn(Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        if name.trim().is_empty() {
            return Err(RegistrationError::EmptyName);
        }
        let mut functions = self.functions.write().expect("function registry poisoned");
        if functions.contains_key(name) {
            return Err(RegistrationError::Duplicate {
                name: name.to_string(),
            });
        }
        let callback: Callback =
            Arc::new(move |args: Vec<String>| -> CallbackFuture { Box::pin(callback(args)) });
        functions.insert(name.to_string(), Registered { arity, callback });
        debug!(function = name, arity, "function registered");
        Ok(())
    }

    /// Remove a function. Returns false if the name was not registered.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self
            .functions
            .write()
            .expect("function registry poisoned")
            .remove(name)
            .is_some();
        if removed {
            debug!(function = name, "function unregistered");
        }
        removed
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let functions = self.functions.read().expect("function registry poisoned");
        let mut names: Vec<String> = functions.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Invoker for FunctionRegistry {
    fn resolves(&self, function: &str) -> bool {
        self.functions
            .read()
            .expect("function registry poisoned")
            .contains_key(function)
    }

    async fn invoke(&self, function: &str, args: &[String]) -> Result<(), InvocationError> {
        // Clone the Arc out so the lock is not held across the await.
        let (arity, callback) = {
            let functions = self.functions.read().expect("function registry poisoned");
            let registered =
                functions
                    .get(function)
                    .ok_or_else(|| InvocationError::UnknownFunction {
                        function: function.to_string(),
                    })?;
            (registered.arity, Arc::clone(&registered.callback))
        };

        if args.len() != arity {
            return Err(InvocationError::ArityMismatch {
                function: function.to_string(),
                expected: arity,
                got: args.len(),
            });
        }

        callback(args.to_vec())
            .await
            .map_err(|reason| InvocationError::Failed {
                function: function.to_string(),
                reason,
            })
    }
}
