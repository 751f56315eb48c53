//! Handler registration table.
//!
//! Methods are registered by name at startup. A `call` for a name with no
//! entry is answered with `not_exists`; a `cast` for one is logged.

use crate::connection::ConnectionHandle;
use crate::errors::HandlerError;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

pub(crate) type CallHandler =
    Arc<dyn Fn(ConnectionHandle, Args) -> BoxFuture<'static, Result<Value, HandlerError>> + Send + Sync>;

pub(crate) type CastHandler =
    Arc<dyn Fn(ConnectionHandle, Args) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Positional arguments of an incoming `call` or `cast`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Vec<Value>);

impl Args {
    #[must_use]
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Decode a required argument.
    pub fn get<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T, HandlerError> {
        let value = self
            .0
            .get(index)
            .ok_or_else(|| HandlerError::InvalidArgs(format!("missing argument '{name}'")))?;

        T::deserialize(value)
            .map_err(|e| HandlerError::InvalidArgs(format!("argument '{name}': {e}")))
    }

    /// Decode an optional argument. Absent and `null` both yield `None`.
    pub fn optional<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
    ) -> Result<Option<T>, HandlerError> {
        match self.0.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.get(index, name).map(Some),
        }
    }

    /// Arguments from `index` onwards.
    #[must_use]
    pub fn tail(&self, index: usize) -> Args {
        Args(self.0.get(index..).map(<[Value]>::to_vec).unwrap_or_default())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Method name to handler mapping for one connection role.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    calls: HashMap<String, CallHandler>,
    casts: HashMap<String, CastHandler>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut calls: Vec<_> = self.calls.keys().collect();
        let mut casts: Vec<_> = self.casts.keys().collect();
        calls.sort();
        casts.sort();
        f.debug_struct("HandlerRegistry")
            .field("calls", &calls)
            .field("casts", &casts)
            .finish()
    }
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `call` packets naming `method`.
    pub fn on_call<F, Fut>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(ConnectionHandle, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.calls.insert(
            method.into(),
            Arc::new(move |conn, args| Box::pin(handler(conn, args))),
        );
        self
    }

    /// Register the handler for `cast` packets naming `method`.
    pub fn on_cast<F, Fut>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(ConnectionHandle, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.casts.insert(
            method.into(),
            Arc::new(move |conn, args| Box::pin(handler(conn, args))),
        );
        self
    }

    pub(crate) fn call_handler(&self, method: &str) -> Option<CallHandler> {
        self.calls.get(method).cloned()
    }

    pub(crate) fn cast_handler(&self, method: &str) -> Option<CastHandler> {
        self.casts.get(method).cloned()
    }
}
