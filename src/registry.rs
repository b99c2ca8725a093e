//! Service registry mapping method names to callables.
//!
//! Calls and notifications have separate namespaces: a call handler
//! produces a result (or a domain error string) that travels back in a
//! response, a notification handler produces nothing.
//!
//! Handlers run inline in the endpoint's read loop, so they should be
//! quick; anything long-running belongs on its own task with the handler
//! only kicking it off.
//!
//! # Example
//!
//! ```
//! use crosscall::registry::ServiceRegistry;
//! use crosscall::Value;
//!
//! let mut registry = ServiceRegistry::new();
//! registry.register_call("sum", |params: &[Value]| {
//!     let a = params[0].as_i64().ok_or("sum: bad argument")?;
//!     let b = params[1].as_i64().ok_or("sum: bad argument")?;
//!     Ok(Value::from(a + b))
//! });
//! registry.register_notify("log", |params: &[Value]| {
//!     println!("{:?}", params);
//! });
//! ```

use std::collections::HashMap;

use rmpv::Value;

/// A callable serving incoming requests.
///
/// `Err` carries a human-readable domain error that is propagated to the
/// remote caller in the response's error slot.
pub trait CallHandler: Send + Sync {
    fn call(&self, params: &[Value]) -> Result<Value, String>;
}

impl<F> CallHandler for F
where
    F: Fn(&[Value]) -> Result<Value, String> + Send + Sync,
{
    fn call(&self, params: &[Value]) -> Result<Value, String> {
        self(params)
    }
}

/// A callable serving incoming notifications. No reply exists, so there
/// is nothing to return.
pub trait NotifyHandler: Send + Sync {
    fn notify(&self, params: &[Value]);
}

impl<F> NotifyHandler for F
where
    F: Fn(&[Value]) + Send + Sync,
{
    fn notify(&self, params: &[Value]) {
        self(params)
    }
}

/// Registry of call and notification handlers, keyed by method name.
#[derive(Default)]
pub struct ServiceRegistry {
    calls: HashMap<String, Box<dyn CallHandler>>,
    notifies: HashMap<String, Box<dyn NotifyHandler>>,
}

impl ServiceRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call handler. Replaces any previous handler of the
    /// same name.
    pub fn register_call(&mut self, name: &str, handler: impl CallHandler + 'static) {
        self.calls.insert(name.to_string(), Box::new(handler));
    }

    /// Register a notification handler. Replaces any previous handler of
    /// the same name.
    pub fn register_notify(&mut self, name: &str, handler: impl NotifyHandler + 'static) {
        self.notifies.insert(name.to_string(), Box::new(handler));
    }

    /// Resolve a call handler by name.
    pub fn get_call(&self, name: &str) -> Option<&dyn CallHandler> {
        self.calls.get(name).map(|h| h.as_ref())
    }

    /// Resolve a notification handler by name.
    pub fn get_notify(&self, name: &str) -> Option<&dyn NotifyHandler> {
        self.notifies.get(name).map(|h| h.as_ref())
    }

    /// Names of all registered call handlers.
    pub fn call_names(&self) -> Vec<&str> {
        self.calls.keys().map(|s| s.as_str()).collect()
    }

    /// Names of all registered notification handlers.
    pub fn notify_names(&self) -> Vec<&str> {
        self.notifies.keys().map(|s| s.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_resolve_call() {
        let mut registry = ServiceRegistry::new();
        registry.register_call("echo", |params: &[Value]| Ok(params[0].clone()));

        let handler = registry.get_call("echo").unwrap();
        let result = handler.call(&[Value::from("hi")]).unwrap();
        assert_eq!(result, Value::from("hi"));
    }

    #[test]
    fn call_handler_domain_error() {
        let mut registry = ServiceRegistry::new();
        registry.register_call("fail", |_: &[Value]| Err("nope".to_string()));

        let err = registry.get_call("fail").unwrap().call(&[]).unwrap_err();
        assert_eq!(err, "nope");
    }

    #[test]
    fn register_and_resolve_notify() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();

        let mut registry = ServiceRegistry::new();
        registry.register_notify("tick", move |_: &[Value]| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        registry.get_notify("tick").unwrap().notify(&[]);
        registry.get_notify("tick").unwrap().notify(&[]);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn namespaces_are_separate() {
        let mut registry = ServiceRegistry::new();
        registry.register_call("ping", |_: &[Value]| Ok(Value::Nil));

        assert!(registry.get_call("ping").is_some());
        assert!(registry.get_notify("ping").is_none());
    }

    #[test]
    fn unknown_name_resolves_to_none() {
        let registry = ServiceRegistry::new();
        assert!(registry.get_call("nope").is_none());
        assert!(registry.get_notify("nope").is_none());
    }

    #[test]
    fn names_listing() {
        let mut registry = ServiceRegistry::new();
        registry.register_call("a", |_: &[Value]| Ok(Value::Nil));
        registry.register_call("b", |_: &[Value]| Ok(Value::Nil));
        registry.register_notify("c", |_: &[Value]| {});

        let mut calls = registry.call_names();
        calls.sort_unstable();
        assert_eq!(calls, vec!["a", "b"]);
        assert_eq!(registry.notify_names(), vec!["c"]);
    }
}
