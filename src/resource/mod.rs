//! Remote resource seam.
//!
//! A management protocol sees the node as a flat set of named, typed values.
//! Each value has a getter, an optional setter invoked on remote writes, and
//! observers notified when the value changes. The registry knows nothing of
//! the wire format that carries these values.

mod bindings;

pub use bindings::bind_node_resources;

use crate::audio::StartError;
use crate::config::ConfigError;
use log::debug;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// A resource value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn as_bool(&self) -> Result<bool, ResourceError> {
        match self {
            Self::Bool(b) => Ok(*b),
            Self::Int(i) => Ok(*i != 0),
            _ => Err(ResourceError::TypeMismatch { expected: "bool" }),
        }
    }

    pub fn as_int(&self) -> Result<i64, ResourceError> {
        match self {
            Self::Int(i) => Ok(*i),
            _ => Err(ResourceError::TypeMismatch { expected: "int" }),
        }
    }

    pub fn as_text(&self) -> Result<&str, ResourceError> {
        match self {
            Self::Text(s) => Ok(s),
            _ => Err(ResourceError::TypeMismatch { expected: "text" }),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

/// A named value exposed to the management protocol.
pub trait Resource: Send + Sync {
    fn get(&self) -> Value;

    /// Apply a remote write. Read-only resources keep the default.
    fn set_from_remote(&self, _value: Value) -> Result<(), ResourceError> {
        Err(ResourceError::ReadOnly)
    }

    fn is_writable(&self) -> bool {
        false
    }
}

type Getter = Box<dyn Fn() -> Value + Send + Sync>;
type Setter = Box<dyn Fn(Value) -> Result<(), ResourceError> + Send + Sync>;
type Observer = Box<dyn Fn(&str, &Value) + Send + Sync>;
type WriteHook = Box<dyn Fn(&str) + Send + Sync>;

/// Read-only resource backed by a closure.
pub struct ReadOnly {
    get: Getter,
}

impl ReadOnly {
    pub fn new<G>(get: G) -> Self
    where
        G: Fn() -> Value + Send + Sync + 'static,
    {
        Self { get: Box::new(get) }
    }
}

impl Resource for ReadOnly {
    fn get(&self) -> Value {
        (self.get)()
    }
}

/// Read-write resource backed by a getter and a setter.
pub struct ReadWrite {
    get: Getter,
    set: Setter,
}

impl ReadWrite {
    pub fn new<G, S>(get: G, set: S) -> Self
    where
        G: Fn() -> Value + Send + Sync + 'static,
        S: Fn(Value) -> Result<(), ResourceError> + Send + Sync + 'static,
    {
        Self {
            get: Box::new(get),
            set: Box::new(set),
        }
    }
}

impl Resource for ReadWrite {
    fn get(&self) -> Value {
        (self.get)()
    }

    fn set_from_remote(&self, value: Value) -> Result<(), ResourceError> {
        (self.set)(value)
    }

    fn is_writable(&self) -> bool {
        true
    }
}

/// Named resources plus the write hooks and change observers around them.
#[derive(Default)]
pub struct ResourceRegistry {
    resources: Mutex<BTreeMap<String, Arc<dyn Resource>>>,
    observers: Mutex<Vec<Observer>>,
    write_hooks: Mutex<Vec<WriteHook>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn resources(&self) -> MutexGuard<'_, BTreeMap<String, Arc<dyn Resource>>> {
        self.resources.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `resource` under `name`, replacing any earlier entry.
    pub fn register(&self, name: impl Into<String>, resource: impl Resource + 'static) {
        self.resources().insert(name.into(), Arc::new(resource));
    }

    pub fn read(&self, name: &str) -> Result<Value, ResourceError> {
        let resource = self.lookup(name)?;
        Ok(resource.get())
    }

    /// Apply a write arriving from the management server.
    ///
    /// Write hooks run for every write addressed to a known resource, even
    /// one the resource rejects; observers only see accepted values.
    pub fn write_from_remote(&self, name: &str, value: Value) -> Result<(), ResourceError> {
        let resource = self.lookup(name)?;
        debug!("Remote write {} = {}", name, value);
        let result = if resource.is_writable() {
            resource.set_from_remote(value)
        } else {
            Err(ResourceError::ReadOnly)
        };

        for hook in self.write_hooks.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            hook(name);
        }
        result?;
        self.notify_changed(name);
        Ok(())
    }

    /// Run `hook` on every remote write to a known resource.
    pub fn on_remote_write<F>(&self, hook: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.write_hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(hook));
    }

    /// Observe value changes pushed through [`notify_changed`](Self::notify_changed).
    pub fn subscribe<F>(&self, observer: F)
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(observer));
    }

    /// Push the current value of `name` to every observer.
    pub fn notify_changed(&self, name: &str) {
        let Ok(value) = self.read(name) else {
            return;
        };
        for observer in self.observers.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            observer(name, &value);
        }
    }

    /// Push every resource under `prefix`.
    pub fn notify_prefix(&self, prefix: &str) {
        for name in self.names().into_iter().filter(|n| n.starts_with(prefix)) {
            self.notify_changed(&name);
        }
    }

    /// Registered names in order.
    pub fn names(&self) -> Vec<String> {
        self.resources().keys().cloned().collect()
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn Resource>, ResourceError> {
        self.resources()
            .get(name)
            .cloned()
            .ok_or_else(|| ResourceError::NotFound(name.to_string()))
    }
}

/// Errors from resource access.
#[derive(Debug)]
pub enum ResourceError {
    /// No resource with this name.
    NotFound(String),
    /// The resource cannot be written remotely.
    ReadOnly,
    /// The written value has the wrong type.
    TypeMismatch { expected: &'static str },
    /// The written value is out of range.
    Invalid(ConfigError),
    /// Writing the value tried to start a session, which failed.
    Start(StartError),
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(name) => write!(f, "no resource named {}", name),
            Self::ReadOnly => write!(f, "resource is read-only"),
            Self::TypeMismatch { expected } => write!(f, "expected a {} value", expected),
            Self::Invalid(e) => write!(f, "{}", e),
            Self::Start(e) => write!(f, "session start failed: {}", e),
        }
    }
}

impl std::error::Error for ResourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Invalid(e) => Some(e),
            Self::Start(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for ResourceError {
    fn from(e: ConfigError) -> Self {
        Self::Invalid(e)
    }
}

impl From<StartError> for ResourceError {
    fn from(e: StartError) -> Self {
        Self::Start(e)
    }
}
