//! # Values, handles and closures
//!
//! The things that cross the isolation boundary.
//!
//! ## Philosophy
//!
//! - **Handles, not graphs**: a `Handle` names a value that stays inside one worker's table.
//!   Values only travel when a caller explicitly asks for them (`get`) or pushes one (`wrap`).
//! - **Owner-scoped**: a handle carries the identity of the table that minted it, so a table can
//!   reject handles it never issued even when the numeric ids collide.

use serde::Deserialize;
use serde::Serialize;

/// Identity of the object table that minted a handle.
///
/// Minted randomly per table, so two workers living in the same process never share one.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerId(pub u64);

impl OwnerId {
    /// Mints a fresh random owner identity.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "owner-{:016x}", self.0)
    }
}

/// An opaque reference to a value living in a worker's object table.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handle {
    pub owner: OwnerId,
    pub id: u64,
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.id)
    }
}

/// Describes a failure raised by a closure while it ran on the worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FaultInfo {
    pub unit: String,
    pub function: String,
    pub message: String,
}

impl std::fmt::Display for FaultInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{} failed: {}", self.unit, self.function, self.message)
    }
}

/// A dynamically typed value held in an object table.
///
/// **Invariant**: the variant order is part of the wire format (guest code decodes it), so new
/// variants are only ever appended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Fault(FaultInfo),
}

impl Value {
    /// Returns the string payload, if this is a `Str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the fault description, if this value represents a failure.
    pub fn as_fault(&self) -> Option<&FaultInfo> {
        match self {
            Value::Fault(info) => Some(info),
            _ => None,
        }
    }

    /// Short name of the variant, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Fault(_) => "fault",
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

/// A unit of behaviour shipped to the worker: an exported function of a code unit.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Closure {
    pub unit: String,
    pub function: String,
}

impl Closure {
    pub fn new(unit: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            function: function.into(),
        }
    }
}

impl std::fmt::Display for Closure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.unit, self.function)
    }
}
