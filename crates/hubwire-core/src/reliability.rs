//! Per-receiver-method delivery classes and channel routing.
//!
//! A connection always has a reliable primary stream. It may also have a
//! secondary channel (datagram-like) that can carry unreliable or unordered
//! traffic. Each server-to-client receiver method has a reliability class;
//! the router sends non-reliable methods over the secondary channel when one
//! is attached and falls back to the primary stream otherwise.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::{MethodTableError, ReliabilityError};
use crate::hashing::method_id;
use crate::method_table::MethodTable;

/// Delivery class of a receiver method.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reliability {
    /// Delivered, in order.
    #[default]
    Reliable,
    /// Delivered, possibly out of order.
    ReliableUnordered,
    /// May be dropped, possibly out of order.
    Unreliable,
    /// May be dropped, never reordered.
    UnreliableOrdered,
}

impl Reliability {
    /// Whether this class requires the reliable ordered stream.
    pub const fn is_reliable(self) -> bool {
        matches!(self, Self::Reliable)
    }

    /// Lowercase name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Reliable => "reliable",
            Self::ReliableUnordered => "reliable_unordered",
            Self::Unreliable => "unreliable",
            Self::UnreliableOrdered => "unreliable_ordered",
        }
    }
}

impl fmt::Display for Reliability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declaration of one server-to-client receiver method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceiverMethod {
    /// Method name; its FNV-1a hash is the wire id.
    pub name: String,
    /// Whether the server awaits a client result for this method.
    pub awaitable: bool,
    /// Per-method override of the receiver's default class.
    pub reliability: Option<Reliability>,
}

impl ReceiverMethod {
    /// A fire-and-forget receiver method with the default class.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            awaitable: false,
            reliability: None,
        }
    }

    /// A receiver method whose result the server awaits.
    pub fn awaitable(name: impl Into<String>) -> Self {
        Self {
            awaitable: true,
            ..Self::new(name)
        }
    }

    /// Override the delivery class.
    #[must_use]
    pub fn with_reliability(mut self, reliability: Reliability) -> Self {
        self.reliability = Some(reliability);
        self
    }

    /// Wire method id.
    pub fn id(&self) -> i32 {
        method_id(&self.name)
    }
}

/// Resolved reliability class per receiver method id.
#[derive(Debug)]
pub struct ReceiverMethodMap {
    default: Reliability,
    kind: MapKind,
}

#[derive(Debug)]
enum MapKind {
    /// Every method uses the default class.
    Uniform,
    /// At least one method overrides the default.
    PerMethod(MethodTable<Reliability>),
}

/// Entry of a built [`ReceiverMethodMap`], kept for introspection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedReceiver {
    /// Method name.
    pub name: String,
    /// Wire id.
    pub id: i32,
    /// Effective class.
    pub reliability: Reliability,
    /// Whether the server awaits a client result.
    pub awaitable: bool,
}

impl ReceiverMethodMap {
    /// Build the map, validating that every awaitable method is reliable.
    pub fn build(
        default: Reliability,
        methods: &[ReceiverMethod],
    ) -> Result<(Self, Vec<ResolvedReceiver>), ReliabilityError> {
        let mut resolved = Vec::with_capacity(methods.len());
        let mut names: HashMap<i32, &str> = HashMap::with_capacity(methods.len());

        for method in methods {
            let id = method.id();
            if let Some(first) = names.insert(id, &method.name) {
                return Err(MethodTableError::DuplicateMethodName {
                    method_id: id,
                    first: first.to_owned(),
                    second: method.name.clone(),
                }
                .into());
            }
            let reliability = method.reliability.unwrap_or(default);
            if method.awaitable && !reliability.is_reliable() {
                return Err(ReliabilityError::AwaitableMustBeReliable {
                    method: method.name.clone(),
                    reliability,
                });
            }
            resolved.push(ResolvedReceiver {
                name: method.name.clone(),
                id,
                reliability,
                awaitable: method.awaitable,
            });
        }

        let uniform = resolved.iter().all(|r| r.reliability == default);
        let kind = if uniform {
            // Still reject reserved ids even though no table is kept.
            let _ = MethodTable::build(resolved.iter().map(|r| (r.id, ())))?;
            MapKind::Uniform
        } else {
            MapKind::PerMethod(MethodTable::build(resolved.iter().map(|r| (r.id, r.reliability)))?)
        };

        Ok((Self { default, kind }, resolved))
    }

    /// A map where every method is reliable.
    pub fn all_reliable() -> Self {
        Self {
            default: Reliability::Reliable,
            kind: MapKind::Uniform,
        }
    }

    /// The receiver's default class.
    pub fn default_reliability(&self) -> Reliability {
        self.default
    }

    /// Whether every method shares the default class.
    pub fn is_uniform(&self) -> bool {
        matches!(self.kind, MapKind::Uniform)
    }

    /// Effective class of a method id; unknown ids get the default.
    #[inline]
    pub fn reliability(&self, method_id: i32) -> Reliability {
        match &self.kind {
            MapKind::Uniform => self.default,
            MapKind::PerMethod(table) => table.get(method_id).copied().unwrap_or(self.default),
        }
    }
}

/// Channel a frame should be written to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    /// The reliable ordered stream.
    Primary,
    /// The optional secondary channel.
    Secondary,
}

/// Chooses a channel for each outbound receiver invocation.
#[derive(Clone, Debug)]
pub struct ReliabilityRouter {
    map: Arc<ReceiverMethodMap>,
}

impl ReliabilityRouter {
    /// Wrap a built map.
    pub fn new(map: ReceiverMethodMap) -> Self {
        Self { map: Arc::new(map) }
    }

    /// Route a receiver method id.
    ///
    /// Without a secondary channel everything goes to the primary stream.
    #[inline]
    pub fn route(&self, method_id: i32, has_secondary: bool) -> Route {
        if !has_secondary {
            return Route::Primary;
        }
        if self.map.reliability(method_id).is_reliable() {
            Route::Primary
        } else {
            Route::Secondary
        }
    }

    /// Effective class of a method id.
    pub fn reliability(&self, method_id: i32) -> Reliability {
        self.map.reliability(method_id)
    }

    /// The underlying map.
    pub fn map(&self) -> &ReceiverMethodMap {
        &self.map
    }
}

impl Default for ReliabilityRouter {
    fn default() -> Self {
        Self::new(ReceiverMethodMap::all_reliable())
    }
}
