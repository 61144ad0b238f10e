//! Type tags and type-erased item helpers.
//!
//! This module provides:
//! - [`TypeTag`]: a lightweight runtime type identifier used by the builder,
//!   plan compiler, and executor to assert element types across node
//!   boundaries without carrying generic types.
//! - [`AnyItem`]: the type-erased representation of a single in-flight item.
//!   Items are reference-counted so a multicast can hand "shallow copies" to
//!   every subscriber without cloning the payload.
//!
//! The execution engine erases node generics exactly once, when a node is
//! registered with the builder. From then on the hot path moves [`AnyItem`]s
//! between nodes; typed node internals downcast at the edges via
//! [`item_of`] / [`item_into`]. Downcast failures are reported as
//! [`PipelineError::TypeMismatch`] diagnostics naming the consuming node,
//! the expected element type, and the element type the producing pipe
//! declared (callers without a producing pipe at hand pass a placeholder).

use crate::error::{PipelineError, Result};
use std::any::{Any, TypeId, type_name};
use std::sync::Arc;

/// A type-erased pipeline item.
///
/// Cloning an `AnyItem` is a reference-count bump; the payload is shared.
/// Typed extraction via [`item_into`] unwraps the allocation when this is
/// the only reference and clones otherwise.
pub type AnyItem = Arc<dyn Any + Send + Sync>;

/// A lightweight runtime type tag for diagnostics and edge validation.
///
/// `TypeTag` carries the `TypeId` and a readable type name. It is attached
/// to node definitions and pipes so the builder and executor can reason
/// about element types without a generic parameter.
///
/// ```
/// use npipeline::type_token::TypeTag;
/// let tag = TypeTag::of::<u32>();
/// assert_eq!(tag.name, "u32");
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TypeTag {
    /// Stable Rust type identifier.
    pub id: TypeId,
    /// Human-readable type name (best-effort).
    pub name: &'static str,
}

impl TypeTag {
    /// Construct a tag for `T`.
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    /// The tag used for slots that accept any element type (custom merges,
    /// dynamically-typed adapters).
    pub fn any() -> Self {
        Self::of::<AnyItem>()
    }

    /// True if a pipe carrying `other` elements may be bound to a slot
    /// declared as `self`.
    #[inline]
    pub fn accepts(&self, other: &TypeTag) -> bool {
        self.id == other.id || self.id == TypeId::of::<AnyItem>()
    }
}

/// Erase a typed item.
#[inline]
pub fn item_from<T: Send + Sync + 'static>(value: T) -> AnyItem {
    Arc::new(value)
}

/// Borrow the payload of an erased item as `T`, if it is one.
#[inline]
pub fn item_of<T: 'static>(item: &AnyItem) -> Option<&T> {
    item.downcast_ref::<T>()
}

/// Placeholder `actual` for [`item_into`] call sites that re-erase inside a
/// node closure, where the producing pipe's tag is out of reach. The
/// builder's edge validation makes mismatches on those paths unreachable
/// short of a lying [`DynPipe::from_raw`](crate::pipe::DynPipe::from_raw).
pub(crate) const UNDECLARED_ELEM: &str = "an element type other than the declared input";

/// Extract the payload of an erased item as an owned `T`.
///
/// Unwraps the allocation when this was the last reference, otherwise
/// clones. Returns a [`PipelineError::TypeMismatch`] naming `node`, the
/// expected type, and `actual` (the element type the producing pipe
/// declared) when the item carries something else.
pub fn item_into<T: Clone + Send + Sync + 'static>(
    item: AnyItem,
    node: &str,
    actual: &'static str,
) -> Result<T> {
    match item.downcast::<T>() {
        Ok(arc) => Ok(Arc::try_unwrap(arc).unwrap_or_else(|shared| (*shared).clone())),
        Err(_original) => Err(PipelineError::TypeMismatch {
            node: node.to_string(),
            expected: type_name::<T>(),
            actual,
        }),
    }
}
