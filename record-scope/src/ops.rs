//! The exported scope operators and their stack calling convention.
//!
//! Embedders that drive scopes through an interpreter rather than through
//! the Rust API call the operators by name: operands are pushed onto a value
//! stack, [`OperatorRegistry::dispatch`] is invoked, and results are left on
//! the same stack. Scope handles and bound futures cross this boundary
//! opaquely inside [`OpValue`] slots.
//!
//! Each dispatch runs inside a reserved management span for the operation,
//! which is the situation the repair pass in the scope layer deals with: the
//! enter operator's management span is still the innermost active span when
//! the operator body opens the user scope, and is ended early so it never
//! becomes that scope's parent.
//!
//! Unknown operators and short stacks are recoverable dispatch errors.
//! Handing an operator the wrong payload, or consuming a one-shot slot
//! twice, is a programming error in the embedder and panics.
//!
//! ```
//! use record_scope::ops::{OperatorRegistry, OpValue};
//!
//! let registry = OperatorRegistry::new();
//! let mut stack = vec![OpValue::from("ops::example")];
//! registry.dispatch("profiler.scope_enter", &mut stack).unwrap();
//!
//! // The handle stays on the stack until the matching exit.
//! registry.dispatch("profiler.scope_exit", &mut stack).unwrap();
//! assert!(stack.is_empty());
//! ```

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;

use futures_util::future::BoxFuture;
use futures_util::FutureExt as _;
use thiserror::Error;

use crate::trace::{open_reserved, open_scope, CloseOnResolve, ReservedOp, ScopeHandle};

/// A value crossing the operator boundary.
///
/// Handles and futures ride in one-shot slots: taking the payload leaves the
/// slot empty, and taking it again panics. The transport never inspects the
/// payloads beyond their variant tag.
pub enum OpValue {
    /// No value.
    Unit,
    /// A scope name or other text operand.
    Str(Cow<'static, str>),
    /// An open scope's handle, smuggled through the stack.
    Handle(Option<ScopeHandle>),
    /// A pending result carrying the next value for this stack.
    Future(Option<BoxFuture<'static, OpValue>>),
}

impl OpValue {
    /// Wraps a pending result for transport.
    pub fn future(fut: impl Future<Output = OpValue> + Send + 'static) -> Self {
        OpValue::Future(Some(fut.boxed()))
    }

    /// Takes a text operand.
    ///
    /// # Panics
    ///
    /// Panics if the value is not [`OpValue::Str`].
    pub fn take_str(&mut self) -> Cow<'static, str> {
        match std::mem::replace(self, OpValue::Unit) {
            OpValue::Str(name) => name,
            other => panic!("operand holds {other:?} where a scope name was required"),
        }
    }

    /// Takes the scope handle out of its slot.
    ///
    /// # Panics
    ///
    /// Panics if the value is not [`OpValue::Handle`], or if the slot was
    /// already consumed.
    pub fn take_handle(&mut self) -> ScopeHandle {
        match self {
            OpValue::Handle(slot) => match slot.take() {
                Some(handle) => handle,
                None => panic!("scope handle slot was already consumed"),
            },
            other => panic!("operand holds {other:?} where a scope handle was required"),
        }
    }

    /// Takes the bound future out of its slot.
    ///
    /// # Panics
    ///
    /// Panics if the value is not [`OpValue::Future`], or if the slot was
    /// already consumed.
    pub fn take_future(&mut self) -> BoxFuture<'static, OpValue> {
        match self {
            OpValue::Future(slot) => match slot.take() {
                Some(fut) => fut,
                None => panic!("future slot was already consumed"),
            },
            other => panic!("operand holds {other:?} where a future was required"),
        }
    }
}

impl From<ScopeHandle> for OpValue {
    fn from(handle: ScopeHandle) -> Self {
        OpValue::Handle(Some(handle))
    }
}

impl From<&'static str> for OpValue {
    fn from(name: &'static str) -> Self {
        OpValue::Str(Cow::Borrowed(name))
    }
}

impl From<String> for OpValue {
    fn from(name: String) -> Self {
        OpValue::Str(Cow::Owned(name))
    }
}

impl fmt::Debug for OpValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpValue::Unit => f.write_str("Unit"),
            OpValue::Str(name) => f.debug_tuple("Str").field(name).finish(),
            OpValue::Handle(Some(handle)) => f.debug_tuple("Handle").field(handle).finish(),
            OpValue::Handle(None) => f.write_str("Handle(<consumed>)"),
            OpValue::Future(Some(_)) => f.write_str("Future(..)"),
            OpValue::Future(None) => f.write_str("Future(<consumed>)"),
        }
    }
}

/// Errors surfaced by [`OperatorRegistry::dispatch`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum OpError {
    /// The named operator is not registered.
    #[error("unknown operator {name:?}")]
    UnknownOperator {
        /// The name that failed to resolve.
        name: String,
    },
    /// The operand stack holds fewer values than the operator consumes.
    #[error("operator {op} expects {expected} operand(s), found {found}")]
    Arity {
        /// The operator that was dispatched.
        op: &'static str,
        /// Operands the operator consumes.
        expected: usize,
        /// Operands available on the stack.
        found: usize,
    },
}

type OpBody = fn(&mut Vec<OpValue>);

#[derive(Debug)]
struct RegisteredOp {
    op: ReservedOp,
    arity: usize,
    body: OpBody,
}

/// Name-indexed table of the exported scope operators.
#[derive(Debug)]
pub struct OperatorRegistry {
    ops: HashMap<&'static str, RegisteredOp>,
}

impl OperatorRegistry {
    /// Creates a registry with the three scope operators installed.
    pub fn new() -> Self {
        let mut ops = HashMap::new();
        for (op, arity, body) in [
            (ReservedOp::Enter, 1, scope_enter as OpBody),
            (ReservedOp::Exit, 1, scope_exit as OpBody),
            (ReservedOp::CloseOnResolve, 2, scope_close_on_resolve as OpBody),
        ] {
            ops.insert(op.name(), RegisteredOp { op, arity, body });
        }
        OperatorRegistry { ops }
    }

    /// The exported operator names, in no particular order.
    pub fn operator_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.ops.keys().copied()
    }

    /// Runs the named operator against `stack`.
    ///
    /// Operands are popped from the end of the stack and results pushed back
    /// onto it. The whole call runs inside the operation's reserved
    /// management span.
    pub fn dispatch(&self, name: &str, stack: &mut Vec<OpValue>) -> Result<(), OpError> {
        let registered = self.ops.get(name).ok_or_else(|| OpError::UnknownOperator {
            name: name.to_owned(),
        })?;
        if stack.len() < registered.arity {
            return Err(OpError::Arity {
                op: registered.op.name(),
                expected: registered.arity,
                found: stack.len(),
            });
        }

        let management = open_reserved(registered.op);
        (registered.body)(stack);
        management.close();
        Ok(())
    }
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn pop_operand(stack: &mut Vec<OpValue>) -> OpValue {
    // Arity is checked before the body runs.
    match stack.pop() {
        Some(value) => value,
        None => panic!("operand stack underflow"),
    }
}

/// `(name) -> (handle)`: opens a user scope.
fn scope_enter(stack: &mut Vec<OpValue>) {
    let name = pop_operand(stack).take_str();
    let handle = open_scope(name);
    stack.push(OpValue::from(handle));
}

/// `(handle) -> ()`: closes the scope owned by `handle`.
fn scope_exit(stack: &mut Vec<OpValue>) {
    pop_operand(stack).take_handle().close();
}

/// `(handle, result) -> (result')`: binds the scope close to `result`.
///
/// The returned future forwards the resolved value unchanged; the scope
/// closes at the moment of resolution, not here.
fn scope_close_on_resolve(stack: &mut Vec<OpValue>) {
    let result = pop_operand(stack).take_future();
    let handle = pop_operand(stack).take_handle();
    stack.push(OpValue::future(CloseOnResolve::new(handle, result)));
}
