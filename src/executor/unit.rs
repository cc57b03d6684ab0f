//! Units of work and their readiness gates.

use crate::types::UnitId;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

/// Answers "can this unit run now without blocking?".
///
/// Implementations must be cheap, synchronous and free of side effects. The
/// executor evaluates gates while holding the pending-queue lock, so a gate
/// must never call back into the executor. The answer is never cached: every
/// scan asks again.
pub trait ReadinessGate: Send + Sync {
    fn is_ready(&self) -> bool;
}

impl<F> ReadinessGate for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_ready(&self) -> bool {
        self()
    }
}

/// A gate that is always open.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReady;

impl ReadinessGate for AlwaysReady {
    fn is_ready(&self) -> bool {
        true
    }
}

/// One operation submitted to the executor: a body that runs at most once and
/// the gate that decides when it may run.
pub struct UnitOfWork {
    id: UnitId,
    label: Option<String>,
    gate: Box<dyn ReadinessGate>,
    body: Box<dyn FnOnce() + Send>,
}

impl UnitOfWork {
    /// Create a unit gated by `gate`.
    pub fn new<G, F>(gate: G, body: F) -> Self
    where
        G: ReadinessGate + 'static,
        F: FnOnce() + Send + 'static,
    {
        Self {
            id: UnitId::new(NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed)),
            label: None,
            gate: Box::new(gate),
            body: Box::new(body),
        }
    }

    /// Create a unit that can always run.
    pub fn ready<F>(body: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new(AlwaysReady, body)
    }

    /// Attach a label for log output.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Evaluate the gate. A panicking gate yields `Err` with the panic message.
    pub(crate) fn check_ready(&self) -> Result<bool, String> {
        catch_unwind(AssertUnwindSafe(|| self.gate.is_ready())).map_err(|p| panic_message(&*p))
    }

    pub(crate) fn run(self) {
        (self.body)()
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("label", &self.label)
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Lifecycle of a submitted unit.
///
/// `Submitted → Pending | Dispatched`, `Pending → Dispatched`,
/// `Dispatched → Completed`. Any state before the body starts may move to
/// `Cancelled` on shutdown; a unit whose gate panicked ends in `Faulted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UnitState {
    Submitted = 0,
    Pending = 1,
    Dispatched = 2,
    Completed = 3,
    Cancelled = 4,
    Faulted = 5,
}

impl UnitState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Submitted,
            1 => Self::Pending,
            2 => Self::Dispatched,
            3 => Self::Completed,
            4 => Self::Cancelled,
            _ => Self::Faulted,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Faulted)
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submitted => write!(f, "submitted"),
            Self::Pending => write!(f, "pending"),
            Self::Dispatched => write!(f, "dispatched"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Faulted => write!(f, "faulted"),
        }
    }
}

/// Shared state slot between the executor and a [`UnitHandle`].
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(UnitState::Submitted as u8))
    }

    pub(crate) fn get(&self) -> UnitState {
        UnitState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: UnitState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move `from → to`; false if the current state is not `from`.
    pub(crate) fn transition(&self, from: UnitState, to: UnitState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Observer for a submitted unit.
#[derive(Debug, Clone)]
pub struct UnitHandle {
    id: UnitId,
    state: Arc<StateCell>,
}

impl UnitHandle {
    pub(crate) fn new(id: UnitId, state: Arc<StateCell>) -> Self {
        Self { id, state }
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn state(&self) -> UnitState {
        self.state.get()
    }

    /// True once the unit reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_closure_gate() {
        let open = Arc::new(AtomicBool::new(false));
        let flag = open.clone();
        let unit = UnitOfWork::new(move || flag.load(Ordering::SeqCst), || {});

        assert_eq!(unit.check_ready(), Ok(false));
        open.store(true, Ordering::SeqCst);
        assert_eq!(unit.check_ready(), Ok(true));
    }

    #[test]
    fn test_panicking_gate_is_reported() {
        let unit = UnitOfWork::new(|| -> bool { panic!("lock table poisoned") }, || {});
        let err = unit.check_ready().unwrap_err();
        assert!(err.contains("lock table poisoned"));
    }

    #[test]
    fn test_unit_ids_are_unique() {
        let a = UnitOfWork::ready(|| {});
        let b = UnitOfWork::ready(|| {}).with_label("put k1");
        assert_ne!(a.id(), b.id());
        assert_eq!(b.label(), Some("put k1"));
        assert_eq!(a.label(), None);
    }

    #[test]
    fn test_state_transitions() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), UnitState::Submitted);

        cell.set(UnitState::Dispatched);
        assert!(!cell.transition(UnitState::Pending, UnitState::Cancelled));
        assert!(cell.transition(UnitState::Dispatched, UnitState::Cancelled));
        assert_eq!(cell.get(), UnitState::Cancelled);
        assert!(cell.get().is_terminal());
    }
}
