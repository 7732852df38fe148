//! Run outcomes and their classification.
//!
//! Every way a run can end maps to exactly one [`RunOutcome`]. The mapping
//! works on typed values only: wasmtime [`Trap`] codes and our own
//! [`CapabilityFault`] recovered by downcasting.

use std::fmt;

use wasmtime::Trap;

use crate::capabilities::{CapabilityFault, HostRejection};

/// Fault caught at the sandbox boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrapReason {
    /// Out-of-bounds or misaligned memory access
    MemoryAccess,
    /// Call stack budget exceeded
    StackOverflow,
    /// Division by zero, overflow or invalid float-to-int conversion
    Arithmetic,
    /// Ran a full fuel slice without calling a capability
    FuelExhausted,
    /// Null, out-of-table or wrongly typed indirect call
    IndirectCall,
    /// Any other fault reported by the runtime
    Other(String),
}

impl fmt::Display for TrapReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrapReason::MemoryAccess => write!(f, "illegal memory access"),
            TrapReason::StackOverflow => write!(f, "stack overflow"),
            TrapReason::Arithmetic => write!(f, "arithmetic fault"),
            TrapReason::FuelExhausted => write!(f, "execution budget exhausted"),
            TrapReason::IndirectCall => write!(f, "bad indirect call"),
            TrapReason::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// Why a run was terminated rather than trapped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    /// The module took its own abort path (`unreachable`)
    Abort,
    /// External shutdown observed at a capability call
    Shutdown,
}

/// How one run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Entry point returned, optionally with an `i32` exit code
    Completed {
        /// Value returned by an `() -> i32` entry point
        exit_code: Option<i32>,
    },
    /// Fault contained by the sandbox
    Trapped(TrapReason),
    /// Module abort or external shutdown
    Terminated(TerminationCause),
    /// Capability misuse, handled like a trap
    HostRejected(HostRejection),
}

impl RunOutcome {
    /// Classify an error returned from instantiating or calling into the module.
    pub(crate) fn from_error(error: &wasmtime::Error) -> Self {
        if let Some(fault) = error.downcast_ref::<CapabilityFault>() {
            return match fault {
                CapabilityFault::Shutdown => RunOutcome::Terminated(TerminationCause::Shutdown),
                CapabilityFault::Rejected(rejection) => RunOutcome::HostRejected(rejection.clone()),
            };
        }

        match error.downcast_ref::<Trap>() {
            Some(Trap::UnreachableCodeReached) => RunOutcome::Terminated(TerminationCause::Abort),
            Some(trap) => RunOutcome::Trapped(classify_trap(trap)),
            None => RunOutcome::Trapped(TrapReason::Other(format!("{:#}", error))),
        }
    }

    /// Whether the run ended in a fault (trap, rejection or module abort)
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            RunOutcome::Trapped(_)
                | RunOutcome::HostRejected(_)
                | RunOutcome::Terminated(TerminationCause::Abort)
        )
    }

    /// Whether the run ended because shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        matches!(self, RunOutcome::Terminated(TerminationCause::Shutdown))
    }

    /// Short label for logs
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Completed { .. } => "completed",
            RunOutcome::Trapped(_) => "trapped",
            RunOutcome::Terminated(_) => "terminated",
            RunOutcome::HostRejected(_) => "host-rejected",
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed { exit_code: None } => write!(f, "completed"),
            RunOutcome::Completed {
                exit_code: Some(code),
            } => write!(f, "completed with exit code {}", code),
            RunOutcome::Trapped(reason) => write!(f, "trapped: {}", reason),
            RunOutcome::Terminated(TerminationCause::Abort) => write!(f, "terminated: module abort"),
            RunOutcome::Terminated(TerminationCause::Shutdown) => write!(f, "terminated: shutdown"),
            RunOutcome::HostRejected(rejection) => write!(f, "host rejected: {}", rejection),
        }
    }
}

fn classify_trap(trap: &Trap) -> TrapReason {
    match trap {
        Trap::MemoryOutOfBounds | Trap::HeapMisaligned | Trap::TableOutOfBounds => {
            TrapReason::MemoryAccess
        }
        Trap::StackOverflow => TrapReason::StackOverflow,
        Trap::IntegerDivisionByZero | Trap::IntegerOverflow | Trap::BadConversionToInteger => {
            TrapReason::Arithmetic
        }
        Trap::OutOfFuel => TrapReason::FuelExhausted,
        Trap::IndirectCallToNull | Trap::BadSignature => TrapReason::IndirectCall,
        other => TrapReason::Other(other.to_string()),
    }
}
