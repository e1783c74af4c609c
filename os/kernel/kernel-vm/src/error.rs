use crate::addresses::{VirtualAddress, VirtualPage};
use core::fmt;

/// Exit status handed to the process layer for process-fatal errors.
pub const FAULT_EXIT_STATUS: i32 = -1;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("a page is already mapped at {0}")]
    DuplicateMapping(VirtualPage),
    #[error("out of memory: no free frame and no evictable victim")]
    OutOfMemory,
    #[error("swap area exhausted")]
    SwapExhausted,
    #[error("backing store I/O failed for page {page}")]
    BackingIo { page: VirtualPage },
    #[error("invalid page fault at {addr}: {reason}")]
    InvalidFault {
        addr: VirtualAddress,
        reason: FaultReason,
    },
    #[error("failed to install mapping for page {0}")]
    MapFailed(VirtualPage),
    #[error("no mapping at {0}")]
    NotMapped(VirtualAddress),
    #[error("invalid mapping request: {0}")]
    InvalidMapping(&'static str),
    #[error("page {0} has no resident content")]
    NotResident(VirtualPage),
}

/// Why a fault could not be resolved.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultReason {
    NullAddress,
    KernelAddress,
    Unmapped,
    WriteToReadOnly,
    ProtectionViolation,
}

impl fmt::Display for FaultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NullAddress => "null address",
            Self::KernelAddress => "kernel address from user context",
            Self::Unmapped => "address outside any valid region",
            Self::WriteToReadOnly => "write to read-only page",
            Self::ProtectionViolation => "protection violation on present page",
        })
    }
}

/// Who pays for an error.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Severity {
    /// Terminate the faulting process with `exit_status`; the kernel continues.
    Process { exit_status: i32 },
    /// No safe recovery below the process level; halt.
    Kernel,
}

impl VmError {
    #[must_use]
    pub const fn invalid_fault(addr: VirtualAddress, reason: FaultReason) -> Self {
        Self::InvalidFault { addr, reason }
    }

    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::OutOfMemory | Self::SwapExhausted => Severity::Kernel,
            Self::DuplicateMapping(_)
            | Self::BackingIo { .. }
            | Self::InvalidFault { .. }
            | Self::MapFailed(_)
            | Self::NotMapped(_)
            | Self::InvalidMapping(_)
            | Self::NotResident(_) => Severity::Process {
                exit_status: FAULT_EXIT_STATUS,
            },
        }
    }

    #[must_use]
    pub const fn is_kernel_fatal(&self) -> bool {
        matches!(self.severity(), Severity::Kernel)
    }
}
