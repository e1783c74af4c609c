//! # Page-Fault Resolution
//!
//! The trap handler decodes CR2, the pushed error code and the user stack
//! pointer into a [`PageFault`] and passes it to [`Vm::handle_fault`].
//! Resolution happens in two steps:
//!
//! 1. [`classify`] decides, without touching any allocator, whether the fault
//!    is legitimate and what it needs (load a known page, or grow the stack).
//! 2. The VM performs that action: allocate the stack page if needed, then
//!    claim the page (frame, content, mapping).
//!
//! Faults that cannot be resolved are reported as
//! [`VmError::InvalidFault`]; the process layer terminates the faulting
//! process with [`FAULT_EXIT_STATUS`](crate::error::FAULT_EXIT_STATUS).

use crate::addresses::{VirtualAddress, VirtualPage};
use crate::error::{FaultReason, VmError};
use crate::layout::{VmConfig, is_user_address};
use crate::page::{Initializer, PageKind};
use crate::spt::SupplementalPageTable;
use crate::vm::Vm;
use bitfield_struct::bitfield;
use log::{trace, warn};

/// Page-fault error code layout (x86-64).
///
/// Each bit describes the condition that caused the page fault.
/// Reference: Intel SDM Vol. 3A, §6.15.1 “Page-Fault Exception (#PF)”.
#[bitfield(u64)]
pub struct PageFaultError {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read or execute.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor (CPL 0–2).
    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = caused by reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch (execute access).
    pub instruction_fetch: bool, // bit 4

    /// 1 = protection-key violation (if CR4.PKE=1).
    pub protection_key: bool, // bit 5

    /// 1 = shadow stack access (if CET-SS enabled).
    pub shadow_stack: bool, // bit 6

    #[bits(57)]
    __: u64, // reserved / ignored bits
}

/// A decoded page fault.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PageFault {
    /// The faulting address (CR2).
    pub addr: VirtualAddress,
    /// The page was not present (as opposed to a protection violation).
    pub not_present: bool,
    pub write: bool,
    /// The access originated in user mode.
    ///
    /// Only reported. A kernel-mode fault on a user address (a system call
    /// touching a user buffer) is resolved exactly like a user fault.
    pub user: bool,
    /// User stack pointer at the time of the fault. For kernel-mode faults
    /// this is the value saved on entry to the kernel.
    pub rsp: VirtualAddress,
}

impl PageFault {
    /// Decode a hardware fault.
    #[must_use]
    pub const fn from_error_code(
        addr: VirtualAddress,
        err: PageFaultError,
        rsp: VirtualAddress,
    ) -> Self {
        Self {
            addr,
            not_present: !err.present(),
            write: err.write(),
            user: err.user(),
            rsp,
        }
    }
}

/// What a legitimate fault needs.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultAction {
    /// A page is registered at the address; bring it in.
    Load,
    /// Unregistered address just below the stack; add a stack page first.
    GrowStack,
}

/// Decide how to handle `fault`.
///
/// `page_writable` is the write permission of the page registered at the
/// faulting address, or `None` if there is none.
///
/// # Errors
/// The reason the fault is not resolvable.
pub fn classify(
    fault: &PageFault,
    page_writable: Option<bool>,
    config: &VmConfig,
) -> Result<FaultAction, FaultReason> {
    if fault.addr.is_null() {
        return Err(FaultReason::NullAddress);
    }
    if !is_user_address(fault.addr) {
        return Err(FaultReason::KernelAddress);
    }
    if !fault.not_present {
        return Err(match page_writable {
            Some(false) if fault.write => FaultReason::WriteToReadOnly,
            _ => FaultReason::ProtectionViolation,
        });
    }
    match page_writable {
        Some(false) if fault.write => Err(FaultReason::WriteToReadOnly),
        Some(_) => Ok(FaultAction::Load),
        None if config.is_stack_access(fault.addr, fault.rsp) => Ok(FaultAction::GrowStack),
        None => Err(FaultReason::Unmapped),
    }
}

impl Vm {
    /// Resolve a page fault in the address space described by `spt`.
    ///
    /// On success the faulting access can be retried. On error nothing was
    /// allocated or mapped on behalf of the fault.
    ///
    /// # Errors
    /// - [`VmError::InvalidFault`] for faults that are not legitimate.
    /// - Any error of [`Vm::claim_page`] while bringing the page in.
    pub fn handle_fault(
        &self,
        spt: &mut SupplementalPageTable,
        fault: &PageFault,
    ) -> Result<(), VmError> {
        let writable = spt.find(fault.addr).map(|page| page.lock().writable());
        let action = classify(fault, writable, self.config()).map_err(|reason| {
            warn!(
                "page fault at {} ({} {}, rsp {}): {reason}",
                fault.addr,
                if fault.user { "user" } else { "kernel" },
                if fault.write { "write" } else { "read" },
                fault.rsp
            );
            VmError::invalid_fault(fault.addr, reason)
        })?;

        if action == FaultAction::GrowStack {
            trace!("page fault at {}: growing stack", fault.addr);
            let page = fault.addr.page();
            self.alloc_stack_page(spt, page)?;
            return self.claim_page(spt, page.base()).inspect_err(|_| {
                // Leave no trace of the failed growth.
                if let Some(stale) = spt.detach(page) {
                    self.deallocate(&**spt.mmu(), &stale);
                }
            });
        }
        self.claim_page(spt, fault.addr)
    }

    /// Register a zero-filled, writable stack page at `page`.
    pub(crate) fn alloc_stack_page(
        &self,
        spt: &mut SupplementalPageTable,
        page: VirtualPage,
    ) -> Result<(), VmError> {
        self.alloc_page_inner(spt, PageKind::Anon, page.base(), true, Initializer::Zero, true)
    }
}
