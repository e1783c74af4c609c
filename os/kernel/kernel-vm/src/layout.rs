//! # User Address-Space Layout

use crate::addresses::{PAGE_SIZE, VirtualAddress};

/// End of userspace VA range after which Kernel space begins.
pub const USERSPACE_END: u64 = 0x0000_8000_0000_0000;

/// Initial user stack pointer; the stack grows down from here.
pub const USER_STACK_TOP: u64 = 0x0000_0000_4748_0000;

/// Upper bound on how far the user stack may grow.
pub const MAX_STACK_SIZE: u64 = 1024 * 1024; // 1 MiB

/// How far below the faulting thread's stack pointer an access may land and
/// still count as stack growth.
pub const STACK_FAULT_WINDOW: u64 = PAGE_SIZE;

const _: () = {
    assert!(USER_STACK_TOP.is_multiple_of(PAGE_SIZE));
    assert!(MAX_STACK_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(USER_STACK_TOP <= USERSPACE_END);
    assert!(MAX_STACK_SIZE < USER_STACK_TOP);
};

/// Whether `va` lies in the user half of the address space.
#[inline]
#[must_use]
pub const fn is_user_address(va: VirtualAddress) -> bool {
    va.as_u64() < USERSPACE_END
}

/// Tunables of the VM subsystem, fixed at [`Vm::new`](crate::Vm::new).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct VmConfig {
    /// Initial user stack pointer (page-aligned).
    pub user_stack_top: VirtualAddress,
    /// Maximum number of bytes the user stack may occupy.
    pub max_stack_size: u64,
    /// Accepted distance of a stack-growth fault below the stack pointer.
    pub stack_fault_window: u64,
}

impl VmConfig {
    /// Lowest address the stack may grow down to.
    #[inline]
    #[must_use]
    pub const fn stack_limit(&self) -> VirtualAddress {
        self.user_stack_top.saturating_sub(self.max_stack_size)
    }

    /// Whether `addr` falls inside the region reserved for the stack.
    #[inline]
    #[must_use]
    pub fn in_stack_region(&self, addr: VirtualAddress) -> bool {
        addr >= self.stack_limit() && addr < self.user_stack_top
    }

    /// Whether a fault at `addr` with stack pointer `rsp` is a stack access.
    ///
    /// Anything inside the stack region at or above `rsp - stack_fault_window`
    /// qualifies; accesses further below the stack pointer are wild.
    #[must_use]
    pub fn is_stack_access(&self, addr: VirtualAddress, rsp: VirtualAddress) -> bool {
        self.in_stack_region(addr) && addr >= rsp.saturating_sub(self.stack_fault_window)
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_stack_top: VirtualAddress::new(USER_STACK_TOP),
            max_stack_size: MAX_STACK_SIZE,
            stack_fault_window: STACK_FAULT_WINDOW,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stack_region() {
        let config = VmConfig::default();
        let top = config.user_stack_top;
        assert!(config.in_stack_region(top - 1));
        assert!(!config.in_stack_region(top));
        assert!(config.in_stack_region(config.stack_limit()));
        assert!(!config.in_stack_region(config.stack_limit() - 1));
    }

    #[test]
    fn stack_access_is_bounded_by_rsp() {
        let config = VmConfig::default();
        let rsp = config.user_stack_top - 3 * PAGE_SIZE;

        assert!(config.is_stack_access(rsp - 8, rsp));
        assert!(config.is_stack_access(rsp - PAGE_SIZE, rsp));
        assert!(!config.is_stack_access(rsp - PAGE_SIZE - 1, rsp));
        // above the stack pointer but still inside the region
        assert!(config.is_stack_access(rsp + 16, rsp));
    }

    #[test]
    fn kernel_half_is_not_user() {
        assert!(is_user_address(VirtualAddress::new(0x40_0000)));
        assert!(!is_user_address(VirtualAddress::new(USERSPACE_END)));
        assert!(!is_user_address(VirtualAddress::new(0xffff_ffff_8000_0000)));
    }
}
