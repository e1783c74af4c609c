mod common;

use common::{Harness, Process, TestFile, va};
use kernel_vm::addresses::PAGE_SIZE;
use kernel_vm::error::FAULT_EXIT_STATUS;
use kernel_vm::platform::Mmu;
use kernel_vm::{FaultReason, LoadSegment, PageKind, Severity, VmError};

fn reason(err: &VmError) -> Option<FaultReason> {
    match err {
        VmError::InvalidFault { reason, .. } => Some(*reason),
        _ => None,
    }
}

#[test]
fn null_address_is_rejected_without_allocating() {
    let h = Harness::new(4, 4);
    let mut p = Process::new();

    let err = h.fault(&mut p, va(0), false, va(0)).unwrap_err();
    assert_eq!(reason(&err), Some(FaultReason::NullAddress));
    assert_eq!(
        err.severity(),
        Severity::Process {
            exit_status: FAULT_EXIT_STATUS
        }
    );
    assert_eq!(h.mem.frames_in_use(), 0);
    assert!(p.spt.is_empty());
}

#[test]
fn kernel_address_is_rejected() {
    let h = Harness::new(4, 4);
    let mut p = Process::new();
    let err = h
        .fault(&mut p, va(0xffff_8000_0000_1000), true, va(0))
        .unwrap_err();
    assert_eq!(reason(&err), Some(FaultReason::KernelAddress));
    assert_eq!(h.mem.frames_in_use(), 0);
}

#[test]
fn wild_access_is_rejected() {
    let h = Harness::new(4, 4);
    let mut p = Process::new();
    let err = h.write(&mut p, va(0x1000_0000), b"x").unwrap_err();
    assert_eq!(reason(&err), Some(FaultReason::Unmapped));
    assert!(p.spt.is_empty());
}

#[test]
fn registered_page_loads_on_first_touch() {
    let h = Harness::new(4, 4);
    let mut p = Process::new();
    h.vm.alloc_page(&mut p.spt, PageKind::Anon, va(0x40_0000), true).unwrap();
    assert_eq!(p.mmu.mapped(), 0);
    assert_eq!(h.mem.frames_in_use(), 0);

    // frames come out of the pool dirty; the page must not
    assert_eq!(h.read(&mut p, va(0x40_0ff0), 16).unwrap(), [0; 16]);
    assert_eq!(p.mmu.mapped(), 1);
    assert!(!p.spt.find(va(0x40_0000)).unwrap().lock().is_uninit());
    h.assert_consistent();

    // a second claim is a no-op
    h.vm.claim_page(&p.spt, va(0x40_0000)).unwrap();
    assert_eq!(h.mem.frames_in_use(), 1);
}

#[test]
fn stack_grows_one_page_below_rsp() {
    let h = Harness::new(4, 4);
    let mut p = Process::new();
    let top = h.vm.setup_stack(&mut p.spt).unwrap();
    assert_eq!(top, h.vm.config().user_stack_top);

    let rsp = top - PAGE_SIZE;
    let addr = rsp - PAGE_SIZE;
    h.access(&mut p, addr, true, rsp).unwrap();

    let page = p.spt.find(addr).unwrap().lock();
    assert!(page.is_stack());
    assert!(page.writable());
    assert!(page.frame().is_some());
    assert_eq!(page.kind(), PageKind::Anon);
    drop(page);
    assert_eq!(p.spt.len(), 2);
    h.assert_consistent();
}

#[test]
fn access_far_below_rsp_is_not_stack_growth() {
    let h = Harness::new(4, 4);
    let mut p = Process::new();
    let top = h.vm.setup_stack(&mut p.spt).unwrap();
    let rsp = top - PAGE_SIZE;

    let err = h.access(&mut p, rsp - PAGE_SIZE - 8, true, rsp).unwrap_err();
    assert_eq!(reason(&err), Some(FaultReason::Unmapped));
    assert_eq!(p.spt.len(), 1);
    assert_eq!(h.mem.frames_in_use(), 1);
}

#[test]
fn stack_does_not_grow_past_its_limit() {
    let h = Harness::new(4, 4);
    let mut p = Process::new();
    let limit = h.vm.config().stack_limit();

    let below = limit - 8;
    let err = h.access(&mut p, below, true, below).unwrap_err();
    assert_eq!(reason(&err), Some(FaultReason::Unmapped));

    h.access(&mut p, limit, true, limit).unwrap();
    assert!(p.spt.find(limit).unwrap().lock().is_stack());
}

#[test]
fn write_to_read_only_page_changes_nothing() {
    let h = Harness::new(4, 4);
    let mut p = Process::new();
    let ro = va(0x40_0000);
    h.vm.alloc_page(&mut p.spt, PageKind::Anon, ro, false).unwrap();

    // not yet present
    let err = h.write(&mut p, ro, b"x").unwrap_err();
    assert_eq!(reason(&err), Some(FaultReason::WriteToReadOnly));
    assert_eq!(p.mmu.mapped(), 0);
    assert_eq!(h.mem.frames_in_use(), 0);

    // present
    h.read(&mut p, ro, 1).unwrap();
    let frame = p.mmu.query(ro.page());
    let err = h.write(&mut p, ro, b"x").unwrap_err();
    assert_eq!(reason(&err), Some(FaultReason::WriteToReadOnly));
    assert_eq!(p.mmu.query(ro.page()), frame);
    assert_eq!(p.mmu.is_writable(ro.page()), Some(false));
}

#[test]
fn failed_mapping_leaves_page_untouched() {
    let h = Harness::new(4, 4);
    let mut p = Process::new();
    h.vm.alloc_page(&mut p.spt, PageKind::Anon, va(0x40_0000), true).unwrap();

    p.mmu.fail_maps(true);
    let err = h.read(&mut p, va(0x40_0000), 1).unwrap_err();
    assert!(matches!(err, VmError::MapFailed(_)));
    assert!(p.spt.find(va(0x40_0000)).unwrap().lock().is_uninit());
    assert_eq!(h.mem.frames_in_use(), 0);

    p.mmu.fail_maps(false);
    assert_eq!(h.read(&mut p, va(0x40_0000), 1).unwrap(), [0]);
}

#[test]
fn failed_file_read_leaves_page_uninit() {
    let h = Harness::new(4, 4);
    let mut p = Process::new();
    let file = TestFile::patterned(4096);
    let segment = LoadSegment {
        file: file.clone(),
        offset: 0,
        vaddr: va(0x40_0000),
        read_bytes: 4096,
        zero_bytes: 0,
        writable: false,
    };
    h.vm.load_segment(&mut p.spt, &segment).unwrap();

    file.fail_io(true);
    let err = h.read(&mut p, va(0x40_0000), 1).unwrap_err();
    assert!(matches!(err, VmError::BackingIo { .. }));
    assert!(!err.is_kernel_fatal());
    assert!(p.spt.find(va(0x40_0000)).unwrap().lock().is_uninit());
    assert_eq!(h.mem.frames_in_use(), 0);
    assert_eq!(p.mmu.mapped(), 0);

    file.fail_io(false);
    assert_eq!(h.read(&mut p, va(0x40_0100), 2).unwrap(), [5, 6]);
}

#[test]
fn user_accessibility_follows_registered_pages() {
    let h = Harness::new(4, 4);
    let mut p = Process::new();
    h.vm.alloc_page(&mut p.spt, PageKind::Anon, va(0x40_0000), true).unwrap();
    h.vm.alloc_page(&mut p.spt, PageKind::Anon, va(0x40_1000), false).unwrap();

    assert!(p.spt.is_user_accessible(va(0x40_0010), true));
    assert!(p.spt.is_user_accessible(va(0x40_1010), false));
    assert!(!p.spt.is_user_accessible(va(0x40_1010), true));
    assert!(!p.spt.is_user_accessible(va(0x40_2000), false));
    assert!(!p.spt.is_user_accessible(va(0), false));
    assert!(!p.spt.is_user_accessible(va(0xffff_8000_0000_0000), false));
}
