//! In-memory stand-ins for the platform traits, plus a small harness that
//! plays the role of user code touching memory.

#![allow(dead_code)]

use kernel_vm::addresses::{PAGE_BYTES, PhysicalPage, VirtualAddress, VirtualPage};
use kernel_vm::platform::{BackingFile, FrameBuffer, FramePool, Mmu, PhysMapper, SwapDevice};
use kernel_vm::{EvictionPolicy, Fifo, PageFault, SupplementalPageTable, Vm, VmConfig, VmError};
use log::{LevelFilter, Log, Metadata, Record};
use std::cell::UnsafeCell;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

/// First frame number handed out by [`TestMemory`].
const BASE_PFN: u64 = 0x100;

/// Byte pattern of a frame allocated without zeroing.
pub const STALE: u8 = 0xCC;

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        eprintln!("[{}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

/// Route the crate's log output to the test's stderr.
pub fn init_logging() {
    static INIT: Once = Once::new();
    static LOGGER: StderrLogger = StderrLogger;
    INIT.call_once(|| {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(LevelFilter::Trace);
        }
    });
}

/// A fixed number of physical frames.
pub struct TestMemory {
    frames: Box<[UnsafeCell<FrameBuffer>]>,
    free: Mutex<Vec<u64>>,
    in_use: Mutex<BTreeSet<u64>>,
}

// SAFETY: frame contents are only reached through `PhysMapper::frame_mut`,
// whose contract hands exclusivity to the caller.
unsafe impl Sync for TestMemory {}

impl TestMemory {
    pub fn new(frames: usize) -> Arc<Self> {
        let free = (0..frames as u64).rev().map(|i| BASE_PFN + i).collect();
        Arc::new(Self {
            frames: (0..frames).map(|_| UnsafeCell::new([0; PAGE_BYTES])).collect(),
            free: Mutex::new(free),
            in_use: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn free_frames(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    pub fn frames_in_use(&self) -> usize {
        self.in_use.lock().unwrap().len()
    }

    fn cell(&self, frame: PhysicalPage) -> &UnsafeCell<FrameBuffer> {
        &self.frames[(frame.number() - BASE_PFN) as usize]
    }

    /// Copy of a frame's content.
    pub fn read(&self, frame: PhysicalPage) -> FrameBuffer {
        // SAFETY: tests only inspect frames while the VM is idle.
        unsafe { *self.cell(frame).get() }
    }

    /// Write into a frame as user code would.
    pub fn write(&self, frame: PhysicalPage, offset: usize, bytes: &[u8]) {
        // SAFETY: tests only write frames while the VM is idle.
        let buf = unsafe { &mut *self.cell(frame).get() };
        buf[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

impl PhysMapper for TestMemory {
    unsafe fn frame_mut<'a>(&self, frame: PhysicalPage) -> &'a mut FrameBuffer {
        assert!(
            self.in_use.lock().unwrap().contains(&frame.number()),
            "access to free frame {frame}"
        );
        unsafe { &mut *self.cell(frame).get() }
    }
}

/// [`FramePool`] view of a shared [`TestMemory`].
pub struct TestPool(pub Arc<TestMemory>);

impl FramePool for TestPool {
    fn alloc_page(&mut self, zeroed: bool) -> Option<PhysicalPage> {
        let pfn = self.0.free.lock().unwrap().pop()?;
        self.0.in_use.lock().unwrap().insert(pfn);
        let frame = PhysicalPage::from_number(pfn);
        let fill = if zeroed { 0 } else { STALE };
        // SAFETY: the frame was free until just now.
        unsafe { (*self.0.cell(frame).get()).fill(fill) };
        Some(frame)
    }

    fn free_page(&mut self, frame: PhysicalPage) {
        let pfn = frame.number();
        assert!(
            self.0.in_use.lock().unwrap().remove(&pfn),
            "double free of frame {frame}"
        );
        self.0.free.lock().unwrap().push(pfn);
    }
}

#[derive(Debug, Copy, Clone)]
struct Pte {
    frame: PhysicalPage,
    writable: bool,
    dirty: bool,
    accessed: bool,
}

/// Page table of one simulated address space.
#[derive(Default)]
pub struct TestMmu {
    ptes: Mutex<BTreeMap<VirtualPage, Pte>>,
    fail_map: AtomicBool,
}

impl TestMmu {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every subsequent `map` call fail.
    pub fn fail_maps(&self, fail: bool) {
        self.fail_map.store(fail, Ordering::SeqCst);
    }

    pub fn mapped(&self) -> usize {
        self.ptes.lock().unwrap().len()
    }

    pub fn is_writable(&self, page: VirtualPage) -> Option<bool> {
        self.ptes.lock().unwrap().get(&page).map(|pte| pte.writable)
    }

    /// Record a user access the way the hardware walker would.
    fn touch(&self, page: VirtualPage, write: bool) {
        if let Some(pte) = self.ptes.lock().unwrap().get_mut(&page) {
            pte.accessed = true;
            pte.dirty |= write;
        }
    }
}

impl Mmu for TestMmu {
    fn map(&self, page: VirtualPage, frame: PhysicalPage, writable: bool) -> bool {
        if self.fail_map.load(Ordering::SeqCst) {
            return false;
        }
        let pte = Pte {
            frame,
            writable,
            dirty: false,
            accessed: false,
        };
        self.ptes.lock().unwrap().insert(page, pte);
        true
    }

    fn unmap(&self, page: VirtualPage) {
        self.ptes.lock().unwrap().remove(&page);
    }

    fn query(&self, page: VirtualPage) -> Option<PhysicalPage> {
        self.ptes.lock().unwrap().get(&page).map(|pte| pte.frame)
    }

    fn is_dirty(&self, page: VirtualPage) -> bool {
        self.ptes.lock().unwrap().get(&page).is_some_and(|pte| pte.dirty)
    }

    fn set_dirty(&self, page: VirtualPage, dirty: bool) {
        if let Some(pte) = self.ptes.lock().unwrap().get_mut(&page) {
            pte.dirty = dirty;
        }
    }

    fn is_accessed(&self, page: VirtualPage) -> bool {
        self.ptes.lock().unwrap().get(&page).is_some_and(|pte| pte.accessed)
    }

    fn set_accessed(&self, page: VirtualPage, accessed: bool) {
        if let Some(pte) = self.ptes.lock().unwrap().get_mut(&page) {
            pte.accessed = accessed;
        }
    }
}

/// Swap disk in RAM.
pub struct TestSwap {
    slots: Mutex<Vec<FrameBuffer>>,
    fail: AtomicBool,
}

impl TestSwap {
    pub fn new(slots: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(vec![[0; PAGE_BYTES]; slots]),
            fail: AtomicBool::new(false),
        })
    }

    pub fn fail_io(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl SwapDevice for TestSwap {
    fn slot_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    fn read_slot(&self, slot: usize, buf: &mut FrameBuffer) -> bool {
        if self.fail.load(Ordering::SeqCst) {
            return false;
        }
        buf.copy_from_slice(&self.slots.lock().unwrap()[slot]);
        true
    }

    fn write_slot(&self, slot: usize, buf: &FrameBuffer) -> bool {
        if self.fail.load(Ordering::SeqCst) {
            return false;
        }
        self.slots.lock().unwrap()[slot].copy_from_slice(buf);
        true
    }
}

/// An open file held in memory.
pub struct TestFile {
    data: Mutex<Vec<u8>>,
    fail: AtomicBool,
    writes: AtomicUsize,
}

impl TestFile {
    pub fn new(data: impl Into<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(data.into()),
            fail: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        })
    }

    /// A file of `len` bytes where byte `i` is `i % 251`.
    pub fn patterned(len: usize) -> Arc<Self> {
        Self::new((0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>())
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn fail_io(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Number of `write_at` calls so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl BackingFile for TestFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        if self.fail.load(Ordering::SeqCst) {
            return 0;
        }
        let data = self.data.lock().unwrap();
        let start = (offset as usize).min(data.len());
        let n = (data.len() - start).min(buf.len());
        buf[..n].copy_from_slice(&data[start..start + n]);
        n
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> usize {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return 0;
        }
        let mut data = self.data.lock().unwrap();
        let start = offset as usize;
        if data.len() < start + buf.len() {
            data.resize(start + buf.len(), 0);
        }
        data[start..start + buf.len()].copy_from_slice(buf);
        buf.len()
    }

    fn len(&self) -> u64 {
        self.data.lock().unwrap().len() as u64
    }
}

/// One simulated process.
pub struct Process {
    pub spt: SupplementalPageTable,
    pub mmu: Arc<TestMmu>,
}

impl Process {
    pub fn new() -> Self {
        let mmu = TestMmu::new();
        Self {
            spt: SupplementalPageTable::new(mmu.clone()),
            mmu,
        }
    }
}

/// A VM over test doubles, with helpers that behave like user code.
pub struct Harness {
    pub vm: Vm,
    pub mem: Arc<TestMemory>,
    pub swap: Arc<TestSwap>,
}

impl Harness {
    pub fn new(frames: usize, swap_slots: usize) -> Self {
        Self::with_policy(frames, swap_slots, Box::new(Fifo))
    }

    pub fn with_policy(frames: usize, swap_slots: usize, policy: Box<dyn EvictionPolicy>) -> Self {
        init_logging();
        let mem = TestMemory::new(frames);
        let swap = TestSwap::new(swap_slots);
        let vm = Vm::new(
            Box::new(TestPool(mem.clone())),
            mem.clone(),
            swap.clone(),
            policy,
            VmConfig::default(),
        );
        Self { vm, mem, swap }
    }

    /// Raise the fault user code would get for accessing `va`.
    pub fn fault(
        &self,
        proc: &mut Process,
        va: VirtualAddress,
        write: bool,
        rsp: VirtualAddress,
    ) -> Result<(), VmError> {
        let not_present = proc.mmu.query(va.page()).is_none();
        let fault = PageFault {
            addr: va,
            not_present,
            write,
            user: true,
            rsp,
        };
        self.vm.handle_fault(&mut proc.spt, &fault)
    }

    /// Access `va` like user code with stack pointer `rsp`, faulting as needed.
    pub fn access(
        &self,
        proc: &mut Process,
        va: VirtualAddress,
        write: bool,
        rsp: VirtualAddress,
    ) -> Result<PhysicalPage, VmError> {
        let page = va.page();
        let allowed = match proc.mmu.is_writable(page) {
            Some(writable) => writable || !write,
            None => false,
        };
        if !allowed {
            self.fault(proc, va, write, rsp)?;
        }
        proc.mmu.touch(page, write);
        Ok(proc.mmu.query(page).expect("resolved fault left page unmapped"))
    }

    fn default_rsp(&self) -> VirtualAddress {
        self.vm.config().user_stack_top
    }

    pub fn write(
        &self,
        proc: &mut Process,
        va: VirtualAddress,
        bytes: &[u8],
    ) -> Result<(), VmError> {
        let frame = self.access(proc, va, true, self.default_rsp())?;
        self.mem.write(frame, va.offset() as usize, bytes);
        Ok(())
    }

    pub fn read(
        &self,
        proc: &mut Process,
        va: VirtualAddress,
        len: usize,
    ) -> Result<Vec<u8>, VmError> {
        let frame = self.access(proc, va, false, self.default_rsp())?;
        let offset = va.offset() as usize;
        Ok(self.mem.read(frame)[offset..offset + len].to_vec())
    }

    /// Frame-table bindings and page-table mappings agree.
    pub fn assert_consistent(&self) {
        if let Err(id) = self.vm.frames().audit() {
            panic!("frame table inconsistent at {id:?}");
        }
    }
}

pub fn va(addr: u64) -> VirtualAddress {
    VirtualAddress::new(addr)
}
