//! # Demand-Paged Virtual Memory
//!
//! This crate is the virtual-memory core of the kernel: it decides which
//! physical frame (if any) backs each page of a user process, brings pages in
//! lazily on first touch, pushes them out to swap or back to their file when
//! memory runs short, and tears everything down again when a process exits.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                        Vm                           │
//! │    • page-fault resolution, stack growth            │
//! │    • lazy segment loading, mmap / munmap            │
//! │    • fork (eager copy), process teardown            │
//! └──────────┬──────────────────────────────┬───────────┘
//!            │ per process                  │ global
//! ┌──────────▼──────────────┐   ┌───────────▼───────────┐
//! │ SupplementalPageTable   │   │ FrameAllocator        │
//! │  VirtualPage → Page     │◄──┤  frame → page (weak)  │
//! │  mmap regions           │   │  eviction policy      │
//! └──────────┬──────────────┘   └───────────┬───────────┘
//!            │                              │
//! ┌──────────▼──────────────────────────────▼───────────┐
//! │  Page: Uninit ─► Anon (swap) │ File (write-back)    │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Components
//!
//! ### Pages ([`page`])
//!
//! Every user page starts out *uninit* and carries the recipe for its first
//! content. On first touch it becomes an anonymous or a file-backed page and
//! stays that kind for the rest of its life.
//!
//! ### Frame Table ([`frame`], [`evict`])
//!
//! Tracks every frame in use by a user page. When the physical pool is empty
//! a victim is chosen by the configured [`EvictionPolicy`], its content is
//! persisted and the frame is reused.
//!
//! ### Swap ([`swap`])
//!
//! Page-sized slots on a [`SwapDevice`](platform::SwapDevice) for evicted
//! anonymous pages.
//!
//! ### Faults ([`fault`])
//!
//! Decides whether a fault is legitimate and what to do about it.
//!
//! ## Platform Integration
//!
//! The crate is `no_std` and never touches hardware. The kernel supplies the
//! physical pool, the direct map, per-process MMU handles, the swap disk and
//! open files through the traits in [`platform`]; the test suite supplies
//! in-memory doubles of the same traits.
//!
//! ## Errors and Logging
//!
//! Fallible operations return [`VmError`]. Its [`severity`](VmError::severity)
//! tells the caller whether to terminate the process or halt the kernel.
//! Diagnostics go through the [`log`] facade: page transitions at `trace`,
//! address-space events at `debug`, process-fatal conditions at `warn` and
//! kernel-fatal ones at `error`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod addresses;
pub mod error;
pub mod evict;
pub mod fault;
mod fork;
pub mod frame;
pub mod layout;
pub mod loader;
mod mmap;
pub mod page;
pub mod platform;
pub mod spt;
pub mod swap;
mod vm;

pub use crate::error::{FaultReason, Severity, VmError};
pub use crate::evict::{Clock, EvictionPolicy, Fifo};
pub use crate::fault::{PageFault, PageFaultError};
pub use crate::layout::VmConfig;
pub use crate::loader::LoadSegment;
pub use crate::page::{Initializer, PageKind};
pub use crate::spt::SupplementalPageTable;
pub use crate::vm::Vm;
