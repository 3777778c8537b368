//! Guest address space, descriptor tables and vCPU state management for
//! hardware-accelerated x86_64 test virtual machines.
//!
//! The crate builds what the virtualization extension consumes: 4-level paging
//! structures, the GDT, TSS and IDT, the exception routing table, and the
//! complete vCPU state snapshot used to suspend and resume a vCPU. The
//! hypervisor control channel and the guest memory allocator are provided by
//! the caller through the traits in [`platform_ops`].
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod processor;

pub use processor::cpuid::{CpuFeature, CpuidCache};
pub use processor::error::{Error, IoctlError};
pub use processor::interrupt_handlers::{ExRegs, ExceptionHandler};
pub use processor::paging_structures::{PageLevel, PagingStructures};
pub use processor::platform_ops::{self, Capability, GuestMemory, HypervisorOps, VcpuOps};
pub use processor::vcpu_state::VcpuState;
pub use processor::vm::GuestVm;
pub use processor::VmMode;
