//! # NES 6502 (Ricoh 2A03) CPU Core
//!
//! An interpreter for the NES's 6502 derivative: all 151 documented
//! opcodes across 13 addressing modes, bit-accurate flag handling,
//! per-instruction cycle counting with page-cross and branch penalties,
//! and NMI/IRQ/BRK interrupt servicing. The decimal flag is storable but
//! arithmetically inert, as on the real chip.
//!
//! The CPU talks to the outside world only through the [`bus::Bus`] trait;
//! a flat 64 KiB [`memory::Memory`] backing is provided for hosting and
//! tests. Hardware quirks are part of the contract: JMP-indirect wraps at
//! page boundaries and zero-page indexing never leaves the zero page.
//!
//! An HTTP control plane ([`server`]) hosts emulator instances with
//! machine-variant profiles, save-state snapshots and Prometheus metrics.
//!
//! ## Example
//!
//! ```rust
//! use ricoh2a03::cpu::Cpu;
//! use ricoh2a03::memory::Memory;
//!
//! let mut memory = Memory::new();
//!
//! // Load a simple program: LDA #$42
//! memory.load_program(&[0xA9, 0x42], 0x0600);
//!
//! // Set reset vector
//! memory.write_u16(0xFFFC, 0x0600);
//!
//! let mut cpu = Cpu::new(memory);
//! let cycles = cpu.step().unwrap();
//!
//! assert_eq!(cpu.regs.a, 0x42);
//! assert_eq!(cycles, 2);
//! ```

#![recursion_limit = "2048"]

pub mod addressing;
pub mod alu;
pub mod bus;
pub mod cpu;
pub mod interrupt;
pub mod memory;
pub mod metrics;
pub mod opcodes;
pub mod registers;
pub mod server;
pub mod instance_types;
pub mod snapshots;

pub use bus::Bus;
pub use cpu::{Cpu, CpuError, IllegalOpcodePolicy};
pub use memory::Memory;
