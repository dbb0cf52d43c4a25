//! The fetch-decode-execute core.
//!
//! `step()` runs one instruction (or services one pending interrupt) and
//! returns the cycles it consumed, so a host can clock peripherals against
//! the 2A03's 1.79 MHz rate. Dispatch is table-driven: the opcode byte
//! indexes `opcodes::OPCODE_TABLE`, the addressing resolver produces the
//! effective address, and the mnemonic handler finishes the job.

use std::fmt;

use crate::addressing::{self, Operand, Resolved};
use crate::alu;
use crate::bus::{Bus, IRQ_VECTOR, NMI_VECTOR, RESET_VECTOR};
use crate::interrupt::InterruptController;
use crate::metrics::{
    record_cycles, record_illegal_opcode, record_instruction, record_interrupt, Timer,
};
use crate::opcodes::{self, Mnemonic, Opcode};
use crate::registers::{
    Registers, CARRY_FLAG, DECIMAL_MODE, INTERRUPT_DISABLE, NEGATIVE_FLAG, OVERFLOW_FLAG,
    UNUSED_FLAG, ZERO_FLAG,
};

/// What to do when the fetch lands on an undocumented opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IllegalOpcodePolicy {
    /// Fail the step; no register state is advanced.
    Strict,
    /// Treat the byte as a 2-cycle, 1-byte NOP.
    NopFallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuError {
    IllegalOpcode { opcode: u8, pc: u16 },
}

impl fmt::Display for CpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuError::IllegalOpcode { opcode, pc } => {
                write!(f, "illegal opcode ${opcode:02X} at ${pc:04X}")
            }
        }
    }
}

impl std::error::Error for CpuError {}

pub struct Cpu<B: Bus> {
    pub regs: Registers,
    bus: B,
    interrupts: InterruptController,
    illegal_policy: IllegalOpcodePolicy,
    cycles: u64,
    last_opcode: Option<u8>,
}

impl<B: Bus> Cpu<B> {
    /// Build a CPU around `bus`, loading PC from the reset vector.
    /// Undocumented opcodes are strict failures.
    pub fn new(bus: B) -> Self {
        Self::with_policy(bus, IllegalOpcodePolicy::Strict)
    }

    pub fn with_policy(mut bus: B, illegal_policy: IllegalOpcodePolicy) -> Self {
        let mut regs = Registers::new();
        regs.pc = bus.read_word(RESET_VECTOR);

        Cpu {
            regs,
            bus,
            interrupts: InterruptController::new(),
            illegal_policy,
            cycles: 0,
            last_opcode: None,
        }
    }

    /// Re-apply the reset sequence.
    ///
    /// The real chip runs its interrupt microcode with writes suppressed,
    /// leaving SP three lower; we use the documented post-reset state
    /// directly.
    pub fn reset(&mut self) {
        self.regs = Registers::new();
        self.regs.pc = self.bus.read_word(RESET_VECTOR);
        self.interrupts = InterruptController::new();
        self.cycles = 0;
        self.last_opcode = None;
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Total cycles consumed since construction or the last reset.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Reinstate the cycle counter from a save-state.
    pub fn set_cycles(&mut self, cycles: u64) {
        self.cycles = cycles;
    }

    pub fn last_opcode(&self) -> Option<u8> {
        self.last_opcode
    }

    /// Peripheral-facing: latch a non-maskable interrupt request.
    pub fn trigger_nmi(&mut self) {
        self.interrupts.trigger_nmi();
    }

    /// Peripheral-facing: drive the maskable interrupt line.
    pub fn set_irq(&mut self, level: bool) {
        self.interrupts.set_irq(level);
    }

    pub fn interrupts(&self) -> &InterruptController {
        &self.interrupts
    }

    pub fn interrupts_mut(&mut self) -> &mut InterruptController {
        &mut self.interrupts
    }

    /// Execute one instruction, or service one pending interrupt, and
    /// return the cycles consumed.
    pub fn step(&mut self) -> Result<u32, CpuError> {
        // Interrupts are sampled at the step boundary, NMI first
        if self.interrupts.take_nmi() {
            let cycles = self.service_interrupt(NMI_VECTOR);
            record_interrupt("nmi");
            record_cycles(cycles);
            return Ok(cycles);
        }
        if self.interrupts.irq_asserted() && !self.regs.get_flag(INTERRUPT_DISABLE) {
            let cycles = self.service_interrupt(IRQ_VECTOR);
            record_interrupt("irq");
            record_cycles(cycles);
            return Ok(cycles);
        }

        let pc = self.regs.pc;
        let opcode = self.bus.read(pc);
        let timer = Timer::new();

        let entry = match opcodes::lookup(opcode) {
            Some(entry) => entry,
            None => {
                record_illegal_opcode(opcode);
                match self.illegal_policy {
                    IllegalOpcodePolicy::Strict => {
                        return Err(CpuError::IllegalOpcode { opcode, pc });
                    }
                    IllegalOpcodePolicy::NopFallback => {
                        self.regs.pc = pc.wrapping_add(1);
                        self.last_opcode = Some(opcode);
                        self.cycles += 2;
                        record_instruction(opcode, "NOP", 2, timer.elapsed());
                        return Ok(2);
                    }
                }
            }
        };

        self.regs.pc = pc.wrapping_add(1);
        self.last_opcode = Some(opcode);

        let resolved = addressing::resolve(&mut self.regs, &mut self.bus, entry.mode);

        let mut cycles = entry.base_cycles as u32;
        if entry.extra_on_page_cross && resolved.page_crossed {
            cycles += 1;
        }
        cycles += self.execute(entry, resolved);

        // Bit 5 of live P is kept set by every path that writes P
        debug_assert!(self.regs.get_flag(UNUSED_FLAG));

        self.cycles += cycles as u64;
        record_instruction(opcode, entry.mnemonic.name(), cycles, timer.elapsed());
        Ok(cycles)
    }

    /// Human-readable machine state, bit-decoded P included. Printed by
    /// hosts next to any fault.
    pub fn debug_dump(&self) -> String {
        let p = self.regs.status;
        let bit = |flag: u8| u8::from(p & flag != 0);
        let last = match self.last_opcode {
            Some(op) => format!("${:02X} {}", op, opcodes::instruction_name(op)),
            None => "none".to_string(),
        };

        format!(
            "PC=${:04X} A=${:02X} X=${:02X} Y=${:02X} SP=${:02X} P=${:02X} \
             [N:{} V:{} B:{} D:{} I:{} Z:{} C:{}] last={}",
            self.regs.pc,
            self.regs.a,
            self.regs.x,
            self.regs.y,
            self.regs.sp,
            p,
            bit(NEGATIVE_FLAG),
            bit(OVERFLOW_FLAG),
            bit(crate::registers::BREAK_COMMAND),
            bit(DECIMAL_MODE),
            bit(INTERRUPT_DISABLE),
            bit(ZERO_FLAG),
            bit(CARRY_FLAG),
            last,
        )
    }

    // ---- interrupt servicing ----

    fn service_interrupt(&mut self, vector: u16) -> u32 {
        let pc = self.regs.pc;
        self.push((pc >> 8) as u8);
        self.push(pc as u8);
        // Hardware interrupts push B clear; bit 5 still reads 1
        let image = self.regs.p_to_stack(false);
        self.push(image);
        self.regs.set_flag(INTERRUPT_DISABLE, true);
        self.regs.pc = self.bus.read_word(vector);
        self.cycles += 7;
        7
    }

    // ---- instruction bodies ----

    /// Returns the extra cycles not covered by the table (branch taken /
    /// branch page-cross).
    fn execute(&mut self, entry: &Opcode, resolved: Resolved) -> u32 {
        match entry.mnemonic {
            // Loads
            Mnemonic::Lda => {
                let value = self.read_operand(resolved.operand);
                self.regs.a = value;
                self.regs.update_zero_and_negative_flags(value);
            }
            Mnemonic::Ldx => {
                let value = self.read_operand(resolved.operand);
                self.regs.x = value;
                self.regs.update_zero_and_negative_flags(value);
            }
            Mnemonic::Ldy => {
                let value = self.read_operand(resolved.operand);
                self.regs.y = value;
                self.regs.update_zero_and_negative_flags(value);
            }

            // Stores
            Mnemonic::Sta => {
                let addr = self.operand_address(resolved.operand);
                self.bus.write(addr, self.regs.a);
            }
            Mnemonic::Stx => {
                let addr = self.operand_address(resolved.operand);
                self.bus.write(addr, self.regs.x);
            }
            Mnemonic::Sty => {
                let addr = self.operand_address(resolved.operand);
                self.bus.write(addr, self.regs.y);
            }

            // Transfers
            Mnemonic::Tax => {
                self.regs.x = self.regs.a;
                self.regs.update_zero_and_negative_flags(self.regs.x);
            }
            Mnemonic::Tay => {
                self.regs.y = self.regs.a;
                self.regs.update_zero_and_negative_flags(self.regs.y);
            }
            Mnemonic::Txa => {
                self.regs.a = self.regs.x;
                self.regs.update_zero_and_negative_flags(self.regs.a);
            }
            Mnemonic::Tya => {
                self.regs.a = self.regs.y;
                self.regs.update_zero_and_negative_flags(self.regs.a);
            }
            Mnemonic::Tsx => {
                self.regs.x = self.regs.sp;
                self.regs.update_zero_and_negative_flags(self.regs.x);
            }
            Mnemonic::Txs => {
                // The one transfer that leaves flags alone
                self.regs.sp = self.regs.x;
            }

            // Arithmetic
            Mnemonic::Adc => {
                let m = self.read_operand(resolved.operand);
                let out = alu::adc(self.regs.a, m, self.regs.get_flag(CARRY_FLAG));
                self.regs.set_flag(CARRY_FLAG, out.carry);
                self.regs.set_flag(OVERFLOW_FLAG, out.overflow);
                self.regs.a = out.result;
                self.regs.update_zero_and_negative_flags(out.result);
            }
            Mnemonic::Sbc => {
                let m = self.read_operand(resolved.operand);
                let out = alu::sbc(self.regs.a, m, self.regs.get_flag(CARRY_FLAG));
                self.regs.set_flag(CARRY_FLAG, out.carry);
                self.regs.set_flag(OVERFLOW_FLAG, out.overflow);
                self.regs.a = out.result;
                self.regs.update_zero_and_negative_flags(out.result);
            }

            // Compares
            Mnemonic::Cmp => {
                let m = self.read_operand(resolved.operand);
                let (diff, carry) = alu::compare(self.regs.a, m);
                self.regs.set_flag(CARRY_FLAG, carry);
                self.regs.update_zero_and_negative_flags(diff);
            }
            Mnemonic::Cpx => {
                let m = self.read_operand(resolved.operand);
                let (diff, carry) = alu::compare(self.regs.x, m);
                self.regs.set_flag(CARRY_FLAG, carry);
                self.regs.update_zero_and_negative_flags(diff);
            }
            Mnemonic::Cpy => {
                let m = self.read_operand(resolved.operand);
                let (diff, carry) = alu::compare(self.regs.y, m);
                self.regs.set_flag(CARRY_FLAG, carry);
                self.regs.update_zero_and_negative_flags(diff);
            }

            // Logical
            Mnemonic::And => {
                let m = self.read_operand(resolved.operand);
                self.regs.a &= m;
                self.regs.update_zero_and_negative_flags(self.regs.a);
            }
            Mnemonic::Ora => {
                let m = self.read_operand(resolved.operand);
                self.regs.a |= m;
                self.regs.update_zero_and_negative_flags(self.regs.a);
            }
            Mnemonic::Eor => {
                let m = self.read_operand(resolved.operand);
                self.regs.a ^= m;
                self.regs.update_zero_and_negative_flags(self.regs.a);
            }
            Mnemonic::Bit => {
                let m = self.read_operand(resolved.operand);
                let (zero, negative, overflow) = alu::bit(self.regs.a, m);
                self.regs.set_flag(ZERO_FLAG, zero);
                self.regs.set_flag(NEGATIVE_FLAG, negative);
                self.regs.set_flag(OVERFLOW_FLAG, overflow);
            }

            // Shifts and rotates
            Mnemonic::Asl => self.read_modify_write(resolved, |regs, m| {
                let (result, carry) = alu::asl(m);
                regs.set_flag(CARRY_FLAG, carry);
                regs.update_zero_and_negative_flags(result);
                result
            }),
            Mnemonic::Lsr => self.read_modify_write(resolved, |regs, m| {
                let (result, carry) = alu::lsr(m);
                regs.set_flag(CARRY_FLAG, carry);
                regs.update_zero_and_negative_flags(result);
                result
            }),
            Mnemonic::Rol => {
                let carry_in = self.regs.get_flag(CARRY_FLAG);
                self.read_modify_write(resolved, |regs, m| {
                    let (result, carry) = alu::rol(m, carry_in);
                    regs.set_flag(CARRY_FLAG, carry);
                    regs.update_zero_and_negative_flags(result);
                    result
                });
            }
            Mnemonic::Ror => {
                let carry_in = self.regs.get_flag(CARRY_FLAG);
                self.read_modify_write(resolved, |regs, m| {
                    let (result, carry) = alu::ror(m, carry_in);
                    regs.set_flag(CARRY_FLAG, carry);
                    regs.update_zero_and_negative_flags(result);
                    result
                });
            }

            // Increments and decrements
            Mnemonic::Inc => self.read_modify_write(resolved, |regs, m| {
                let result = m.wrapping_add(1);
                regs.update_zero_and_negative_flags(result);
                result
            }),
            Mnemonic::Dec => self.read_modify_write(resolved, |regs, m| {
                let result = m.wrapping_sub(1);
                regs.update_zero_and_negative_flags(result);
                result
            }),
            Mnemonic::Inx => {
                self.regs.x = self.regs.x.wrapping_add(1);
                self.regs.update_zero_and_negative_flags(self.regs.x);
            }
            Mnemonic::Iny => {
                self.regs.y = self.regs.y.wrapping_add(1);
                self.regs.update_zero_and_negative_flags(self.regs.y);
            }
            Mnemonic::Dex => {
                self.regs.x = self.regs.x.wrapping_sub(1);
                self.regs.update_zero_and_negative_flags(self.regs.x);
            }
            Mnemonic::Dey => {
                self.regs.y = self.regs.y.wrapping_sub(1);
                self.regs.update_zero_and_negative_flags(self.regs.y);
            }

            // Branches
            Mnemonic::Bcc => {
                let taken = !self.regs.get_flag(CARRY_FLAG);
                return self.branch(resolved, taken);
            }
            Mnemonic::Bcs => {
                let taken = self.regs.get_flag(CARRY_FLAG);
                return self.branch(resolved, taken);
            }
            Mnemonic::Beq => {
                let taken = self.regs.get_flag(ZERO_FLAG);
                return self.branch(resolved, taken);
            }
            Mnemonic::Bne => {
                let taken = !self.regs.get_flag(ZERO_FLAG);
                return self.branch(resolved, taken);
            }
            Mnemonic::Bmi => {
                let taken = self.regs.get_flag(NEGATIVE_FLAG);
                return self.branch(resolved, taken);
            }
            Mnemonic::Bpl => {
                let taken = !self.regs.get_flag(NEGATIVE_FLAG);
                return self.branch(resolved, taken);
            }
            Mnemonic::Bvc => {
                let taken = !self.regs.get_flag(OVERFLOW_FLAG);
                return self.branch(resolved, taken);
            }
            Mnemonic::Bvs => {
                let taken = self.regs.get_flag(OVERFLOW_FLAG);
                return self.branch(resolved, taken);
            }

            // Jumps and subroutines
            Mnemonic::Jmp => {
                self.regs.pc = self.operand_address(resolved.operand);
            }
            Mnemonic::Jsr => {
                let target = self.operand_address(resolved.operand);
                // Push the address of the JSR's last byte; RTS adds one
                let return_addr = self.regs.pc.wrapping_sub(1);
                self.push((return_addr >> 8) as u8);
                self.push(return_addr as u8);
                self.regs.pc = target;
            }
            Mnemonic::Rts => {
                let low = self.pop() as u16;
                let high = self.pop() as u16;
                self.regs.pc = ((high << 8) | low).wrapping_add(1);
            }

            // Stack
            Mnemonic::Pha => {
                self.push(self.regs.a);
            }
            Mnemonic::Php => {
                let image = self.regs.p_to_stack(true);
                self.push(image);
            }
            Mnemonic::Pla => {
                self.regs.a = self.pop();
                self.regs.update_zero_and_negative_flags(self.regs.a);
            }
            Mnemonic::Plp => {
                let image = self.pop();
                self.regs.stack_to_p(image);
            }

            // Flag manipulation
            Mnemonic::Clc => self.regs.set_flag(CARRY_FLAG, false),
            Mnemonic::Sec => self.regs.set_flag(CARRY_FLAG, true),
            Mnemonic::Cli => self.regs.set_flag(INTERRUPT_DISABLE, false),
            Mnemonic::Sei => self.regs.set_flag(INTERRUPT_DISABLE, true),
            Mnemonic::Cld => self.regs.set_flag(DECIMAL_MODE, false),
            Mnemonic::Sed => self.regs.set_flag(DECIMAL_MODE, true),
            Mnemonic::Clv => self.regs.set_flag(OVERFLOW_FLAG, false),

            // Software interrupt
            Mnemonic::Brk => {
                // PC of the opcode plus two: BRK carries a signature byte
                let return_addr = self.regs.pc.wrapping_add(1);
                self.push((return_addr >> 8) as u8);
                self.push(return_addr as u8);
                let image = self.regs.p_to_stack(true);
                self.push(image);
                self.regs.set_flag(INTERRUPT_DISABLE, true);
                self.regs.pc = self.bus.read_word(IRQ_VECTOR);
                record_interrupt("brk");
            }
            Mnemonic::Rti => {
                let image = self.pop();
                self.regs.stack_to_p(image);
                let low = self.pop() as u16;
                let high = self.pop() as u16;
                self.regs.pc = (high << 8) | low;
            }

            Mnemonic::Nop => {}
        }

        0
    }

    fn branch(&mut self, resolved: Resolved, taken: bool) -> u32 {
        if !taken {
            return 0;
        }
        self.regs.pc = self.operand_address(resolved.operand);
        if resolved.page_crossed {
            2
        } else {
            1
        }
    }

    /// Read the operand value: through the bus for addressable modes, from
    /// A for accumulator mode.
    fn read_operand(&mut self, operand: Operand) -> u8 {
        match operand {
            Operand::Address(addr) => self.bus.read(addr),
            Operand::Accumulator => self.regs.a,
            // The table never pairs a value-consuming mnemonic with implied
            Operand::None => unreachable!("operand read on implied mode"),
        }
    }

    fn operand_address(&self, operand: Operand) -> u16 {
        match operand {
            Operand::Address(addr) => addr,
            _ => unreachable!("address required for this mnemonic"),
        }
    }

    /// Shared path for INC/DEC and memory-target shifts.
    ///
    /// The unmodified byte is written back before the new value, matching
    /// the chip's bus pattern; peripherals can observe that write.
    fn read_modify_write<F>(&mut self, resolved: Resolved, f: F)
    where
        F: FnOnce(&mut Registers, u8) -> u8,
    {
        match resolved.operand {
            Operand::Accumulator => {
                let old = self.regs.a;
                self.regs.a = f(&mut self.regs, old);
            }
            Operand::Address(addr) => {
                let old = self.bus.read(addr);
                self.bus.write(addr, old);
                let new = f(&mut self.regs, old);
                self.bus.write(addr, new);
            }
            Operand::None => unreachable!("read-modify-write on implied mode"),
        }
    }

    // ---- stack ----

    pub fn push(&mut self, value: u8) {
        let addr = 0x0100 | self.regs.sp as u16;
        self.bus.write(addr, value);
        self.regs.sp = self.regs.sp.wrapping_sub(1);
    }

    pub fn pop(&mut self) -> u8 {
        self.regs.sp = self.regs.sp.wrapping_add(1);
        self.bus.read(0x0100 | self.regs.sp as u16)
    }
}
