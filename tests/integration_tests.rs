use ricoh2a03::bus::Bus;
use ricoh2a03::cpu::Cpu;
use ricoh2a03::memory::Memory;
use ricoh2a03::registers::{
    CARRY_FLAG, INTERRUPT_DISABLE, NEGATIVE_FLAG, OVERFLOW_FLAG, UNUSED_FLAG, ZERO_FLAG,
};

fn machine(program: &[u8]) -> Cpu<Memory> {
    machine_at(program, 0x0600)
}

fn machine_at(program: &[u8], start: u16) -> Cpu<Memory> {
    let mut memory = Memory::new();
    memory.load_program(program, start);
    memory.write_u16(0xFFFC, start);
    Cpu::new(memory)
}

#[test]
fn test_simple_calculation() {
    // Calculate 10 + 20 + 30 and store result
    let mut cpu = machine(&[
        0xA9, 0x0A, // LDA #$0A    ; A = 10
        0x69, 0x14, // ADC #$14    ; A = A + 20 = 30
        0x69, 0x1E, // ADC #$1E    ; A = A + 30 = 60
        0x85, 0x50, // STA $50     ; Store result at $50
    ]);

    for _ in 0..4 {
        cpu.step().unwrap();
    }

    assert_eq!(cpu.regs.a, 60);
    assert_eq!(cpu.bus_mut().read(0x50), 60);
}

#[test]
fn test_memory_copy_single_byte() {
    let mut cpu = machine(&[
        0xA5, 0x60, // LDA $60     ; Load from source
        0x85, 0x70, // STA $70     ; Store to destination
    ]);
    cpu.bus_mut().write(0x60, 0x42);

    cpu.step().unwrap(); // LDA $60
    cpu.step().unwrap(); // STA $70

    assert_eq!(cpu.bus_mut().read(0x70), 0x42);
    assert_eq!(cpu.regs.a, 0x42);
}

#[test]
fn test_indexed_memory_access() {
    let mut cpu = machine(&[
        0xA2, 0x02, // LDX #$02    ; X = 2
        0xB5, 0x50, // LDA $50,X   ; Load from $50 + X = $52
        0x95, 0x60, // STA $60,X   ; Store to $60 + X = $62
    ]);
    cpu.bus_mut().write(0x50, 0x10);
    cpu.bus_mut().write(0x51, 0x20);
    cpu.bus_mut().write(0x52, 0x30);

    cpu.step().unwrap(); // LDX
    cpu.step().unwrap(); // LDA $50,X
    cpu.step().unwrap(); // STA $60,X

    assert_eq!(cpu.regs.x, 2);
    assert_eq!(cpu.regs.a, 0x30); // Value from $52
    assert_eq!(cpu.bus_mut().read(0x62), 0x30); // Stored at $60 + 2
}

#[test]
fn test_countdown_loop_until_zero() {
    // LDX #3; DEX; BNE -3: three trips around the loop, then fall through
    let mut cpu = machine(&[0xA2, 0x03, 0xCA, 0xD0, 0xFD]);

    for _ in 0..7 {
        cpu.step().unwrap();
    }

    assert_eq!(cpu.regs.x, 0x00);
    assert!(cpu.regs.get_flag(ZERO_FLAG));
    assert_eq!(cpu.regs.pc, 0x0605); // fell through the branch
}

// Scenario: load and store through the absolute path
#[test]
fn test_load_and_store() {
    let mut cpu = machine(&[0xA9, 0x01, 0x8D, 0x00, 0x02]); // LDA #$01; STA $0200

    cpu.step().unwrap();
    cpu.step().unwrap();

    assert_eq!(cpu.regs.a, 0x01);
    assert_eq!(cpu.bus_mut().read(0x0200), 0x01);
    assert_eq!(cpu.regs.pc, 0x0605);
    assert!(!cpu.regs.get_flag(NEGATIVE_FLAG));
    assert!(!cpu.regs.get_flag(ZERO_FLAG));
}

// Scenario: two positives adding to a negative set V but not C
#[test]
fn test_add_with_carry_overflow() {
    let mut cpu = machine(&[0x69, 0x50]); // ADC #$50
    cpu.regs.a = 0x50;
    cpu.regs.set_flag(CARRY_FLAG, false);

    cpu.step().unwrap();

    assert_eq!(cpu.regs.a, 0xA0);
    assert!(!cpu.regs.get_flag(CARRY_FLAG));
    assert!(cpu.regs.get_flag(OVERFLOW_FLAG));
    assert!(cpu.regs.get_flag(NEGATIVE_FLAG));
    assert!(!cpu.regs.get_flag(ZERO_FLAG));
}

// Scenario: subtraction to zero keeps carry (no borrow)
#[test]
fn test_subtract_producing_zero() {
    let mut cpu = machine(&[0xE9, 0x05]); // SBC #$05
    cpu.regs.a = 0x05;
    cpu.regs.set_flag(CARRY_FLAG, true);

    cpu.step().unwrap();

    assert_eq!(cpu.regs.a, 0x00);
    assert!(cpu.regs.get_flag(ZERO_FLAG));
    assert!(cpu.regs.get_flag(CARRY_FLAG));
    assert!(!cpu.regs.get_flag(NEGATIVE_FLAG));
    assert!(!cpu.regs.get_flag(OVERFLOW_FLAG));
}

// Scenario: taken branch across a page costs 2 + 1 + 1 cycles
#[test]
fn test_branch_taken_page_cross() {
    let mut cpu = machine_at(&[0xD0, 0x02], 0x06FD); // BNE +2 with Z clear

    let cycles = cpu.step().unwrap();

    assert_eq!(cycles, 4);
    assert_eq!(cpu.regs.pc, 0x0701);
}

// Scenario: JSR/RTS round trip with the documented stack image
#[test]
fn test_subroutine_call_and_return() {
    let mut cpu = machine(&[0x20, 0x34, 0x12, 0xEA]); // JSR $1234; NOP
    cpu.bus_mut().write(0x1234, 0x60); // RTS

    cpu.step().unwrap(); // JSR
    assert_eq!(cpu.regs.pc, 0x1234);
    // PC of JSR + 2, pushed high then low: next pull yields $02 then $06
    assert_eq!(cpu.bus_mut().read(0x01FC), 0x02);
    assert_eq!(cpu.bus_mut().read(0x01FD), 0x06);

    cpu.step().unwrap(); // RTS
    assert_eq!(cpu.regs.pc, 0x0603); // instruction after the 3-byte JSR
}

// Scenario: NMI latched between instructions is serviced at the boundary
#[test]
fn test_nmi_service() {
    let mut cpu = machine(&[0xEA, 0xEA]);
    cpu.bus_mut().write_u16(0xFFFA, 0x8000);

    cpu.step().unwrap(); // NOP; a peripheral raises NMI afterwards
    cpu.trigger_nmi();
    let cycles = cpu.step().unwrap();

    assert_eq!(cycles, 7);
    assert_eq!(cpu.regs.pc, 0x8000);
    assert!(cpu.regs.get_flag(INTERRUPT_DISABLE));
    // Pushed: PCH ($06), PCL ($01), then P with bit 4 clear and bit 5 set
    assert_eq!(cpu.bus_mut().read(0x01FD), 0x06);
    assert_eq!(cpu.bus_mut().read(0x01FC), 0x01);
    let image = cpu.bus_mut().read(0x01FB);
    assert_eq!(image & 0x10, 0);
    assert_eq!(image & UNUSED_FLAG, UNUSED_FLAG);
}

#[test]
fn test_interrupt_handler_round_trip() {
    // Main program increments $10 forever; the NMI handler increments $11
    // and returns to exactly where it left off
    let mut cpu = machine(&[
        0xE6, 0x10, // $0600: INC $10
        0x4C, 0x00, 0x06, // JMP $0600
    ]);
    cpu.bus_mut().load_program(&[0xE6, 0x11, 0x40], 0x8000); // INC $11; RTI
    cpu.bus_mut().write_u16(0xFFFA, 0x8000);

    cpu.step().unwrap(); // INC $10
    cpu.trigger_nmi();
    cpu.step().unwrap(); // NMI service
    assert_eq!(cpu.regs.pc, 0x8000);

    cpu.step().unwrap(); // INC $11
    cpu.step().unwrap(); // RTI
    assert_eq!(cpu.regs.pc, 0x0602); // back at the JMP

    cpu.step().unwrap(); // JMP $0600
    cpu.step().unwrap(); // INC $10 again

    assert_eq!(cpu.bus_mut().read(0x10), 0x02);
    assert_eq!(cpu.bus_mut().read(0x11), 0x01);
}

#[test]
fn test_push_pull_round_trips() {
    // PHA/PLA and PHP/PLP both restore what they saved (modulo bits 4/5)
    let mut cpu = machine(&[
        0xA9, 0x99, // LDA #$99
        0x48,       // PHA
        0x38,       // SEC
        0x08,       // PHP
        0xA9, 0x00, // LDA #$00
        0x18,       // CLC
        0x28,       // PLP
        0x68,       // PLA
    ]);

    for _ in 0..7 {
        cpu.step().unwrap();
    }

    assert!(cpu.regs.get_flag(CARRY_FLAG)); // PLP brought carry back

    cpu.step().unwrap(); // PLA
    assert_eq!(cpu.regs.a, 0x99);
    assert!(cpu.regs.get_flag(NEGATIVE_FLAG));
}

#[test]
fn test_zero_page_wrap_boundary() {
    // LDX #$01; LDA $FF,X resolves to $0000, not $0100
    let mut cpu = machine(&[0xA2, 0x01, 0xB5, 0xFF]);
    cpu.bus_mut().write(0x0000, 0x77);
    cpu.bus_mut().write(0x0100, 0x33);

    cpu.step().unwrap();
    cpu.step().unwrap();

    assert_eq!(cpu.regs.a, 0x77);
}

#[test]
fn test_jmp_indirect_boundary_bug() {
    // JMP ($02FF) takes its high byte from $0200
    let mut cpu = machine(&[0x6C, 0xFF, 0x02]);
    cpu.bus_mut().write(0x02FF, 0x00);
    cpu.bus_mut().write(0x0200, 0x80);
    cpu.bus_mut().write(0x0300, 0x90);

    cpu.step().unwrap();

    assert_eq!(cpu.regs.pc, 0x8000);
}

#[test]
fn test_indirect_indexed_program() {
    // Table pointer in zero page, walked with Y
    let mut cpu = machine(&[
        0xA0, 0x03, // LDY #$03
        0xB1, 0x40, // LDA ($40),Y
    ]);
    cpu.bus_mut().write(0x40, 0x00);
    cpu.bus_mut().write(0x41, 0x03); // pointer -> $0300
    cpu.bus_mut().write(0x0303, 0x5A);

    cpu.step().unwrap();
    cpu.step().unwrap();

    assert_eq!(cpu.regs.a, 0x5A);
}

#[test]
fn test_fault_reports_and_preserves_state() {
    let mut cpu = machine(&[0xA9, 0x07, 0x02]); // LDA #$07 then an undocumented byte

    cpu.step().unwrap();
    let err = cpu.step().unwrap_err();

    assert_eq!(err.to_string(), "illegal opcode $02 at $0602");
    // State is exactly as it was before the bad fetch
    assert_eq!(cpu.regs.pc, 0x0602);
    assert_eq!(cpu.regs.a, 0x07);
    assert_eq!(cpu.cycles(), 2);
}
