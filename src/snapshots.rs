use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::cpu::Cpu;
use crate::memory::Memory;
use crate::bus::Bus;

/// A full-machine save-state: register file, pending interrupt lines and
/// the whole 64 KiB address space (run-length compressed; the space is
/// mostly zeros in practice).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatorSnapshot {
    pub id: String,
    pub name: String,
    pub description: String,
    pub emulator_id: String,
    pub cpu_state: CpuSnapshot,
    pub memory_dump: Vec<u8>,
    pub metadata: SnapshotMetadata,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuSnapshot {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub pc: u16,
    pub sp: u8,
    pub status: u8,
    pub cycles: u64,
    pub nmi_pending: bool,
    pub irq_line: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub variant: String,
    pub template_id: Option<String>,
    pub checkpoint_reason: CheckpointReason,
    pub instruction_count: u64,
    pub compression_ratio: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CheckpointReason {
    Manual,
    Automatic,
    BeforeRestore, // Taken implicitly so a restore can be undone
    Breakpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    pub name: String,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreSnapshotRequest {
    pub snapshot_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotListResponse {
    pub snapshots: Vec<SnapshotSummary>,
    pub total_count: usize,
    pub total_size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub checkpoint_reason: CheckpointReason,
    pub tags: Vec<String>,
}

pub type SnapshotStore = std::sync::Arc<std::sync::Mutex<HashMap<String, EmulatorSnapshot>>>;

impl EmulatorSnapshot {
    pub fn create_from_emulator(
        name: String,
        description: String,
        emulator_id: String,
        cpu: &mut Cpu<Memory>,
        variant: String,
        template_id: Option<String>,
        reason: CheckpointReason,
        instruction_count: u64,
        tags: Vec<String>,
    ) -> Self {
        let cpu_state = CpuSnapshot {
            a: cpu.regs.a,
            x: cpu.regs.x,
            y: cpu.regs.y,
            pc: cpu.regs.pc,
            sp: cpu.regs.sp,
            status: cpu.regs.status,
            cycles: cpu.cycles(),
            nmi_pending: cpu.interrupts().nmi_pending(),
            irq_line: cpu.interrupts().irq_asserted(),
        };

        // Dump the whole address space
        let mut memory_dump = Vec::with_capacity(65536);
        for addr in 0..=0xFFFFu16 {
            memory_dump.push(cpu.bus_mut().read(addr));
        }

        let original_size = memory_dump.len();
        let compressed_dump = compress_memory(&memory_dump);
        let compression_ratio = compressed_dump.len() as f32 / original_size as f32;

        let metadata = SnapshotMetadata {
            variant,
            template_id,
            checkpoint_reason: reason,
            instruction_count,
            compression_ratio,
        };

        Self {
            id: Uuid::new_v4().to_string(),
            name,
            description,
            emulator_id,
            cpu_state,
            memory_dump: compressed_dump.clone(),
            metadata,
            created_at: Utc::now(),
            size_bytes: compressed_dump.len() as u64,
            tags,
        }
    }

    pub fn restore_to_emulator(&self, cpu: &mut Cpu<Memory>) -> Result<(), String> {
        let decompressed_memory = decompress_memory(&self.memory_dump)?;
        if decompressed_memory.len() != 65536 {
            return Err("Invalid memory dump size".to_string());
        }

        // Restore memory first: the registers below must win over any
        // vector-driven state
        for (addr, &value) in decompressed_memory.iter().enumerate() {
            cpu.bus_mut().write(addr as u16, value);
        }

        cpu.regs.a = self.cpu_state.a;
        cpu.regs.x = self.cpu_state.x;
        cpu.regs.y = self.cpu_state.y;
        cpu.regs.pc = self.cpu_state.pc;
        cpu.regs.sp = self.cpu_state.sp;
        cpu.regs.status = self.cpu_state.status;
        cpu.set_cycles(self.cpu_state.cycles);
        cpu.interrupts_mut()
            .restore(self.cpu_state.nmi_pending, self.cpu_state.irq_line);

        Ok(())
    }

    pub fn get_summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            created_at: self.created_at,
            size_bytes: self.size_bytes,
            checkpoint_reason: self.metadata.checkpoint_reason.clone(),
            tags: self.tags.clone(),
        }
    }
}

// Simple run-length encoding for memory compression
fn compress_memory(memory: &[u8]) -> Vec<u8> {
    let mut compressed = Vec::new();
    let mut i = 0;

    while i < memory.len() {
        let current_byte = memory[i];
        let mut count = 1;

        // Count consecutive identical bytes (max 255)
        while i + count < memory.len() &&
              memory[i + count] == current_byte &&
              count < 255 {
            count += 1;
        }

        if count > 3 || current_byte == 0 {
            // Use RLE for runs of 4+ or any zeros
            compressed.push(0xFF); // RLE marker
            compressed.push(count as u8);
            compressed.push(current_byte);
        } else {
            // Store literal bytes
            for j in 0..count {
                if memory[i + j] == 0xFF {
                    // Escape literal 0xFF
                    compressed.push(0xFF);
                    compressed.push(0x00);
                } else {
                    compressed.push(memory[i + j]);
                }
            }
        }

        i += count;
    }

    compressed
}

fn decompress_memory(compressed: &[u8]) -> Result<Vec<u8>, String> {
    let mut decompressed = Vec::with_capacity(65536);
    let mut i = 0;

    while i < compressed.len() {
        if compressed[i] == 0xFF {
            if i + 1 >= compressed.len() {
                return Err("Truncated RLE data".to_string());
            }

            if compressed[i + 1] == 0x00 {
                // Escaped literal 0xFF
                decompressed.push(0xFF);
                i += 2;
            } else {
                // RLE sequence
                if i + 2 >= compressed.len() {
                    return Err("Truncated RLE sequence".to_string());
                }

                let count = compressed[i + 1];
                let value = compressed[i + 2];

                for _ in 0..count {
                    decompressed.push(value);
                }

                i += 3;
            }
        } else {
            // Literal byte
            decompressed.push(compressed[i]);
            i += 1;
        }
    }

    if decompressed.len() != 65536 {
        return Err(format!("Decompressed size {} != 65536", decompressed.len()));
    }

    Ok(decompressed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_with_program(program: &[u8]) -> Cpu<Memory> {
        let mut memory = Memory::new();
        memory.load_program(program, 0x0600);
        memory.write_u16(0xFFFC, 0x0600);
        Cpu::new(memory)
    }

    #[test]
    fn test_memory_compression() {
        let mut memory = vec![0u8; 65536];

        // Add some patterns
        memory[0x1000] = 0xFF;
        memory[0x1001] = 0xFF;
        memory[0x1002] = 0xFF;
        memory[0x1003] = 0xFF;

        memory[0x2000] = 0xAA;
        memory[0x2001] = 0xBB;
        memory[0x2002] = 0xCC;

        let compressed = compress_memory(&memory);
        let decompressed = decompress_memory(&compressed).unwrap();

        assert_eq!(memory, decompressed);
        assert!(compressed.len() < memory.len()); // Should be smaller
    }

    #[test]
    fn test_rle_escape() {
        let mut memory = vec![0x00; 65536];
        memory[0] = 0xFF;
        memory[1] = 0xFF;
        memory[2] = 0xAA;
        memory[3] = 0xFF;
        memory[4] = 0x00;

        let compressed = compress_memory(&memory);
        let decompressed = decompress_memory(&compressed).unwrap();

        assert_eq!(memory, decompressed);
    }

    #[test]
    fn test_snapshot_round_trip_restores_machine() {
        // Run two instructions, snapshot, run further, restore
        let mut cpu = cpu_with_program(&[0xA9, 0x42, 0x48, 0xA9, 0x00]);
        cpu.step().unwrap(); // LDA #$42
        cpu.step().unwrap(); // PHA
        cpu.set_irq(true);

        let snapshot = EmulatorSnapshot::create_from_emulator(
            "checkpoint".to_string(),
            String::new(),
            "emu-1".to_string(),
            &mut cpu,
            "ntsc".to_string(),
            None,
            CheckpointReason::Manual,
            2,
            vec![],
        );

        cpu.step().unwrap(); // LDA #$00 clobbers A
        cpu.set_irq(false);
        cpu.bus_mut().write(0x01FD, 0x99); // scribble over the stack

        snapshot.restore_to_emulator(&mut cpu).unwrap();

        assert_eq!(cpu.regs.a, 0x42);
        assert_eq!(cpu.regs.pc, 0x0603);
        assert_eq!(cpu.regs.sp, 0xFC);
        assert_eq!(cpu.cycles(), 5); // 2 (LDA) + 3 (PHA)
        assert_eq!(cpu.bus_mut().read(0x01FD), 0x42); // stack cell back
        assert!(cpu.interrupts().irq_asserted());
    }

    #[test]
    fn test_snapshot_serializes_and_deserializes() {
        let mut cpu = cpu_with_program(&[0xA9, 0x11]);
        cpu.step().unwrap();

        let snapshot = EmulatorSnapshot::create_from_emulator(
            "persisted".to_string(),
            "serde round trip".to_string(),
            "emu-2".to_string(),
            &mut cpu,
            "pal".to_string(),
            Some("store-sequence".to_string()),
            CheckpointReason::Automatic,
            1,
            vec!["ci".to_string()],
        );

        let json = serde_json::to_string(&snapshot).unwrap();
        let back: EmulatorSnapshot = serde_json::from_str(&json).unwrap();

        assert_eq!(back.id, snapshot.id);
        assert_eq!(back.cpu_state.a, 0x11);
        assert_eq!(back.cpu_state.pc, 0x0602);
        assert_eq!(back.memory_dump, snapshot.memory_dump);
    }

    #[test]
    fn test_restore_rejects_short_dump() {
        let mut cpu = cpu_with_program(&[0xEA]);
        let mut snapshot = EmulatorSnapshot::create_from_emulator(
            "bad".to_string(),
            String::new(),
            "emu-1".to_string(),
            &mut cpu,
            "ntsc".to_string(),
            None,
            CheckpointReason::Manual,
            0,
            vec![],
        );

        snapshot.memory_dump = vec![0x01, 0x02, 0x03];

        assert!(snapshot.restore_to_emulator(&mut cpu).is_err());
    }
}
