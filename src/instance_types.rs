use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use chrono::{DateTime, Utc};

/// The chip variants a hosted core can model. They differ only in clock
/// rate; the instruction set and flag semantics are identical.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MachineVariant {
    Ntsc,  // RP2A03, 1.789773 MHz, 60 Hz frames
    Pal,   // RP2A07, 1.662607 MHz, 50 Hz frames
    Dendy, // UMC UA6527P clone, 1.773448 MHz, 50 Hz frames
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantSpecs {
    pub clock_hz: u64,
    pub frame_rate: u32,
    /// Cycle budget for a single /execute call: one video frame's worth.
    pub execute_budget_cycles: u64,
}

impl MachineVariant {
    pub fn get_specs(&self) -> VariantSpecs {
        match self {
            MachineVariant::Ntsc => VariantSpecs {
                clock_hz: 1_789_773,
                frame_rate: 60,
                execute_budget_cycles: 1_789_773 / 60,
            },
            MachineVariant::Pal => VariantSpecs {
                clock_hz: 1_662_607,
                frame_rate: 50,
                execute_budget_cycles: 1_662_607 / 50,
            },
            MachineVariant::Dendy => VariantSpecs {
                clock_hz: 1_773_448,
                frame_rate: 50,
                execute_budget_cycles: 1_773_448 / 50,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MachineVariant::Ntsc => "ntsc",
            MachineVariant::Pal => "pal",
            MachineVariant::Dendy => "dendy",
        }
    }
}

impl Default for MachineVariant {
    fn default() -> Self {
        MachineVariant::Ntsc
    }
}

/// A canned machine image: program bytes, where to load them, the reset
/// vector and any extra memory pokes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceTemplate {
    pub id: String,
    pub name: String,
    pub description: String,
    pub program: Vec<u8>,
    pub load_address: u16,
    pub reset_vector: u16,
    pub initial_memory: HashMap<u16, u8>,
    pub variant: MachineVariant,
    pub created_at: DateTime<Utc>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    pub template_id: Option<String>,
    pub variant: Option<MachineVariant>,
    pub name: Option<String>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatorInstance {
    pub id: String,
    pub name: String,
    pub variant: MachineVariant,
    pub template_id: Option<String>,
    pub state: InstanceState,
    pub specs: VariantSpecs,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub tags: Vec<String>,
    pub usage_stats: UsageStats,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum InstanceState {
    Idle,
    Running,
    /// Stopped on an illegal opcode; carries the fault description.
    Faulted(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageStats {
    pub total_cycles: u64,
    pub total_instructions: u64,
    pub total_interrupts: u64,
    pub api_calls: u64,
    pub last_reset: DateTime<Utc>,
}

impl Default for UsageStats {
    fn default() -> Self {
        Self {
            total_cycles: 0,
            total_instructions: 0,
            total_interrupts: 0,
            api_calls: 0,
            last_reset: Utc::now(),
        }
    }
}

impl InstanceTemplate {
    pub fn create_basic_templates() -> Vec<InstanceTemplate> {
        vec![
            InstanceTemplate {
                id: "store-sequence".to_string(),
                name: "Store Sequence".to_string(),
                description: "Writes $01/$05/$08 to $0200-$0202, then spins in place".to_string(),
                program: vec![
                    0xA9, 0x01, 0x8D, 0x00, 0x02, // LDA #$01; STA $0200
                    0xA9, 0x05, 0x8D, 0x01, 0x02, // LDA #$05; STA $0201
                    0xA9, 0x08, 0x8D, 0x02, 0x02, // LDA #$08; STA $0202
                    0x4C, 0x0F, 0x06,             // JMP $060F (idle loop)
                ],
                load_address: 0x0600,
                reset_vector: 0x0600,
                initial_memory: HashMap::new(),
                variant: MachineVariant::Ntsc,
                created_at: Utc::now(),
                tags: vec!["demo".to_string(), "basic".to_string()],
            },
            InstanceTemplate {
                id: "countdown-loop".to_string(),
                name: "Countdown Loop".to_string(),
                description: "Counts X down from 8 with a backward branch".to_string(),
                program: vec![
                    0xA2, 0x08,       // LDX #$08
                    0xCA,             // DEX
                    0xD0, 0xFD,       // BNE -3
                    0x4C, 0x05, 0x06, // JMP $0605 (idle loop)
                ],
                load_address: 0x0600,
                reset_vector: 0x0600,
                initial_memory: HashMap::new(),
                variant: MachineVariant::Ntsc,
                created_at: Utc::now(),
                tags: vec!["demo".to_string(), "branches".to_string()],
            },
            InstanceTemplate {
                id: "subroutine-demo".to_string(),
                name: "Subroutine Demo".to_string(),
                description: "JSR into a routine that loads A and returns".to_string(),
                program: vec![
                    0x20, 0x06, 0x06, // JSR $0606
                    0x4C, 0x03, 0x06, // JMP $0603 (idle loop after return)
                    0xA9, 0x2A,       // LDA #$2A
                    0x60,             // RTS
                ],
                load_address: 0x0600,
                reset_vector: 0x0600,
                initial_memory: HashMap::new(),
                variant: MachineVariant::Ntsc,
                created_at: Utc::now(),
                tags: vec!["demo".to_string(), "stack".to_string()],
            },
            InstanceTemplate {
                id: "nmi-handler".to_string(),
                name: "NMI Handler".to_string(),
                description: "Idle loop with an NMI handler that counts into $10".to_string(),
                program: vec![
                    0xEA,             // $0600: NOP (idle loop body)
                    0x4C, 0x00, 0x06, // JMP $0600
                    0xE6, 0x10,       // $0604: INC $10 (NMI handler)
                    0x40,             // RTI
                ],
                load_address: 0x0600,
                reset_vector: 0x0600,
                initial_memory: {
                    let mut mem = HashMap::new();
                    mem.insert(0xFFFA, 0x04); // NMI vector -> $0604
                    mem.insert(0xFFFB, 0x06);
                    mem
                },
                variant: MachineVariant::Ntsc,
                created_at: Utc::now(),
                tags: vec!["demo".to_string(), "interrupts".to_string()],
            },
        ]
    }
}

impl EmulatorInstance {
    pub fn new(
        variant: MachineVariant,
        name: Option<String>,
        template_id: Option<String>,
        tags: Option<Vec<String>>,
    ) -> Self {
        let specs = variant.get_specs();
        let instance_name = name.unwrap_or_else(|| {
            format!(
                "{}-{}",
                variant.as_str(),
                &uuid::Uuid::new_v4().to_string()[..8]
            )
        });

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: instance_name,
            variant,
            template_id,
            state: InstanceState::Idle,
            specs,
            created_at: Utc::now(),
            last_activity: Utc::now(),
            tags: tags.unwrap_or_default(),
            usage_stats: UsageStats::default(),
        }
    }

    pub fn record_activity(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn record_step(&mut self, cycles: u32) {
        self.usage_stats.total_instructions += 1;
        self.usage_stats.total_cycles += cycles as u64;
    }

    pub fn record_interrupt(&mut self) {
        self.usage_stats.total_interrupts += 1;
    }

    pub fn record_api_call(&mut self) {
        self.usage_stats.api_calls += 1;
    }

    pub fn record_reset(&mut self) {
        self.state = InstanceState::Idle;
        self.usage_stats.last_reset = Utc::now();
    }

    pub fn fault(&mut self, description: String) {
        self.state = InstanceState::Faulted(description);
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self.state, InstanceState::Faulted(_))
    }

    pub fn is_idle(&self, idle_threshold_minutes: i64) -> bool {
        let idle_duration = Utc::now() - self.last_activity;
        idle_duration.num_minutes() > idle_threshold_minutes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_specs() {
        let ntsc = MachineVariant::Ntsc.get_specs();
        assert_eq!(ntsc.clock_hz, 1_789_773);
        assert_eq!(ntsc.execute_budget_cycles, 29829);

        let pal = MachineVariant::Pal.get_specs();
        assert_eq!(pal.frame_rate, 50);
        assert!(pal.clock_hz < ntsc.clock_hz);
    }

    #[test]
    fn test_templates_stay_inside_one_page() {
        for template in InstanceTemplate::create_basic_templates() {
            let end = template.load_address as usize + template.program.len();
            assert!(end <= 0x0700, "template {} spills past $0700", template.id);
            assert_eq!(template.reset_vector, 0x0600);
        }
    }

    #[test]
    fn test_instance_bookkeeping() {
        let mut instance = EmulatorInstance::new(MachineVariant::Pal, None, None, None);
        assert_eq!(instance.state, InstanceState::Idle);
        assert!(instance.name.starts_with("pal-"));

        instance.record_step(4);
        instance.record_step(2);
        instance.record_interrupt();

        assert_eq!(instance.usage_stats.total_instructions, 2);
        assert_eq!(instance.usage_stats.total_cycles, 6);
        assert_eq!(instance.usage_stats.total_interrupts, 1);

        instance.fault("illegal opcode $02 at $0600".to_string());
        assert!(instance.is_faulted());

        instance.record_reset();
        assert_eq!(instance.state, InstanceState::Idle);
    }
}
