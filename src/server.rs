use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use serde::{Deserialize, Serialize};
use warp::Filter;
use prometheus::Encoder;

use crate::bus::Bus;
use crate::cpu::Cpu;
use crate::memory::Memory;
use crate::metrics::{
    init_metrics, record_api_request, record_emulator_reset, record_memory_operation,
    record_program_load, record_snapshot_operation, set_active_emulators, update_cpu_registers,
    Timer, REGISTRY,
};
use crate::instance_types::{
    CreateInstanceRequest, EmulatorInstance, InstanceState, InstanceTemplate, MachineVariant,
};
use crate::snapshots::{
    CheckpointReason, CreateSnapshotRequest, EmulatorSnapshot, RestoreSnapshotRequest,
    SnapshotListResponse, SnapshotStore,
};

#[derive(Debug, Clone, Serialize)]
pub struct CpuState {
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

#[derive(Debug, Clone, Serialize)]
pub struct EmulatorState {
    pub id: String,
    pub name: String,
    pub variant: MachineVariant,
    pub state: InstanceState,
    pub cpu: CpuState,
}

#[derive(Debug, Deserialize)]
pub struct MemoryWrite {
    pub address: u16,
    pub value: u8,
}

#[derive(Debug, Deserialize)]
pub struct MemoryRead {
    pub address: u16,
    pub length: Option<u16>,
}

#[derive(Debug, Serialize)]
pub struct MemoryData {
    pub address: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Deserialize)]
pub struct ProgramLoad {
    pub address: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteSteps {
    pub steps: u32,
}

#[derive(Debug, Deserialize)]
pub struct IrqRequest {
    pub level: bool,
}

#[derive(Debug, Serialize)]
pub struct StepResult {
    pub cycles: u32,
    pub final_state: CpuState,
}

#[derive(Debug, Serialize)]
pub struct ExecutionResult {
    pub steps_executed: u32,
    pub cycles_consumed: u64,
    /// Fault description plus the debug dump, present when execution
    /// stopped on an illegal opcode
    pub fault: Option<String>,
    pub final_state: CpuState,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// One hosted machine: a CPU around its 64 KiB RAM, plus the instance
/// record the control plane reports.
pub struct Emulator {
    pub cpu: Cpu<Memory>,
    pub instance: EmulatorInstance,
}

impl Emulator {
    pub fn new_with_instance(instance: EmulatorInstance) -> Self {
        Self {
            cpu: Cpu::new(Memory::new()),
            instance,
        }
    }

    pub fn from_template(template: &InstanceTemplate, request: &CreateInstanceRequest) -> Self {
        let mut memory = Memory::new();
        memory.load_program(&template.program, template.load_address);
        memory.write_u16(0xFFFC, template.reset_vector);
        for (&addr, &value) in &template.initial_memory {
            memory.write(addr, value);
        }

        let instance = EmulatorInstance::new(
            request.variant.unwrap_or(template.variant),
            request.name.clone(),
            Some(template.id.clone()),
            request.tags.clone(),
        );

        Self {
            cpu: Cpu::new(memory),
            instance,
        }
    }

    pub fn get_state(&self) -> EmulatorState {
        EmulatorState {
            id: self.instance.id.clone(),
            name: self.instance.name.clone(),
            variant: self.instance.variant,
            state: self.instance.state.clone(),
            cpu: CpuState {
                a: self.cpu.regs.a,
                x: self.cpu.regs.x,
                y: self.cpu.regs.y,
                pc: self.cpu.regs.pc,
                sp: self.cpu.regs.sp,
                status: self.cpu.regs.status,
                cycles: self.cpu.cycles(),
                nmi_pending: self.cpu.interrupts().nmi_pending(),
                irq_line: self.cpu.interrupts().irq_asserted(),
            },
        }
    }

    pub fn reset(&mut self) {
        self.cpu.reset();
        self.instance.record_reset();
    }

    /// One instruction or interrupt service. A fault marks the instance
    /// and reports the error next to the debug dump.
    pub fn step(&mut self) -> Result<u32, String> {
        match self.cpu.step() {
            Ok(cycles) => {
                self.instance.record_step(cycles);
                self.instance.state = InstanceState::Running;
                Ok(cycles)
            }
            Err(err) => {
                let fault = format!("{} | {}", err, self.cpu.debug_dump());
                self.instance.fault(fault.clone());
                Err(fault)
            }
        }
    }

    /// Run up to `steps` instructions, bounded by the variant's per-call
    /// cycle budget (one video frame's worth).
    pub fn execute_steps(&mut self, steps: u32) -> ExecutionResult {
        let budget = self.instance.specs.execute_budget_cycles;
        let mut executed = 0;
        let mut cycles_consumed: u64 = 0;
        let mut fault = None;

        for _ in 0..steps {
            if cycles_consumed >= budget {
                break;
            }
            match self.step() {
                Ok(cycles) => {
                    executed += 1;
                    cycles_consumed += cycles as u64;
                }
                Err(description) => {
                    fault = Some(description);
                    break;
                }
            }
        }

        let state = self.get_state();
        ExecutionResult {
            steps_executed: executed,
            cycles_consumed,
            fault,
            final_state: state.cpu,
        }
    }

    pub fn load_program(&mut self, address: u16, data: &[u8]) {
        self.cpu.bus_mut().load_program(data, address);
        self.instance.record_activity();
    }

    pub fn read_memory(&mut self, address: u16, length: u16) -> Vec<u8> {
        (0..length)
            .map(|i| self.cpu.bus_mut().read(address.wrapping_add(i)))
            .collect()
    }

    pub fn write_memory(&mut self, address: u16, value: u8) {
        self.cpu.bus_mut().write(address, value);
        self.instance.record_activity();
    }
}

type EmulatorMap = Arc<Mutex<HashMap<String, Emulator>>>;
type TemplateStore = Arc<Mutex<HashMap<String, InstanceTemplate>>>;

pub async fn run_server() {
    // Initialize Prometheus metrics
    init_metrics();

    // Initialize stores
    let emulators: EmulatorMap = Arc::new(Mutex::new(HashMap::new()));
    let snapshots: SnapshotStore = Arc::new(Mutex::new(HashMap::new()));
    let templates: TemplateStore = Arc::new(Mutex::new(HashMap::new()));

    init_default_templates(templates.clone());

    println!("=== NES 6502 Emulation Service ===");

    // CORS
    let cors = warp::cors()
        .allow_any_origin()
        .allow_headers(vec!["content-type"])
        .allow_methods(vec!["GET", "POST", "PUT", "DELETE"]);

    // Create new emulator instance
    let create_emulator = warp::path("emulator")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_emulators(emulators.clone()))
        .and(with_templates(templates.clone()))
        .and_then(create_emulator_handler);

    // Get emulator state
    let get_state = warp::path!("emulator" / String)
        .and(warp::get())
        .and(with_emulators(emulators.clone()))
        .and_then(get_state_handler);

    // Debug dump
    let get_dump = warp::path!("emulator" / String / "dump")
        .and(warp::get())
        .and(with_emulators(emulators.clone()))
        .and_then(dump_handler);

    // Reset emulator
    let reset_emulator = warp::path!("emulator" / String / "reset")
        .and(warp::post())
        .and(with_emulators(emulators.clone()))
        .and_then(reset_handler);

    // Step execution
    let step_emulator = warp::path!("emulator" / String / "step")
        .and(warp::post())
        .and(with_emulators(emulators.clone()))
        .and_then(step_handler);

    // Execute multiple steps
    let execute_steps = warp::path!("emulator" / String / "execute")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_emulators(emulators.clone()))
        .and_then(execute_handler);

    // Load program
    let load_program = warp::path!("emulator" / String / "program")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_emulators(emulators.clone()))
        .and_then(load_program_handler);

    // Read memory
    let read_memory = warp::path!("emulator" / String / "memory")
        .and(warp::get())
        .and(warp::query::<MemoryRead>())
        .and(with_emulators(emulators.clone()))
        .and_then(read_memory_handler);

    // Write memory
    let write_memory = warp::path!("emulator" / String / "memory")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_emulators(emulators.clone()))
        .and_then(write_memory_handler);

    // Interrupt lines
    let trigger_nmi = warp::path!("emulator" / String / "nmi")
        .and(warp::post())
        .and(with_emulators(emulators.clone()))
        .and_then(trigger_nmi_handler);

    let set_irq = warp::path!("emulator" / String / "irq")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_emulators(emulators.clone()))
        .and_then(set_irq_handler);

    // Snapshots
    let create_snapshot = warp::path!("emulator" / String / "snapshot")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_emulators(emulators.clone()))
        .and(with_snapshots(snapshots.clone()))
        .and_then(create_snapshot_handler);

    let restore_snapshot = warp::path!("emulator" / String / "restore")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_emulators(emulators.clone()))
        .and(with_snapshots(snapshots.clone()))
        .and_then(restore_snapshot_handler);

    let list_snapshots = warp::path!("emulator" / String / "snapshots")
        .and(warp::get())
        .and(with_snapshots(snapshots.clone()))
        .and_then(list_snapshots_handler);

    // List emulators
    let list_emulators = warp::path("emulators")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_emulators(emulators.clone()))
        .and_then(list_emulators_handler);

    // List templates
    let list_templates = warp::path("templates")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_templates(templates.clone()))
        .and_then(list_templates_handler);

    // Delete emulator
    let delete_emulator = warp::path!("emulator" / String)
        .and(warp::delete())
        .and(with_emulators(emulators.clone()))
        .and_then(delete_emulator_handler);

    // Metrics endpoint
    let metrics = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .and_then(metrics_handler);

    let routes = create_emulator
        .or(get_state)
        .or(get_dump)
        .or(reset_emulator)
        .or(step_emulator)
        .or(execute_steps)
        .or(load_program)
        .or(read_memory)
        .or(write_memory)
        .or(trigger_nmi)
        .or(set_irq)
        .or(create_snapshot)
        .or(restore_snapshot)
        .or(list_snapshots)
        .or(list_emulators)
        .or(list_templates)
        .or(delete_emulator)
        .or(metrics)
        .with(cors);

    println!("NES 6502 Emulator Server starting on http://localhost:3030");
    println!("API Documentation:");
    println!("  POST   /emulator               - Create new emulator instance");
    println!("  GET    /emulator/:id           - Get emulator state");
    println!("  GET    /emulator/:id/dump      - Get debug dump text");
    println!("  POST   /emulator/:id/reset     - Reset emulator");
    println!("  POST   /emulator/:id/step      - Execute single step");
    println!("  POST   /emulator/:id/execute   - Execute multiple steps");
    println!("  POST   /emulator/:id/program   - Load program");
    println!("  GET    /emulator/:id/memory    - Read memory");
    println!("  POST   /emulator/:id/memory    - Write memory");
    println!("  POST   /emulator/:id/nmi       - Latch an NMI request");
    println!("  POST   /emulator/:id/irq       - Drive the IRQ line");
    println!("  POST   /emulator/:id/snapshot  - Take a save-state");
    println!("  POST   /emulator/:id/restore   - Restore a save-state");
    println!("  GET    /emulator/:id/snapshots - List save-states");
    println!("  GET    /emulators              - List all emulator instances");
    println!("  GET    /templates              - List instance templates");
    println!("  DELETE /emulator/:id           - Delete emulator instance");
    println!("  GET    /metrics                - Prometheus metrics endpoint");

    warp::serve(routes)
        .run(([127, 0, 0, 1], 3030))
        .await;
}

fn with_emulators(emulators: EmulatorMap) -> impl Filter<Extract = (EmulatorMap,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || emulators.clone())
}

fn with_templates(templates: TemplateStore) -> impl Filter<Extract = (TemplateStore,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || templates.clone())
}

fn with_snapshots(snapshots: SnapshotStore) -> impl Filter<Extract = (SnapshotStore,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || snapshots.clone())
}

async fn create_emulator_handler(
    request: CreateInstanceRequest,
    emulators: EmulatorMap,
    templates: TemplateStore,
) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();

    let emulator = match &request.template_id {
        Some(template_id) => {
            let templates_lock = templates.lock().unwrap();
            match templates_lock.get(template_id) {
                Some(template) => Emulator::from_template(template, &request),
                None => {
                    let response: ApiResponse<EmulatorState> =
                        ApiResponse::error(format!("Template {} not found", template_id));
                    return Ok(warp::reply::json(&response));
                }
            }
        }
        None => {
            let instance = EmulatorInstance::new(
                request.variant.unwrap_or_default(),
                request.name.clone(),
                None,
                request.tags.clone(),
            );
            Emulator::new_with_instance(instance)
        }
    };

    let id = emulator.instance.id.clone();
    let state = emulator.get_state();

    {
        let mut emulators_lock = emulators.lock().unwrap();
        emulators_lock.insert(id.clone(), emulator);
        set_active_emulators(emulators_lock.len());
    }

    // Update CPU metrics for the new emulator
    update_cpu_registers(
        &id, state.cpu.a, state.cpu.x, state.cpu.y, state.cpu.pc, state.cpu.sp, state.cpu.status,
    );

    let response = ApiResponse::success(state);

    record_api_request("POST", "/emulator", 200, timer.elapsed());
    Ok(warp::reply::json(&response))
}

async fn get_state_handler(id: String, emulators: EmulatorMap) -> Result<impl warp::Reply, warp::Rejection> {
    let emulators_lock = emulators.lock().unwrap();

    match emulators_lock.get(&id) {
        Some(emulator) => {
            let response = ApiResponse::success(emulator.get_state());
            Ok(warp::reply::json(&response))
        }
        None => {
            let response: ApiResponse<EmulatorState> = ApiResponse::error("Emulator not found".to_string());
            Ok(warp::reply::json(&response))
        }
    }
}

async fn dump_handler(id: String, emulators: EmulatorMap) -> Result<impl warp::Reply, warp::Rejection> {
    let emulators_lock = emulators.lock().unwrap();

    match emulators_lock.get(&id) {
        Some(emulator) => {
            let response = ApiResponse::success(emulator.cpu.debug_dump());
            Ok(warp::reply::json(&response))
        }
        None => {
            let response: ApiResponse<String> = ApiResponse::error("Emulator not found".to_string());
            Ok(warp::reply::json(&response))
        }
    }
}

async fn reset_handler(id: String, emulators: EmulatorMap) -> Result<impl warp::Reply, warp::Rejection> {
    let mut emulators_lock = emulators.lock().unwrap();

    match emulators_lock.get_mut(&id) {
        Some(emulator) => {
            emulator.reset();
            record_emulator_reset(&id);
            let response = ApiResponse::success(emulator.get_state());
            Ok(warp::reply::json(&response))
        }
        None => {
            let response: ApiResponse<EmulatorState> = ApiResponse::error("Emulator not found".to_string());
            Ok(warp::reply::json(&response))
        }
    }
}

async fn step_handler(id: String, emulators: EmulatorMap) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let mut emulators_lock = emulators.lock().unwrap();

    let result = match emulators_lock.get_mut(&id) {
        Some(emulator) => {
            let step = emulator.step();
            let state = emulator.get_state();

            // Update CPU metrics
            update_cpu_registers(
                &id, state.cpu.a, state.cpu.x, state.cpu.y, state.cpu.pc, state.cpu.sp,
                state.cpu.status,
            );

            let response = match step {
                Ok(cycles) => ApiResponse::success(StepResult {
                    cycles,
                    final_state: state.cpu,
                }),
                Err(fault) => ApiResponse::error(fault),
            };
            Ok(warp::reply::json(&response))
        }
        None => {
            let response: ApiResponse<StepResult> = ApiResponse::error("Emulator not found".to_string());
            Ok(warp::reply::json(&response))
        }
    };

    record_api_request("POST", "/emulator/:id/step", 200, timer.elapsed());
    result
}

async fn execute_handler(id: String, request: ExecuteSteps, emulators: EmulatorMap) -> Result<impl warp::Reply, warp::Rejection> {
    let mut emulators_lock = emulators.lock().unwrap();

    match emulators_lock.get_mut(&id) {
        Some(emulator) => {
            let result = emulator.execute_steps(request.steps);
            let response = ApiResponse::success(result);
            Ok(warp::reply::json(&response))
        }
        None => {
            let response: ApiResponse<ExecutionResult> = ApiResponse::error("Emulator not found".to_string());
            Ok(warp::reply::json(&response))
        }
    }
}

async fn load_program_handler(id: String, request: ProgramLoad, emulators: EmulatorMap) -> Result<impl warp::Reply, warp::Rejection> {
    let mut emulators_lock = emulators.lock().unwrap();

    match emulators_lock.get_mut(&id) {
        Some(emulator) => {
            emulator.load_program(request.address, &request.data);
            record_program_load(&id);
            let response = ApiResponse::success(format!(
                "Loaded {} bytes at address ${:04X}",
                request.data.len(),
                request.address
            ));
            Ok(warp::reply::json(&response))
        }
        None => {
            let response: ApiResponse<String> = ApiResponse::error("Emulator not found".to_string());
            Ok(warp::reply::json(&response))
        }
    }
}

async fn read_memory_handler(id: String, query: MemoryRead, emulators: EmulatorMap) -> Result<impl warp::Reply, warp::Rejection> {
    let mut emulators_lock = emulators.lock().unwrap();

    match emulators_lock.get_mut(&id) {
        Some(emulator) => {
            let length = query.length.unwrap_or(1);
            let data = emulator.read_memory(query.address, length);
            record_memory_operation("read", &id);
            let response = ApiResponse::success(MemoryData {
                address: query.address,
                data,
            });
            Ok(warp::reply::json(&response))
        }
        None => {
            let response: ApiResponse<MemoryData> = ApiResponse::error("Emulator not found".to_string());
            Ok(warp::reply::json(&response))
        }
    }
}

async fn write_memory_handler(id: String, request: MemoryWrite, emulators: EmulatorMap) -> Result<impl warp::Reply, warp::Rejection> {
    let mut emulators_lock = emulators.lock().unwrap();

    match emulators_lock.get_mut(&id) {
        Some(emulator) => {
            emulator.write_memory(request.address, request.value);
            record_memory_operation("write", &id);
            let response = ApiResponse::success(format!(
                "Wrote ${:02X} to address ${:04X}",
                request.value, request.address
            ));
            Ok(warp::reply::json(&response))
        }
        None => {
            let response: ApiResponse<String> = ApiResponse::error("Emulator not found".to_string());
            Ok(warp::reply::json(&response))
        }
    }
}

async fn trigger_nmi_handler(id: String, emulators: EmulatorMap) -> Result<impl warp::Reply, warp::Rejection> {
    let mut emulators_lock = emulators.lock().unwrap();

    match emulators_lock.get_mut(&id) {
        Some(emulator) => {
            emulator.cpu.trigger_nmi();
            emulator.instance.record_interrupt();
            let response = ApiResponse::success("NMI latched; serviced at the next step".to_string());
            Ok(warp::reply::json(&response))
        }
        None => {
            let response: ApiResponse<String> = ApiResponse::error("Emulator not found".to_string());
            Ok(warp::reply::json(&response))
        }
    }
}

async fn set_irq_handler(id: String, request: IrqRequest, emulators: EmulatorMap) -> Result<impl warp::Reply, warp::Rejection> {
    let mut emulators_lock = emulators.lock().unwrap();

    match emulators_lock.get_mut(&id) {
        Some(emulator) => {
            emulator.cpu.set_irq(request.level);
            if request.level {
                emulator.instance.record_interrupt();
            }
            let response = ApiResponse::success(format!(
                "IRQ line {}",
                if request.level { "asserted" } else { "released" }
            ));
            Ok(warp::reply::json(&response))
        }
        None => {
            let response: ApiResponse<String> = ApiResponse::error("Emulator not found".to_string());
            Ok(warp::reply::json(&response))
        }
    }
}

async fn create_snapshot_handler(
    id: String,
    request: CreateSnapshotRequest,
    emulators: EmulatorMap,
    snapshots: SnapshotStore,
) -> Result<impl warp::Reply, warp::Rejection> {
    let mut emulators_lock = emulators.lock().unwrap();

    match emulators_lock.get_mut(&id) {
        Some(emulator) => {
            let snapshot = EmulatorSnapshot::create_from_emulator(
                request.name,
                request.description.unwrap_or_default(),
                id.clone(),
                &mut emulator.cpu,
                emulator.instance.variant.as_str().to_string(),
                emulator.instance.template_id.clone(),
                CheckpointReason::Manual,
                emulator.instance.usage_stats.total_instructions,
                request.tags.unwrap_or_default(),
            );
            record_snapshot_operation("create", &id);

            let summary = snapshot.get_summary();
            snapshots.lock().unwrap().insert(snapshot.id.clone(), snapshot);

            let response = ApiResponse::success(summary);
            Ok(warp::reply::json(&response))
        }
        None => {
            let response: ApiResponse<crate::snapshots::SnapshotSummary> =
                ApiResponse::error("Emulator not found".to_string());
            Ok(warp::reply::json(&response))
        }
    }
}

async fn restore_snapshot_handler(
    id: String,
    request: RestoreSnapshotRequest,
    emulators: EmulatorMap,
    snapshots: SnapshotStore,
) -> Result<impl warp::Reply, warp::Rejection> {
    let mut emulators_lock = emulators.lock().unwrap();
    let snapshots_lock = snapshots.lock().unwrap();

    let emulator = match emulators_lock.get_mut(&id) {
        Some(emulator) => emulator,
        None => {
            let response: ApiResponse<EmulatorState> = ApiResponse::error("Emulator not found".to_string());
            return Ok(warp::reply::json(&response));
        }
    };

    match snapshots_lock.get(&request.snapshot_id) {
        Some(snapshot) => match snapshot.restore_to_emulator(&mut emulator.cpu) {
            Ok(()) => {
                emulator.instance.record_activity();
                emulator.instance.state = InstanceState::Idle;
                record_snapshot_operation("restore", &id);
                let response = ApiResponse::success(emulator.get_state());
                Ok(warp::reply::json(&response))
            }
            Err(err) => {
                let response: ApiResponse<EmulatorState> = ApiResponse::error(err);
                Ok(warp::reply::json(&response))
            }
        },
        None => {
            let response: ApiResponse<EmulatorState> = ApiResponse::error("Snapshot not found".to_string());
            Ok(warp::reply::json(&response))
        }
    }
}

async fn list_snapshots_handler(id: String, snapshots: SnapshotStore) -> Result<impl warp::Reply, warp::Rejection> {
    let snapshots_lock = snapshots.lock().unwrap();

    let summaries: Vec<_> = snapshots_lock
        .values()
        .filter(|snapshot| snapshot.emulator_id == id)
        .map(|snapshot| snapshot.get_summary())
        .collect();

    let total_size_bytes = summaries.iter().map(|s| s.size_bytes).sum();
    let response = ApiResponse::success(SnapshotListResponse {
        total_count: summaries.len(),
        total_size_bytes,
        snapshots: summaries,
    });
    Ok(warp::reply::json(&response))
}

async fn list_emulators_handler(emulators: EmulatorMap) -> Result<impl warp::Reply, warp::Rejection> {
    let emulators_lock = emulators.lock().unwrap();

    let emulator_list: Vec<EmulatorState> = emulators_lock
        .values()
        .map(|emulator| emulator.get_state())
        .collect();

    let response = ApiResponse::success(emulator_list);
    Ok(warp::reply::json(&response))
}

async fn list_templates_handler(templates: TemplateStore) -> Result<impl warp::Reply, warp::Rejection> {
    let templates_lock = templates.lock().unwrap();

    let template_list: Vec<InstanceTemplate> = templates_lock.values().cloned().collect();
    let response = ApiResponse::success(template_list);
    Ok(warp::reply::json(&response))
}

async fn delete_emulator_handler(id: String, emulators: EmulatorMap) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let mut emulators_lock = emulators.lock().unwrap();

    let result = match emulators_lock.remove(&id) {
        Some(_) => {
            set_active_emulators(emulators_lock.len());
            let response = ApiResponse::success(format!("Emulator {} deleted", id));
            Ok(warp::reply::json(&response))
        }
        None => {
            let response: ApiResponse<String> = ApiResponse::error("Emulator not found".to_string());
            Ok(warp::reply::json(&response))
        }
    };

    record_api_request("DELETE", "/emulator/:id", 200, timer.elapsed());
    result
}

async fn metrics_handler() -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics_text) => {
            record_api_request("GET", "/metrics", 200, timer.elapsed());
            Ok(warp::reply::with_header(
                metrics_text,
                "content-type",
                "text/plain; version=0.0.4",
            ))
        }
        Err(_) => {
            record_api_request("GET", "/metrics", 500, timer.elapsed());
            Ok(warp::reply::with_header(
                "Error encoding metrics".to_string(),
                "content-type",
                "text/plain",
            ))
        }
    }
}

fn init_default_templates(templates: TemplateStore) {
    let mut templates_lock = templates.lock().unwrap();
    let default_templates = InstanceTemplate::create_basic_templates();

    for template in default_templates {
        templates_lock.insert(template.id.clone(), template);
    }

    println!("Initialized {} default instance templates", templates_lock.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance_types::InstanceTemplate;

    fn store_sequence_emulator() -> Emulator {
        let templates = InstanceTemplate::create_basic_templates();
        let template = templates.iter().find(|t| t.id == "store-sequence").unwrap();
        let request = CreateInstanceRequest {
            template_id: Some(template.id.clone()),
            variant: None,
            name: Some("demo".to_string()),
            tags: None,
        };
        Emulator::from_template(template, &request)
    }

    #[test]
    fn test_emulator_from_template_runs_program() {
        let mut emulator = store_sequence_emulator();
        assert_eq!(emulator.cpu.regs.pc, 0x0600);

        let result = emulator.execute_steps(6);

        assert_eq!(result.steps_executed, 6);
        assert!(result.fault.is_none());
        assert_eq!(emulator.cpu.bus_mut().read(0x0200), 0x01);
        assert_eq!(emulator.cpu.bus_mut().read(0x0201), 0x05);
        assert_eq!(emulator.cpu.bus_mut().read(0x0202), 0x08);
        assert_eq!(emulator.instance.usage_stats.total_instructions, 6);
    }

    #[test]
    fn test_step_fault_marks_instance_and_carries_dump() {
        let mut emulator = store_sequence_emulator();
        // Point PC at an undocumented opcode
        emulator.cpu.bus_mut().write(0x0700, 0x02);
        emulator.cpu.regs.pc = 0x0700;

        let err = emulator.step().unwrap_err();

        assert!(err.contains("illegal opcode $02 at $0700"));
        assert!(err.contains("PC=$0700")); // debug dump rides along
        assert!(emulator.instance.is_faulted());
    }

    #[test]
    fn test_execute_respects_cycle_budget() {
        let mut emulator = store_sequence_emulator();
        let budget = emulator.instance.specs.execute_budget_cycles;

        // The tail jump-to-self never ends; ask for far more steps than one frame
        let result = emulator.execute_steps(u32::MAX);

        assert!(result.cycles_consumed >= budget);
        assert!(result.cycles_consumed < budget + 7); // overshoot is at most one instruction
        assert!(result.fault.is_none());
    }

    #[test]
    fn test_reset_clears_fault_state() {
        let mut emulator = store_sequence_emulator();
        emulator.cpu.bus_mut().write(0x0700, 0x02);
        emulator.cpu.regs.pc = 0x0700;
        emulator.step().unwrap_err();
        assert!(emulator.instance.is_faulted());

        emulator.reset();

        assert_eq!(emulator.instance.state, InstanceState::Idle);
        assert_eq!(emulator.cpu.regs.pc, 0x0600);
    }
}
