use ricoh2a03::bus::Bus;
use ricoh2a03::cpu::Cpu;
use ricoh2a03::memory::Memory;
use ricoh2a03::server::run_server;

#[tokio::main]
async fn main() {
    if std::env::args().nth(1).as_deref() == Some("serve") {
        run_server().await;
        return;
    }

    // Default mode: run the bundled store-sequence demo one instruction at
    // a time, dumping state as we go
    let mut memory = Memory::new();
    memory.load_program(
        &[
            0xA9, 0x01, 0x8D, 0x00, 0x02, // LDA #$01; STA $0200
            0xA9, 0x05, 0x8D, 0x01, 0x02, // LDA #$05; STA $0201
            0xA9, 0x08, 0x8D, 0x02, 0x02, // LDA #$08; STA $0202
        ],
        0x0600,
    );

    // Reset vector is little endian: 00 06 reads back as $0600
    memory.write_u16(0xFFFC, 0x0600);

    let mut cpu = Cpu::new(memory);

    for _ in 0..6 {
        match cpu.step() {
            Ok(cycles) => println!("{cycles:>2} cycles | {}", cpu.debug_dump()),
            Err(err) => {
                eprintln!("{err}");
                eprintln!("{}", cpu.debug_dump());
                break;
            }
        }
    }

    println!("$0200..$0202 = {:02X} {:02X} {:02X}",
        cpu.bus_mut().read(0x0200),
        cpu.bus_mut().read(0x0201),
        cpu.bus_mut().read(0x0202));
}
