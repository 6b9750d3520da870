//! `lockstep` — the sdb debugger shell over the simulator library.
//!
//! Builds a board (RAM, console, machine timer), loads the guest binary,
//! and runs the interactive debugger on one core or on a DUT/REF pair under
//! differential testing.

use clap::Parser;
use lockstep_core::cpu::Cpu;
use lockstep_core::debugger::Sdb;
use lockstep_core::difftest::Difftest;
use lockstep_core::io::console::{ConsoleFrontend, StreamConsoleBackend};
use lockstep_core::io::mtime::{HostClockBackend, MtimeFrontend};
use lockstep_core::io::{Device, IoDispatcher, MmioAgent};
use lockstep_core::memory::{ContiguousMemory, SharedMemory};
use lockstep_core::system_cpu::SystemCpu;
use lockstep_core::word::Word;
use log::{info, warn};
use std::io::{BufRead, Write};
use std::process::ExitCode;

const RAM_BASE: u64 = 0x8000_0000;
const RAM_SIZE: usize = 64 << 20;
const CONSOLE_BASE: u64 = 0xA000_03F8;
const CONSOLE_SPAN: u64 = 8;
const MTIME_BASE: u64 = 0xA000_0048;
const MTIME_SPAN: u64 = 16;
const EVENT_BUFFER_SIZE: usize = 256;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Simulate a 64-bit core instead of a 32-bit one.
    #[arg(long)]
    rv64: bool,
    /// Run a second core in lockstep and cross-check the commit-event streams.
    #[arg(long)]
    difftest: bool,
    /// Load the file as a raw image at the RAM base instead of parsing it as an ELF.
    #[arg(long)]
    raw: bool,
    /// Binary file to execute.
    binary: String,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    if args.rv64 {
        run::<u64>(&args)
    } else {
        run::<u32>(&args)
    }
}

fn build_ram<W: Word>(args: &Args) -> std::io::Result<(SharedMemory<W>, W)> {
    let image = std::fs::read(&args.binary)?;
    let ram = ContiguousMemory::<W>::new_shared(W::from_u64(RAM_BASE), RAM_SIZE);
    let entry = if args.raw {
        let base = W::from_u64(RAM_BASE);
        match ram.borrow_mut().host_slice(base, image.len()) {
            Some(slice) => slice.copy_from_slice(&image),
            None => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "raw image exceeds RAM",
                ))
            }
        }
        base
    } else {
        let entry = ram.borrow_mut().load_elf(&image);
        if entry == W::ZERO {
            warn!("no entry point found, starting at the RAM base");
            W::from_u64(RAM_BASE)
        } else {
            entry
        }
    };
    Ok((ram, entry))
}

fn build_cpu<W: Word>(
    ram: &SharedMemory<W>,
    dispatcher: &std::rc::Rc<std::cell::RefCell<IoDispatcher>>,
    entry: W,
) -> Box<SystemCpu<W>> {
    let mut cpu = SystemCpu::new(ram.clone(), ram.clone())
        .with_mmio(Box::new(MmioAgent::new(dispatcher.clone())))
        .with_event_buffer(EVENT_BUFFER_SIZE);
    cpu.reset(entry);
    Box::new(cpu)
}

/// Which CPU of a differential test the shell commands currently apply to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Focus {
    Difftest,
    Dut,
    Reference,
}

fn run<W: Word>(args: &Args) -> ExitCode {
    let (ram, entry) = match build_ram::<W>(args) {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("lockstep: cannot load {}: {err}", args.binary);
            return ExitCode::FAILURE;
        }
    };
    info!("guest loaded, entry point {:#x}", entry);

    let dispatcher = IoDispatcher::new(IoDispatcher::DEFAULT_BUFFER_SIZE)
        .with_device(
            Device::new(
                Box::new(ConsoleFrontend),
                Box::new(StreamConsoleBackend::stdio()),
            ),
            CONSOLE_BASE,
            CONSOLE_SPAN,
        )
        .with_device(
            Device::new(Box::new(MtimeFrontend), Box::new(HostClockBackend::new())),
            MTIME_BASE,
            MTIME_SPAN,
        )
        .into_shared();

    let dut = build_cpu(&ram, &dispatcher, entry);

    let mut sdb = Sdb::new();

    if args.difftest {
        let reference = build_cpu(&ram, &dispatcher, entry);
        let mut difftest = Difftest::new(dut, reference, EVENT_BUFFER_SIZE);
        let mut focus = Focus::Difftest;

        while let Some(line) = read_command(prompt(focus)) {
            match line.trim() {
                "dut" => focus = Focus::Dut,
                "ref" => focus = Focus::Reference,
                "difftest" => focus = Focus::Difftest,
                command => {
                    let cpu: &mut dyn Cpu<W> = match focus {
                        Focus::Difftest => &mut difftest,
                        Focus::Dut => difftest.dut_mut(),
                        Focus::Reference => difftest.reference_mut(),
                    };
                    sdb.execute_line(cpu, command);
                }
            }
            if sdb.quit_requested() {
                break;
            }
        }
        exit_code(&difftest)
    } else {
        let mut cpu = dut;
        while let Some(line) = read_command("sdb> ") {
            sdb.execute_line(&mut *cpu, &line);
            if sdb.quit_requested() {
                break;
            }
        }
        exit_code(&*cpu)
    }
}

fn prompt(focus: Focus) -> &'static str {
    match focus {
        Focus::Difftest => "sdb|difftest> ",
        Focus::Dut => "sdb|dut> ",
        Focus::Reference => "sdb|ref> ",
    }
}

/// Prints the prompt and reads one command line; `None` on EOF or a read error.
fn read_command(prompt: &str) -> Option<String> {
    print!("{prompt}");
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line),
    }
}

/// The example convention: exit with register `a0` of the final state.
fn exit_code<W: Word>(cpu: &dyn Cpu<W>) -> ExitCode {
    let a0 = cpu.gpr(cpu.gpr_addr("a0"));
    ExitCode::from(a0.to_u64() as u8)
}
