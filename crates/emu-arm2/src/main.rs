//! ARM2 emulator binary.
//!
//! Assembles and runs a guest program directly, optionally tracing each
//! instruction, or serves the debugging facade as a JSON-RPC 2.0 server
//! over stdin/stdout (`--rpc`).

use std::path::PathBuf;
use std::process;

use asm_arm2::FsProvider;
use machine_arm2::{LoadError, RunPolicy, StdIo, StopReason, Vm, VmConfig};

mod rpc;

struct CliArgs {
    source_path: Option<PathBuf>,
    rpc: bool,
    trace: bool,
    max_cycles: Option<u64>,
    fs_root: Option<PathBuf>,
    stack_size: Option<u32>,
    heap_size: Option<u32>,
    origin: Option<u32>,
    guest_args: Vec<String>,
}

fn usage() -> ! {
    eprintln!(
        "usage: emu-arm2 [options] program.s\n\
         \n\
         options:\n\
           --rpc                serve the JSON-RPC facade on stdin/stdout\n\
           --trace              print each executed instruction to stderr\n\
           --max-cycles N       instruction budget per run (default 1000000)\n\
           --fs-root DIR        sandbox root for guest file syscalls\n\
           --stack-size BYTES   stack segment size\n\
           --heap-size BYTES    heap segment size\n\
           --origin ADDR        code origin (default 0x8000)\n\
           --arg VALUE          append a guest program argument (repeatable)"
    );
    process::exit(2);
}

fn parse_number(text: &str) -> Option<u64> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

fn parse_args() -> CliArgs {
    let mut cli = CliArgs {
        source_path: None,
        rpc: false,
        trace: false,
        max_cycles: None,
        fs_root: None,
        stack_size: None,
        heap_size: None,
        origin: None,
        guest_args: Vec::new(),
    };
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--rpc" => cli.rpc = true,
            "--trace" => cli.trace = true,
            "--max-cycles" => {
                i += 1;
                cli.max_cycles = args.get(i).and_then(|s| parse_number(s));
                if cli.max_cycles.is_none() {
                    usage();
                }
            }
            "--fs-root" => {
                i += 1;
                cli.fs_root = args.get(i).map(PathBuf::from);
                if cli.fs_root.is_none() {
                    usage();
                }
            }
            "--stack-size" => {
                i += 1;
                cli.stack_size = args.get(i).and_then(|s| parse_number(s)).map(|v| v as u32);
                if cli.stack_size.is_none() {
                    usage();
                }
            }
            "--heap-size" => {
                i += 1;
                cli.heap_size = args.get(i).and_then(|s| parse_number(s)).map(|v| v as u32);
                if cli.heap_size.is_none() {
                    usage();
                }
            }
            "--origin" => {
                i += 1;
                cli.origin = args.get(i).and_then(|s| parse_number(s)).map(|v| v as u32);
                if cli.origin.is_none() {
                    usage();
                }
            }
            "--arg" => {
                i += 1;
                match args.get(i) {
                    Some(value) => cli.guest_args.push(value.clone()),
                    None => usage(),
                }
            }
            "--help" | "-h" => usage(),
            other if other.starts_with('-') => {
                eprintln!("unknown option '{other}'");
                usage();
            }
            path => {
                if cli.source_path.is_some() {
                    usage();
                }
                cli.source_path = Some(PathBuf::from(path));
            }
        }
        i += 1;
    }
    cli
}

fn config_from(cli: &CliArgs) -> VmConfig {
    let mut config = VmConfig::default();
    if let Some(v) = cli.max_cycles {
        config.max_cycles = v;
    }
    if let Some(v) = cli.stack_size {
        config.stack_size = v;
    }
    if let Some(v) = cli.heap_size {
        config.heap_size = v;
    }
    if let Some(v) = cli.origin {
        config.origin = v;
    }
    config.fs_root = cli.fs_root.clone();
    config.args = cli.guest_args.clone();
    config
}

fn report_fault(vm: &Vm) {
    let Some(report) = vm.fault_report() else { return };
    eprintln!("error: {}", report.error);
    match &report.nearest_symbol {
        Some((name, 0)) => eprintln!("  at 0x{:08X} <{name}>", report.pc),
        Some((name, offset)) => eprintln!("  at 0x{:08X} <{name}+0x{offset:X}>", report.pc),
        None => eprintln!("  at 0x{:08X}", report.pc),
    }
    if !report.recent.is_empty() {
        eprintln!("  recent instructions:");
        for (addr, word, text) in &report.recent {
            eprintln!("    0x{addr:08X}: {word:08X}  {text}");
        }
    }
    let r = &report.registers;
    for row in 0..4 {
        let cols: Vec<String> = (0..4)
            .map(|col| {
                let idx = row * 4 + col;
                format!("R{idx:<2} = 0x{:08X}", r.r[idx])
            })
            .collect();
        eprintln!("  {}", cols.join("  "));
    }
    eprintln!(
        "  N={} Z={} C={} V={}  cycles={}",
        u8::from(r.n),
        u8::from(r.z),
        u8::from(r.c),
        u8::from(r.v),
        r.cycles
    );
    if !report.stack_top.is_empty() {
        let words: Vec<String> =
            report.stack_top.iter().map(|w| format!("0x{w:08X}")).collect();
        eprintln!("  stack: {}", words.join(" "));
    }
}

/// Run with per-instruction tracing on stderr.
fn run_traced(vm: &mut Vm) -> StopReason {
    loop {
        let pc = vm.registers().r[15];
        if let Some(line) = vm.disassemble(pc, 1).into_iter().next() {
            eprintln!("0x{:08X}: {:08X}  {}", line.addr, line.word, line.text);
        }
        match vm.step() {
            StopReason::Step => {}
            reason => return reason,
        }
    }
}

fn main() {
    let cli = parse_args();

    if cli.rpc {
        rpc::serve();
        return;
    }

    let Some(path) = &cli.source_path else { usage() };
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("cannot read '{}': {e}", path.display());
            process::exit(2);
        }
    };

    let config = config_from(&cli);
    let mut vm = match Vm::new(config, Box::new(StdIo)) {
        Ok(vm) => vm,
        Err(e) => {
            eprintln!("bad configuration: {e}");
            process::exit(2);
        }
    };

    let name = path.to_string_lossy();
    match vm.load_source(&source, &name, &FsProvider) {
        Ok(()) => {}
        Err(LoadError::Assemble(diags)) => {
            for d in &diags {
                eprintln!("{d}");
            }
            eprintln!("{} error(s)", diags.len());
            process::exit(1);
        }
        Err(LoadError::Layout(message)) => {
            eprintln!("cannot map image: {message}");
            process::exit(1);
        }
    }

    let reason = if cli.trace { run_traced(&mut vm) } else { vm.run(RunPolicy::Continue) };
    match reason {
        StopReason::Halted { code } => process::exit((code & 0xFF) as i32),
        StopReason::Error(_) => {
            report_fault(&vm);
            process::exit(1);
        }
        other => {
            // No interactive debugger here; any pause ends the process.
            eprintln!("stopped: {other:?} in state {}", vm.state());
            process::exit(1);
        }
    }
}
