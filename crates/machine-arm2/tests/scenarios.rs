//! End-to-end machine scenarios: assemble, run, observe.

use machine_arm2::{
    RunPolicy, SharedIo, StopReason, VmConfig, VmError, VmState, WatchMode, Vm,
};

fn make_vm(config: VmConfig) -> (Vm, SharedIo) {
    let io = SharedIo::default();
    let vm = Vm::new(config, Box::new(io.clone())).expect("valid config");
    (vm, io)
}

fn load(vm: &mut Vm, source: &str) {
    let provider = asm_arm2::MapProvider::new();
    if let Err(err) = vm.load_source(source, "test.s", &provider) {
        panic!("load failed: {err:?}");
    }
}

fn run_to_halt(vm: &mut Vm) -> u32 {
    match vm.run(RunPolicy::Continue) {
        StopReason::Halted { code } => code,
        other => panic!("expected halt, got {other:?} (report: {:?})", vm.fault_report()),
    }
}

#[test]
fn hello_writes_string_and_halts() {
    let (mut vm, io) = make_vm(VmConfig::default());
    load(
        &mut vm,
        "LDR R0, =msg\n\
         SWI #2\n\
         MOV R0, #0\n\
         SWI #0\n\
         .data\n\
         msg: .asciz \"Hi\\n\"\n",
    );
    assert_eq!(run_to_halt(&mut vm), 0);
    assert_eq!(vm.state(), VmState::Halted);
    assert_eq!(io.take_output(), b"Hi\n");
}

#[test]
fn addflags_sets_overflow() {
    let (mut vm, _io) = make_vm(VmConfig::default());
    load(
        &mut vm,
        "LDR R0, =0x7FFFFFFF\n\
         ADDS R1, R0, #1\n\
         SWI #0\n",
    );
    run_to_halt(&mut vm);
    let regs = vm.registers();
    assert_eq!(regs.r[1], 0x8000_0000);
    assert!(regs.n);
    assert!(!regs.z);
    assert!(!regs.c);
    assert!(regs.v);
}

#[test]
fn branch_loop_counts_to_five() {
    let (mut vm, _io) = make_vm(VmConfig::default());
    load(
        &mut vm,
        "MOV R0, #0\n\
         loop: ADD R0, R0, #1\n\
         CMP R0, #5\n\
         BNE loop\n\
         SWI #0\n",
    );
    run_to_halt(&mut vm);
    let regs = vm.registers();
    assert_eq!(regs.r[0], 5);
    assert!(regs.z);
}

#[test]
fn bl_and_bx_round_trip() {
    let (mut vm, _io) = make_vm(VmConfig::default());
    load(
        &mut vm,
        "MOV LR, #0\n\
         BL sub\n\
         B end\n\
         sub: MOV R0, #42\n\
         BX LR\n\
         end: SWI #0\n",
    );
    run_to_halt(&mut vm);
    assert_eq!(vm.registers().r[0], 42);
}

#[test]
fn push_pop_preserves_registers_and_stack() {
    let config = VmConfig::default();
    let stack_top = config.stack_top;
    let (mut vm, _io) = make_vm(config);
    load(
        &mut vm,
        "MOV R0, #1\n\
         MOV R1, #2\n\
         MOV R2, #3\n\
         MOV R3, #4\n\
         STMFD SP!, {R0-R3}\n\
         MOV R0, #0\n\
         MOV R1, #0\n\
         MOV R2, #0\n\
         MOV R3, #0\n\
         LDMFD SP!, {R0-R3}\n\
         SWI #0\n",
    );
    run_to_halt(&mut vm);
    let regs = vm.registers();
    assert_eq!(regs.r[0..4], [1, 2, 3, 4]);
    assert_eq!(regs.r[13], stack_top);
    // The four words below the original SP hold 1..4, low address first.
    let bytes = vm.read_memory(stack_top - 16, 16);
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    assert_eq!(words, [1, 2, 3, 4]);
}

#[test]
fn conditional_breakpoint_fires_once_at_three() {
    let (mut vm, _io) = make_vm(VmConfig::default());
    load(
        &mut vm,
        "MOV R0, #0\n\
         loop: ADD R0, R0, #1\n\
         CMP R0, #5\n\
         BNE loop\n\
         SWI #0\n",
    );
    let loop_addr = vm.symbols().unwrap().address_of("loop").unwrap();
    let id = vm.add_breakpoint(loop_addr, Some("R0 == 3".to_string()));
    match vm.run(RunPolicy::Continue) {
        StopReason::Breakpoint { id: hit, addr } => {
            assert_eq!(hit, id);
            assert_eq!(addr, loop_addr);
        }
        other => panic!("expected breakpoint, got {other:?}"),
    }
    assert_eq!(vm.state(), VmState::Paused);
    assert_eq!(vm.registers().r[0], 3);
    assert_eq!(vm.breakpoints()[0].hits, 1);
    // Continuing runs to the exit; the condition never holds again.
    assert_eq!(run_to_halt(&mut vm), 0);
    assert_eq!(vm.registers().r[0], 5);
    assert_eq!(vm.breakpoints()[0].hits, 1);
}

#[test]
fn step_over_and_finish() {
    let (mut vm, _io) = make_vm(VmConfig::default());
    load(
        &mut vm,
        "MOV R4, #7\n\
         BL sub\n\
         SWI #0\n\
         sub: MOV R0, #42\n\
         BX LR\n",
    );
    // Step past the MOV.
    assert_eq!(vm.step(), StopReason::Step);
    let pc_at_bl = vm.registers().r[15];
    // Step-over runs the whole call.
    match vm.run(RunPolicy::StepOver) {
        StopReason::Breakpoint { addr, .. } => assert_eq!(addr, pc_at_bl + 4),
        other => panic!("expected temporary breakpoint, got {other:?}"),
    }
    assert_eq!(vm.registers().r[0], 42);
    // The temporary breakpoint is gone.
    assert!(vm.breakpoints().is_empty());
    assert_eq!(run_to_halt(&mut vm), 0);
}

#[test]
fn watchpoint_pauses_on_write() {
    let (mut vm, _io) = make_vm(VmConfig::default());
    load(
        &mut vm,
        "LDR R1, =target\n\
         MOV R0, #9\n\
         STR R0, [R1]\n\
         SWI #0\n\
         .data\n\
         target: .word 0\n",
    );
    let target = vm.symbols().unwrap().address_of("target").unwrap();
    let id = vm.add_watchpoint(target, 4, WatchMode::Write, None);
    match vm.run(RunPolicy::Continue) {
        StopReason::Watchpoint { id: hit, addr } => {
            assert_eq!(hit, id);
            assert_eq!(addr, target);
        }
        other => panic!("expected watchpoint, got {other:?}"),
    }
    // The write completed before the pause.
    assert_eq!(vm.read_memory(target, 4), 9u32.to_le_bytes());
    assert_eq!(run_to_halt(&mut vm), 0);
}

#[test]
fn syscalls_preserve_flags() {
    let (mut vm, io) = make_vm(VmConfig::default());
    load(
        &mut vm,
        "MOV R1, #0\n\
         SUBS R1, R1, #1\n\
         MOV R0, #65\n\
         SWI #1\n\
         SWI #7\n\
         MOV R0, #123\n\
         MOV R1, #10\n\
         SWI #3\n\
         SWI #0\n",
    );
    run_to_halt(&mut vm);
    let regs = vm.registers();
    // SUBS 0 - 1: N set, C clear (borrow), V clear.
    assert!(regs.n && !regs.z && !regs.c && !regs.v);
    assert_eq!(io.take_output(), b"A\n123");
}

#[test]
fn stdin_queue_feeds_read_syscalls() {
    let (mut vm, io) = make_vm(VmConfig::default());
    load(
        &mut vm,
        "SWI #4\n\
         SWI #1\n\
         SWI #6\n\
         MOV R1, #10\n\
         SWI #3\n\
         SWI #4\n\
         SWI #0\n",
    );
    vm.send_input(b"X42\n");
    run_to_halt(&mut vm);
    // READ_CHAR got 'X', WRITE_CHAR echoed it, READ_INT parsed 42.
    assert_eq!(io.take_output(), b"X42");
    // Queue exhausted: the final READ_CHAR reports EOF.
    assert_eq!(vm.registers().r[0], u32::MAX);
}

#[test]
fn heap_allocate_and_free() {
    let (mut vm, _io) = make_vm(VmConfig::default());
    load(
        &mut vm,
        "MOV R0, #64\n\
         SWI #0x20\n\
         MOV R4, R0\n\
         MOV R1, #99\n\
         STR R1, [R4]\n\
         MOV R0, R4\n\
         SWI #0x21\n\
         MOV R5, R0\n\
         SWI #0\n",
    );
    run_to_halt(&mut vm);
    let regs = vm.registers();
    assert_ne!(regs.r[4], 0, "allocation succeeded");
    assert_eq!(regs.r[5], 0, "free succeeded");
    assert_eq!(vm.read_memory(regs.r[4], 4), 99u32.to_le_bytes());
}

#[test]
fn budget_exhaustion_is_an_error() {
    let config = VmConfig { max_cycles: 100, ..VmConfig::default() };
    let (mut vm, _io) = make_vm(config);
    load(&mut vm, "loop: B loop\n");
    match vm.run(RunPolicy::Continue) {
        StopReason::Error(VmError::Fault(cpu_arm2::Fault::BudgetExceeded { limit })) => {
            assert_eq!(limit, 100);
        }
        other => panic!("expected budget error, got {other:?}"),
    }
    assert_eq!(vm.state(), VmState::Error);
    let report = vm.fault_report().expect("report");
    assert!(!report.recent.is_empty());
    assert_eq!(report.nearest_symbol.as_ref().map(|(n, _)| n.as_str()), Some("loop"));
}

#[test]
fn fault_report_captures_context() {
    let (mut vm, _io) = make_vm(VmConfig::default());
    load(
        &mut vm,
        "main: MOV R0, #1\n\
         LDR R1, =0x500000\n\
         LDR R2, [R1]\n\
         SWI #0\n",
    );
    match vm.run(RunPolicy::Continue) {
        StopReason::Error(VmError::Fault(cpu_arm2::Fault::Segmentation { addr, .. })) => {
            assert_eq!(addr, 0x0050_0000);
        }
        other => panic!("expected segmentation fault, got {other:?}"),
    }
    let report = vm.fault_report().expect("report");
    assert_eq!(report.registers.r[0], 1);
    assert!(report.recent.iter().any(|(_, _, text)| text.contains("LDR")));
    assert_eq!(report.nearest_symbol.as_ref().map(|(n, _)| n.as_str()), Some("main"));
}

#[test]
fn reset_is_idempotent_and_preserves_image() {
    let (mut vm, _io) = make_vm(VmConfig::default());
    load(
        &mut vm,
        "LDR R1, =slot\n\
         MOV R0, #7\n\
         STR R0, [R1]\n\
         SWI #0\n\
         .data\n\
         slot: .word 1\n",
    );
    let slot = vm.symbols().unwrap().address_of("slot").unwrap();
    run_to_halt(&mut vm);
    assert_eq!(vm.read_memory(slot, 4), 7u32.to_le_bytes());

    vm.reset();
    assert_eq!(vm.state(), VmState::Ready);
    let first = vm.registers();
    // Data restored from the image, guest write gone.
    assert_eq!(vm.read_memory(slot, 4), 1u32.to_le_bytes());
    assert_eq!(first.r[0..13], [0; 13]);
    assert_eq!(first.cycles, 0);
    assert!(!first.n && !first.z && !first.c && !first.v);

    vm.reset();
    assert_eq!(vm.registers(), first, "second reset yields an equal state");
    // The machine runs again to the same result.
    run_to_halt(&mut vm);
    assert_eq!(vm.read_memory(slot, 4), 7u32.to_le_bytes());
}

#[test]
fn write_to_code_segment_faults() {
    let (mut vm, _io) = make_vm(VmConfig::default());
    load(
        &mut vm,
        "_start: LDR R1, =_start\n\
         MOV R0, #0\n\
         STR R0, [R1]\n\
         SWI #0\n",
    );
    match vm.run(RunPolicy::Continue) {
        StopReason::Error(VmError::Fault(cpu_arm2::Fault::Permission { .. })) => {}
        other => panic!("expected permission fault, got {other:?}"),
    }
}

#[test]
fn assertion_failure_reports_message() {
    let (mut vm, _io) = make_vm(VmConfig::default());
    load(
        &mut vm,
        "MOV R0, #0\n\
         LDR R1, =msg\n\
         SWI #0xF4\n\
         SWI #0\n\
         .data\n\
         msg: .asciz \"broken invariant\"\n",
    );
    match vm.run(RunPolicy::Continue) {
        StopReason::Error(VmError::Assertion { message }) => {
            assert_eq!(message, "broken invariant");
        }
        other => panic!("expected assertion, got {other:?}"),
    }
}

#[test]
fn expression_evaluation_sees_machine_state() {
    let (mut vm, _io) = make_vm(VmConfig::default());
    load(
        &mut vm,
        "MOV R0, #5\n\
         LDR R1, =value\n\
         SWI #0\n\
         .data\n\
         value: .word 0x1234\n",
    );
    run_to_halt(&mut vm);
    assert_eq!(vm.evaluate("R0 + 1"), Ok(6));
    assert_eq!(vm.evaluate("*(value)"), Ok(0x1234));
    assert_eq!(vm.evaluate("value == R1"), Ok(1));
    assert!(vm.evaluate("*(0xFFFFFF0)").is_err());
}

#[test]
fn disassembly_annotates_symbols() {
    let (mut vm, _io) = make_vm(VmConfig::default());
    load(
        &mut vm,
        "main: MOV R0, #1\n\
         loop: ADD R0, R0, #1\n\
         B loop\n",
    );
    let lines = vm.disassemble(0x8000, 3);
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0].text, "MOV R0, #1");
    assert_eq!(lines[0].symbol, Some(("main".to_string(), 0)));
    assert_eq!(lines[1].symbol, Some(("loop".to_string(), 0)));
    assert_eq!(lines[2].symbol, Some(("loop".to_string(), 4)));
    assert_eq!(lines[2].text, "B 0x00008004");
}

#[test]
fn file_syscalls_write_inside_sandbox_only() {
    let root = std::env::temp_dir().join(format!("arm2-sandbox-{}", std::process::id()));
    std::fs::create_dir_all(&root).expect("temp root");

    let config = VmConfig { fs_root: Some(root.clone()), ..VmConfig::default() };
    let (mut vm, _io) = make_vm(config);
    load(
        &mut vm,
        "LDR R0, =name\n\
         MOV R1, #1\n\
         SWI #0x10\n\
         MOV R4, R0\n\
         LDR R1, =text\n\
         MOV R2, #5\n\
         MOV R0, R4\n\
         SWI #0x13\n\
         MOV R0, R4\n\
         SWI #0x11\n\
         LDR R0, =evil\n\
         MOV R1, #1\n\
         SWI #0x10\n\
         MOV R5, R0\n\
         SWI #0\n\
         .data\n\
         name: .asciz \"out.txt\"\n\
         text: .asciz \"hello\"\n\
         evil: .asciz \"../escape.txt\"\n",
    );
    run_to_halt(&mut vm);
    let regs = vm.registers();
    assert!(regs.r[4] >= 3, "file fd allocated");
    assert_eq!(regs.r[5], u32::MAX, "escape attempt rejected");
    let written = std::fs::read(root.join("out.txt")).expect("file written in sandbox");
    assert_eq!(written, b"hello");
    assert!(!root.parent().unwrap().join("escape.txt").exists());

    let _ = std::fs::remove_dir_all(&root);
}
