//! Whole-VM tests: programs assembled with `ProgramBuilder`, booted through
//! `RayVmBuilder` and judged by their exit and final data memory.

use rayos_vm::types::{DYNCALL_FAILED, MA, MB, MC, NEW_CORE_FAILED, PAGE_SIZE};
use rayos_vm::{Fault, Opcode, ProgramBuilder, RayVm, RayVmBuilder, VmExit};

/// Iterations core 0 spins so that cores it started reach their own halt first
const SETTLE: u32 = 20_000;

fn boot(builder: RayVmBuilder) -> (VmExit, RayVm) {
    let mut vm = builder.build().expect("vm should initialize");
    let exit = vm.run();
    (exit, vm)
}

fn settle(program: ProgramBuilder) -> ProgramBuilder {
    let program = program.imm(Opcode::MoveImm, 1, SETTLE);
    let top = program.here();
    program
        .imm(Opcode::Dec, 1, 0)
        .wide(Opcode::Jnz, 0, top)
}

fn cstr_at(data: &mut Vec<u8>, address: usize, text: &str) {
    let end = address + text.len() + 1;
    if data.len() < end {
        data.resize(end, 0);
    }
    data[address..end - 1].copy_from_slice(text.as_bytes());
    data[end - 1] = 0;
}

#[test]
fn halt_on_sole_core_returns_ma() {
    let program = ProgramBuilder::new()
        .imm(Opcode::MoveImm, MA, 42)
        .op(Opcode::Halt)
        .build();

    let (exit, vm) = boot(RayVmBuilder::new().with_program(program));
    assert!(exit.is_clean());
    assert_eq!(exit.return_value, 42);

    let metrics = vm.metrics();
    assert_eq!(metrics.cores_total, 1);
    assert_eq!(metrics.cores_running, 0);
    assert_eq!(metrics.cores_resident, 0);
    assert_eq!(metrics.instructions_retired, 2);
}

#[test]
fn arithmetic_results_land_in_data_memory() {
    let program = ProgramBuilder::new()
        .imm(Opcode::MoveImm, 1, 6)
        .imm(Opcode::MoveImm, 2, 7)
        .regs(Opcode::MulReg, 1, 2)
        .wide(Opcode::Store, 1, 16)
        .imm(Opcode::SubImm, 2, 10)
        .wide(Opcode::Store, 2, 24)
        .regs(Opcode::MoveReg, MA, 1)
        .op(Opcode::Halt)
        .build();

    let (exit, vm) = boot(RayVmBuilder::new().with_program(program));
    assert!(exit.is_clean());
    assert_eq!(exit.return_value, 42);
    assert_eq!(vm.data().read_u64(16), Ok(42));
    assert_eq!(vm.data().read_u64(24), Ok((-3i64) as u64));
    assert_eq!(vm.metrics().instructions_retired, 8);
}

#[test]
fn call_and_return_through_the_stack() {
    // main: call double; store r1; halt
    // double: add r1, r1; ret
    let program = ProgramBuilder::new().imm(Opcode::MoveImm, 1, 21);
    let call_at = program.here();
    let program = program
        .wide(Opcode::Call, 0, 0)
        .wide(Opcode::Store, 1, 0)
        .regs(Opcode::MoveReg, MA, 1)
        .op(Opcode::Halt);
    let double = program.here();
    let program = program
        .regs(Opcode::AddReg, 1, 1)
        .op(Opcode::Ret)
        .patch(call_at + 1, double)
        .build();

    let (exit, vm) = boot(RayVmBuilder::new().with_program(program));
    assert!(exit.is_clean());
    assert_eq!(exit.return_value, 42);
    assert_eq!(vm.data().read_u64(0), Ok(42));
}

#[test]
fn halt_with_other_cores_running_stops_only_the_requester() {
    let program = ProgramBuilder::new()
        .imm(Opcode::MoveImm, MA, 0)
        .op(Opcode::NewCore);
    let program = settle(program)
        .imm(Opcode::MoveImm, MA, 42)
        .op(Opcode::Halt);
    let child = program.here();
    let program = program
        .imm(Opcode::MoveImm, MA, 7)
        .op(Opcode::Halt)
        .patch(0, rayos_vm::isa::encode::imm(Opcode::MoveImm, MA, child as u32))
        .build();

    let (exit, vm) = boot(RayVmBuilder::new().with_program(program));
    assert!(exit.is_clean());
    // The child's halt did not end the VM; core 0's did.
    assert_eq!(exit.return_value, 42);
    assert_eq!(vm.metrics().cores_total, 2);
}

#[test]
fn new_core_ids_strictly_increase() {
    let mut program = ProgramBuilder::new();
    let mut patches = Vec::new();
    for slot in 0..3u64 {
        patches.push(program.here());
        program = program
            .imm(Opcode::MoveImm, MA, 0)
            .op(Opcode::NewCore)
            .wide(Opcode::Store, MA, slot * 8);
    }
    let program = settle(program)
        .imm(Opcode::MoveImm, MA, 0)
        .op(Opcode::Halt);
    let child = program.here();
    let mut program = program.op(Opcode::Halt);
    for at in patches {
        program = program.patch(at, rayos_vm::isa::encode::imm(Opcode::MoveImm, MA, child as u32));
    }

    let (exit, vm) = boot(RayVmBuilder::new().with_program(program.build()));
    assert!(exit.is_clean());
    assert_eq!(vm.data().read_u64(0), Ok(1));
    assert_eq!(vm.data().read_u64(8), Ok(2));
    assert_eq!(vm.data().read_u64(16), Ok(3));
    assert_eq!(vm.metrics().cores_total, 4);
}

#[test]
fn new_core_is_denied_when_memory_runs_out() {
    // One page each for instructions, data and the boot stack; nothing left
    // for a second stack.
    let program = ProgramBuilder::new()
        .imm(Opcode::MoveImm, MA, 3)
        .op(Opcode::NewCore)
        .op(Opcode::Halt)
        .op(Opcode::Halt)
        .build();

    let builder = RayVmBuilder::new()
        .with_program(program)
        .with_stack_len(PAGE_SIZE)
        .with_memory_budget(3 * PAGE_SIZE);
    let (exit, vm) = boot(builder);

    assert!(exit.is_clean());
    assert_eq!(exit.return_value, NEW_CORE_FAILED);
    assert_eq!(vm.metrics().cores_total, 1);
}

#[test]
fn new_core_is_denied_at_the_core_limit() {
    let program = ProgramBuilder::new()
        .imm(Opcode::MoveImm, MA, 3)
        .op(Opcode::NewCore)
        .op(Opcode::Halt)
        .op(Opcode::Halt)
        .build();

    let (exit, vm) = boot(RayVmBuilder::new().with_program(program).with_max_cores(1));
    assert!(exit.is_clean());
    assert_eq!(exit.return_value, NEW_CORE_FAILED);
    assert_eq!(vm.metrics().cores_total, 1);
}

#[test]
fn private_boot_core_may_not_start_cores() {
    let program = ProgramBuilder::new()
        .imm(Opcode::MoveImm, MA, 3)
        .op(Opcode::NewCore)
        .op(Opcode::Halt)
        .op(Opcode::Halt)
        .build();

    let (exit, vm) = boot(
        RayVmBuilder::new()
            .with_program(program)
            .with_private_boot_core(true),
    );
    assert_eq!(exit.return_value, NEW_CORE_FAILED);
    assert_eq!(vm.metrics().cores_total, 1);
}

#[test]
fn fopen_of_missing_file_returns_null_handle() {
    let mut data = Vec::new();
    cstr_at(&mut data, 0, "/definitely/not/here/rayos-vm.bin");

    let program = ProgramBuilder::new()
        .imm(Opcode::MoveImm, MA, 0)
        .imm(Opcode::MoveImm, MB, 99)
        .op(Opcode::Fopen)
        .wide(Opcode::Store, MB, 64)
        .op(Opcode::Halt)
        .build();

    let (exit, vm) = boot(RayVmBuilder::new().with_program(program).with_data(data));
    assert!(exit.is_clean());
    assert_eq!(exit.return_value, 1);
    assert_eq!(vm.data().read_u64(64), Ok(0));
}

#[test]
fn fread_on_null_handle_kills_the_last_core() {
    let program = ProgramBuilder::new()
        .imm(Opcode::MoveImm, MA, 0)
        .imm(Opcode::MoveImm, MB, 0)
        .imm(Opcode::MoveImm, MC, 8)
        .op(Opcode::Fread)
        .op(Opcode::Halt)
        .build();

    let (exit, vm) = boot(RayVmBuilder::new().with_program(program));
    let fatal = exit.fatal.expect("last core died");
    assert_eq!(fatal.core, Some(0));
    assert_eq!(fatal.fault, Fault::NullFileHandle);
    assert_eq!(vm.faults().len(), 1);
}

#[test]
fn core_fault_with_survivors_keeps_the_vm_running() {
    let program = ProgramBuilder::new()
        .imm(Opcode::MoveImm, MA, 0)
        .op(Opcode::NewCore);
    let program = settle(program)
        .imm(Opcode::MoveImm, MA, 5)
        .op(Opcode::Halt);
    let child = program.here();
    let program = program
        .imm(Opcode::MoveImm, MB, 0)
        .op(Opcode::Fread)
        .op(Opcode::Halt)
        .patch(0, rayos_vm::isa::encode::imm(Opcode::MoveImm, MA, child as u32))
        .build();

    let (exit, vm) = boot(RayVmBuilder::new().with_program(program));
    assert!(exit.is_clean());
    assert_eq!(exit.return_value, 5);

    let faults = vm.faults();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].core, Some(1));
    assert_eq!(faults[0].fault, Fault::NullFileHandle);
}

#[test]
fn dyncall_reaches_builtin_library() {
    let mut data = vec![0u8; 128];
    cstr_at(&mut data, 0, "rayos");
    cstr_at(&mut data, 8, "sum");
    cstr_at(&mut data, 16, "nope");
    data[64..72].copy_from_slice(&20u64.to_le_bytes());
    data[72..80].copy_from_slice(&22u64.to_le_bytes());

    let program = ProgramBuilder::new()
        .imm(Opcode::MoveImm, MA, 0)
        .op(Opcode::Dynl)
        // Unknown symbol: sentinel in Ma, error flag in Mc, core keeps going.
        .imm(Opcode::MoveImm, MA, 16)
        .imm(Opcode::MoveImm, MC, 64)
        .op(Opcode::Dyncall)
        .wide(Opcode::Store, MA, 256)
        .wide(Opcode::Store, MC, 264)
        .imm(Opcode::MoveImm, MA, 8)
        .imm(Opcode::MoveImm, MC, 64)
        .op(Opcode::Dyncall)
        .wide(Opcode::Store, MC, 272)
        .op(Opcode::Dynul)
        .op(Opcode::Halt)
        .build();

    let (exit, vm) = boot(RayVmBuilder::new().with_program(program).with_data(data));
    assert!(exit.is_clean());
    assert_eq!(exit.return_value, 42);
    assert_eq!(vm.data().read_u64(256), Ok(DYNCALL_FAILED));
    assert_eq!(vm.data().read_u64(264), Ok(1));
    assert_eq!(vm.data().read_u64(272), Ok(0));
}

#[test]
fn dynl_of_unknown_library_is_fatal_for_the_core() {
    let mut data = Vec::new();
    cstr_at(&mut data, 0, "libmissing");

    let program = ProgramBuilder::new()
        .imm(Opcode::MoveImm, MA, 0)
        .op(Opcode::Dynl)
        .op(Opcode::Halt)
        .build();

    let (exit, _vm) = boot(RayVmBuilder::new().with_program(program).with_data(data));
    let fatal = exit.fatal.expect("sole core died");
    assert_eq!(fatal.fault, Fault::DynamicLoadFailed("libmissing".to_string()));
}

#[test]
fn file_write_then_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("guest.txt");

    let mut data = vec![0u8; 1024];
    cstr_at(&mut data, 0, path.to_str().unwrap());
    data[512..517].copy_from_slice(b"hello");

    let program = ProgramBuilder::new()
        // fopen(path, write)
        .imm(Opcode::MoveImm, MA, 0)
        .imm(Opcode::MoveImm, MB, 1)
        .op(Opcode::Fopen)
        // fwrite(512, handle, 5)
        .imm(Opcode::MoveImm, MA, 512)
        .imm(Opcode::MoveImm, MC, 5)
        .op(Opcode::Fwrite)
        .wide(Opcode::Store, MA, 800)
        .op(Opcode::Fclose)
        // fopen(path, read)
        .imm(Opcode::MoveImm, MA, 0)
        .imm(Opcode::MoveImm, MB, 0)
        .op(Opcode::Fopen)
        // fread(600, handle, 16)
        .imm(Opcode::MoveImm, MA, 600)
        .imm(Opcode::MoveImm, MC, 16)
        .op(Opcode::Fread)
        .wide(Opcode::Store, MA, 808)
        .op(Opcode::Feof)
        .wide(Opcode::Store, MA, 816)
        .op(Opcode::Fclose)
        .imm(Opcode::MoveImm, MA, 0)
        .op(Opcode::Halt)
        .build();

    let (exit, vm) = boot(RayVmBuilder::new().with_program(program).with_data(data));
    assert!(exit.is_clean());
    assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    assert_eq!(vm.data().read_u64(800), Ok(5));
    assert_eq!(vm.data().read_u64(808), Ok(5));
    assert_eq!(vm.data().read_u64(816), Ok(1));
    assert_eq!(vm.data().read_bytes(600, 5).unwrap(), b"hello");
}

#[test]
fn reaching_an_invalid_opcode_is_fatal() {
    let program = ProgramBuilder::new()
        .imm(Opcode::MoveImm, 1, 1)
        .raw(0xFF << 56)
        .build();

    let (exit, _vm) = boot(RayVmBuilder::new().with_program(program));
    let fatal = exit.fatal.expect("sole core died");
    assert_eq!(fatal.core, Some(0));
    assert_eq!(
        fatal.fault,
        Fault::InvalidOpcode {
            pc: 1,
            opcode: 0xFF
        }
    );
}

#[test]
fn invalid_words_past_halt_are_never_raised() {
    let program = ProgramBuilder::new()
        .imm(Opcode::MoveImm, MA, 9)
        .op(Opcode::Halt)
        .raw(0xFF << 56)
        .raw(u64::MAX)
        .build();

    let (exit, vm) = boot(RayVmBuilder::new().with_program(program));
    assert!(exit.is_clean());
    assert_eq!(exit.return_value, 9);
    assert!(vm.faults().is_empty());
}

#[test]
fn out_of_bounds_store_is_fatal_for_the_core() {
    let program = ProgramBuilder::new()
        .imm(Opcode::MoveImm, 1, 1)
        .wide(Opcode::Store, 1, u64::MAX - 3)
        .op(Opcode::Halt)
        .build();

    let (exit, vm) = boot(RayVmBuilder::new().with_program(program));
    let fatal = exit.fatal.expect("sole core died");
    assert!(matches!(fatal.fault, Fault::OutOfBounds { .. }));
    assert_eq!(vm.metrics().bounds_violations, 1);
}

#[test]
fn image_file_boots_at_its_entry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("entry.rvmi");

    let program = ProgramBuilder::new()
        .imm(Opcode::MoveImm, MA, 1)
        .op(Opcode::Halt)
        .imm(Opcode::MoveImm, MA, 2)
        .op(Opcode::Halt)
        .build();
    rayos_vm::ProgramImage::new(program, Vec::new())
        .with_entry(2)
        .save(&path)
        .unwrap();

    let image = rayos_vm::ProgramImage::load(&path).unwrap();
    let (exit, _vm) = boot(RayVmBuilder::new().with_image(image));
    assert_eq!(exit.return_value, 2);
}

#[test]
fn halted_cores_give_their_stack_back() {
    // Room for the boot stack plus exactly one more. Each child halts before
    // the next one is requested, so every request fits only if halted
    // cores are reclaimed.
    const CHILDREN: u64 = 5;

    let mut program = ProgramBuilder::new();
    let mut patches = Vec::new();
    for slot in 0..CHILDREN {
        patches.push(program.here());
        program = program
            .imm(Opcode::MoveImm, MA, 0)
            .op(Opcode::NewCore)
            .wide(Opcode::Store, MA, slot * 8);
        program = settle(program);
    }
    let program = program.imm(Opcode::MoveImm, MA, 0).op(Opcode::Halt);
    let child = program.here();
    let mut program = program.op(Opcode::Halt);
    for at in patches {
        program = program.patch(at, rayos_vm::isa::encode::imm(Opcode::MoveImm, MA, child as u32));
    }

    let builder = RayVmBuilder::new()
        .with_program(program.build())
        .with_stack_len(PAGE_SIZE)
        .with_memory_budget(4 * PAGE_SIZE);
    let (exit, vm) = boot(builder);

    assert!(exit.is_clean());
    for slot in 0..CHILDREN {
        assert_eq!(vm.data().read_u64(slot * 8), Ok(slot + 1), "child {slot} was denied");
    }

    let metrics = vm.metrics();
    assert_eq!(metrics.cores_total, CHILDREN as usize + 1);
    assert_eq!(metrics.cores_resident, 0);
    // Only instruction and data memory outlive the run.
    assert_eq!(metrics.memory_in_use, 2 * PAGE_SIZE);
}

#[test]
fn dyncall_parameter_block_must_hold_a_full_slot() {
    let mut data = Vec::new();
    cstr_at(&mut data, 0, "rayos");
    cstr_at(&mut data, 8, "nope");

    // Unknown symbol would normally be recoverable, but the block at the
    // last four bytes of data memory is rejected before lookup.
    let program = ProgramBuilder::new()
        .imm(Opcode::MoveImm, MA, 0)
        .op(Opcode::Dynl)
        .imm(Opcode::MoveImm, MA, 8)
        .imm(Opcode::MoveImm, MC, (PAGE_SIZE - 4) as u32)
        .op(Opcode::Dyncall)
        .op(Opcode::Halt)
        .build();

    let (exit, _vm) = boot(RayVmBuilder::new().with_program(program).with_data(data));
    let fatal = exit.fatal.expect("sole core died");
    assert!(matches!(
        fatal.fault,
        Fault::OutOfBounds { address, width: 8, .. } if address == (PAGE_SIZE - 4) as u64
    ));
}
