use std::cell::RefCell;
use std::rc::Rc;

use nacho_core::{
    AccessKind, Cpu, CpuFault, FlatMemory, HaltReason, MemoryFault, MemorySurface, RunExit,
    RunState,
};
use nacho_x86::{Eflags, Gpr, X86Cpu, X86Registers};
use proptest::prelude::*;

fn cpu_with(code: &[u8]) -> X86Cpu<FlatMemory> {
    let mut mem = FlatMemory::new(0x1000);
    mem.load(0, code).unwrap();
    X86Cpu::new(mem)
}

#[test]
fn mov_mov_add_yields_sum_with_clear_flags() {
    let mut cpu = cpu_with(&[
        0xb8, 0x78, 0x56, 0x34, 0x12, // mov eax, 0x12345678
        0xbb, 0x01, 0x00, 0x00, 0x00, // mov ebx, 1
        0x01, 0xd8, // add eax, ebx
        0xf4, // hlt
    ]);
    assert_eq!(cpu.run(100), RunExit::Halted(HaltReason::Hlt));
    let regs = cpu.registers();
    assert_eq!(regs.get32(Gpr::Eax), 0x1234_5679);
    assert!(!regs.zf());
    assert!(!regs.sf());
    assert_eq!(regs.eip, 13);
    assert_eq!(cpu.state(), RunState::Idle);
}

#[test]
fn self_subtract_sets_zero_flag() {
    let mut cpu = cpu_with(&[0x29, 0xc0]);
    let mut regs = cpu.registers();
    regs.set32(Gpr::Eax, 0xdead_beef);
    cpu.set_registers(regs);
    cpu.step().unwrap();
    let regs = cpu.registers();
    assert_eq!(regs.get32(Gpr::Eax), 0);
    assert!(regs.zf());
    assert!(!regs.sf());
}

#[test]
fn only_zero_and_sign_flags_are_computed() {
    // add eax, 1 with eax = 0xffffffff: carries out, but CF stays clear.
    let mut cpu = cpu_with(&[0x83, 0xc0, 0x01, 0xf7, 0xd0, 0xc1, 0xe0, 0x00]);
    let mut regs = cpu.registers();
    regs.set32(Gpr::Eax, 0xffff_ffff);
    cpu.set_registers(regs);

    cpu.step().unwrap();
    assert_eq!(cpu.registers().eflags, Eflags::RESET | Eflags::ZF);

    // not eax: result is all ones but NOT leaves flags alone.
    cpu.step().unwrap();
    assert_eq!(cpu.registers().get32(Gpr::Eax), 0xffff_ffff);
    assert_eq!(cpu.registers().eflags, Eflags::RESET | Eflags::ZF);

    // shl eax, 0 writes nothing.
    cpu.step().unwrap();
    assert_eq!(cpu.registers().eflags, Eflags::RESET | Eflags::ZF);
    assert_eq!(cpu.registers().eip, 8);
}

#[test]
fn unknown_opcode_halts_and_only_moves_pc() {
    let mut cpu = cpu_with(&[0x90, 0x0f, 0x0b]);
    let mut regs = cpu.registers();
    regs.set32(Gpr::Ecx, 0x55);
    cpu.set_registers(regs.clone());

    let exit = cpu.run(10);
    let RunExit::Faulted(CpuFault::Decode(fault)) = exit else {
        panic!("expected decode fault, got {exit:?}");
    };
    assert_eq!(fault.pc, 1);
    assert_eq!(fault.opcode, 0x0f0b);
    assert_eq!(cpu.state(), RunState::Idle);

    let after = cpu.registers();
    assert_eq!(after.eip, 3);
    assert_eq!(after.gpr, regs.gpr);
    assert_eq!(after.eflags, regs.eflags);
}

#[test]
fn call_push_pop_ret_keep_esp_consistent() {
    let mut cpu = cpu_with(&[
        0xbc, 0x00, 0x01, 0x00, 0x00, // 00: mov esp, 0x100
        0xe8, 0x02, 0x00, 0x00, 0x00, // 05: call 0x0c
        0xf4, // 0a: hlt
        0x90, // 0b: nop
        0x6a, 0x2a, // 0c: push 0x2a
        0x58, // 0e: pop eax
        0xc3, // 0f: ret
    ]);
    assert_eq!(cpu.run(100), RunExit::Halted(HaltReason::Hlt));
    let regs = cpu.registers();
    assert_eq!(regs.get32(Gpr::Eax), 0x2a);
    assert_eq!(regs.get32(Gpr::Esp), 0x100);
    assert_eq!(regs.eip, 0x0b);
    assert_eq!(cpu.call_depth(), 0);
    assert_eq!(cpu.memory().read_u32(0xfc).unwrap(), 0x0a);
    assert_eq!(cpu.memory().read_u32(0xf8).unwrap(), 0x2a);
}

#[test]
fn ret_with_empty_call_stack_halts_without_popping() {
    let mut cpu = cpu_with(&[0xc3]);
    let mut regs = cpu.registers();
    regs.set32(Gpr::Esp, 0x200);
    cpu.set_registers(regs);
    assert_eq!(cpu.run(10), RunExit::Halted(HaltReason::ReturnFromTop));
    assert_eq!(cpu.registers().get32(Gpr::Esp), 0x200);
    assert_eq!(cpu.registers().eip, 1);
}

#[test]
fn int_invokes_the_registered_handler() {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let mut cpu = cpu_with(&[0xcd, 0x21, 0xcd, 0x80, 0xf4]);
    let log = Rc::clone(&seen);
    cpu.set_interrupt_handler(Box::new(move |vector: u8, regs: &mut X86Registers| {
        log.borrow_mut().push((vector, regs.eip));
        regs.set32(Gpr::Eax, u32::from(vector));
    }));

    assert_eq!(cpu.run(10), RunExit::Halted(HaltReason::Hlt));
    assert_eq!(*seen.borrow(), vec![(0x21, 2), (0x80, 4)]);
    assert_eq!(cpu.registers().get32(Gpr::Eax), 0x80);
}

#[test]
fn stack_write_out_of_bounds_faults_without_moving_esp() {
    let mut cpu = cpu_with(&[0x50]);
    let exit = cpu.run(10);
    assert_eq!(
        exit,
        RunExit::Faulted(CpuFault::Memory(MemoryFault {
            addr: 0xffff_fffc,
            len: 4,
            kind: AccessKind::Write,
        }))
    );
    assert_eq!(cpu.registers().get32(Gpr::Esp), 0);
    assert_eq!(cpu.registers().eip, 0);
    assert_eq!(cpu.state(), RunState::Idle);
}

#[test]
fn fetch_past_end_of_memory_faults() {
    let mut cpu = cpu_with(&[]);
    cpu.set_entry(0x1000);
    assert!(matches!(
        cpu.run(1),
        RunExit::Faulted(CpuFault::Memory(MemoryFault { addr: 0x1000, .. }))
    ));
}

#[test]
fn memory_operands_decode_but_have_no_effect() {
    // add [eax+ecx*4+0x10], edx; mov eax, [0x20]; hlt
    let mut cpu = cpu_with(&[
        0x01, 0x54, 0x88, 0x10, 0x8b, 0x05, 0x20, 0x00, 0x00, 0x00, 0xf4,
    ]);
    let before = cpu.registers();
    assert_eq!(cpu.run(10), RunExit::Halted(HaltReason::Hlt));
    let after = cpu.registers();
    assert_eq!(after.gpr, before.gpr);
    assert_eq!(after.eflags, before.eflags);
    assert_eq!(after.eip, 11);
    assert!(cpu.memory().as_slice()[0x10..0x30].iter().all(|b| *b == 0));
}

#[test]
fn budget_exhaustion_leaves_cpu_running() {
    let mut cpu = cpu_with(&[0xeb, 0xfe]);
    assert_eq!(cpu.run(5), RunExit::BudgetExhausted);
    assert_eq!(cpu.state(), RunState::Running);
    assert_eq!(cpu.registers().eip, 0);
}

#[test]
fn counted_loop_with_conditional_branch() {
    let mut cpu = cpu_with(&[
        0xb9, 0x05, 0x00, 0x00, 0x00, // mov ecx, 5
        0x31, 0xc0, // xor eax, eax
        0x01, 0xc8, // loop: add eax, ecx
        0xff, 0xc9, // dec ecx
        0x75, 0xfa, // jnz loop
        0xf4, // hlt
    ]);
    assert_eq!(cpu.run(1000), RunExit::Halted(HaltReason::Hlt));
    assert_eq!(cpu.registers().get32(Gpr::Eax), 15);
    assert!(cpu.registers().zf());
}

#[test]
fn rex_w_selects_64_bit_operands() {
    let mut cpu = cpu_with(&[
        0x48, 0xb8, 0xff, 0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00, // mov rax, 0xffffffff
        0x48, 0x83, 0xc0, 0x01, // add rax, 1
        0x83, 0xc3, 0xff, // add ebx, -1
        0xf4,
    ]);
    let mut regs = cpu.registers();
    regs.set64(Gpr::Ebx, 0xffff_0000_0000_0001);
    cpu.set_registers(regs);
    assert_eq!(cpu.run(10), RunExit::Halted(HaltReason::Hlt));
    let regs = cpu.registers();
    assert_eq!(regs.get64(Gpr::Eax), 0x1_0000_0000);
    // 32-bit writes zero the upper half.
    assert_eq!(regs.get64(Gpr::Ebx), 0);
    assert!(regs.zf());
}

#[test]
fn reset_returns_to_entry() {
    let mut cpu = cpu_with(&[0x90, 0x90, 0xf4]);
    cpu.set_entry(1);
    cpu.run(10);
    cpu.reset();
    assert_eq!(cpu.registers(), X86Registers { eip: 1, ..X86Registers::default() });
    assert_eq!(cpu.state(), RunState::Idle);
}

/// `op dst, src` register-direct ALU forms and their encodings.
fn alu_instruction() -> impl Strategy<Value = (Vec<u8>, Option<usize>)> {
    let reg = 0u8..8;
    prop_oneof![
        // 01/09/21/29/31: op r/m32, r32 (writes r/m)
        (prop::sample::select(vec![0x01u8, 0x09, 0x21, 0x29, 0x31]), reg.clone(), reg.clone())
            .prop_map(|(op, dst, src)| (vec![op, 0xc0 | (src << 3) | dst], Some(dst as usize))),
        // 39/85: cmp/test write no register
        (prop::sample::select(vec![0x39u8, 0x85]), reg.clone(), reg.clone())
            .prop_map(|(op, dst, src)| (vec![op, 0xc0 | (src << 3) | dst], None)),
        // 83 /0 /1 /4 /5 /6: op r/m32, imm8
        (prop::sample::select(vec![0u8, 1, 4, 5, 6]), reg.clone(), any::<u8>())
            .prop_map(|(ext, dst, imm)| (vec![0x83, 0xc0 | (ext << 3) | dst, imm], Some(dst as usize))),
        // 0F AF: imul r32, r/m32
        (reg.clone(), reg.clone())
            .prop_map(|(dst, src)| (vec![0x0f, 0xaf, 0xc0 | (dst << 3) | src], Some(dst as usize))),
        // C1 /4 /5 /7: shifts by imm8
        (prop::sample::select(vec![4u8, 5, 7]), reg.clone(), any::<u8>())
            .prop_map(|(ext, dst, n)| (vec![0xc1, 0xc0 | (ext << 3) | dst, n], Some(dst as usize))),
        // B8+r: mov r32, imm32
        (reg, any::<u32>()).prop_map(|(dst, imm)| {
            let mut bytes = vec![0xb8 + dst];
            bytes.extend_from_slice(&imm.to_le_bytes());
            (bytes, Some(dst as usize))
        }),
    ]
}

proptest! {
    #[test]
    fn step_advances_by_length_and_touches_only_destination(
        (code, dst) in alu_instruction(),
        gpr in prop::array::uniform8(any::<u64>()),
    ) {
        let mut cpu = cpu_with(&code);
        cpu.set_registers(X86Registers { gpr, ..X86Registers::default() });

        prop_assert_eq!(cpu.step(), Ok(None));
        let after = cpu.registers();
        prop_assert_eq!(after.eip as usize, code.len());
        for (i, (before, now)) in gpr.iter().zip(after.gpr.iter()).enumerate() {
            if Some(i) != dst {
                prop_assert_eq!(before, now, "register {} changed", i);
            }
        }
        let untouched = !(Eflags::ZF | Eflags::SF);
        prop_assert_eq!(after.eflags & untouched, Eflags::RESET);
    }
}
