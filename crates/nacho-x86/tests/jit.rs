#![cfg(not(target_arch = "wasm32"))]

use nacho_core::{Cpu, FlatMemory, HaltReason, MemorySurface, RunExit};
use nacho_jit::{BackendKind, JitConfig};
use nacho_x86::{Gpr, X86Cpu, X86Jit, X86Registers};
use proptest::prelude::*;

fn config(backend: BackendKind, threshold: u64) -> JitConfig {
    JitConfig {
        hot_threshold: threshold,
        backend,
        ..JitConfig::x86()
    }
}

fn memory(code: &[u8]) -> FlatMemory {
    let mut mem = FlatMemory::new(0x1000);
    mem.load(0, code).unwrap();
    mem
}

fn jit_cpu(code: &[u8], backend: BackendKind, threshold: u64) -> X86Cpu<FlatMemory> {
    X86Cpu::with_jit(memory(code), X86Jit::new(config(backend, threshold)).unwrap())
}

/// eax = sum(1..=n), ebx counts iterations, then HLT.
fn sum_program(n: u32) -> Vec<u8> {
    let mut code = vec![0xb9];
    code.extend_from_slice(&n.to_le_bytes()); // 00: mov ecx, n
    code.extend_from_slice(&[
        0x31, 0xc0, // 05: xor eax, eax
        0x31, 0xdb, // 07: xor ebx, ebx
        0x01, 0xc8, // 09: loop: add eax, ecx
        0x83, 0xc3, 0x01, // 0b: add ebx, 1
        0xff, 0xc9, // 0e: dec ecx
        0x75, 0xf7, // 10: jnz loop
        0xf4, // 12: hlt
    ]);
    code
}

#[test]
fn should_compile_flips_at_ten_dispatches() {
    let mut jit = X86Jit::new(config(BackendKind::Interp, 10)).unwrap();
    let answers: Vec<bool> = (0..12).map(|_| jit.should_compile(0x400)).collect();
    assert_eq!(answers[..9], [false; 9]);
    assert_eq!(answers[9..], [true; 3]);
}

#[test]
fn hot_loop_runs_compiled_with_identical_results() {
    let code = sum_program(100);
    let mut reference = X86Cpu::new(memory(&code));
    assert_eq!(reference.run(10_000), RunExit::Halted(HaltReason::Hlt));

    for backend in [BackendKind::Interp, BackendKind::Wasm] {
        let mut cpu = jit_cpu(&code, backend, 10);
        assert_eq!(cpu.run(10_000), RunExit::Halted(HaltReason::Hlt));
        assert_eq!(cpu.registers(), reference.registers(), "{backend:?}");
        assert_eq!(cpu.registers().get32(Gpr::Eax), 5050);

        let stats = cpu.jit().unwrap().engine().stats();
        assert_eq!(stats.compiles, 1, "{backend:?}");
        assert!(stats.compiled_executions > 80, "{backend:?}: {stats:?}");
        // Every iteration after the first enters the loop block at a leader, compiled or not.
        assert_eq!(cpu.jit().unwrap().engine().profile().count(&0x09), 99, "{backend:?}");
        assert!(cpu.jit_mut().unwrap().get_compiled_function(0x09).is_some());
    }
}

#[test]
fn compiled_block_is_skipped_when_it_exceeds_the_budget() {
    let code = sum_program(1000);
    let mut cpu = jit_cpu(&code, BackendKind::Interp, 2);
    assert_eq!(cpu.run(50), RunExit::BudgetExhausted);
    assert!(cpu.jit_mut().unwrap().get_compiled_function(0x09).is_some());

    let mut regs = cpu.registers();
    regs.eip = 0x09;
    cpu.set_registers(regs.clone());
    // The block is four instructions; a budget of one interprets the ADD alone.
    assert_eq!(cpu.run(1), RunExit::BudgetExhausted);
    assert_eq!(cpu.registers().eip, 0x0b);
    assert_eq!(
        cpu.registers().get32(Gpr::Eax),
        regs.get32(Gpr::Eax).wrapping_add(regs.get32(Gpr::Ecx))
    );
}

#[test]
fn blocks_with_leading_stack_ops_are_not_retried() {
    // loop: push eax; pop eax; jmp loop
    let code = [0x50, 0x58, 0xeb, 0xfc];
    let mut cpu = jit_cpu(&code, BackendKind::Interp, 3);
    let mut regs = cpu.registers();
    regs.set32(Gpr::Esp, 0x800);
    cpu.set_registers(regs);

    assert_eq!(cpu.run(300), RunExit::BudgetExhausted);
    let jit = cpu.jit().unwrap();
    assert!(jit.engine().is_aborted(&0));
    assert_eq!(jit.engine().stats().aborts, 1);
    assert_eq!(jit.engine().stats().compiles, 0);
}

#[test]
fn stack_writes_over_compiled_code_evict_the_block() {
    let code = [
        0x83, 0xc0, 0x01, // 00: add eax, 1
        0x83, 0xf8, 0x14, // 03: cmp eax, 20
        0x75, 0xf8, // 06: jnz 0
        0xbc, 0x08, 0x00, 0x00, 0x00, // 08: mov esp, 8
        0x6a, 0x00, // 0d: push 0 (overwrites bytes 4..8)
        0xf4, // 0f: hlt
    ];
    let mut cpu = jit_cpu(&code, BackendKind::Interp, 2);
    assert_eq!(cpu.run(1000), RunExit::Halted(HaltReason::Hlt));
    assert_eq!(cpu.registers().get32(Gpr::Eax), 20);

    let jit = cpu.jit().unwrap();
    assert_eq!(jit.engine().stats().compiles, 1);
    assert!(!jit.engine().cache().contains(&0));
}

#[test]
fn loading_new_code_replaces_compiled_block() {
    // 00: add eax, 1; jmp 0
    let mut cpu = jit_cpu(&[0x83, 0xc0, 0x01, 0xeb, 0xfb], BackendKind::Interp, 2);
    cpu.run(40);
    assert!(cpu.jit().unwrap().engine().cache().contains(&0));

    // 00: add eax, 2; jmp 0
    cpu.load(0, &[0x83, 0xc0, 0x02]).unwrap();
    assert!(!cpu.jit().unwrap().engine().cache().contains(&0));

    let before = cpu.registers().get32(Gpr::Eax);
    cpu.set_registers(X86Registers {
        eip: 0,
        ..cpu.registers()
    });
    cpu.run(20);
    assert_eq!(cpu.registers().get32(Gpr::Eax), before + 20);
}

#[test]
fn disabled_jit_never_compiles() {
    let code = sum_program(50);
    let config = JitConfig {
        enabled: false,
        ..config(BackendKind::Interp, 1)
    };
    let mut cpu = X86Cpu::with_jit(memory(&code), X86Jit::new(config).unwrap());
    assert_eq!(cpu.run(10_000), RunExit::Halted(HaltReason::Hlt));
    assert_eq!(cpu.jit().unwrap().engine().stats().compiles, 0);
    assert_eq!(cpu.registers().get32(Gpr::Eax), 1275);
}

/// Register-direct instructions the block compiler accepts. ECX is the loop counter and ESP is
/// left alone.
fn block_instruction() -> impl Strategy<Value = Vec<u8>> {
    let dst = prop::sample::select(vec![0u8, 2, 3, 5, 6, 7]);
    let src = 0u8..8;
    prop_oneof![
        (
            prop::sample::select(vec![0x01u8, 0x09, 0x21, 0x29, 0x31, 0x39, 0x85, 0x89]),
            dst.clone(),
            src.clone()
        )
            .prop_map(|(op, d, s)| vec![op, 0xc0 | (s << 3) | d]),
        (prop::sample::select(vec![0u8, 1, 4, 5, 6, 7]), dst.clone(), any::<u8>())
            .prop_map(|(ext, d, imm)| vec![0x83, 0xc0 | (ext << 3) | d, imm]),
        (prop::sample::select(vec![0u8, 1]), dst.clone())
            .prop_map(|(ext, d)| vec![0xff, 0xc0 | (ext << 3) | d]),
        (prop::sample::select(vec![2u8, 3]), dst.clone())
            .prop_map(|(ext, d)| vec![0xf7, 0xc0 | (ext << 3) | d]),
        (prop::sample::select(vec![4u8, 5, 7]), dst.clone(), any::<u8>())
            .prop_map(|(ext, d, n)| vec![0xc1, 0xc0 | (ext << 3) | d, n]),
        (dst.clone(), src).prop_map(|(d, s)| vec![0x0f, 0xaf, 0xc0 | (d << 3) | s]),
        (dst, any::<u32>()).prop_map(|(d, imm)| {
            let mut bytes = vec![0xb8 + d];
            bytes.extend_from_slice(&imm.to_le_bytes());
            bytes
        }),
    ]
}

/// `mov ecx, iterations; loop: <body>; dec ecx; jnz loop; hlt`
fn looped(body: &[Vec<u8>], iterations: u32) -> Vec<u8> {
    let mut code = vec![0xb9];
    code.extend_from_slice(&iterations.to_le_bytes());
    let loop_start = code.len();
    for inst in body {
        code.extend_from_slice(inst);
    }
    code.extend_from_slice(&[0xff, 0xc9, 0x75]);
    let disp = loop_start as i64 - (code.len() as i64 + 1);
    code.push(disp as i8 as u8);
    code.push(0xf4);
    code
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn compiled_blocks_match_the_interpreter(
        body in prop::collection::vec(block_instruction(), 1..12),
        gpr in prop::array::uniform8(any::<u32>()),
    ) {
        let code = looped(&body, 20);
        let start = X86Registers {
            gpr: gpr.map(u64::from),
            ..X86Registers::default()
        };

        let mut reference = X86Cpu::new(memory(&code));
        reference.set_registers(start.clone());
        let expected = reference.run(10_000);

        let mut cpu = jit_cpu(&code, BackendKind::Interp, 2);
        cpu.set_registers(start);
        prop_assert_eq!(cpu.run(10_000), expected);
        prop_assert_eq!(cpu.registers(), reference.registers());
        prop_assert!(cpu.jit().unwrap().engine().stats().compiled_executions > 0);
    }
}
