#![cfg(not(target_arch = "wasm32"))]

use std::sync::Arc;

use nacho_core::{CpuFault, GuestExceptionKind, HaltReason};
use nacho_jit::{BackendKind, JitConfig};
use nacho_dalvik::{DalvikConfig, DalvikError, DalvikInterpreter, DalvikJit};
use proptest::prelude::*;

fn code(units: &[u16]) -> Vec<u8> {
    units.iter().flat_map(|u| u.to_le_bytes()).collect()
}

fn jit_config(backend: BackendKind, threshold: u64) -> JitConfig {
    JitConfig {
        hot_threshold: threshold,
        backend,
        ..JitConfig::dalvik()
    }
}

fn jit_vm(backend: BackendKind, threshold: u64) -> DalvikInterpreter {
    DalvikInterpreter::from_config(DalvikConfig {
        jit: jit_config(backend, threshold),
        ..DalvikConfig::default()
    })
    .unwrap()
}

/// v0 = v2 + (v2 - 1) + ... + 1, counting v2 down to zero.
fn sum_method() -> Vec<u8> {
    code(&[
        0x0012, // 0: const/4 v0, #0
        0x023d, 0x0006, // 2: if-lez v2, +6
        0x20b0, // 6: add-int/2addr v0, v2
        0x02d8, 0xff02, // 8: add-int/lit8 v2, v2, #-1
        0xfb28, // 12: goto -5
        0x000f, // 14: return v0
    ])
}

#[test]
fn should_compile_flips_at_one_hundred_invocations() {
    let mut jit = DalvikJit::new(jit_config(BackendKind::Interp, 100)).unwrap();
    let answers: Vec<bool> = (0..102).map(|_| jit.should_compile("hot")).collect();
    assert!(answers[..99].iter().all(|hot| !hot));
    assert!(answers[99..].iter().all(|hot| *hot));
}

#[test]
fn hot_method_switches_to_compiled_code() {
    let method = sum_method();
    for backend in [BackendKind::Interp, BackendKind::Wasm] {
        let mut vm = jit_vm(backend, 100);
        for call in 1..=105 {
            vm.regs_mut().v[2] = 10;
            let outcome = vm.execute(&method, "sum").unwrap();
            assert_eq!(outcome.return_value, Some(55), "{backend:?} call {call}");
            assert_eq!(outcome.compiled, call > 100, "{backend:?} call {call}");
            assert_eq!(vm.regs().v[..3], [55, 0, 0]);
        }
        let engine = vm.jit().unwrap().engine();
        assert_eq!(engine.stats().compiles, 1, "{backend:?}");
        assert_eq!(engine.stats().compiled_executions, 5, "{backend:?}");
        assert_eq!(engine.profile().count(&"sum".to_string()), 105, "{backend:?}");
    }
}

#[test]
fn compiled_calls_report_like_interpreted_ones() {
    // const/4 v1, 7; return v1
    let returns_seven = code(&[0x7112, 0x010f]);
    // const/4 v3, 1 and then off the end of the method
    let falls_off = code(&[0x1312]);

    for backend in [BackendKind::Interp, BackendKind::Wasm] {
        let mut vm = jit_vm(backend, 1);
        let first = vm.execute(&falls_off, "m").unwrap();
        assert_eq!((first.halt, first.compiled), (HaltReason::EndOfCode, false));

        let seven = vm.execute(&returns_seven, "r").unwrap();
        assert_eq!(seven.return_value, Some(7));
        assert_eq!(vm.return_value(), Some(7));

        let second = vm.execute(&falls_off, "m").unwrap();
        assert!(second.compiled, "{backend:?}");
        assert_eq!(second.halt, HaltReason::EndOfCode, "{backend:?}");
        assert_eq!(second.return_value, None);
        assert_eq!(vm.return_value(), None, "{backend:?}");

        let seven = vm.execute(&returns_seven, "r").unwrap();
        assert!(seven.compiled);
        assert_eq!(seven.halt, HaltReason::Returned);
        assert_eq!(vm.return_value(), Some(7));
    }
}

#[test]
fn warm_cache_returns_the_same_unit() {
    let mut jit = DalvikJit::new(jit_config(BackendKind::Interp, 100)).unwrap();
    let first = jit.compile_method("sum", &sum_method()).unwrap();
    let second = jit.compile_method("sum", &sum_method()).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(jit.engine().stats().compiles, 1);
    assert!(Arc::ptr_eq(&jit.get_compiled_method("sum").unwrap(), &first));
}

#[test]
fn untranslatable_method_is_not_retried() {
    // div-int v2, v0, v1; return v2
    let method = code(&[0x0293, 0x0100, 0x020f]);
    let mut vm = jit_vm(BackendKind::Interp, 10);
    for _ in 0..50 {
        vm.regs_mut().v[1] = 3;
        let outcome = vm.execute(&method, "div").unwrap();
        assert!(!outcome.compiled);
    }
    let jit = vm.jit().unwrap();
    assert!(jit.engine().is_aborted(&"div".to_string()));
    assert_eq!(jit.engine().stats().aborts, 1);
    assert_eq!(jit.engine().stats().compiles, 0);
}

#[test]
fn failing_compiled_method_is_evicted_and_interpreted() {
    let method = code(&[
        0x0123, 0x0000, // new-array v1, v0, type@0
        0x1221, // array-length v2, v1
        0x020f, // return v2
    ]);
    let mut vm = jit_vm(BackendKind::Interp, 2);
    let call = |vm: &mut DalvikInterpreter, len: i32| {
        vm.regs_mut().v[0] = len as u32;
        vm.execute(&method, "alloc")
    };

    for _ in 0..2 {
        assert!(!call(&mut vm, 3).unwrap().compiled);
    }
    let outcome = call(&mut vm, 3).unwrap();
    assert!(outcome.compiled);
    assert_eq!(outcome.return_value, Some(3));

    // The compiled unit traps; the interpreter then raises the guest exception.
    let before = vm.regs().clone();
    let err = call(&mut vm, -1).unwrap_err();
    assert!(matches!(
        err,
        DalvikError::Fault {
            fault: CpuFault::GuestException {
                kind: GuestExceptionKind::NegativeArraySize,
                ..
            },
            ..
        }
    ));
    assert_eq!(vm.regs().v[1..3], before.v[1..3]);
    assert!(!vm.jit().unwrap().engine().cache().contains(&"alloc".to_string()));

    // The method is profiled from scratch and compiled again once hot.
    let outcome = call(&mut vm, 4).unwrap();
    assert!(!outcome.compiled);
    assert_eq!(outcome.return_value, Some(4));
    assert!(call(&mut vm, 5).unwrap().compiled);
    assert_eq!(vm.jit().unwrap().engine().stats().compiles, 2);
}

#[test]
fn disabled_jit_only_interprets() {
    let mut vm = DalvikInterpreter::from_config(DalvikConfig {
        jit: JitConfig {
            enabled: false,
            ..jit_config(BackendKind::Interp, 1)
        },
        ..DalvikConfig::default()
    })
    .unwrap();
    for _ in 0..5 {
        vm.regs_mut().v[2] = 4;
        assert!(!vm.execute(&sum_method(), "sum").unwrap().compiled);
    }
    assert_eq!(vm.jit().unwrap().engine().stats().compiles, 0);
}

/// Straight-line int instructions over v0..v3 that the method compiler accepts.
fn int_instruction() -> impl Strategy<Value = Vec<u16>> {
    let reg = 0u16..4;
    prop_oneof![
        (
            prop::sample::select(vec![0x90u16, 0x91, 0x92, 0x95, 0x96, 0x97, 0x98, 0x99, 0x9a]),
            reg.clone(),
            reg.clone(),
            reg.clone()
        )
            .prop_map(|(op, a, b, c)| vec![(a << 8) | op, (c << 8) | b]),
        (
            prop::sample::select(vec![0xb0u16, 0xb1, 0xb2, 0xb5, 0xb6, 0xb7, 0xb8, 0xb9, 0xba]),
            reg.clone(),
            reg.clone()
        )
            .prop_map(|(op, a, b)| vec![(((b << 4) | a) << 8) | op]),
        (
            prop::sample::select(vec![0xd8u16, 0xd9, 0xda, 0xdd, 0xde, 0xdf, 0xe0, 0xe1, 0xe2]),
            reg.clone(),
            reg.clone(),
            any::<i8>()
        )
            .prop_map(|(op, a, b, lit)| vec![(a << 8) | op, (u16::from(lit as u8) << 8) | b]),
        (
            prop::sample::select(vec![0xd0u16, 0xd1, 0xd2, 0xd5, 0xd6, 0xd7]),
            reg.clone(),
            reg.clone(),
            any::<i16>()
        )
            .prop_map(|(op, a, b, lit)| vec![(((b << 4) | a) << 8) | op, lit as u16]),
        (
            prop::sample::select(vec![0x01u16, 0x7b, 0x7c, 0x8d, 0x8e, 0x8f]),
            reg.clone(),
            reg.clone()
        )
            .prop_map(|(op, a, b)| vec![(((b << 4) | a) << 8) | op]),
        (reg, any::<i16>()).prop_map(|(a, imm)| vec![(a << 8) | 0x13, imm as u16]),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn compiled_methods_match_the_interpreter(
        body in prop::collection::vec(int_instruction(), 1..24),
        returns in any::<bool>(),
        init in prop::array::uniform4(any::<u32>()),
    ) {
        let mut units: Vec<u16> = body.concat();
        if returns {
            units.push(0x000f); // return v0
        }
        let method = code(&units);

        let mut interp = DalvikInterpreter::new(DalvikConfig {
            register_count: 4,
            ..DalvikConfig::default()
        });
        interp.regs_mut().v.copy_from_slice(&init);
        let expected = interp.execute(&method, "p").unwrap();

        let mut vm = DalvikInterpreter::from_config(DalvikConfig {
            register_count: 4,
            jit: jit_config(BackendKind::Interp, 1),
            ..DalvikConfig::default()
        })
        .unwrap();
        vm.regs_mut().v.copy_from_slice(&init);
        prop_assert!(!vm.execute(&method, "p").unwrap().compiled);

        vm.regs_mut().v.copy_from_slice(&init);
        let actual = vm.execute(&method, "p").unwrap();
        prop_assert!(actual.compiled);
        prop_assert_eq!(actual.return_value, expected.return_value);
        prop_assert_eq!(actual.halt, expected.halt);
        prop_assert_eq!(vm.return_value(), interp.return_value());
        prop_assert_eq!(&vm.regs().v, &interp.regs().v);
    }
}
