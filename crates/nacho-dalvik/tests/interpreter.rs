use std::cell::RefCell;
use std::rc::Rc;

use nacho_core::{
    Cpu, CpuFault, GuestExceptionKind, HaltReason, ObjectRef, RunExit, RunState,
};
use nacho_dalvik::{DalvikConfig, DalvikError, DalvikInterpreter, DalvikRegisters, ExecOutcome};
use proptest::prelude::*;

fn code(units: &[u16]) -> Vec<u8> {
    units.iter().flat_map(|u| u.to_le_bytes()).collect()
}

fn vm() -> DalvikInterpreter {
    DalvikInterpreter::new(DalvikConfig::default())
}

fn run(units: &[u16]) -> (DalvikInterpreter, Result<ExecOutcome, DalvikError>) {
    let mut vm = vm();
    let outcome = vm.execute(&code(units), "test");
    (vm, outcome)
}

fn returned(value: u64) -> Result<ExecOutcome, DalvikError> {
    Ok(ExecOutcome {
        return_value: Some(value),
        halt: HaltReason::Returned,
        compiled: false,
    })
}

fn guest_exception(outcome: Result<ExecOutcome, DalvikError>) -> (u64, GuestExceptionKind) {
    match outcome {
        Err(DalvikError::Fault {
            fault: CpuFault::GuestException { pc, kind },
            ..
        }) => (pc, kind),
        other => panic!("expected a guest exception, got {other:?}"),
    }
}

proptest! {
    #[test]
    fn const4_loads_sign_extended_nibble(a in 0u16..16, lit in -8i8..=7) {
        let unit = ((((lit as u8 & 0xf) as u16) << 4 | a) << 8) | 0x12;
        let mut vm = vm();
        vm.load(&code(&[unit]), "const4");
        prop_assert_eq!(vm.step(), Ok(None));

        let regs = vm.registers();
        prop_assert_eq!(regs.pc, 2);
        prop_assert_eq!(regs.v[a as usize], lit as i32 as u32);
        let others = regs.v.iter().enumerate().filter(|(i, _)| *i != a as usize);
        for (_, v) in others {
            prop_assert_eq!(*v, 0);
        }
    }
}

#[test]
fn integer_arithmetic_follows_java_semantics() {
    let (vm, outcome) = run(&[
        0x0013, 1000, // const/16 v0, #1000
        0x0113, 0xfff9, // const/16 v1, #-7
        0x0290, 0x0100, // add-int v2, v0, v1
        0x03da, 0x0302, // mul-int/lit8 v3, v2, #3
        0x04d4, 7, // rem-int/lit16 v4, v0, #7
        0x06e0, 0x2101, // shl-int/lit8 v6, v1, #33
        0x07e2, 0x1c01, // ushr-int/lit8 v7, v1, #28
        0x08d1, 1, // rsub-int v8, v0, #1
        0x020f, // return v2
    ]);
    assert_eq!(outcome, returned(993));
    let v = &vm.regs().v;
    assert_eq!(v[3], 2979);
    assert_eq!(v[4], 6);
    assert_eq!(v[6], -14i32 as u32);
    assert_eq!(v[7], 0xf);
    assert_eq!(v[8], -999i32 as u32);
}

#[test]
fn min_int_divided_by_minus_one_wraps() {
    let (_, outcome) = run(&[
        0x0014, 0x0000, 0x8000, // const v0, #MIN
        0xf112, // const/4 v1, #-1
        0x0293, 0x0100, // div-int v2, v0, v1
        0x020f, // return v2
    ]);
    assert_eq!(outcome, returned(u64::from(i32::MIN as u32)));
}

#[test]
fn division_by_zero_is_reported_through_the_handler() {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&seen);
    let mut vm = vm();
    vm.set_interrupt_handler(Box::new(move |vector: u8, regs: &mut DalvikRegisters| {
        log.borrow_mut().push((vector, regs.pc));
    }));

    let outcome = vm.execute(
        &code(&[
            0x1012, // const/4 v0, #1
            0x0112, // const/4 v1, #0
            0x0293, 0x0100, // div-int v2, v0, v1
            0x020f,
        ]),
        "div",
    );
    assert_eq!(guest_exception(outcome), (4, GuestExceptionKind::DivideByZero));
    assert_eq!(*seen.borrow(), vec![(0x01, 4)]);
    assert_eq!(vm.state(), RunState::Idle);
}

#[test]
fn wide_values_use_register_pairs() {
    let (vm, outcome) = run(&[
        0x0018, 0xcdef, 0x89ab, 0x4567, 0x0123, // const-wide v0, #0x0123456789abcdef
        0x0216, 0xffff, // const-wide/16 v2, #-1
        0x049b, 0x0200, // add-long v4, v0, v2
        0x0410, // return-wide v4
    ]);
    assert_eq!(outcome, returned(0x0123_4567_89ab_cdee));
    assert_eq!(vm.regs().v[0..2], [0x89ab_cdef, 0x0123_4567]);
    assert_eq!(vm.regs().v[2..4], [u32::MAX, u32::MAX]);
}

#[test]
fn long_division_by_zero_raises() {
    let (_, outcome) = run(&[
        0x0016, 5, // const-wide/16 v0, #5
        0x0216, 0, // const-wide/16 v2, #0
        0x049e, 0x0200, // div-long v4, v0, v2
    ]);
    assert_eq!(guest_exception(outcome), (8, GuestExceptionKind::DivideByZero));
}

#[test]
fn float_conversions_saturate_and_compare_with_nan_bias() {
    let (vm, outcome) = run(&[
        0x0015, 0x7fc0, // const/high16 v0, NaN
        0x0187, // float-to-int v1, v0
        0x0215, 0x5f00, // const/high16 v2, 2^63
        0x2387, // float-to-int v3, v2
        0x042d, 0x0200, // cmpl-float v4, v0, v2
        0x052e, 0x0200, // cmpg-float v5, v0, v2
        0x0613, 200, // const/16 v6, #200
        0x678d, // int-to-byte v7, v6
        0xf912, // const/4 v9, #-1
        0x9a8e, // int-to-char v10, v9
        0x6b8f, // int-to-short v11, v6
        0x000e, // return-void
    ]);
    assert_eq!(
        outcome,
        Ok(ExecOutcome {
            return_value: None,
            halt: HaltReason::Returned,
            compiled: false,
        })
    );
    let v = &vm.regs().v;
    assert_eq!(v[1], 0);
    assert_eq!(v[3], i32::MAX as u32);
    assert_eq!(v[4], -1i32 as u32);
    assert_eq!(v[5], 1);
    assert_eq!(v[7], -56i32 as u32);
    assert_eq!(v[10], 0xffff);
    assert_eq!(v[11], 200);
}

#[test]
fn cmp_long_is_signed() {
    let (vm, _) = run(&[
        0x0016, 0xffff, // const-wide/16 v0, #-1
        0x0216, 1, // const-wide/16 v2, #1
        0x0431, 0x0200, // cmp-long v4, v0, v2
        0x0531, 0x0002, // cmp-long v5, v2, v0
        0x0631, 0x0000, // cmp-long v6, v0, v0
    ]);
    let v = &vm.regs().v;
    assert_eq!(v[4..7], [-1i32 as u32, 1, 0]);
}

#[test]
fn arrays_narrow_elements_and_tolerate_absent_references() {
    let (vm, outcome) = run(&[
        0x3012, // const/4 v0, #3
        0x0123, 0x0000, // new-array v1, v0, type@0
        0x1221, // array-length v2, v1
        0x0313, 200, // const/16 v3, #200
        0x1412, // const/4 v4, #1
        0x034f, 0x0401, // aput-byte v3, v1, v4
        0x0548, 0x0401, // aget-byte v5, v1, v4
        0x0649, 0x0401, // aget-char v6, v1, v4
        0x0744, 0x0001, // aget v7, v1, v0 (index 3 is out of range)
        0x034b, 0x0001, // aput v3, v1, v0 (dropped)
        0x0812, // const/4 v8, #0 (null)
        0x8921, // array-length v9, v8
        0x0a44, 0x0408, // aget v10, v8, v4
        0x034b, 0x0408, // aput v3, v8, v4 (dropped)
        0x000e,
    ]);
    assert!(outcome.is_ok(), "{outcome:?}");
    let v = &vm.regs().v;
    assert_eq!(v[2], 3);
    assert_eq!(v[5], -56i32 as u32);
    assert_eq!(v[6], 200);
    assert_eq!(v[7], 0);
    assert_eq!(v[9], 0);
    assert_eq!(v[10], 0);
    assert_eq!(vm.heap().len(), 1);
}

#[test]
fn negative_array_size_raises() {
    let (_, outcome) = run(&[
        0xf012, // const/4 v0, #-1
        0x0123, 0x0000, // new-array v1, v0
    ]);
    assert_eq!(guest_exception(outcome), (2, GuestExceptionKind::NegativeArraySize));
}

#[test]
fn filled_new_array_and_fill_array_data() {
    let (_, outcome) = run(&[
        0x5012, // 0: const/4 v0, #5
        0x6112, // 1: const/4 v1, #6
        0x2024, 0x0000, 0x0010, // 2: filled-new-array {v0, v1}, type@0
        0x020c, // 5: move-result-object v2
        0x1412, // 6: const/4 v4, #1
        0x0344, 0x0402, // 7: aget v3, v2, v4
        0x0226, 0x0008, 0x0000, // 9: fill-array-data v2, +8
        0x0544, 0x0402, // 12: aget v5, v2, v4
        0x0390, 0x0503, // 14: add-int v3, v3, v5
        0x030f, // 16: return v3
        0x0300, 4, 2, 0, 70, 0, 80, 0, // 17: array data payload
    ]);
    // 6 from the filled array, then 80 after the payload overwrote it.
    assert_eq!(outcome, returned(86));
}

#[test]
fn packed_switch_selects_case_or_falls_through() {
    let method = code(&[
        0x002b, 9, 0, // packed-switch v0, +9
        0x1112, 0x010f, // default: return 1
        0x2112, 0x010f, // case 10: return 2
        0x3112, 0x010f, // case 11: return 3
        0x0100, 2, 10, 0, 5, 0, 7, 0, // payload
    ]);
    for (key, expected) in [(10, 2), (11, 3), (12, 1), (-5, 1)] {
        let mut vm = vm();
        vm.regs_mut().v[0] = key as u32;
        assert_eq!(vm.execute(&method, "switch"), returned(expected), "key {key}");
    }
}

#[test]
fn sparse_switch_matches_exact_keys() {
    let method = code(&[
        0x002c, 9, 0, // sparse-switch v0, +9
        0x1112, 0x010f, // default: return 1
        0x2112, 0x010f, // case -1: return 2
        0x3112, 0x010f, // case 1000: return 3
        0x0200, 2, 0xffff, 0xffff, 1000, 0, 5, 0, 7, 0, // payload
    ]);
    for (key, expected) in [(-1, 2), (1000, 3), (0, 1)] {
        let mut vm = vm();
        vm.regs_mut().v[0] = key as u32;
        assert_eq!(vm.execute(&method, "switch"), returned(expected), "key {key}");
    }
}

#[test]
fn unknown_opcode_is_skipped() {
    let (vm, outcome) = run(&[
        0x003e, // unused opcode
        0x1012, // const/4 v0, #1
        0x000f, // return v0
    ]);
    assert_eq!(outcome, returned(1));
    assert_eq!(vm.regs().pc, 4);
}

#[test]
fn invoke_and_field_access_only_advance() {
    let mut vm = vm();
    vm.regs_mut().result = 99;
    vm.load(
        &code(&[
            0x7012, // 0: const/4 v0, #7
            0x1071, 0x0003, 0x0000, // 2: invoke-static {v0}, meth@3
            0x010b, // 8: move-result v1
            0x0252, 0x0001, // 10: iget v2, v0, field@1
            0x0067, 0x0002, // 14: sput v0, field@2
            0x0374, 0x0004, 0x0000, // 18: invoke-virtual/range {v0 .. v2}
            0x5312, // 24: const/4 v3, #5
            0x030f, // 26: return v3
        ]),
        "calls",
    );
    let mut pcs = Vec::new();
    loop {
        let halt = vm.step().unwrap();
        pcs.push(vm.regs().pc);
        if halt.is_some() {
            break;
        }
    }
    assert_eq!(pcs, vec![2, 8, 10, 14, 18, 24, 26, 26]);
    assert_eq!(vm.regs().v[..4], [7, 0, 0, 5]);
    assert_eq!(vm.return_value(), Some(5));
}

#[test]
fn instance_of_checks_for_null() {
    let (vm, _) = run(&[
        0x0022, 0x0001, // new-instance v0, type@1
        0x0120, 0x0000, // instance-of v1, v0, type@0
        0x0212, // const/4 v2, #0
        0x2320, 0x0000, // instance-of v3, v2, type@0
    ]);
    assert_eq!(vm.regs().v[1], 1);
    assert_eq!(vm.regs().v[3], 0);
}

#[test]
fn throw_records_the_exception() {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&seen);
    let mut vm = vm();
    vm.set_interrupt_handler(Box::new(move |vector: u8, regs: &mut DalvikRegisters| {
        log.borrow_mut().push((vector, regs.exception));
    }));
    let outcome = vm.execute(
        &code(&[
            0x0022, 0x0001, // new-instance v0, type@1
            0x0027, // throw v0
        ]),
        "thrower",
    );
    let object = vm.regs().v[0];
    assert_ne!(object, 0);
    assert_eq!(guest_exception(outcome), (4, GuestExceptionKind::Throw { object }));
    assert_eq!(*seen.borrow(), vec![(0x00, object)]);
    assert_eq!(vm.regs().exception, object);
}

#[test]
fn running_off_the_end_halts() {
    let (_, outcome) = run(&[0x1012]);
    assert_eq!(
        outcome,
        Ok(ExecOutcome {
            return_value: None,
            halt: HaltReason::EndOfCode,
            compiled: false,
        })
    );
}

#[test]
fn malformed_code_is_a_decode_fault() {
    // goto +10 leaves the method
    let (_, outcome) = run(&[0x0a28]);
    assert!(matches!(
        outcome,
        Err(DalvikError::Fault {
            fault: CpuFault::Decode(_),
            ..
        })
    ));

    // const needs three code units
    let (_, outcome) = run(&[0x0014, 0x0001]);
    assert!(matches!(
        outcome,
        Err(DalvikError::Fault {
            fault: CpuFault::Decode(_),
            ..
        })
    ));
}

#[test]
fn instruction_limit_stops_infinite_loops() {
    let mut vm = DalvikInterpreter::new(DalvikConfig {
        max_instructions: 1000,
        ..DalvikConfig::default()
    });
    // goto +0
    let outcome = vm.execute(&code(&[0x0028]), "spin");
    assert_eq!(
        outcome,
        Err(DalvikError::InstructionLimit {
            method: "spin".into(),
            limit: 1000,
        })
    );
    assert_eq!(vm.state(), RunState::Idle);
}

#[test]
fn cpu_interface_runs_a_loaded_frame() {
    let mut vm = vm();
    vm.load(&code(&[0x1012, 0x2112, 0x010f]), "m");
    assert_eq!(vm.run(1), RunExit::BudgetExhausted);
    assert_eq!(vm.state(), RunState::Running);
    assert_eq!(vm.run(10), RunExit::Halted(HaltReason::Returned));
    assert_eq!(vm.return_value(), Some(2));
    assert_eq!(vm.state(), RunState::Idle);

    vm.reset();
    assert_eq!(vm.registers(), DalvikRegisters::new(256));
    assert_eq!(vm.method(), Some("m"));
}

#[test]
fn reset_drops_heap_objects() {
    let mut vm = vm();
    // const/4 v0, #3; new-array v1, v0, type@0; return-void
    let method = code(&[0x3012, 0x0123, 0x0000, 0x000e]);
    vm.execute(&method, "alloc").unwrap();
    let array = ObjectRef::from_bits(vm.regs().v[1]);
    assert_eq!(vm.heap().array_len(array), Some(3));

    vm.reset();
    assert!(vm.heap().is_empty());
    assert_eq!(vm.heap().array_len(array), None);

    vm.execute(&method, "alloc").unwrap();
    assert_eq!(vm.heap().len(), 1);
    assert_ne!(vm.regs().v[1], array.bits());
}
