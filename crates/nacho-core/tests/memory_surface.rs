use nacho_core::{AccessKind, FlatMemory, MemoryFault, MemorySurface, SparseMemory};
use proptest::prelude::*;

#[test]
fn sparse_reads_do_not_allocate() {
    let mem = SparseMemory::new(0x10_0000);
    let mut buf = [0xffu8; 32];
    mem.read_bytes(0x2000, &mut buf).unwrap();
    assert_eq!(buf, [0u8; 32]);
    assert_eq!(mem.allocated_pages(), 0, "reads must not allocate");
}

#[test]
fn load_places_image_and_faults_past_the_end() {
    let mut mem = FlatMemory::new(0x100);
    mem.load(0xf0, &[0x90, 0xf4]).unwrap();
    assert_eq!(mem.read_u16(0xf0).unwrap(), 0xf490);

    let err = mem.load(0xff, &[1, 2]).unwrap_err();
    assert_eq!(
        err,
        MemoryFault {
            addr: 0xff,
            len: 2,
            kind: AccessKind::Write
        }
    );
    assert_eq!(mem.read_u8(0xff).unwrap(), 0);
}

#[derive(Clone, Debug)]
enum Op {
    Write(u64, Vec<u8>),
    Read(u64, usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u64..0x3000, proptest::collection::vec(any::<u8>(), 1..16)).prop_map(|(a, d)| Op::Write(a, d)),
        (0u64..0x3000, 1usize..16).prop_map(|(a, l)| Op::Read(a, l)),
    ]
}

proptest! {
    #[test]
    fn sparse_and_flat_memory_agree(ops in proptest::collection::vec(op(), 1..64)) {
        let mut flat = FlatMemory::new(0x3000);
        let mut sparse = SparseMemory::new(0x3000);
        for op in ops {
            match op {
                Op::Write(addr, data) => {
                    prop_assert_eq!(flat.write_bytes(addr, &data), sparse.write_bytes(addr, &data));
                }
                Op::Read(addr, len) => {
                    let mut a = vec![0u8; len];
                    let mut b = vec![0u8; len];
                    prop_assert_eq!(flat.read_bytes(addr, &mut a), sparse.read_bytes(addr, &mut b));
                    prop_assert_eq!(a, b);
                }
            }
        }
    }
}
