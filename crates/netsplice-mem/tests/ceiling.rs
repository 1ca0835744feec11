use netsplice_mem::{MemError, MemoryBudget, Tracking};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Alloc(usize),
    Contig(usize),
    Grow(usize),
    Free(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..3000).prop_map(Op::Alloc),
        (0usize..9000).prop_map(Op::Contig),
        (0usize..2000).prop_map(Op::Grow),
        any::<usize>().prop_map(Op::Free),
    ]
}

proptest! {
    #[test]
    fn admission_matches_model(
        ops in proptest::collection::vec(op(), 1..64),
        tracked in any::<bool>(),
    ) {
        const CEILING: usize = 16 * 1024;
        let tracking = if tracked { Tracking::Ledger } else { Tracking::Off };
        let budget = MemoryBudget::with_tracking(CEILING, tracking);
        let mut live = Vec::new();
        let mut model = 0usize;

        for op in ops {
            match op {
                Op::Alloc(size) => {
                    let fits = model + size <= CEILING;
                    match budget.alloc(size) {
                        Ok(block) => {
                            prop_assert!(fits);
                            model += block.len();
                            live.push(block);
                        }
                        Err(MemError::OutOfMemory { .. }) => prop_assert!(!fits),
                        Err(other) => prop_assert!(false, "unexpected error {other:?}"),
                    }
                }
                Op::Contig(size) => {
                    let rounded = size.div_ceil(4096) * 4096;
                    let fits = model + rounded <= CEILING;
                    match budget.alloc_contig(size) {
                        Ok(block) => {
                            prop_assert!(fits);
                            prop_assert_eq!(block.len(), rounded);
                            model += block.len();
                            live.push(block);
                        }
                        Err(_) => prop_assert!(!fits),
                    }
                }
                Op::Grow(extra) => {
                    if let Some(block) = live.iter_mut().find(|b| b.kind() == netsplice_mem::AllocKind::Plain) {
                        let old = block.len();
                        let fits = model + extra <= CEILING;
                        match block.resize(old + extra) {
                            Ok(()) => {
                                prop_assert!(fits);
                                model += extra;
                            }
                            Err(_) => {
                                prop_assert!(!fits);
                                prop_assert_eq!(block.len(), old);
                            }
                        }
                    }
                }
                Op::Free(pick) => {
                    if !live.is_empty() {
                        let block = live.swap_remove(pick % live.len());
                        model -= block.len();
                    }
                }
            }
            prop_assert_eq!(budget.outstanding(), model);
        }

        drop(live);
        let stats = budget.stats();
        prop_assert_eq!(stats.outstanding, 0);
        prop_assert_eq!(stats.allocations, stats.frees);
        prop_assert!(budget.check_for_leaks().is_empty());
    }
}
