use proptest::prelude::*;
use recovery_sync::{GuardedStateMachine, SyncError};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Node(u8);

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

fn machine_with(edges: &[(u8, u8)]) -> GuardedStateMachine<Node> {
    let mut machine = GuardedStateMachine::new(Node(0));
    for &(from, to) in edges {
        machine.add_transition(Node(from), Node(to));
    }
    machine
}

proptest! {
    #[test]
    fn prop_transition_succeeds_only_on_registered_edges(
        edges in prop::collection::vec((0u8..5, 0u8..5), 0..15),
        targets in prop::collection::vec(0u8..5, 1..40),
    ) {
        let machine = machine_with(&edges);
        let table: HashSet<(u8, u8)> = edges.iter().copied().collect();
        let mut expected = 0u8;

        for to in targets {
            let result = machine.transition(Node(to));
            if table.contains(&(expected, to)) {
                let change = result.unwrap();
                prop_assert_eq!(change.from, Node(expected));
                prop_assert_eq!(change.to, Node(to));
                expected = to;
            } else {
                let is_invalid = matches!(result, Err(SyncError::InvalidTransition { .. }));
                prop_assert!(is_invalid);
            }
            prop_assert_eq!(machine.state(), Node(expected));
        }
    }
}

#[test]
fn test_concurrent_transitions_never_interleave() {
    // Ring 0 -> 1 -> 2 -> 0; every thread tries to advance from whatever it observes
    let machine = Arc::new(machine_with(&[(0, 1), (1, 2), (2, 0)]));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let machine = Arc::clone(&machine);
            std::thread::spawn(move || {
                let mut applied = 0u32;
                for _ in 0..500 {
                    let next = Node((machine.state().0 + 1) % 3);
                    if let Ok(change) = machine.transition(next) {
                        assert_eq!((change.from.0 + 1) % 3, change.to.0);
                        applied += 1;
                    }
                }
                applied
            })
        })
        .collect();

    let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(machine.state(), Node(u8::try_from(total % 3).unwrap()));
}
