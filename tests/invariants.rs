//! Property-based checks of the conservation invariants from spec §8,
//! driven purely through the public API with randomized resource capacity
//! and process counts.

use proptest::prelude::*;
use simcore::prelude::*;

proptest! {
    /// `in_use = (total acquisitions) - (total releases) - (total preemptions)`
    /// must hold no matter how many processes contend for a non-preemptive
    /// resource, and the resource must fully drain once every process has
    /// released its unit.
    #[test]
    fn resource_conservation_holds_for_arbitrary_contention(
        capacity in 1u64..5,
        n_processes in 0u64..20,
    ) {
        let mut sim = Simulation::new(SimulationOptions::default());
        let r = sim.create_resource(capacity, ResourceOptions::default()).unwrap();
        for i in 0..n_processes {
            sim.process(move |h| {
                h.request(r, 0)?;
                h.timeout((i % 3) as f64)?;
                h.release(r)?;
                Ok(())
            });
        }
        sim.run(None).unwrap();
        let snap = sim.resource_snapshot(r);
        prop_assert_eq!(snap.in_use, 0);
        prop_assert!(snap.in_use <= snap.capacity);
        prop_assert_eq!(snap.total_requests - snap.total_releases - snap.total_preemptions, 0);
    }

    /// `level = initial_level + puts - gets`, and the level never leaves
    /// `[0, capacity]`, for arbitrary put/get amounts that individually fit
    /// within capacity.
    #[test]
    fn buffer_conservation_holds_for_arbitrary_put_get_sequences(
        capacity in 10.0f64..100.0,
        initial_level in 0.0f64..10.0,
        amounts in proptest::collection::vec(1.0f64..9.0, 0..15),
    ) {
        let mut sim = Simulation::new(SimulationOptions::default());
        let initial_level = initial_level.min(capacity);
        let buf = sim
            .create_buffer(capacity, BufferOptions { initial_level, ..Default::default() })
            .unwrap();
        for (i, amount) in amounts.iter().enumerate() {
            let amount = *amount;
            if i % 2 == 0 {
                sim.process(move |h| {
                    h.put(buf, amount, 0)?;
                    Ok(())
                });
            } else {
                sim.process(move |h| {
                    h.get(buf, amount, 0)?;
                    Ok(())
                });
            }
        }
        sim.run(Some(1000.0)).unwrap();
        let snap = sim.buffer_snapshot(buf);
        prop_assert!(snap.level >= 0.0);
        prop_assert!(snap.level <= snap.capacity);
        prop_assert!((sim.buffer_conserved_level(buf) - snap.level).abs() < 1e-9);
    }
}
