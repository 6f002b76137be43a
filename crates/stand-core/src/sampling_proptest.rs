#[cfg(test)]
mod proptest_sampling {
    use crate::averager::BoundedAverager;
    use crate::cadence::CadenceGate;
    use crate::command::Command;
    use crate::pulse::{PulseRegistry, RpmChannel};
    use crate::telemetry::TelemetryRecord;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(2000))]

        // Property: value() is the mean of the last N samples once warm
        #[test]
        fn averager_tracks_last_window(
            samples in prop::collection::vec(-1.0e4f64..1.0e4, 4..64),
        ) {
            let mut avg = BoundedAverager::<4>::new();
            for s in &samples {
                avg.add_sample(*s);
            }
            let tail = &samples[samples.len() - 4..];
            let expected = tail.iter().sum::<f64>() / 4.0;
            prop_assert!((avg.value() - expected).abs() < 1e-6);
            prop_assert!(avg.is_warm());
        }

        // Property: consecutive fires are never closer than the interval
        #[test]
        fn gate_fires_at_most_once_per_interval(
            interval in 0u64..500,
            steps in prop::collection::vec(0u64..50, 1..200),
        ) {
            let mut gate = CadenceGate::new(interval);
            let mut now = 0u64;
            let mut last: Option<u64> = None;
            for step in steps {
                now += step;
                if let Some(elapsed) = gate.poll(now) {
                    if let Some(prev) = last {
                        prop_assert!(now - prev >= interval);
                        prop_assert_eq!(elapsed, now - prev);
                    }
                    last = Some(now);
                }
            }
        }

        // Property: edges spaced at or beyond the debounce are all counted
        #[test]
        fn spaced_edges_never_lost(
            debounce in 1u64..5_000,
            gaps in prop::collection::vec(0u64..10_000, 1..100),
        ) {
            let mut registry = PulseRegistry::<1>::new();
            let edge = registry.register(2, debounce).unwrap();
            let counter = registry.counter(2).unwrap();
            let mut t = 0u64;
            for gap in &gaps {
                t += debounce + gap;
                prop_assert!(edge.on_edge(t));
            }
            prop_assert_eq!(counter.take() as usize, gaps.len());
            prop_assert_eq!(counter.rejected(), 0);
        }

        // Property: the rate is always finite, whatever the elapsed time
        #[test]
        fn rpm_is_always_finite(
            intervals in prop::collection::vec(0u64..300, 1..40),
            blades in 0u32..8,
        ) {
            let mut registry = PulseRegistry::<1>::new();
            let edge = registry.register(2, 0).unwrap();
            let mut rpm = RpmChannel::<8>::new(0, registry.counter(2).unwrap());
            let mut now = 0u64;
            for dt in intervals {
                now += dt;
                edge.on_edge(now * 1_000);
                rpm.tick(now);
                prop_assert!(rpm.rpm(blades).is_finite());
                prop_assert!(rpm.rpm(blades) >= 0.0);
            }
        }

        // Property: the parser never panics on arbitrary input
        #[test]
        fn command_parser_total(line in "\\PC{0,24}") {
            let _ = line.parse::<Command>();
        }

        // Property: telemetry lines read back what was written
        #[test]
        fn telemetry_line_parses_back(
            ts in 0u64..10_000_000,
            load in -5_000.0f64..5_000.0,
            amps in 0.0f64..60.0,
            volts in 0.0f64..30.0,
            rpm in 0.0f64..30_000.0,
        ) {
            let record = TelemetryRecord {
                timestamp_ms: ts,
                load_g: load,
                current_a: amps,
                voltage_v: volts,
                rpm,
                sequence: None,
            };
            let parsed: TelemetryRecord = record.to_string().parse().unwrap();
            prop_assert_eq!(parsed.timestamp_ms, ts);
            prop_assert!((parsed.load_g - load).abs() <= 0.05 + 1e-9);
            prop_assert!((parsed.voltage_v - volts).abs() <= 0.0005 + 1e-9);
        }
    }

    #[test]
    fn concurrent_take_loses_no_pulses() {
        let mut registry = PulseRegistry::<1>::new();
        let edge = registry.register(2, 0).unwrap();
        let counter = registry.counter(2).unwrap();
        let edges = 200_000u64;

        let producer = {
            let edge = edge.clone();
            thread::spawn(move || {
                for t in 0..edges {
                    edge.on_edge(t);
                }
            })
        };

        let drainer = {
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                let mut total = 0u64;
                for _ in 0..10_000 {
                    total += counter.take() as u64;
                    thread::yield_now();
                }
                total
            })
        };

        producer.join().unwrap();
        let drained = drainer.join().unwrap();
        assert_eq!(drained + counter.take() as u64, edges);
    }
}
