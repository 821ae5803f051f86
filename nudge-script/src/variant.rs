//! Variant selection — condition filtering plus weighted-random choice.

use rand::Rng;
use tracing::{debug, trace};

use crate::condition;
use crate::script::EventVariant;
use crate::types::VariableMap;

/// Pick a variant for an event.
///
/// Filters to variants whose conditions hold, then:
/// - zero survivors → `None` (the caller skips the event silently);
/// - one survivor → that variant, regardless of weight;
/// - several → weighted-random: a uniform draw in `[0, total_weight)`,
///   walking survivors and returning the first whose cumulative weight
///   exceeds the draw. A zero-weight variant is therefore only selectable
///   as the sole survivor.
#[must_use]
pub fn select<'a, R: Rng>(
    variants: &'a [EventVariant],
    variables: &VariableMap,
    rng: &mut R,
) -> Option<&'a EventVariant> {
    let survivors: Vec<&EventVariant> = variants
        .iter()
        .filter(|v| condition::evaluate(&v.conditions, variables))
        .collect();

    match survivors.as_slice() {
        [] => {
            trace!("no variant conditions satisfied");
            None
        }
        [only] => Some(only),
        _ => {
            let total: f64 = survivors.iter().map(|v| v.weight).sum();
            if total <= 0.0 {
                // Several survivors but no probability mass anywhere.
                debug!(survivors = survivors.len(), "all surviving variants have zero weight");
                return None;
            }
            let draw = rng.gen_range(0.0..total);
            let mut cumulative = 0.0;
            for variant in &survivors {
                cumulative += variant.weight;
                if draw < cumulative {
                    return Some(variant);
                }
            }
            // Float rounding at the top edge lands on the last survivor.
            survivors.last().copied()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::Script;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn variants(defs: &[(&str, f64, &str)]) -> Vec<EventVariant> {
        // (id, weight, conditions-json)
        defs.iter()
            .map(|(id, weight, cond)| EventVariant {
                id: (*id).to_string(),
                weight: *weight,
                conditions: serde_json::from_str(cond).expect("conditions"),
                messages: Vec::new(),
                set_variables: VariableMap::new(),
            })
            .collect()
    }

    #[test]
    fn no_survivor_is_silent_none() {
        let vs = variants(&[("a", 1.0, r#"{ "x": { "min": 5 } }"#)]);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(select(&vs, &VariableMap::new(), &mut rng).is_none());
    }

    #[test]
    fn sole_survivor_wins_even_with_zero_weight() {
        let vs = variants(&[
            ("a", 0.0, "{}"),
            ("b", 5.0, r#"{ "x": { "min": 5 } }"#),
        ]);
        let mut rng = StdRng::seed_from_u64(1);
        let picked = select(&vs, &VariableMap::new(), &mut rng).expect("sole survivor");
        assert_eq!(picked.id, "a");
    }

    #[test]
    fn zero_weight_never_picked_among_several() {
        let vs = variants(&[("a", 0.0, "{}"), ("b", 1.0, "{}")]);
        for seed in 0..64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let picked = select(&vs, &VariableMap::new(), &mut rng).expect("survivor");
            assert_eq!(picked.id, "b");
        }
    }

    #[test]
    fn weighted_proportions_converge() {
        // Weights [1, 1, 2] → roughly 25/25/50 over many draws.
        let vs = variants(&[("a", 1.0, "{}"), ("b", 1.0, "{}"), ("c", 2.0, "{}")]);
        let mut rng = StdRng::seed_from_u64(7);
        let mut counts = std::collections::HashMap::new();
        let n = 40_000;
        for _ in 0..n {
            let picked = select(&vs, &VariableMap::new(), &mut rng).expect("pick");
            *counts.entry(picked.id.clone()).or_insert(0usize) += 1;
        }
        let share = |id: &str| counts[id] as f64 / n as f64;
        assert!((share("a") - 0.25).abs() < 0.02, "a: {}", share("a"));
        assert!((share("b") - 0.25).abs() < 0.02, "b: {}", share("b"));
        assert!((share("c") - 0.50).abs() < 0.02, "c: {}", share("c"));
    }

    #[test]
    fn streak_scenario_is_deterministic() {
        // Two variants gated on streak; streak=7 leaves exactly one
        // survivor, so selection is deterministic under any seed.
        let script = Script::from_json(
            r#"{
                "id": "s", "version": "1",
                "daily_events": [ {
                    "id": "check_in",
                    "trigger": { "type": "time_window", "start": "06:00", "end": "12:00" },
                    "variants": [
                        { "id": "early", "weight": 1,
                          "conditions": { "streak": { "max": 4 } },
                          "messages": [ { "id": "m", "content": "Keep going!" } ] },
                        { "id": "seasoned", "weight": 1,
                          "conditions": { "streak": { "min": 5 } },
                          "messages": [ { "id": "m", "content": "A week strong!" } ] }
                    ]
                } ]
            }"#,
        )
        .expect("script");

        let mut vars = VariableMap::new();
        vars.insert("streak".to_string(), 7.into());
        for seed in 0..16 {
            let mut rng = StdRng::seed_from_u64(seed);
            let picked = select(&script.daily_events[0].variants, &vars, &mut rng)
                .expect("survivor");
            assert_eq!(picked.id, "seasoned");
        }
    }
}
