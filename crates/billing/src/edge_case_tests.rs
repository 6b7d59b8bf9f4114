// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Quota Ledger
//!
//! Tests critical boundary conditions in:
//! - Quota default and rate resolution (QMS-P01 to QMS-P04)
//! - Subscription intervals and retirement (QMS-S01 to QMS-S06)
//! - Plan change gate and carry-forward (QMS-C01 to QMS-C04)
//! - Usage arithmetic and overage (QMS-U01 to QMS-U05)

#[cfg(test)]
mod resolution_tests {
    use crate::plans::fixtures::*;
    use time::macros::datetime;
    use time::Duration;

    // =========================================================================
    // QMS-P01: Resolving twice at the same instant gives the same answer
    // =========================================================================
    #[test]
    fn test_resolution_is_idempotent() {
        let cpu = resource("cpu.hours", true);
        let disk = resource("data.size", false);
        let plan = plan(
            "Basic",
            vec![
                default(&cpu, 100.0, datetime!(2023-01-01 0:00 UTC)),
                default(&cpu, 120.0, datetime!(2024-01-01 0:00 UTC)),
                default(&disk, 10.0, datetime!(2023-06-01 0:00 UTC)),
            ],
            vec![],
        );
        let at = datetime!(2024-02-01 0:00 UTC);

        assert_eq!(plan.active_quota_values(at), plan.active_quota_values(at));
    }

    // =========================================================================
    // QMS-P02: Appending a future version never changes past resolutions
    // =========================================================================
    #[test]
    fn test_future_version_does_not_alter_history() {
        let cpu = resource("cpu.hours", true);
        let mut plan = plan(
            "Basic",
            vec![default(&cpu, 100.0, datetime!(2023-01-01 0:00 UTC))],
            vec![rate(5.0, datetime!(2023-01-01 0:00 UTC))],
        );
        let at = datetime!(2024-01-01 0:00 UTC);
        let before_values = plan.active_quota_values(at);
        let before_rate = plan.active_rate(at).cloned();

        plan.quota_defaults
            .push(default(&cpu, 10.0, at + Duration::days(1)));
        plan.rates.push(rate(50.0, at + Duration::days(1)));

        assert_eq!(plan.active_quota_values(at), before_values);
        assert_eq!(plan.active_rate(at).cloned(), before_rate);
    }

    // =========================================================================
    // QMS-P03: One nanosecond before a version takes effect, the old one holds
    // =========================================================================
    #[test]
    fn test_version_boundary() {
        let cpu = resource("cpu.hours", true);
        let switch = datetime!(2024-01-01 0:00 UTC);
        let plan = plan(
            "Basic",
            vec![
                default(&cpu, 100.0, datetime!(2023-01-01 0:00 UTC)),
                default(&cpu, 200.0, switch),
            ],
            vec![
                rate(1.0, datetime!(2023-01-01 0:00 UTC)),
                rate(2.0, switch),
            ],
        );

        let just_before = switch - Duration::nanoseconds(1);
        assert_eq!(
            plan.active_quota_values(just_before).get("cpu.hours"),
            Some(&100.0)
        );
        assert_eq!(plan.active_rate(just_before).map(|r| r.rate), Some(1.0));
        assert_eq!(plan.active_quota_values(switch).get("cpu.hours"), Some(&200.0));
        assert_eq!(plan.active_rate(switch).map(|r| r.rate), Some(2.0));
    }

    // =========================================================================
    // QMS-P04: A plan with no rates at all has no active rate
    // =========================================================================
    #[test]
    fn test_plan_without_rates() {
        let plan = plan("Empty", vec![], vec![]);
        assert!(plan.active_rate(datetime!(2024-01-01 0:00 UTC)).is_none());
        assert!(plan
            .active_quota_values(datetime!(2024-01-01 0:00 UTC))
            .is_empty());
    }
}

#[cfg(test)]
mod interval_tests {
    use crate::subscriptions::*;
    use qms_shared::{PlanId, SubscriptionId, UserId};
    use time::macros::datetime;
    use time::{Duration, OffsetDateTime};

    fn sub(start: OffsetDateTime, end: Option<OffsetDateTime>) -> Subscription {
        Subscription {
            id: SubscriptionId::new(),
            user_id: UserId::default(),
            plan_id: PlanId::default(),
            plan_rate_id: None,
            effective_start_date: start,
            effective_end_date: end,
            paid: false,
        }
    }

    fn apply(existing: &[Subscription], adjustments: &[IntervalAdjustment]) -> Vec<Subscription> {
        existing
            .iter()
            .map(|s| {
                match adjustments.iter().find(|a| a.subscription_id == s.id) {
                    Some(a) => Subscription {
                        effective_start_date: a.effective_start_date,
                        effective_end_date: a.effective_end_date,
                        ..s.clone()
                    },
                    None => s.clone(),
                }
            })
            .collect()
    }

    fn active_count(subs: &[Subscription], at: OffsetDateTime) -> usize {
        subs.iter().filter(|s| s.is_active_at(at)).count()
    }

    // =========================================================================
    // QMS-S01: After retire + install, every instant has at most one active
    // =========================================================================
    #[test]
    fn test_non_overlap_after_plan_change() {
        let base = datetime!(2024-01-01 0:00 UTC);
        let day = Duration::days(1);

        // A spread of existing layouts relative to a window [base+30d, base+395d)
        let layouts: Vec<Vec<Subscription>> = vec![
            vec![sub(base, None)],
            vec![sub(base, Some(base + day * 365))],
            vec![sub(base + day * 60, Some(base + day * 90))],
            vec![sub(base + day * 300, Some(base + day * 700))],
            vec![
                sub(base, Some(base + day * 40)),
                sub(base + day * 40, Some(base + day * 100)),
                sub(base + day * 100, None),
            ],
            vec![sub(base + day * 400, None)],
        ];

        let from = base + day * 30;
        let through = base + day * 395;

        for existing in layouts {
            let adjustments = plan_retirement(&existing, from, Some(through));
            let mut after = apply(&existing, &adjustments);
            after.push(sub(from, Some(through)));

            let mut at = base - day;
            while at < base + day * 800 {
                assert!(
                    active_count(&after, at) <= 1,
                    "more than one active subscription at {} in {:?}",
                    at,
                    after
                );
                at += day;
            }
        }
    }

    // =========================================================================
    // QMS-S02: Retirement never deletes; every row survives in some form
    // =========================================================================
    #[test]
    fn test_retirement_preserves_rows() {
        let base = datetime!(2024-01-01 0:00 UTC);
        let existing = vec![
            sub(base, None),
            sub(base + Duration::days(10), Some(base + Duration::days(20))),
        ];

        let adjustments = plan_retirement(&existing, base + Duration::days(5), None);
        let after = apply(&existing, &adjustments);
        assert_eq!(after.len(), existing.len());
        assert!(after[1].is_void());
    }

    // =========================================================================
    // QMS-S03: Adjusted intervals never end before they start
    // =========================================================================
    #[test]
    fn test_adjusted_intervals_well_formed() {
        let base = datetime!(2024-01-01 0:00 UTC);
        let existing = vec![
            sub(base, Some(base + Duration::days(50))),
            sub(base + Duration::days(60), Some(base + Duration::days(500))),
            sub(base + Duration::days(70), None),
        ];

        let adjustments = plan_retirement(
            &existing,
            base + Duration::days(20),
            Some(base + Duration::days(200)),
        );
        for adjustment in adjustments {
            if let Some(end) = adjustment.effective_end_date {
                assert!(end >= adjustment.effective_start_date, "{:?}", adjustment);
            }
        }
    }

    // =========================================================================
    // QMS-S04: A subscription starting exactly at the window start is voided,
    // not truncated to zero by accident of ordering
    // =========================================================================
    #[test]
    fn test_same_instant_replacement() {
        let now = datetime!(2024-05-05 12:00 UTC);
        let current = sub(now, Some(now + Duration::days(365)));

        let adjustments = plan_retirement(
            std::slice::from_ref(&current),
            now,
            Some(now + Duration::days(365)),
        );
        assert_eq!(adjustments.len(), 1);
        assert_eq!(adjustments[0].action, RetirementAction::Void);
    }

    // =========================================================================
    // QMS-S05: Leap day start plus one period lands on March 1
    // =========================================================================
    #[test]
    fn test_leap_day_period() {
        use crate::plans::fixtures::{plan, rate};

        let start = datetime!(2024-02-29 09:00 UTC);
        let p = plan("Basic", vec![], vec![rate(0.0, start)]);
        let planned = plan_subscription(&p, start, 1, None).unwrap();
        assert_eq!(planned.effective_end_date, datetime!(2025-03-01 09:00 UTC));
    }

    // =========================================================================
    // QMS-S06: Corrupted data with two active rows: latest start wins
    // =========================================================================
    #[test]
    fn test_latest_start_preferred_among_active() {
        let base = datetime!(2024-01-01 0:00 UTC);
        let older = sub(base, None);
        let newer = sub(base + Duration::days(10), None);
        let at = base + Duration::days(20);

        let chosen = [older, newer.clone()]
            .into_iter()
            .filter(|s| s.is_active_at(at))
            .max_by_key(|s| s.effective_start_date)
            .unwrap();
        assert_eq!(chosen.id, newer.id);
    }
}

#[cfg(test)]
mod plan_change_tests {
    use crate::plans::fixtures::*;
    use crate::quotas::*;
    use crate::subscriptions::*;
    use time::macros::datetime;

    // =========================================================================
    // QMS-C01: Downgrade (CPU 100 -> 50) is a no-op under the gate
    // =========================================================================
    #[test]
    fn test_downgrade_gated() {
        let cpu = resource("cpu.hours", true);
        let at = datetime!(2024-01-01 0:00 UTC);
        let plan_b = plan("B", vec![default(&cpu, 50.0, at)], vec![rate(1.0, at)]);

        let planned = plan_subscription(&plan_b, at, 1, None).unwrap();
        assert!(!is_upgrade(&planned.quotas, Some(100.0), "cpu.hours"));
    }

    // =========================================================================
    // QMS-C02: Upgrade (CPU 100 -> 200, storage 50 -> 30) keeps storage at 50
    // =========================================================================
    #[test]
    fn test_upgrade_carries_forward_larger_storage() {
        let cpu = resource("cpu.hours", true);
        let disk = resource("data.size", false);
        let at = datetime!(2024-01-01 0:00 UTC);
        let plan_a = plan(
            "A",
            vec![default(&cpu, 100.0, at), default(&disk, 50.0, at)],
            vec![rate(1.0, at)],
        );
        let plan_b = plan(
            "B",
            vec![default(&cpu, 200.0, at), default(&disk, 30.0, at)],
            vec![rate(2.0, at)],
        );

        let old = seed_from_plan(&plan_a, at, 1);
        let planned = plan_subscription(&plan_b, at, 1, None).unwrap();
        assert!(is_upgrade(&planned.quotas, Some(100.0), "cpu.hours"));

        let mut new = planned.quotas.clone();
        for target in carry_forward_targets(&old, &new) {
            match new
                .iter_mut()
                .find(|q| q.resource_type.id == target.resource_type.id)
            {
                Some(existing) => existing.quota = existing.quota.max(target.quota),
                None => new.push(target),
            }
        }

        let cpu_quota = new.iter().find(|q| q.resource_type.name == "cpu.hours");
        let disk_quota = new.iter().find(|q| q.resource_type.name == "data.size");
        assert_eq!(cpu_quota.map(|q| q.quota), Some(200.0));
        assert_eq!(disk_quota.map(|q| q.quota), Some(50.0));
    }

    // =========================================================================
    // QMS-C03: Carry-forward is monotonic for every held resource
    // =========================================================================
    #[test]
    fn test_carry_forward_monotonic() {
        let names = ["a", "b", "c", "d"];
        let types: Vec<_> = names.iter().map(|n| resource(n, true)).collect();
        let old: Vec<Quota> = types
            .iter()
            .zip([10.0, 20.0, 30.0, 40.0])
            .map(|(rt, quota)| Quota {
                resource_type: rt.clone(),
                quota,
            })
            .collect();
        let new: Vec<Quota> = types
            .iter()
            .take(3)
            .zip([15.0, 5.0, 30.0])
            .map(|(rt, quota)| Quota {
                resource_type: rt.clone(),
                quota,
            })
            .collect();

        let targets = carry_forward_targets(&old, &new);
        for held in &old {
            let granted = new
                .iter()
                .chain(targets.iter())
                .filter(|q| q.resource_type.id == held.resource_type.id)
                .map(|q| q.quota)
                .fold(f64::MIN, f64::max);
            assert!(granted >= held.quota, "{} shrank", held.resource_type.name);
        }
    }

    // =========================================================================
    // QMS-C04: Consumable scaling applies to the gate comparison
    // =========================================================================
    #[test]
    fn test_gate_uses_scaled_quota() {
        let cpu = resource("cpu.hours", true);
        let at = datetime!(2024-01-01 0:00 UTC);
        let plan_a = plan("A", vec![default(&cpu, 60.0, at)], vec![rate(1.0, at)]);

        let one_period = plan_subscription(&plan_a, at, 1, None).unwrap();
        let two_periods = plan_subscription(&plan_a, at, 2, None).unwrap();
        assert!(!is_upgrade(&one_period.quotas, Some(100.0), "cpu.hours"));
        assert!(is_upgrade(&two_periods.quotas, Some(100.0), "cpu.hours"));
    }
}

#[cfg(test)]
mod usage_tests {
    use crate::overage::*;
    use crate::plans::fixtures::resource;
    use crate::quotas::Quota;
    use crate::usage::*;
    use qms_shared::UpdateOperation;

    // =========================================================================
    // QMS-U01: ADD 10 then ADD 5 against quota 12 flips overage on the second
    // =========================================================================
    #[test]
    fn test_add_crosses_quota() {
        let cpu = resource("cpu.hours", true);
        let quotas = vec![Quota {
            resource_type: cpu.clone(),
            quota: 12.0,
        }];

        let after_first = UpdateOperation::Add.apply(0.0, 10.0);
        let usages = vec![Usage {
            resource_type: cpu.clone(),
            usage: after_first,
        }];
        assert!(evaluate_overages(&quotas, &usages).is_empty());

        let after_second = UpdateOperation::Add.apply(after_first, 5.0);
        let usages = vec![Usage {
            resource_type: cpu,
            usage: after_second,
        }];
        let overages = evaluate_overages(&quotas, &usages);
        assert_eq!(overages.len(), 1);
        assert_eq!(overages[0].usage, 15.0);
        assert_eq!(overages[0].quota, 12.0);
    }

    // =========================================================================
    // QMS-U02: Usage exactly equal to quota is an overage
    // =========================================================================
    #[test]
    fn test_usage_equal_to_quota() {
        assert!(is_over(Some(12.0), Some(12.0)));
    }

    // =========================================================================
    // QMS-U03: Zero quota with zero usage counts as over
    // =========================================================================
    #[test]
    fn test_zero_quota_zero_usage() {
        assert!(is_over(Some(0.0), Some(0.0)));
    }

    // =========================================================================
    // QMS-U04: SET after ADD replaces the accumulated value
    // =========================================================================
    #[test]
    fn test_set_replaces_accumulated() {
        let accumulated = UpdateOperation::Add.apply(UpdateOperation::Add.apply(0.0, 4.0), 4.0);
        assert_eq!(UpdateOperation::Set.apply(accumulated, 1.0), 1.0);
    }

    // =========================================================================
    // QMS-U05: Zero is a valid amount; negatives are not
    // =========================================================================
    #[test]
    fn test_amount_boundaries() {
        assert!(validate_amount(0.0).is_ok());
        assert!(validate_amount(-f64::MIN_POSITIVE).is_err());
    }
}
