use criterion::{criterion_group, criterion_main, Criterion};
use fp_core::{NetworkPolicyRule, PolicyAction, TargetType};
use fp_policy::{evaluate, EgressTarget};
use uuid::Uuid;

fn sample_rules(n: usize) -> Vec<NetworkPolicyRule> {
    (0..n)
        .map(|i| NetworkPolicyRule {
            id: Uuid::new_v4(),
            project_id: None,
            action: if i % 2 == 0 {
                PolicyAction::Allow
            } else {
                PolicyAction::Deny
            },
            target_type: TargetType::Domain,
            target_value: format!("*.service-{i}.internal"),
            priority: i as i32,
            description: None,
        })
        .collect()
}

fn policy_eval_bench(c: &mut Criterion) {
    let rules = sample_rules(200);
    let miss = EgressTarget::Domain("nowhere.example.com".into());
    let hit = EgressTarget::Domain("api.service-150.internal".into());

    c.bench_function("policy_eval_miss_200_rules", |b| {
        b.iter(|| evaluate(&rules, &miss))
    });
    c.bench_function("policy_eval_hit_200_rules", |b| {
        b.iter(|| evaluate(&rules, &hit))
    });
}

criterion_group!(benches, policy_eval_bench);
criterion_main!(benches);
