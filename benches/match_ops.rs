//! Benchmarks for matching and the decision cycle.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use cognit_kernel::agent::Agent;
use cognit_kernel::config::AgentConfig;
use cognit_kernel::cycle::RunUnit;
use cognit_kernel::production::ast::{Cond, RuleDef};

/// `n` rules that share their first two conditions.
fn shared_rules(n: usize) -> Vec<RuleDef> {
    (0..n)
        .map(|i| {
            RuleDef::new(format!("watch*{i}"))
                .when(Cond::state("<s>", "io", "<io>"))
                .when(Cond::new("<io>", "input-link", "<in>"))
                .when(Cond::new("<in>", "value", i as i64))
                .then_make("<s>", "seen", i as i64)
        })
        .collect()
}

fn bench_input_churn(c: &mut Criterion) {
    let mut agent = Agent::new(AgentConfig::default());
    agent.add_rules(&shared_rules(100)).unwrap();
    let link = agent.input_link();
    let value = agent.symbols_mut().string("value");
    let values: Vec<_> = (0..100).map(|i| agent.symbols_mut().int(i)).collect();

    c.bench_function("add_remove_100_inputs", |bench| {
        bench.iter(|| {
            let added: Vec<_> = values
                .iter()
                .map(|v| agent.add_input_wme(link, value, *v).unwrap())
                .collect();
            for w in added {
                black_box(agent.remove_input_wme(w).unwrap());
            }
        })
    });
}

fn bench_decisions(c: &mut Criterion) {
    c.bench_function("ten_decisions_100_rules", |bench| {
        bench.iter(|| {
            let mut agent = Agent::new(AgentConfig {
                wait_on_state_no_change: true,
                ..Default::default()
            });
            agent.add_rules(&shared_rules(100)).unwrap();
            let link = agent.input_link();
            let value = agent.symbols_mut().string("value");
            for i in 0..100 {
                let v = agent.symbols_mut().int(i);
                agent.add_input_wme(link, value, v).unwrap();
            }
            black_box(agent.run_for(10, RunUnit::Decision).unwrap())
        })
    });
}

fn bench_compile(c: &mut Criterion) {
    let rules = shared_rules(200);
    c.bench_function("compile_200_rules", |bench| {
        bench.iter(|| {
            let mut agent = Agent::new(AgentConfig::default());
            black_box(agent.add_rules(&rules).unwrap())
        })
    });
}

criterion_group!(benches, bench_input_churn, bench_decisions, bench_compile);
criterion_main!(benches);
