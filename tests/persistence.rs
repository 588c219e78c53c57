//! Save/reload tests.
//!
//! These verify that an agent written out mid-run and read back continues
//! exactly as the original would have, both through raw snapshot bytes and
//! through the on-disk snapshot store.

use cognit_kernel::agent::Agent;
use cognit_kernel::config::AgentConfig;
use cognit_kernel::cycle::RunUnit;
use cognit_kernel::persist::SnapshotStore;
use cognit_kernel::production::ast::{Cond, RuleDef};
use cognit_kernel::production::{PreferenceType, ProductionKind};

/// Four indifferent tasks; applying one marks it done.
fn task_rules() -> Vec<RuleDef> {
    let mut rules: Vec<RuleDef> = ["a", "b", "c", "d"]
        .into_iter()
        .map(|task| {
            RuleDef::new(format!("propose*{task}"))
                .when(Cond::state("<s>", "superstate", "nil"))
                .when(Cond::not("<s>", "done", task))
                .then_make("<s>", "operator", "<o>")
                .then_make("<o>", "name", task)
                .then_prefer("<s>", "operator", "<o>", PreferenceType::UnaryIndifferent)
        })
        .collect();
    rules.push(
        RuleDef::new("apply*task")
            .when(Cond::state("<s>", "operator", "<o>"))
            .when(Cond::new("<o>", "name", "<n>"))
            .then_make("<s>", "done", "<n>")
            .then_call("write", vec!["<n>".into()]),
    );
    rules
}

fn task_agent(seed: u64) -> Agent {
    let mut agent = Agent::new(AgentConfig {
        seed,
        ..Default::default()
    });
    agent.add_rules(&task_rules()).unwrap();
    agent
}

#[test]
fn reloaded_agent_continues_like_the_original() {
    let mut original = task_agent(11);
    original.run_for(2, RunUnit::Decision).unwrap();
    let bytes = original.save().unwrap();
    let early_output = original.take_output_text();

    original.run_for(4, RunUnit::Decision).unwrap();

    let mut restored = Agent::new(AgentConfig::default());
    restored.load(&bytes).unwrap();
    assert_eq!(restored.config().seed, 11);
    assert_eq!(restored.take_output_text(), early_output);
    restored.run_for(4, RunUnit::Decision).unwrap();

    assert_eq!(restored.render_wmes(), original.render_wmes());
    assert_eq!(restored.firing_counts(), original.firing_counts());
    assert_eq!(restored.stats().decisions, original.stats().decisions);
    assert_eq!(restored.take_output_text(), original.take_output_text());
}

#[test]
fn every_task_is_applied_exactly_once() {
    let mut agent = task_agent(3);
    agent.run_for(6, RunUnit::Decision).unwrap();
    assert_eq!(agent.firing_count("apply*task"), Some(4));
    let done = agent.symbols_mut().string("done");
    assert_eq!(agent.find_wmes(None, Some(done), None).len(), 4);
}

#[test]
fn store_survives_reopen() {
    let dir = tempfile::TempDir::new().unwrap();

    let counts;
    // First session: run and save.
    {
        let store = SnapshotStore::open(dir.path()).unwrap();
        let mut agent = task_agent(5);
        agent.run_for(3, RunUnit::Decision).unwrap();
        counts = agent.firing_counts();
        store.save("midway", &agent).unwrap();
    }

    // Second session: reopen and restore.
    {
        let store = SnapshotStore::open(dir.path()).unwrap();
        assert_eq!(store.names().unwrap(), vec!["midway".to_string()]);
        let mut agent = Agent::new(AgentConfig::default());
        store.load("midway", &mut agent).unwrap();
        assert_eq!(agent.firing_counts(), counts);
        assert_eq!(agent.stats().decisions, 3);

        assert!(store.load("missing", &mut agent).is_err());
        assert!(store.delete("midway").unwrap());
        assert!(store.names().unwrap().is_empty());
    }
}

#[test]
fn learned_rules_survive_reload() {
    let mut agent = Agent::new(AgentConfig {
        learning: true,
        ..Default::default()
    });
    for name in ["a", "b"] {
        agent
            .add_rule(
                &RuleDef::new(format!("propose*{name}"))
                    .when(Cond::state("<s>", "superstate", "nil"))
                    .then_make("<s>", "operator", "<o>")
                    .then_make("<o>", "name", name),
            )
            .unwrap();
    }
    agent
        .add_rule(
            &RuleDef::new("tie*prefer-a")
                .when(Cond::state("<s>", "superstate", "<ss>"))
                .when(Cond::new("<s>", "item", "<o>"))
                .when(Cond::new("<o>", "name", "a"))
                .then_prefer("<ss>", "operator", "<o>", PreferenceType::Best),
        )
        .unwrap();
    agent.run_for(2, RunUnit::Decision).unwrap();
    let bytes = agent.save().unwrap();

    let mut restored = Agent::new(AgentConfig::default());
    restored.load(&bytes).unwrap();
    let chunks = restored.rules().filter(|p| p.kind == ProductionKind::Chunk).count();
    assert_eq!(chunks, 1);

    restored.initialize().unwrap();
    restored.run_for(1, RunUnit::Decision).unwrap();
    assert_eq!(restored.goals().len(), 1);
    assert!(restored.goals()[0].operator.is_some());
}

#[test]
fn config_loads_from_toml_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("agent.toml");
    std::fs::write(&path, "max_elaborations = 7\nlearning = true\nseed = 9\n").unwrap();

    let config = AgentConfig::load(&path).unwrap();
    assert_eq!(config.max_elaborations, 7);
    assert!(config.learning);
    assert_eq!(config.seed, 9);
    assert_eq!(config.max_chunks, AgentConfig::default().max_chunks);

    std::fs::write(&path, "max_elaborationz = 7\n").unwrap();
    assert!(AgentConfig::load(&path).is_err());
    assert!(AgentConfig::load(&dir.path().join("absent.toml")).is_err());
}
