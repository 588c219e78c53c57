//! Learning tests: chunks and justifications built from sub-goal results.

use cognit_kernel::agent::Agent;
use cognit_kernel::config::AgentConfig;
use cognit_kernel::cycle::{RunUnit, StopReason};
use cognit_kernel::production::ast::{Cond, RuleDef};
use cognit_kernel::production::{PreferenceType, ProductionKind};

/// Two proposals tie; a rule in the tie sub-state makes `a` best for the
/// super-state.
fn tie_agent(config: AgentConfig) -> Agent {
    let mut agent = Agent::new(config);
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
    agent
}

fn learned(agent: &Agent, kind: ProductionKind) -> Vec<String> {
    agent.rules().filter(|p| p.kind == kind).map(|p| p.name.clone()).collect()
}

fn selected_name(agent: &mut Agent) -> Option<String> {
    let op = agent.goals()[0].operator?;
    let name = agent.symbols_mut().string("name");
    let wme = agent.find_wmes(Some(op), Some(name), None).first().map(|w| w.fields.value)?;
    Some(agent.symbols().display(wme))
}

#[test]
fn chunk_skips_the_sub_goal_next_time() {
    let mut agent = tie_agent(AgentConfig {
        learning: true,
        ..Default::default()
    });

    agent.run_for(1, RunUnit::Decision).unwrap();
    assert_eq!(agent.goals().len(), 2);

    agent.run_for(1, RunUnit::Decision).unwrap();
    assert_eq!(agent.goals().len(), 1);
    assert_eq!(selected_name(&mut agent).as_deref(), Some("a"));

    let chunks = learned(&agent, ProductionKind::Chunk);
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].starts_with("chunk-1*d1*tie*"), "{}", chunks[0]);
    assert_eq!(agent.stats().chunks, 1);

    // The chunk is a generalized super-state rule.
    let text = agent.rule(&chunks[0]).unwrap().render(agent.symbols());
    assert!(text.contains("^operator"), "{text}");
    assert!(text.contains("^name a"), "{text}");
    assert!(!text.contains("S1"), "{text}");
    assert!(!text.contains("^item"), "{text}");

    // Same situation again: decided in one decision without a sub-state.
    agent.initialize().unwrap();
    agent.run_for(1, RunUnit::Decision).unwrap();
    assert_eq!(agent.goals().len(), 1);
    assert_eq!(selected_name(&mut agent).as_deref(), Some("a"));
    assert_eq!(agent.firing_count("tie*prefer-a"), Some(0));
    assert_eq!(agent.firing_count(&chunks[0]), Some(1));
}

#[test]
fn justification_without_learning_is_dropped_on_initialize() {
    let mut agent = tie_agent(AgentConfig::default());
    agent.run_for(2, RunUnit::Decision).unwrap();

    assert!(learned(&agent, ProductionKind::Chunk).is_empty());
    assert_eq!(learned(&agent, ProductionKind::Justification), vec!["justification-1".to_string()]);
    assert_eq!(selected_name(&mut agent).as_deref(), Some("a"));

    agent.initialize().unwrap();
    assert!(agent.rule("justification-1").is_none());
    agent.run_for(1, RunUnit::Decision).unwrap();
    assert_eq!(agent.goals().len(), 2);
}

#[test]
fn excised_chunks_are_learned_again() {
    let mut agent = tie_agent(AgentConfig {
        learning: true,
        ..Default::default()
    });
    agent.run_for(2, RunUnit::Decision).unwrap();
    agent.initialize().unwrap();
    agent.run_for(2, RunUnit::Decision).unwrap();
    assert_eq!(learned(&agent, ProductionKind::Chunk).len(), 1);
    assert_eq!(agent.stats().chunks, 0);

    assert_eq!(agent.excise_all_chunks().unwrap(), 1);
    agent.initialize().unwrap();
    agent.run_for(2, RunUnit::Decision).unwrap();
    let chunks = learned(&agent, ProductionKind::Chunk);
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].starts_with("chunk-2*"), "{}", chunks[0]);
}

#[test]
fn chunk_limit_falls_back_to_a_justification() {
    let mut agent = tie_agent(AgentConfig {
        learning: true,
        max_chunks: 0,
        ..Default::default()
    });
    let out = agent.run_for(2, RunUnit::Decision).unwrap();
    assert_eq!(out.stop, Some(StopReason::MaxChunks));
    assert!(learned(&agent, ProductionKind::Chunk).is_empty());
    assert_eq!(learned(&agent, ProductionKind::Justification).len(), 1);
}

#[test]
fn custom_prefix_names_chunks() {
    let mut agent = tie_agent(AgentConfig {
        learning: true,
        chunk_name_prefix: "learned".into(),
        ..Default::default()
    });
    agent.run_for(2, RunUnit::Decision).unwrap();
    let chunks = learned(&agent, ProductionKind::Chunk);
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].starts_with("learned-1*"), "{}", chunks[0]);
}

/// A state no-change sub-goal whose only link to the super-state is the
/// proposal of its selected operator.
fn flag_agent() -> Agent {
    let mut agent = Agent::new(AgentConfig {
        learning: true,
        ..Default::default()
    });
    agent
        .add_rule(
            &RuleDef::new("sub*propose")
                .when(Cond::state("<s>", "superstate", "<ss>"))
                .when(Cond::new("<ss>", "flag", "yes"))
                .then_make("<s>", "operator", "<q>"),
        )
        .unwrap();
    agent
        .add_rule(
            &RuleDef::new("sub*apply")
                .when(Cond::state("<s>", "operator", "<q>"))
                .when(Cond::new("<s>", "superstate", "<ss>"))
                .then_make("<ss>", "result", "done"),
        )
        .unwrap();
    agent
}

fn raise_flag(agent: &mut Agent) {
    let top = agent.top_state();
    let flag = agent.symbols_mut().string("flag");
    let yes = agent.symbols_mut().string("yes");
    agent.add_input_wme(top, flag, yes).unwrap();
}

fn results(agent: &mut Agent) -> usize {
    let result = agent.symbols_mut().string("result");
    agent.find_wmes(None, Some(result), None).len()
}

#[test]
fn chunk_backtraces_through_the_selected_operator() {
    let mut agent = flag_agent();
    raise_flag(&mut agent);

    agent.run_for(1, RunUnit::Decision).unwrap();
    assert_eq!(results(&mut agent), 0);
    agent.run_for(1, RunUnit::Decision).unwrap();
    assert_eq!(results(&mut agent), 1);

    let chunks = learned(&agent, ProductionKind::Chunk);
    assert_eq!(chunks.len(), 1, "{chunks:?}");
    let text = agent.rule(&chunks[0]).unwrap().render(agent.symbols());
    assert!(text.contains("^flag yes"), "{text}");
    assert!(text.contains("^result done"), "{text}");
    assert!(!text.contains("^operator"), "{text}");

    // Next time the result arrives in the first decision.
    agent.initialize().unwrap();
    raise_flag(&mut agent);
    agent.run_for(1, RunUnit::Decision).unwrap();
    assert_eq!(results(&mut agent), 1);
    assert_eq!(agent.firing_count(&chunks[0]), Some(1));
    assert_eq!(agent.firing_count("sub*apply"), Some(0));
}

#[test]
fn result_without_super_state_grounds_learns_nothing() {
    let mut agent = Agent::new(AgentConfig {
        learning: true,
        ..Default::default()
    });
    agent
        .add_rule(
            &RuleDef::new("sub*announce")
                .when(Cond::state("<s>", "superstate", "<ss>"))
                .then_make("<ss>", "result", "done"),
        )
        .unwrap();
    agent.run_for(1, RunUnit::Decision).unwrap();

    assert_eq!(results(&mut agent), 1);
    assert!(learned(&agent, ProductionKind::Chunk).is_empty());
    assert!(learned(&agent, ProductionKind::Justification).is_empty());
    assert_eq!(agent.stats().chunks, 0);
}

#[test]
fn identical_results_install_one_chunk() {
    let mut agent = tie_agent(AgentConfig {
        learning: true,
        ..Default::default()
    });
    agent
        .add_rule(
            &RuleDef::new("tie*prefer-a-again")
                .when(Cond::state("<s>", "superstate", "<ss>"))
                .when(Cond::new("<s>", "item", "<o>"))
                .when(Cond::new("<o>", "name", "a"))
                .then_prefer("<ss>", "operator", "<o>", PreferenceType::Best),
        )
        .unwrap();

    agent.run_for(2, RunUnit::Decision).unwrap();
    assert_eq!(agent.firing_count("tie*prefer-a"), Some(1));
    assert_eq!(agent.firing_count("tie*prefer-a-again"), Some(1));
    assert_eq!(learned(&agent, ProductionKind::Chunk).len(), 1);
    assert!(learned(&agent, ProductionKind::Justification).is_empty());
    assert_eq!(agent.stats().chunks, 1);
    assert_eq!(selected_name(&mut agent).as_deref(), Some("a"));
}
