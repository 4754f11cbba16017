//! End-to-end runs of the orchestrator against a scripted backend.

mod common;

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{settings, ScriptedBackend};
use robust_pbt::attack::AttackOutcome;
use robust_pbt::events::MemorySink;
use robust_pbt::pbt::Termination;
use robust_pbt::population::{SeedId, SeedStatus};
use robust_pbt::report::{AttackPhase, RunReport};
use robust_pbt::{JobError, Orchestrator, RunStatus};
use tempfile::tempdir;
use tracing_test::traced_test;

fn ids(report: &RunReport, generation: u32) -> Vec<SeedId> {
    report.generation(generation).map(|s| s.id).collect()
}

#[tokio::test]
#[traced_test]
async fn test_all_seeds_succeed() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::default());
    let orchestrator = Orchestrator::new(settings(dir.path(), 4, 3), backend.clone()).unwrap();

    let report = orchestrator.run().await.unwrap();

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.termination(0), Some(&Termination::MaxGenerations { generation: 3 }));
    assert_eq!(report.populations[0].generations, 4);
    for generation in 0..=3 {
        assert_eq!(report.generation(generation).count(), 4);
    }
    assert!(report.generation(3).all(|s| s.status == SeedStatus::Completed));
    assert_eq!(report.totals.seeds_failed, 0);
    assert_eq!(backend.train_calls.load(Ordering::SeqCst), 16);

    // Within a generation the highest id ranks last and is replaced by a
    // clone of seed 0, in its own slot.
    assert_eq!(ids(&report, 0), vec![0, 1, 2, 3]);
    assert_eq!(ids(&report, 1), vec![0, 1, 2, 4]);
    assert_eq!(ids(&report, 3), vec![0, 1, 2, 6]);
    let newest = report.generation(3).find(|s| s.id == 6).unwrap();
    assert_eq!(newest.parent_id, Some(0));
    assert_eq!(newest.lineage, vec![6, 0]);

    let best_fitness = |generation: u32| {
        report
            .generation(generation)
            .filter_map(|s| s.fitness)
            .fold(f64::MIN, f64::max)
    };
    assert!((1..=3).all(|g| best_fitness(g) > best_fitness(g - 1)));

    // Attacks target the final generation only.
    assert_eq!(report.totals.attacks_succeeded, 8);
    assert_eq!(report.totals.attacks_failed, 0);
    assert!(report.attacks().all(|a| a.generation == 3));

    let path = report.save(orchestrator.output_dir()).unwrap();
    let saved: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(saved["status"], "success");
    assert_eq!(saved["group"], "itest");
}

#[tokio::test]
#[traced_test]
async fn test_failed_seed_is_replaced_without_aborting() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend {
        failing_training: HashSet::from([(1, 1)]),
        ..ScriptedBackend::default()
    });
    let memory = Arc::new(MemorySink::new());
    let orchestrator = Orchestrator::new(settings(dir.path(), 4, 2), backend.clone())
        .unwrap()
        .with_sink(memory.clone());

    let report = orchestrator.run().await.unwrap();

    assert_eq!(report.status, RunStatus::PartialSuccess);
    assert_eq!(report.termination(0), Some(&Termination::MaxGenerations { generation: 2 }));

    let failed: Vec<_> = report.failed_seeds().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!((failed[0].id, failed[0].generation), (1, 1));
    assert_eq!(failed[0].attempts, 2);
    assert!(failed[0].error.as_deref().unwrap().contains("out of memory"));

    // Generation 2: three survivors of generation 1 plus one replacement
    // for the failed seed, cloned from the best seed.
    assert_eq!(ids(&report, 2), vec![0, 5, 2, 4]);
    let replacement = report.generation(2).find(|s| s.id == 5).unwrap();
    assert_eq!(replacement.parent_id, Some(0));
    assert!(report.generation(2).all(|s| s.status == SeedStatus::Completed));

    let selected: Vec<_> = memory
        .events()
        .into_iter()
        .filter(|e| e.event.name() == "generation_selected")
        .collect();
    assert_eq!(selected.len(), 2);
    assert_eq!(report.totals.attacks_succeeded, 8);
}

#[tokio::test]
async fn test_attack_matrix_outcomes_are_independent() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend {
        failing_attacks: HashSet::from([(0, 4)]),
        ..ScriptedBackend::default()
    });
    let orchestrator = Orchestrator::new(settings(dir.path(), 2, 0), backend.clone()).unwrap();

    let report = orchestrator.run().await.unwrap();

    assert_eq!(report.attack_phase, AttackPhase::Completed);
    let mut outcomes: Vec<(SeedId, u32, bool)> = report
        .attacks()
        .map(|a| (a.seed_id, a.level, a.outcome.is_success()))
        .collect();
    outcomes.sort();
    assert_eq!(outcomes, vec![(0, 2, true), (0, 4, false), (1, 2, true), (1, 4, true)]);
    assert_eq!(backend.attack_calls.load(Ordering::SeqCst), 4);

    let failed = report.attacks().find(|a| !a.outcome.is_success()).unwrap();
    assert!(matches!(&failed.outcome, AttackOutcome::Failed { error: JobError::Permanent(_) }));
    assert_eq!(report.status, RunStatus::PartialSuccess);
}

#[tokio::test]
#[traced_test]
async fn test_cancel_mid_generation_preserves_finished_work() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend {
        slow_from_generation: Some(1),
        ..ScriptedBackend::default()
    });
    let orchestrator = Orchestrator::new(settings(dir.path(), 4, 3), backend.clone()).unwrap();
    let cancel = orchestrator.cancel_handle();

    let run = tokio::spawn(async move { orchestrator.run().await });
    tokio::time::timeout(Duration::from_secs(10), backend.slow_started.notified())
        .await
        .expect("generation 1 should start");

    let cancelled_at = Instant::now();
    cancel.cancel();
    let report = run.await.unwrap().unwrap();

    // Grace period is one second.
    assert!(cancelled_at.elapsed() < Duration::from_secs(3));
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.termination(0), Some(&Termination::Cancelled { generation: 1 }));
    assert_eq!(report.attack_phase, AttackPhase::Skipped);
    assert_eq!(backend.attack_calls.load(Ordering::SeqCst), 0);

    for seed in report.generation(0) {
        assert_eq!(seed.status, SeedStatus::Completed);
        let expected = format!("itest/seed-{}/gen-0", seed.id);
        assert_eq!(seed.checkpoint.as_ref().map(|c| c.as_str()), Some(expected.as_str()));
    }
    assert!(report
        .generation(1)
        .all(|s| s.status == SeedStatus::Failed && s.error.as_deref() == Some("job cancelled")));
}

#[tokio::test]
#[traced_test]
async fn test_cancel_during_attacks_fails_every_pair() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend {
        slow_attacks: true,
        ..ScriptedBackend::default()
    });
    let orchestrator = Orchestrator::new(settings(dir.path(), 2, 0), backend.clone()).unwrap();
    let cancel = orchestrator.cancel_handle();

    let run = tokio::spawn(async move { orchestrator.run().await });
    tokio::time::timeout(Duration::from_secs(10), backend.attack_started.notified())
        .await
        .expect("attacks should start");

    let cancelled_at = Instant::now();
    cancel.cancel();
    let report = run.await.unwrap().unwrap();

    // Attack grace period is one second.
    assert!(cancelled_at.elapsed() < Duration::from_secs(3));
    assert_eq!(report.termination(0), Some(&Termination::MaxGenerations { generation: 0 }));
    assert_eq!(report.attack_phase, AttackPhase::Cancelled);
    assert_eq!(report.status, RunStatus::Cancelled);
    assert!(report.generation(0).all(|s| s.status == SeedStatus::Completed));

    let attacks: Vec<_> = report.attacks().collect();
    assert_eq!(attacks.len(), 4);
    assert!(attacks
        .iter()
        .all(|a| matches!(&a.outcome, AttackOutcome::Failed { error: JobError::Cancelled })));
}

#[tokio::test]
async fn test_collapse_still_attacks_survivors() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend {
        failing_training: HashSet::from([(1, 0), (2, 0)]),
        ..ScriptedBackend::default()
    });
    let orchestrator = Orchestrator::new(settings(dir.path(), 3, 2), backend.clone()).unwrap();

    let report = orchestrator.run().await.unwrap();

    assert_eq!(report.status, RunStatus::PopulationCollapsed);
    assert_eq!(
        report.termination(0),
        Some(&Termination::PopulationCollapsed { generation: 0, completed: 1 })
    );
    assert_eq!(report.populations[0].generations, 1);
    assert_eq!(report.attacks().filter(|a| a.seed_id == 0).count(), 2);
}
