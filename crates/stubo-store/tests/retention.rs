//! Retention through the public service API.

use std::sync::Arc;
use std::thread;

use chrono::NaiveDate;
use serde_json::json;
use stubo_store::backends::InMemoryStubRepository;
use stubo_store::config::{Config, InsertionConfig};
use stubo_store::stub::StubPayload;
use stubo_store::{StubRepository, StubService};

fn payload(rule: &str, recorded: &str) -> StubPayload {
    serde_json::from_value(json!({
        "request": {"bodyPatterns": [{"contains": [rule]}]},
        "response": {"body": "ok"},
        "recorded": recorded
    }))
    .unwrap()
}

fn date(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

#[test]
fn test_retention_cascade() {
    let svc = StubService::new(
        Arc::new(InMemoryStubRepository::new()),
        InsertionConfig::default(),
    );
    svc.insert_stub("S", payload("a", "2024-01-01"), false).unwrap();
    svc.insert_stub("S", payload("b", "2024-02-01"), false).unwrap();

    let first = svc.remove_older_than("S", date("2024-01-15")).unwrap();
    assert_eq!(first.stubs_deleted, 1);
    assert_eq!(svc.stub_count("S").unwrap(), 1);
    assert!(svc.repository().scenario_exists("S").unwrap());

    let second = svc.remove_older_than("S", date("2024-03-01")).unwrap();
    assert_eq!(second.stubs_deleted, 1);
    assert!(!svc.repository().scenario_exists("S").unwrap());
}

#[test]
fn test_sweep_uses_configured_cutoff() {
    let yaml = "retention:\n  max_age_days: 10\n";
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    config.validate().unwrap();
    let svc = StubService::from_config(&config).unwrap();

    svc.insert_stub("old", payload("a", "2024-02-19"), false).unwrap();
    svc.insert_stub("edge", payload("a", "2024-02-20"), false).unwrap();
    svc.insert_stub("fresh", payload("a", "2024-02-21"), false).unwrap();

    let cutoff = config.retention.cutoff(date("2024-03-01"));
    assert_eq!(cutoff, date("2024-02-20"));
    let report = svc.sweep(cutoff).unwrap();

    assert_eq!(report.stubs_deleted(), 2);
    assert_eq!(report.scenarios_removed(), 2);
    assert_eq!(
        svc.repository().list_scenarios().unwrap(),
        vec!["fresh".to_string()]
    );
}

#[test]
fn test_sweep_never_drops_concurrent_fresh_stubs() {
    let repo = Arc::new(InMemoryStubRepository::new());
    let svc = Arc::new(StubService::new(repo.clone(), InsertionConfig::default()));
    for i in 0..50 {
        svc.insert_stub("S", payload(&format!("old-{i}"), "2024-01-01"), false)
            .unwrap();
    }

    let writer = {
        let svc = Arc::clone(&svc);
        thread::spawn(move || {
            for i in 0..50 {
                svc.insert_stub("S", payload(&format!("new-{i}"), "2024-06-01"), false)
                    .unwrap();
            }
        })
    };
    let sweeper = {
        let svc = Arc::clone(&svc);
        thread::spawn(move || {
            for _ in 0..10 {
                svc.sweep(date("2024-02-01")).unwrap();
            }
        })
    };
    writer.join().unwrap();
    sweeper.join().unwrap();
    svc.sweep(date("2024-02-01")).unwrap();

    let remaining = svc.list_stubs("S").unwrap();
    assert_eq!(remaining.len(), 50);
    assert!(remaining.iter().all(|s| s.recorded() == date("2024-06-01")));
    assert!(repo.scenario_exists("S").unwrap());
}

#[test]
fn test_sweep_purges_pre_stubs_left_by_removed_scenario() {
    let svc = StubService::new(
        Arc::new(InMemoryStubRepository::new()),
        InsertionConfig::default(),
    );
    svc.insert_stub("S", payload("a", "2024-01-01"), false).unwrap();
    svc.insert_pre_stub("S", payload("b", "2024-03-01")).unwrap();

    let first = svc.sweep(date("2024-02-01")).unwrap();
    assert_eq!(first.scenarios_removed(), 1);
    assert!(svc.repository().list_scenarios().unwrap().is_empty());
    assert_eq!(svc.list_pre_stubs("S").unwrap().len(), 1);

    let second = svc.sweep(date("2024-12-31")).unwrap();
    assert_eq!(second.swept.len(), 1);
    assert_eq!(second.pre_stubs_deleted(), 1);
    assert!(svc.list_pre_stubs("S").unwrap().is_empty());
}
