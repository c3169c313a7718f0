//! Several collectors racing for the same lock inside one process.
//!
//! `flock` locks belong to open file descriptions, so separate collectors in one process
//! contend exactly like separate processes would.

use multiproc_metrics::{
    Collector, CollectorConfig, CollectorError, LabelSet, MetricEvent, Role,
};
use std::{
    sync::{Arc, Barrier},
    thread,
    time::{Duration, Instant},
};

const COLLECTORS: usize = 4;

fn config(dir: &std::path::Path) -> CollectorConfig {
    CollectorConfig::default()
        .lock_path(dir.join("election.lock"))
        .socket_path(dir.join("election.sock"))
        .poll_interval(Duration::from_millis(10))
        .ready_timeout(Some(Duration::from_secs(10)))
}

/// Drops the trailing timestamp from every sample line.
fn without_timestamps(text: &str) -> String {
    text.lines()
        .map(|line| {
            if line.starts_with('#') {
                line.to_string()
            } else {
                line.rsplit_once(' ').map_or(line, |(rest, _)| rest).to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[test]
fn exactly_one_collector_leads_and_all_see_the_same_metrics() {
    let dir = tempfile::tempdir().unwrap();
    let barrier = Arc::new(Barrier::new(COLLECTORS));

    let starters: Vec<_> = (0..COLLECTORS)
        .map(|_| {
            let config = config(dir.path());
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let collector = Collector::new(config);
                barrier.wait();
                collector.start().unwrap();
                let role = collector.wait_ready(None).unwrap();
                (collector, role)
            })
        })
        .collect();
    let collectors: Vec<(Collector, Role)> =
        starters.into_iter().map(|t| t.join().unwrap()).collect();

    let leaders = collectors
        .iter()
        .filter(|(_, role)| *role == Role::Leader)
        .count();
    assert_eq!(leaders, 1);

    for (i, (collector, _)) in collectors.iter().enumerate() {
        let counter = collector.counter("requests_total", None).unwrap();
        for _ in 0..10 {
            counter
                .inc_by(1.0, &LabelSet::new().with("worker", i))
                .unwrap();
        }
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    let expected: Vec<String> = (0..COLLECTORS)
        .map(|i| format!("requests_total{{worker=\"{i}\"}} 10"))
        .collect();
    loop {
        let views: Vec<String> = collectors
            .iter()
            .map(|(collector, _)| without_timestamps(&collector.query().unwrap()))
            .collect();
        let settled = views.iter().all(|view| view == &views[0])
            && expected.iter().all(|line| views[0].contains(line.as_str()));
        if settled {
            assert!(views[0].starts_with("# TYPE requests_total counter\n"));
            break;
        }
        assert!(Instant::now() < deadline, "views never converged: {views:#?}");
        thread::sleep(Duration::from_millis(20));
    }

    // Followers first, so their drained queues still have a leader to reach.
    let (leader, followers): (Vec<_>, Vec<_>) = collectors
        .into_iter()
        .partition(|(_, role)| *role == Role::Leader);
    for (collector, _) in followers {
        collector.stop().unwrap();
    }
    for (collector, _) in leader {
        collector.stop().unwrap();
    }
    assert!(!dir.path().join("election.sock").exists());
}

#[test]
fn drained_follower_increments_are_visible_after_stop() {
    let dir = tempfile::tempdir().unwrap();
    let leader = Collector::new(config(dir.path()));
    leader.start().unwrap();
    assert_eq!(leader.wait_ready(None).unwrap(), Role::Leader);

    let follower = Collector::new(config(dir.path()));
    follower.start().unwrap();
    assert_eq!(follower.wait_ready(None).unwrap(), Role::Follower);

    let counter = follower.counter("jobs_total", Some("Jobs done.")).unwrap();
    for _ in 0..500 {
        counter.inc().unwrap();
    }
    follower.stop().unwrap();

    let text = leader.query().unwrap();
    assert!(text.contains("# HELP jobs_total Jobs done.\n"));
    assert!(text.contains("\njobs_total 500 "));
    leader.stop().unwrap();
}

#[test]
fn negative_increments_are_rejected_before_sending() {
    let dir = tempfile::tempdir().unwrap();
    let collector = Collector::new(config(dir.path()));
    collector.start().unwrap();

    let counter = collector.counter("errors_total", None).unwrap();
    assert!(counter.inc_by(-1.0, &LabelSet::new()).is_err());
    assert!(counter.inc_by(f64::NAN, &LabelSet::new()).is_err());
    assert!(collector.counter("bad name", None).is_err());
    assert!(
        counter
            .inc_by(1.0, &LabelSet::new().with("bad-label", "x"))
            .is_err()
    );

    assert_eq!(
        collector.query().unwrap(),
        "# TYPE errors_total counter\n"
    );
    collector.stop().unwrap();
}

#[test]
fn raw_events_are_checked_before_reaching_either_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let leader = Collector::new(config(dir.path()));
    leader.start().unwrap();
    assert_eq!(leader.wait_ready(None).unwrap(), Role::Leader);

    let follower = Collector::new(config(dir.path()));
    follower.start().unwrap();
    assert_eq!(follower.wait_ready(None).unwrap(), Role::Follower);

    let split_description = MetricEvent::Register {
        kind: "counter".into(),
        name: "a_total".into(),
        description: Some("line1\r\nline2".into()),
    };
    let bad_name = MetricEvent::Register {
        kind: "counter".into(),
        name: "x y\nz".into(),
        description: Some(String::new()),
    };
    for collector in [&leader, &follower] {
        assert!(matches!(
            collector.send(&split_description),
            Err(CollectorError::InvalidField("description", _))
        ));
        assert!(matches!(
            collector.send(&bad_name),
            Err(CollectorError::InvalidName(_))
        ));
    }

    // The follower's connection survives, so later increments still arrive.
    let counter = follower.counter("b_total", None).unwrap();
    for _ in 0..5 {
        counter.inc().unwrap();
    }
    follower.stop().unwrap();

    assert_eq!(
        without_timestamps(&leader.query().unwrap()),
        "# TYPE b_total counter\nb_total 5"
    );
    leader.stop().unwrap();
}
