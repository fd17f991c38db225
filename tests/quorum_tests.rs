use std::sync::Arc;

use chrono::Utc;

use shovey::dispatch::{check_quorum, Quorum};
use shovey::error::ShoveyError;
use shovey::liveness::LivenessMonitor;

fn targets(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

async fn monitor_with_up(names: &[&str]) -> LivenessMonitor {
    let monitor = LivenessMonitor::new();
    for name in names {
        monitor.record_heartbeat(name, Utc::now()).await;
    }
    monitor
}

#[tokio::test]
async fn test_percentage_quorum_of_five() {
    let monitor = monitor_with_up(&["n1", "n2", "n3"]).await;
    let five = targets(&["n1", "n2", "n3", "n4", "n5"]);

    let sixty = check_quorum(&monitor, &five, Quorum::Percent(60)).await.unwrap();
    assert!(sixty.satisfied);
    assert_eq!(sixty.required, 3);
    assert_eq!(sixty.up_count, 3);
    assert_eq!(sixty.total, 5);

    let eighty = check_quorum(&monitor, &five, Quorum::Percent(80)).await.unwrap();
    assert!(!eighty.satisfied);
    assert_eq!(eighty.required, 4);
}

#[tokio::test]
async fn test_count_quorum() {
    let monitor = monitor_with_up(&["n1", "n2"]).await;
    let three = targets(&["n1", "n2", "n3"]);

    assert!(check_quorum(&monitor, &three, Quorum::Count(2)).await.unwrap().satisfied);
    assert!(!check_quorum(&monitor, &three, Quorum::Count(3)).await.unwrap().satisfied);
    assert!(matches!(
        check_quorum(&monitor, &three, Quorum::Count(4)).await,
        Err(ShoveyError::InvalidQuorum(_))
    ));
}

#[tokio::test]
async fn test_down_nodes_do_not_count() {
    let monitor = monitor_with_up(&["n1", "n2"]).await;
    monitor
        .sweep(
            Utc::now() + chrono::Duration::hours(1),
            std::time::Duration::from_secs(600),
        )
        .await;
    monitor.record_heartbeat("n2", Utc::now() + chrono::Duration::hours(2)).await;

    let check = check_quorum(&monitor, &targets(&["n1", "n2"]), Quorum::Percent(100))
        .await
        .unwrap();
    assert_eq!(check.up_count, 1);
    assert!(!check.satisfied);
}

#[tokio::test]
async fn test_quorum_under_concurrent_heartbeats() {
    let monitor = Arc::new(monitor_with_up(&["n1", "n2", "n3"]).await);
    let all = targets(&["n1", "n2", "n3"]);

    let beats = {
        let monitor = monitor.clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                for name in ["n1", "n2", "n3"] {
                    monitor.record_heartbeat(name, Utc::now()).await;
                }
                tokio::task::yield_now().await;
            }
        })
    };

    for _ in 0..200 {
        let check = check_quorum(&monitor, &all, Quorum::Count(3)).await.unwrap();
        assert_eq!(check.up_count, 3);
        tokio::task::yield_now().await;
    }
    beats.await.unwrap();
}
