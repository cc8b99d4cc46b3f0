mod testsupport;

use std::time::Duration;

use samovar::prelude::protocol::{PartitionOffsets, RequestBody, EARLIEST_TIMESTAMP};
use samovar::prelude::Error;

const GROUP_ID: &str = "consumer-runtime-integration";

#[test]
fn group_member_consumes_commits_and_shuts_down() {
    testsupport::init_tracing();
    let (transport, commits) = testsupport::one_broker_cluster(3);
    let mut runtime = testsupport::runtime_builder()
        .group(GROUP_ID)
        .spawn(transport)
        .unwrap();

    // Joining, reconciling the assignment, and resolving positions all
    // happen in the background; records arrive once they are done.
    let records = testsupport::fetch_until(&runtime, 3, Duration::from_secs(5));
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].offset, 0);
    assert_eq!(records[2].value, bytes::Bytes::from_static(b"record-2"));

    let next = records.last().unwrap().offset + 1;
    runtime
        .commit(PartitionOffsets::from([(
            (testsupport::TOPIC.to_string(), 0),
            next,
        )]))
        .unwrap();

    runtime.shutdown().unwrap();

    let commits = commits.lock().unwrap();
    assert_eq!(commits.len(), 1);
    match &commits[0] {
        RequestBody::OffsetCommit { offsets, .. } => {
            assert_eq!(offsets.get(&(testsupport::TOPIC.to_string(), 0)), Some(&3));
        }
        other => panic!("unexpected request {:?}", other),
    }
}

#[test]
fn shutdown_flushes_a_commit_still_in_the_queue() {
    let (transport, commits) = testsupport::one_broker_cluster(3);
    let mut runtime = testsupport::runtime_builder()
        .group(GROUP_ID)
        .spawn(transport)
        .unwrap();
    testsupport::fetch_until(&runtime, 3, Duration::from_secs(5));

    // Fire and forget, then shut down immediately: the close phase must
    // still deliver it.
    runtime
        .commit_async(PartitionOffsets::from([(
            (testsupport::TOPIC.to_string(), 0),
            3,
        )]))
        .unwrap();
    runtime.shutdown().unwrap();

    let commits = commits.lock().unwrap();
    assert_eq!(commits.len(), 1);
}

#[test]
fn explicit_leave_resolves_and_is_idempotent() {
    let (transport, _) = testsupport::one_broker_cluster(0);
    let mut runtime = testsupport::runtime_builder()
        .group(GROUP_ID)
        .spawn(transport)
        .unwrap();
    // Give the member a moment to join before leaving.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(runtime.leave_group(), Ok(()));
    assert_eq!(runtime.leave_group(), Ok(()));
    runtime.shutdown().unwrap();
}

#[test]
fn reset_positions_rewinds_to_the_earliest_offset() {
    let (transport, _) = testsupport::one_broker_cluster(3);
    let mut runtime = testsupport::runtime_builder()
        .group(GROUP_ID)
        .spawn(transport)
        .unwrap();
    let first = testsupport::fetch_until(&runtime, 3, Duration::from_secs(5));
    assert_eq!(first.len(), 3);

    let resolved = runtime
        .reset_positions(vec![(testsupport::TOPIC.to_string(), 0, EARLIEST_TIMESTAMP)])
        .unwrap();
    assert_eq!(resolved.get(&(testsupport::TOPIC.to_string(), 0)), Some(&0));

    // The same records come around again.
    let again = testsupport::fetch_until(&runtime, 3, Duration::from_secs(5));
    assert_eq!(again.len(), 3);
    assert_eq!(again[0].offset, 0);
    runtime.shutdown().unwrap();
}

#[test]
fn facade_serves_brokers_and_topics_synchronously() {
    let (transport, _) = testsupport::one_broker_cluster(0);
    let mut runtime = testsupport::runtime_builder().spawn(transport).unwrap();

    let state = runtime.cluster_state(Duration::from_secs(2));
    let brokers = state.brokers().unwrap();
    assert_eq!(brokers.len(), 1);
    assert_eq!(brokers[0].node_id, 1);

    assert_eq!(state.partition_count(testsupport::TOPIC).unwrap(), Some(1));
    assert_eq!(state.partition_count("missing").unwrap(), None);

    runtime.shutdown().unwrap();

    // A facade outliving its runtime degrades to errors, never hangs.
    assert_eq!(state.brokers(), Err(Error::RuntimeClosed));
}

#[test]
fn standalone_runtime_rejects_group_operations() {
    let (transport, _) = testsupport::one_broker_cluster(0);
    let mut runtime = testsupport::runtime_builder().spawn(transport).unwrap();
    let result = runtime.commit(PartitionOffsets::from([(
        (testsupport::TOPIC.to_string(), 0),
        1,
    )]));
    assert_eq!(result, Err(Error::NotInGroupMode));
    runtime.shutdown().unwrap();
}
