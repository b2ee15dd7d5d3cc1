//! Deleting objects named by trigger events, through the batcher, against the in-memory object
//! store.
//!
//! These run with the clock paused so the flush interval costs nothing.
use crate::{test_location, Result, TEST_BUCKET, TEST_REGION};
use assert_matches::assert_matches;
use costask::{
    objstore::{MemoryStorage, ObjectLocation},
    summarize, Config, CosTaskError, DeleteFileTask, DeleteParams, SummaryStatus, TaskTally,
    TriggerEvent, TriggerType,
};
use costask_testing::{
    logging::test_with_paused_time,
    test_data::{self, TestObject},
};
use more_asserts::{assert_le, assert_lt};
use serde_json::json;
use std::time::Duration;

/// Store `count` small objects and return their locations
fn populate(storage: &MemoryStorage, count: usize) -> Vec<ObjectLocation> {
    let objects = (0..count).map(|index| TestObject::new(format!("obj-{index:04}"), "16B"));
    let (_, objects) = test_data::prepend_unique_prefix(objects);

    test_data::make_test_data(objects)
        .into_iter()
        .map(|object| {
            let location = test_location(&object.key);
            storage.put_object(location.clone(), object.data);
            location
        })
        .collect()
}

fn config() -> Config {
    Config::default().with_delete_batching(500, Duration::from_secs(5), 100)
}

#[test]
fn deletes_objects_from_an_invoke_event() -> Result<()> {
    test_with_paused_time(async move {
        let storage = MemoryStorage::new();
        let locations = populate(&storage, 1234);

        let urls = locations
            .iter()
            .map(|location| -> Result<String> { Ok(location.url()?.to_string()) })
            .collect::<Result<Vec<_>>>()?;
        let event = json!({ "sourceList": urls });
        let params = DeleteParams::from(TriggerEvent::parse(&event)?);
        assert_eq!(Some(TriggerType::Invoke), params.trigger_type);
        assert_eq!(Some(false), params.avoid_loop_risk);

        let task = DeleteFileTask::new(params, config(), Box::new(storage.clone()));
        let outcome = task.run_task().await;

        assert_eq!(
            &TaskTally {
                success: 1234,
                fail: 0
            },
            outcome.result().unwrap()
        );
        assert!(locations.iter().all(|location| !storage.contains(location)));

        let calls = storage.delete_calls();
        assert!(calls.iter().all(|call| call.keys.len() <= 100));
        assert_eq!(
            1234,
            calls.iter().map(|call| call.keys.len()).sum::<usize>()
        );

        let json = serde_json::to_value(&outcome)?;
        assert_eq!(
            json!({
                "params": {
                    "sourceListLength": 1234,
                    "triggerType": "invoke",
                    "avoidLoopRisk": false
                },
                "result": { "success": 1234, "fail": 0 }
            }),
            json
        );

        Ok(())
    })
}

#[test]
fn deletes_objects_from_a_cos_event() -> Result<()> {
    test_with_paused_time(async move {
        let storage = MemoryStorage::new();
        let locations = populate(&storage, 3);

        let records = locations
            .iter()
            .map(|location| -> Result<serde_json::Value> {
                Ok(json!({
                    "cos": { "cosObject": { "url": location.url()?.to_string() } },
                    "event": { "eventName": "cos:ObjectCreated:Put" }
                }))
            })
            .collect::<Result<Vec<_>>>()?;
        let event = TriggerEvent::parse(&json!({ "Records": records }))?;
        assert_eq!(locations, event.source_list);

        let task = DeleteFileTask::new(event.into(), config(), Box::new(storage.clone()));
        let outcome = task.run_task().await;

        assert_eq!(3, outcome.result().unwrap().success);
        assert_eq!(Some(TriggerType::CosTrigger), outcome.params.trigger_type);
        assert_eq!(Some(true), outcome.params.avoid_loop_risk);

        // All three fit in one window, which was flushed by the timer
        assert_eq!(1, storage.delete_calls().len());

        Ok(())
    })
}

#[test]
fn rejected_keys_are_reported_but_do_not_stop_the_task() -> Result<()> {
    test_with_paused_time(async move {
        let storage = MemoryStorage::new();
        let locations = populate(&storage, 300);
        for location in locations.iter().step_by(50) {
            storage.reject_key(location.key.clone(), "AccessDenied", "Access Denied.");
        }

        let task = DeleteFileTask::new(
            DeleteParams::new(locations.clone()),
            config(),
            Box::new(storage.clone()),
        );
        let outcome = task.run_task().await;

        assert_eq!(
            &TaskTally {
                success: 294,
                fail: 6
            },
            outcome.result().unwrap()
        );
        assert!(storage.contains(&locations[0]));
        assert!(!storage.contains(&locations[1]));

        let summary = summarize("delete", std::slice::from_ref(&outcome));
        assert_eq!(SummaryStatus::Success, summary.status);

        Ok(())
    })
}

#[test]
fn failed_bulk_calls_trip_the_fail_limit() -> Result<()> {
    test_with_paused_time(async move {
        let storage = MemoryStorage::new().with_delete_latency(Duration::from_millis(100));
        let locations = populate(&storage, 1000);
        storage.fail_next_delete_calls(1);

        let task = DeleteFileTask::new(
            DeleteParams::new(locations.clone()),
            config().with_max_fail_limit(10),
            Box::new(storage.clone()),
        );
        let outcome = task.run_task().await;

        // The first bulk call failed all of its 100 keys, which is well over the limit
        assert_matches!(
            outcome.error(),
            Some(CosTaskError::FailLimitExceeded {
                max_fail_limit: 10,
                ..
            })
        );

        let calls = storage.delete_calls();
        assert_lt!(calls.len(), 10);
        let attempted = calls.iter().map(|call| call.keys.len()).sum::<usize>();
        assert_le!(attempted, 300);

        let summary = summarize("delete", std::slice::from_ref(&outcome));
        assert_eq!(SummaryStatus::Fail, summary.status);

        Ok(())
    })
}

#[test]
fn objects_in_other_buckets_get_their_own_calls() -> Result<()> {
    test_with_paused_time(async move {
        let storage = MemoryStorage::new();
        let mut locations = populate(&storage, 5);

        let other = ObjectLocation::new("other-1250000000", "ap-beijing", "x");
        storage.put_object(other.clone(), "x");
        locations.push(other.clone());

        let task = DeleteFileTask::new(
            DeleteParams::new(locations),
            config(),
            Box::new(storage.clone()),
        );
        let outcome = task.run_task().await;

        assert_eq!(6, outcome.result().unwrap().success);

        let mut calls = storage
            .delete_calls()
            .into_iter()
            .map(|call| (call.bucket, call.region, call.keys.len()))
            .collect::<Vec<_>>();
        calls.sort();
        assert_eq!(
            vec![
                (TEST_BUCKET.to_string(), TEST_REGION.to_string(), 5),
                ("other-1250000000".to_string(), "ap-beijing".to_string(), 1),
            ],
            calls
        );

        Ok(())
    })
}
