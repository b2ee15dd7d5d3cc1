//! End-to-end concatenation against the in-memory object store, with randomly generated source
//! objects of various sizes.
use crate::{test_location, Result};
use assert_matches::assert_matches;
use costask::{
    objstore::{MemoryStorage, ObjectLocation},
    ConcatFileTask, ConcatParams, Config, CosTaskError,
};
use costask_testing::{
    logging::test_with_logging,
    test_data::{self, TestObject, TestObjectWithData},
};
use futures::TryStreamExt;
use more_asserts::assert_ge;

/// Put the test objects in `storage` under a unique prefix, and make a task that concatenates
/// them into `target_key` under the same prefix
fn setup(
    storage: &MemoryStorage,
    objects: Vec<TestObject>,
    target_key: &str,
    config: Config,
) -> (ConcatFileTask, Vec<TestObjectWithData>, ObjectLocation) {
    let (prefix, objects) = test_data::prepend_unique_prefix(objects);
    let objects = test_data::make_test_data(objects);

    for object in &objects {
        storage.put_object(test_location(&object.key), object.data.clone());
    }

    let target = test_location(&format!("{prefix}{target_key}"));
    let task = ConcatFileTask::new(
        ConcatParams {
            source_list: objects
                .iter()
                .map(|object| test_location(&object.key).url().unwrap())
                .collect(),
            target: target.clone(),
        },
        config,
        Box::new(storage.clone()),
        Box::new(storage.clone()),
        Box::new(storage.clone()),
    );

    (task, objects, target)
}

/// Generates a test that concatenates objects of the given sizes, with the uploader reading the
/// concatenation either all at once or in parts of the given size
macro_rules! concat_test {
    ($name:ident, [$($size:expr),*], $part_size:expr) => {
        #[test]
        fn $name() -> Result<()> {
            test_with_logging(async move {
                let part_size: Option<&str> = $part_size;
                let storage = match part_size {
                    Some(part_size) => MemoryStorage::new().with_upload_part_size(
                        byte_unit::Byte::from_str(part_size).unwrap().get_bytes() as u64,
                    ),
                    None => MemoryStorage::new(),
                };

                let objects = [$($size),*]
                    .into_iter()
                    .enumerate()
                    .map(|(index, size)| TestObject::new(format!("source-{index}.bin"), size))
                    .collect::<Vec<_>>();

                let (mut task, objects, target) =
                    setup(&storage, objects, "concatenated.bin", Config::default());

                let outcome = task.run_task().await;
                let output = outcome.result().expect("concatenation failed");

                assert_eq!(target.key, output.key);
                assert_eq!(
                    Some(test_data::concatenated(&objects)),
                    storage.object(&target)
                );

                Ok(())
            })
        }
    };
}

concat_test!(single_source, ["100KiB"], None);
concat_test!(several_sources, ["10KiB", "1B", "300KiB", "7KiB"], None);
concat_test!(empty_sources_are_skipped, ["0B", "10KiB", "0B", "20KiB", "0B"], None);
concat_test!(all_sources_empty, ["0B", "0B"], None);
concat_test!(parts_span_sources, ["10KiB", "1B", "300KiB", "7KiB"], Some("64KiB"));
concat_test!(parts_smaller_than_sources, ["100KiB", "200KiB"], Some("3KB"));
concat_test!(parts_larger_than_everything, ["1KiB", "2KiB"], Some("1MiB"));

#[test]
fn arbitrary_ranges_match_concatenation() -> Result<()> {
    test_with_logging(async move {
        let storage = MemoryStorage::new();
        let objects = ["5KiB", "0B", "17KiB", "1B", "9KiB"]
            .into_iter()
            .enumerate()
            .map(|(index, size)| TestObject::new(format!("{index}"), size))
            .collect();

        let (mut task, objects, _) = setup(&storage, objects, "unused", Config::default());
        let expected = test_data::concatenated(&objects);

        task.resolve_sizes().await?;
        task.resolve_offsets()?;
        assert_eq!(Some(expected.len() as u64), task.total_size());

        for _ in 0..50 {
            let mut bounds = [
                rand::random::<u64>() % (expected.len() as u64 + 1),
                rand::random::<u64>() % (expected.len() as u64 + 1),
            ];
            bounds.sort_unstable();
            let range = bounds[0]..bounds[1];

            let data = task
                .read_stream(range.clone())?
                .try_collect::<Vec<_>>()
                .await?
                .concat();

            assert_eq!(
                &expected[range.start as usize..range.end as usize],
                &data[..],
                "{range:?}"
            );
        }

        Ok(())
    })
}

#[test]
fn missing_source_fails_without_uploading() -> Result<()> {
    test_with_logging(async move {
        let storage = MemoryStorage::new();
        let objects = vec![TestObject::new("present", "1KiB")];

        let (mut task, _, target) = setup(&storage, objects, "out", Config::default());

        // Append a source that doesn't exist
        let mut params = task.params().clone();
        params
            .source_list
            .push(test_location("does/not/exist").url()?);
        task = ConcatFileTask::new(
            params,
            Config::default(),
            Box::new(storage.clone()),
            Box::new(storage.clone()),
            Box::new(storage.clone()),
        );

        let outcome = task.run_task().await;

        assert_matches!(
            outcome.error(),
            Some(CosTaskError::MemoryObjectNotFound { .. })
        );
        assert_eq!(None, storage.object(&target));

        let json = serde_json::to_value(&outcome)?;
        assert!(json.get("result").is_none());
        assert_eq!(2, json["params"]["sourceListLength"]);
        assert!(json["error"].as_str().unwrap().contains("not present"));

        Ok(())
    })
}

#[test]
fn probes_are_bounded_by_metadata_concurrency() -> Result<()> {
    test_with_logging(async move {
        let storage = MemoryStorage::new();
        let objects = (0..40)
            .map(|index| TestObject::new(format!("{index}"), "1KiB"))
            .collect();

        let (mut task, objects, target) = setup(
            &storage,
            objects,
            "out",
            Config::default().with_metadata_concurrency(3),
        );

        let outcome = task.run_task().await;
        assert!(outcome.is_ok());

        let output = storage.object(&target).unwrap();
        assert_ge!(output.len(), 40 * 1024);
        assert_eq!(test_data::concatenated(&objects), output);

        // Every source was read exactly once, in order
        let opened = storage
            .opened_ranges()
            .into_iter()
            .map(|(location, _)| location.key)
            .collect::<Vec<_>>();
        let expected = objects
            .iter()
            .map(|object| object.key.clone())
            .collect::<Vec<_>>();
        assert_eq!(expected, opened);

        Ok(())
    })
}
