//! Random test objects with human-friendly sizes
use bytes::Bytes;
use rand::prelude::*;
use std::collections::HashSet;

#[derive(Clone, Debug)]
pub struct TestObject {
    pub key: String,
    pub size: usize,
}

impl TestObject {
    /// Make a new test object spec with the size specified as a string so we can use
    /// human-friendly units like "10 KB" or "20 MiB"
    pub fn new(key: impl Into<String>, size: impl AsRef<str>) -> Self {
        let size = byte_unit::Byte::from_str(size).unwrap();

        Self {
            key: key.into(),
            size: size.get_bytes() as usize,
        }
    }
}

/// A [`TestObject`] together with the random data generated for it
#[derive(Clone, Debug)]
pub struct TestObjectWithData {
    pub key: String,
    pub data: Bytes,
}

/// Generate a unique prefix ending in a `/` character, and prepend it to the `key` in a collection
/// of [`TestObject`]s.
///
/// Returns the unique prefix and the modified test objects.
pub fn prepend_unique_prefix(
    objects: impl IntoIterator<Item = TestObject>,
) -> (String, Vec<TestObject>) {
    let prefix = format!("{:08x}/", rand::thread_rng().next_u32());

    let objects = objects
        .into_iter()
        .map(|mut object| {
            object.key = format!("{}{}", prefix, object.key);
            object
        })
        .collect();

    (prefix, objects)
}

/// Generate random contents for each test object, preserving their order.
///
/// Panics if the same key appears more than once.
pub fn make_test_data(objects: impl IntoIterator<Item = TestObject>) -> Vec<TestObjectWithData> {
    let mut rand = rand::thread_rng();
    let mut seen = HashSet::new();

    objects
        .into_iter()
        .map(|object| {
            assert!(
                seen.insert(object.key.clone()),
                "BUG: test data contains the same key '{}' more than once",
                object.key
            );

            let mut data = vec![0u8; object.size];
            rand.fill(&mut data[..]);

            TestObjectWithData {
                key: object.key,
                data: Bytes::from(data),
            }
        })
        .collect()
}

/// The bytes of all of `objects` laid end to end
pub fn concatenated<'a>(objects: impl IntoIterator<Item = &'a TestObjectWithData>) -> Bytes {
    objects
        .into_iter()
        .flat_map(|object| object.data.iter().copied())
        .collect::<Vec<u8>>()
        .into()
}
