//! Benchmark utilities.

#![warn(missing_docs)]

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use syncwell_protocol::{NewOperation, Operation, Timestamp};

/// Generate a random string of `len` alphanumeric characters.
pub fn random_text(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generate a card payload whose `body` field holds `size` characters.
pub fn card_payload(size: usize) -> Value {
    json!({
        "title": random_text(16),
        "body": random_text(size),
        "rank": rand::thread_rng().gen_range(0..1000),
    })
}

/// Generate `count` pending update operations spread over `entities`
/// cards.
pub fn generate_operations(count: usize, entities: usize, payload_size: usize) -> Vec<Operation> {
    (0..count)
        .map(|i| {
            let request = NewOperation::update(
                "card",
                format!("c{}", i % entities.max(1)),
                card_payload(payload_size),
            );
            Operation::from_request(request, 3, Timestamp::from_millis(i as u64))
        })
        .collect()
}
