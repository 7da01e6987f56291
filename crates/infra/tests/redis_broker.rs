//! Redis broker behavior against a live server.
//!
//! Runs only with the `redis` feature and a `REDIS_URL`; without one each test
//! prints a note and returns.

#![cfg(feature = "redis")]

use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use courier_core::TenantId;
use courier_infra::jobs::{Job, JobKind, JobOptions, JobQueue, RateLimit, RedisJobQueue};

/// Connects to `REDIS_URL`, or returns None when it is not set.
async fn connect(queue: &str, limit: RateLimit) -> Option<RedisJobQueue> {
    let Ok(redis_url) = std::env::var("REDIS_URL") else {
        println!("REDIS_URL not set, skipping Redis broker tests");
        return None;
    };
    let broker = RedisJobQueue::connect(redis_url).await.unwrap();
    Some(broker.with_rate_limit(queue, limit))
}

macro_rules! require_redis {
    ($broker:expr) => {
        match $broker {
            Some(broker) => broker,
            None => {
                println!("Skipping test: Redis not available");
                return;
            }
        }
    };
}

/// A queue name no other run shares.
fn unique_queue() -> String {
    format!("test-{}", Uuid::new_v4())
}

fn job(tenant: TenantId, queue: &str, rate_key: &str) -> Job {
    let mut options = JobOptions::default().rate_key(rate_key);
    options.queue = Some(queue.to_owned());
    Job::new(tenant, JobKind::SendMessage, json!({})).with_options(options)
}

#[tokio::test]
async fn long_backlog_of_a_limited_key_does_not_hide_later_keys() {
    let queue = unique_queue();
    let broker = require_redis!(
        connect(&queue, RateLimit {
            max: 1,
            window: Duration::from_secs(3600),
        })
        .await
    );
    let tenant = TenantId::new();

    for _ in 0..60 {
        broker.enqueue(job(tenant, &queue, "a")).await.unwrap();
    }
    // Strictly behind the backlog
    tokio::time::sleep(Duration::from_millis(5)).await;
    let other = broker.enqueue(job(tenant, &queue, "b")).await.unwrap();

    let first = broker.claim_next(&queue).await.unwrap().unwrap();
    assert_eq!(first.rate_key.as_deref(), Some("a"));

    let second = broker.claim_next(&queue).await.unwrap().unwrap();
    assert_eq!(second.id, other.id);

    assert!(broker.claim_next(&queue).await.unwrap().is_none());
}
