//! Cache-layer behavior across the full engine: TTL discipline, forced
//! refresh, and degraded stale serving.

mod common;

use std::sync::Arc;
use std::time::Duration;

use addax::session::ReconciliationSession;
use addax::utils::CancelToken;
use common::{folders, MockSource, TestEnv};

#[tokio::test]
async fn second_session_within_ttl_never_reaches_the_source() {
    let env = TestEnv::new();
    env.write_addon("Bagnon", "## Title: Bagnon\n");

    let source = MockSource::new("alpha");
    source.identity("bagnon", "Bagnon");

    let (ctx, _clock) = env.context_with_clock(&[(source.clone(), 0)], Arc::default());

    ReconciliationSession::start(&ctx, &CancelToken::new()).await.unwrap();
    let calls_after_first = source.search_calls();
    assert!(calls_after_first > 0);

    ReconciliationSession::start(&ctx, &CancelToken::new()).await.unwrap();
    assert_eq!(source.search_calls(), calls_after_first, "served from cache");
}

#[tokio::test]
async fn expired_ttl_reaches_the_source_again() {
    let env = TestEnv::new();
    env.write_addon("Bagnon", "## Title: Bagnon\n");

    let source = MockSource::new("alpha");
    source.identity("bagnon", "Bagnon");

    let (ctx, clock) = env.context_with_clock(&[(source.clone(), 0)], Arc::default());

    ReconciliationSession::start(&ctx, &CancelToken::new()).await.unwrap();
    let calls_after_first = source.search_calls();

    clock.advance(Duration::from_secs(301));
    ReconciliationSession::start(&ctx, &CancelToken::new()).await.unwrap();
    assert!(source.search_calls() > calls_after_first, "expired entry refetched");
}

#[tokio::test]
async fn manual_invalidation_forces_a_refresh() {
    let env = TestEnv::new();
    env.write_addon("Bagnon", "## Title: Bagnon\n");

    let source = MockSource::new("alpha");
    source.identity("bagnon", "Bagnon");

    let (ctx, _clock) = env.context_with_clock(&[(source.clone(), 0)], Arc::default());

    ReconciliationSession::start(&ctx, &CancelToken::new()).await.unwrap();
    let calls_after_first = source.search_calls();

    ctx.cache.invalidate("alpha", None);
    ReconciliationSession::start(&ctx, &CancelToken::new()).await.unwrap();
    assert!(source.search_calls() > calls_after_first);
}

#[tokio::test]
async fn stale_entry_keeps_matching_through_an_outage() {
    let env = TestEnv::new();
    env.write_addon("Bagnon", "## Title: Bagnon\n");

    let source = MockSource::new("alpha");
    source.identity("bagnon", "Bagnon");

    let (ctx, clock) = env.context_with_clock(&[(source.clone(), 0)], Arc::default());

    // Prime the cache, then expire it and take the source down.
    ReconciliationSession::start(&ctx, &CancelToken::new()).await.unwrap();
    clock.advance(Duration::from_secs(301));
    source.fail_next_searches(100);

    let session = ReconciliationSession::start(&ctx, &CancelToken::new()).await.unwrap();
    let entry = session.entry(&folders(&["Bagnon"])).unwrap();
    assert_eq!(
        entry.candidates.len(),
        1,
        "stale catalogue entries still produce candidates during an outage"
    );
}
