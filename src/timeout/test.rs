use std::time::Duration;

use pretty_assertions::assert_eq;

use super::{max_time_ms, TimeoutContext, TimeoutSettings};
use crate::options::{Acknowledgment, WriteConcern};

#[tokio::test(start_paused = true)]
async fn zero_or_absent_budget_never_times_out() {
    for ctx in [
        TimeoutContext::for_new_operation(None),
        TimeoutContext::for_new_operation(Duration::ZERO),
    ] {
        assert_eq!(ctx.deadline(), None);
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(ctx.remaining().unwrap(), None);
        assert_eq!(ctx.per_call_ceiling().unwrap(), None);
    }
}

#[tokio::test(start_paused = true)]
async fn remaining_is_monotonic_until_expiry() {
    let ctx = TimeoutContext::for_new_operation(Duration::from_millis(100));
    let mut previous = ctx.remaining().unwrap().unwrap();
    assert_eq!(previous, Duration::from_millis(100));

    for _ in 0..9 {
        tokio::time::advance(Duration::from_millis(10)).await;
        let current = ctx.remaining().unwrap().unwrap();
        assert!(current <= previous);
        previous = current;
    }

    tokio::time::advance(Duration::from_millis(10)).await;
    let error = ctx.remaining().unwrap_err();
    assert!(error.is_timed_out());
}

#[tokio::test(start_paused = true)]
async fn per_call_ceiling_is_capped() {
    let settings = TimeoutSettings {
        budget: Some(Duration::from_secs(10)),
        max_time_ceiling: Some(Duration::from_secs(2)),
        ..Default::default()
    };
    let ctx = settings.new_context();
    assert_eq!(ctx.per_call_ceiling().unwrap(), Some(Duration::from_secs(2)));

    tokio::time::advance(Duration::from_millis(9500)).await;
    assert_eq!(
        ctx.per_call_ceiling().unwrap(),
        Some(Duration::from_millis(500))
    );
}

#[tokio::test(start_paused = true)]
async fn legacy_timeouts_ignored_with_budget() {
    let legacy = Some(Duration::from_secs(30));
    let write_concern = WriteConcern::builder()
        .w(Acknowledgment::Majority)
        .w_timeout(Duration::from_secs(5))
        .build();

    let with_budget = TimeoutSettings {
        budget: Some(Duration::from_secs(1)),
        socket_timeout: Some(Duration::from_millis(10)),
        ..Default::default()
    }
    .new_context();
    assert_eq!(with_budget.max_time(legacy).unwrap(), Some(Duration::from_secs(1)));
    assert_eq!(with_budget.write_concern(&write_concern).w_timeout, None);
    assert_eq!(with_budget.send_deadline(), with_budget.deadline());

    let without_budget = TimeoutSettings {
        socket_timeout: Some(Duration::from_millis(10)),
        ..Default::default()
    }
    .new_context();
    assert_eq!(without_budget.max_time(legacy).unwrap(), legacy);
    assert_eq!(
        without_budget.write_concern(&write_concern).w_timeout,
        Some(Duration::from_secs(5))
    );
    assert_eq!(
        without_budget.send_deadline(),
        Some(tokio::time::Instant::now() + Duration::from_millis(10))
    );
}

#[tokio::test(start_paused = true)]
async fn refreshed_context_restarts_the_budget() {
    let ctx = TimeoutContext::for_new_operation(Duration::from_millis(100));
    tokio::time::advance(Duration::from_millis(80)).await;
    assert_eq!(ctx.remaining().unwrap(), Some(Duration::from_millis(20)));

    let fresh = ctx.refreshed();
    assert_eq!(fresh.remaining().unwrap(), Some(Duration::from_millis(100)));
    assert_eq!(fresh.budget(), ctx.budget());
}

#[tokio::test(start_paused = true)]
async fn bound_fails_slow_futures() {
    let ctx = TimeoutContext::for_new_operation(Duration::from_millis(50));
    let start = tokio::time::Instant::now();
    let result = ctx
        .bound("test", async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;
    assert!(result.unwrap_err().is_timed_out());
    assert_eq!(start.elapsed(), Duration::from_millis(50));
}

#[tokio::test(start_paused = true)]
async fn socket_timeout_produces_network_error() {
    let ctx = TimeoutSettings {
        socket_timeout: Some(Duration::from_millis(20)),
        ..Default::default()
    }
    .new_context();
    let error = ctx
        .bound_send(async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(error.is_network_timeout());
    assert!(!error.is_timed_out());
}

#[tokio::test(start_paused = true)]
async fn cleanup_grace_defaults() {
    let explicit = TimeoutSettings {
        budget: Some(Duration::from_secs(5)),
        cleanup_grace: Some(Duration::from_millis(250)),
        ..Default::default()
    };
    assert_eq!(
        explicit.cleanup_context().budget(),
        Some(Duration::from_millis(250))
    );

    let from_budget = TimeoutSettings {
        budget: Some(Duration::from_secs(5)),
        ..Default::default()
    };
    assert_eq!(
        from_budget.cleanup_context().budget(),
        Some(Duration::from_secs(5))
    );

    assert_eq!(
        TimeoutSettings::default().cleanup_context().budget(),
        Some(Duration::from_secs(1))
    );
}

#[test]
fn max_time_rounds_up() {
    assert_eq!(max_time_ms(Duration::from_micros(1)), 1);
    assert_eq!(max_time_ms(Duration::from_millis(20)), 20);
    assert_eq!(max_time_ms(Duration::from_micros(20_001)), 21);
    assert_eq!(max_time_ms(Duration::from_secs(u64::MAX / 2)), i32::MAX as i64);
}
