//! End-to-end scenarios against the crate's public API, mirroring the
//! literal request/response sequences the engine is expected to produce.

use std::time::Duration;

use guardrail::rules::BreakerStrategy;
use guardrail::{CircuitBreakerRule, Decision, ProtectionEngine, RateLimitRule, ReportOutcome, RuleRegistry};
use std::sync::Arc;

fn engine() -> ProtectionEngine {
    ProtectionEngine::new(Arc::new(RuleRegistry::new()))
}

#[test]
fn hard_qps_limit() {
    let engine = engine();
    engine
        .add_or_replace_rate_limit(RateLimitRule {
            name: "h".into(),
            pattern: "/health".into(),
            threshold: 2.0,
            window_ms: 1_000,
            enabled: true,
        })
        .unwrap();

    let decisions: Vec<_> = (0..5).map(|_| engine.acquire("/health")).collect();
    assert_eq!(
        decisions,
        vec![
            Decision::Admit,
            Decision::Admit,
            Decision::BlockRateLimit,
            Decision::BlockRateLimit,
            Decision::BlockRateLimit,
        ]
    );
}

#[test]
fn priority_resolution_favors_the_more_specific_pattern() {
    let engine = engine();
    engine
        .add_or_replace_rate_limit(RateLimitRule {
            name: "a".into(),
            pattern: "/api/v1/auth/*".into(),
            threshold: 10.0,
            window_ms: 60_000,
            enabled: true,
        })
        .unwrap();
    engine
        .add_or_replace_rate_limit(RateLimitRule {
            name: "b".into(),
            pattern: "/api/*".into(),
            threshold: 100.0,
            window_ms: 60_000,
            enabled: true,
        })
        .unwrap();

    let mut admitted = 0;
    let mut blocked = 0;
    for _ in 0..11 {
        match engine.acquire("/api/v1/auth/login") {
            Decision::Admit => admitted += 1,
            Decision::BlockRateLimit => blocked += 1,
            Decision::BlockCircuitOpen => panic!("no breaker rule configured"),
        }
    }
    assert_eq!(admitted, 10);
    assert_eq!(blocked, 1);
}

fn breaker_rule() -> CircuitBreakerRule {
    CircuitBreakerRule {
        name: "auth-breaker".into(),
        pattern: "/api/test/auth/*".into(),
        strategy: BreakerStrategy::ErrorRatio,
        threshold: 0.5,
        min_request_amount: 10,
        stat_window_ms: 10_000,
        bucket_count: 10,
        retry_timeout_ms: 5_000,
        max_allowed_rt_ms: 0,
        probe_num: 3,
        enabled: true,
    }
}

#[test]
fn breaker_trips_on_error_ratio() {
    let engine = engine();
    engine.add_or_replace_circuit_breaker(breaker_rule()).unwrap();

    let resource = "/api/test/auth/register";
    let mut handles = Vec::new();
    for _ in 0..10 {
        let (decision, handle) = engine.acquire_with_handle(resource);
        assert_eq!(decision, Decision::Admit);
        handles.push(handle.unwrap());
    }
    for handle in handles.drain(..6) {
        engine.report(&handle, ReportOutcome::Error, Duration::from_millis(1));
    }
    for handle in handles.drain(..) {
        engine.report(&handle, ReportOutcome::Success, Duration::from_millis(1));
    }

    // 11th Acquire is blocked; breaker is Open. Half-open recovery after
    // the retry timeout is exercised at the breaker level directly
    // (`breaker::tests::recovers_through_half_open`), since the engine's
    // public API has no clock-skip hook.
    assert_eq!(engine.acquire(resource), Decision::BlockCircuitOpen);
    let stats = engine.stats(resource);
    assert!(stats.breaker.is_some());
}

#[test]
fn multi_pattern_glob_gives_each_resource_its_own_counter() {
    let engine = engine();
    engine
        .add_or_replace_rate_limit(RateLimitRule {
            name: "m".into(),
            pattern: "/grpc/*/get*,/grpc/*/list*,/grpc/*/find*".into(),
            threshold: 10.0,
            window_ms: 1_000,
            enabled: true,
        })
        .unwrap();

    for _ in 0..6 {
        assert_eq!(engine.acquire("/grpc/user_service/get_user"), Decision::Admit);
    }
    for _ in 0..6 {
        assert_eq!(
            engine.acquire("/grpc/order_service/list_orders"),
            Decision::Admit
        );
    }

    let user_stats = engine.stats("/grpc/user_service/get_user").rate_limit.unwrap();
    let order_stats = engine.stats("/grpc/order_service/list_orders").rate_limit.unwrap();
    assert_eq!(user_stats.pass, 6);
    assert_eq!(order_stats.pass, 6);
}

#[test]
fn rpc_name_mapping() {
    use guardrail::adapters::rpc::rpc_resource_name;
    assert_eq!(
        rpc_resource_name("/user.UserService/GetUser"),
        "/grpc/user_service/get_user"
    );
    assert_eq!(
        rpc_resource_name("/order.OrderService/CreateOrder"),
        "/grpc/order_service/create_order"
    );
}

#[test]
fn rule_mutation_takes_effect_only_after_invalidation_not_retroactively() {
    let engine = engine();
    engine
        .add_or_replace_rate_limit(RateLimitRule {
            name: "a".into(),
            pattern: "/x".into(),
            threshold: 1.0,
            window_ms: 1_000,
            enabled: true,
        })
        .unwrap();
    assert_eq!(engine.acquire("/x"), Decision::Admit);
    assert_eq!(engine.acquire("/x"), Decision::BlockRateLimit);

    // Loosen the rule; the next acquire should see the new threshold since
    // mutation invalidates cached per-resource state.
    engine
        .add_or_replace_rate_limit(RateLimitRule {
            name: "a".into(),
            pattern: "/x".into(),
            threshold: 5.0,
            window_ms: 1_000,
            enabled: true,
        })
        .unwrap();
    assert_eq!(engine.acquire("/x"), Decision::Admit);
}
