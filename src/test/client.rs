use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::time::Instant;

use crate::{
    bson::doc,
    error::{ErrorKind, RETRYABLE_WRITE_ERROR},
    options::{Acknowledgment, ClientOptions, RunCommandOptions, WriteConcern},
    retry::Retryability,
    test::{MockDeployment, MockReply},
};

fn budget(millis: u64) -> ClientOptions {
    ClientOptions::builder()
        .timeout(Duration::from_millis(millis))
        .build()
}

fn retryable(retryability: Retryability) -> RunCommandOptions {
    RunCommandOptions::builder()
        .retryability(retryability)
        .build()
}

#[tokio::test(start_paused = true)]
async fn slow_reply_times_out_at_the_budget() {
    let deployment = MockDeployment::replica_set();
    deployment.script([MockReply::Delay(
        Duration::from_millis(200),
        doc! { "ok": 1 },
    )]);
    let client = deployment.client(budget(50));

    let start = Instant::now();
    let error = client
        .run_command("db", doc! { "ping": 1 }, None)
        .await
        .unwrap_err();
    let elapsed = start.elapsed();

    assert!(error.is_timed_out(), "{error}");
    assert!(elapsed >= Duration::from_millis(50), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(200), "{elapsed:?}");
    // The reply may still arrive on the abandoned connection.
    assert_eq!(deployment.discarded(), vec![1]);
    assert!(deployment.checked_in().is_empty());
}

#[tokio::test(start_paused = true)]
async fn no_budget_waits_for_slow_replies() {
    let deployment = MockDeployment::replica_set();
    deployment.script([MockReply::Delay(
        Duration::from_millis(200),
        doc! { "ok": 1, "answer": 42 },
    )]);
    let client = deployment.client(ClientOptions::default());

    let reply = client
        .run_command("db", doc! { "ping": 1 }, None)
        .await
        .unwrap();
    assert_eq!(reply.get_i32("answer").unwrap(), 42);
    assert_eq!(deployment.checked_in(), vec![1]);

    let sent = deployment.sent();
    assert!(!sent[0].body.contains_key("maxTimeMS"));
}

#[tokio::test(start_paused = true)]
async fn zero_budget_disables_the_timeout() {
    let deployment = MockDeployment::replica_set();
    deployment.script([MockReply::Delay(Duration::from_secs(5), doc! { "ok": 1 })]);
    let client = deployment.client(budget(0));

    client
        .run_command("db", doc! { "ping": 1 }, None)
        .await
        .unwrap();
    assert!(!deployment.sent()[0].body.contains_key("maxTimeMS"));
}

#[tokio::test(start_paused = true)]
async fn budget_is_forwarded_as_max_time() {
    let deployment = MockDeployment::replica_set();
    let options = ClientOptions::builder()
        .timeout(Duration::from_millis(500))
        .max_time_ceiling(Duration::from_millis(200))
        .build();
    let client = deployment.client(options);

    client
        .run_command("db", doc! { "ping": 1 }, None)
        .await
        .unwrap();
    let sent = deployment.sent();
    assert_eq!(sent[0].body.get_i64("maxTimeMS").unwrap(), 200);
    assert_eq!(sent[0].body.get_str("$db").unwrap(), "db");
}

#[tokio::test(start_paused = true)]
async fn legacy_timeouts_ignored_under_a_budget() {
    let deployment = MockDeployment::replica_set();
    deployment.script([MockReply::Delay(
        Duration::from_millis(50),
        doc! { "ok": 1 },
    )]);
    let options = ClientOptions::builder()
        .timeout(Duration::from_secs(1))
        .socket_timeout(Duration::from_millis(10))
        .build();
    let client = deployment.client(options);

    let command_options = RunCommandOptions::builder()
        .retryability(Retryability::Write)
        .max_time(Duration::from_secs(5))
        .write_concern(
            WriteConcern::builder()
                .w(Acknowledgment::Majority)
                .w_timeout(Duration::from_secs(3))
                .build(),
        )
        .build();
    client
        .run_command(
            "db",
            doc! { "insert": "coll", "documents": [{ "x": 1 }] },
            command_options,
        )
        .await
        .unwrap();

    let body = &deployment.sent()[0].body;
    assert!(body.get_i64("maxTimeMS").unwrap() <= 1000);
    let write_concern = body.get_document("writeConcern").unwrap();
    assert_eq!(write_concern, &doc! { "w": "majority" });
}

#[tokio::test(start_paused = true)]
async fn legacy_timeouts_apply_without_a_budget() {
    let deployment = MockDeployment::replica_set();
    deployment.script([
        MockReply::Ok(doc! { "ok": 1 }),
        MockReply::Delay(Duration::from_millis(50), doc! { "ok": 1 }),
    ]);
    let options = ClientOptions::builder()
        .socket_timeout(Duration::from_millis(10))
        .build();
    let client = deployment.client(options);

    let command_options = RunCommandOptions::builder()
        .max_time(Duration::from_secs(5))
        .build();
    client
        .run_command("db", doc! { "ping": 1 }, command_options)
        .await
        .unwrap();
    assert_eq!(deployment.sent()[0].body.get_i64("maxTimeMS").unwrap(), 5000);

    let error = client
        .run_command("db", doc! { "ping": 1 }, None)
        .await
        .unwrap_err();
    assert!(!error.is_timed_out());
    assert!(
        matches!(*error.kind, ErrorKind::Io(ref e) if e.kind() == std::io::ErrorKind::TimedOut),
        "{error}"
    );
}

#[tokio::test(start_paused = true)]
async fn embedded_max_time_and_write_concern_follow_the_budget() {
    let deployment = MockDeployment::replica_set();
    let client = deployment.client(budget(300));

    client
        .run_command(
            "db",
            doc! {
                "update": "coll",
                "updates": [],
                "maxTimeMS": 10_000,
                "writeConcern": { "w": 1, "wtimeout": 100 },
            },
            None,
        )
        .await
        .unwrap();

    let body = &deployment.sent()[0].body;
    assert!(body.get_i64("maxTimeMS").unwrap() <= 300);
    assert_eq!(body.get_document("writeConcern").unwrap(), &doc! { "w": 1 });
}

#[tokio::test(start_paused = true)]
async fn second_retryable_failure_surfaces() {
    let deployment = MockDeployment::replica_set();
    deployment.script([
        MockReply::network_error(),
        MockReply::command_error(91, &[]),
    ]);
    let client = deployment.client(ClientOptions::default());

    let error = client
        .run_command("db", doc! { "find": "coll" }, retryable(Retryability::Read))
        .await
        .unwrap_err();
    assert_eq!(error.code(), Some(91));

    // The retry avoids the server the first attempt failed on.
    let hosts: Vec<String> = deployment
        .sent()
        .iter()
        .map(|c| c.address.host().to_string())
        .collect();
    assert_eq!(hosts, vec!["a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn read_retry_succeeds_after_transient_failure() {
    let deployment = MockDeployment::replica_set();
    deployment.script([
        MockReply::command_error(11600, &[]),
        MockReply::Ok(doc! { "ok": 1, "n": 3 }),
    ]);
    let client = deployment.client(ClientOptions::default());

    let reply = client
        .run_command("db", doc! { "count": "coll" }, retryable(Retryability::Read))
        .await
        .unwrap();
    assert_eq!(reply.get_i32("n").unwrap(), 3);
    assert_eq!(deployment.sent().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn non_retryable_failure_is_not_retried() {
    let deployment = MockDeployment::replica_set();
    deployment.script([MockReply::command_error(11000, &[])]);
    let client = deployment.client(ClientOptions::default());

    let error = client
        .run_command(
            "db",
            doc! { "insert": "coll", "documents": [{ "_id": 1 }] },
            retryable(Retryability::Write),
        )
        .await
        .unwrap_err();
    assert_eq!(error.code(), Some(11000));
    assert_eq!(deployment.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn write_is_attempted_at_most_twice() {
    let deployment = MockDeployment::replica_set();
    deployment.script([
        MockReply::network_error(),
        MockReply::network_error(),
        MockReply::Ok(doc! { "ok": 1 }),
    ]);
    let client = deployment.client(ClientOptions::default());

    let error = client
        .run_command(
            "db",
            doc! { "insert": "coll", "documents": [{ "x": 1 }] },
            retryable(Retryability::Write),
        )
        .await
        .unwrap_err();
    assert!(error.contains_label(RETRYABLE_WRITE_ERROR));

    let sent = deployment.sent();
    assert_eq!(sent.len(), 2);
    // Both attempts carry the same idempotency identifier and session.
    assert_eq!(sent[0].body.get_i64("txnNumber").unwrap(), 1);
    assert_eq!(sent[1].body.get_i64("txnNumber").unwrap(), 1);
    assert_eq!(
        sent[0].body.get_document("lsid").unwrap(),
        sent[1].body.get_document("lsid").unwrap()
    );
}

#[tokio::test(start_paused = true)]
async fn server_labeled_write_error_is_retried() {
    let deployment = MockDeployment::replica_set();
    deployment.script([
        MockReply::command_error(10107, &[RETRYABLE_WRITE_ERROR]),
        MockReply::Ok(doc! { "ok": 1, "n": 1 }),
    ]);
    let client = deployment.client(ClientOptions::default());

    client
        .run_command(
            "db",
            doc! { "insert": "coll", "documents": [{ "x": 1 }] },
            retryable(Retryability::Write),
        )
        .await
        .unwrap();
    assert_eq!(deployment.sent().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn retry_writes_disabled() {
    let deployment = MockDeployment::replica_set();
    deployment.script([MockReply::network_error()]);
    let client = deployment.client(ClientOptions::builder().retry_writes(false).build());

    client
        .run_command(
            "db",
            doc! { "insert": "coll", "documents": [{ "x": 1 }] },
            retryable(Retryability::Write),
        )
        .await
        .unwrap_err();
    let sent = deployment.sent();
    assert_eq!(sent.len(), 1);
    assert!(!sent[0].body.contains_key("txnNumber"));
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_write_has_no_session_and_no_retry() {
    let deployment = MockDeployment::replica_set();
    deployment.script([MockReply::network_error()]);
    let client = deployment.client(ClientOptions::default());

    let options = RunCommandOptions::builder()
        .retryability(Retryability::Write)
        .write_concern(WriteConcern::nodes(0))
        .build();
    client
        .run_command(
            "db",
            doc! { "insert": "coll", "documents": [{ "x": 1 }] },
            options,
        )
        .await
        .unwrap_err();

    let sent = deployment.sent();
    assert_eq!(sent.len(), 1);
    assert!(!sent[0].body.contains_key("lsid"));
    assert!(!sent[0].body.contains_key("txnNumber"));
}

#[tokio::test(start_paused = true)]
async fn timed_out_retry_surfaces_the_timeout() {
    let deployment = MockDeployment::replica_set();
    deployment.script([
        MockReply::Delay(Duration::from_millis(500), doc! { "ok": 1 }),
        MockReply::Ok(doc! { "ok": 1 }),
    ]);
    let client = deployment.client(budget(100));

    let error = client
        .run_command("db", doc! { "find": "coll" }, retryable(Retryability::Read))
        .await
        .unwrap_err();
    assert!(error.is_timed_out(), "{error}");
    // The budget is spent, so the retry never reaches a server.
    assert_eq!(deployment.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn implicit_session_is_returned_to_the_pool() {
    let deployment = MockDeployment::replica_set();
    let client = deployment.client(ClientOptions::default());

    client
        .run_command("db", doc! { "ping": 1 }, None)
        .await
        .unwrap();
    let lsid = deployment.sent()[0].body.get_document("lsid").unwrap().clone();
    // Session check-in runs on a spawned task.
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(client.is_session_checked_in(&lsid).await);
}

#[tokio::test(start_paused = true)]
async fn dirty_implicit_session_is_discarded() {
    let deployment = MockDeployment::replica_set();
    deployment.script([MockReply::network_error()]);
    let client = deployment.client(ClientOptions::default());

    client
        .run_command("db", doc! { "ping": 1 }, None)
        .await
        .unwrap_err();
    let lsid = deployment.sent()[0].body.get_document("lsid").unwrap().clone();
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(!client.is_session_checked_in(&lsid).await);
}
