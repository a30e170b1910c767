use pretty_assertions::assert_eq;

use super::{Command, PooledConnection};
use crate::{
    bson::{doc, rawdoc},
    options::WriteConcern,
    test::MockDeployment,
};

async fn check_out(deployment: &MockDeployment) -> PooledConnection {
    let pool = deployment.pool("a");
    let connection = pool.check_out().await.unwrap();
    PooledConnection::new(connection, pool)
}

#[tokio::test]
async fn dropped_connection_returns_to_its_pool() {
    let deployment = MockDeployment::replica_set();

    let conn = check_out(&deployment).await;
    assert_eq!(conn.id, 1);
    drop(conn);
    assert_eq!(deployment.checked_in(), vec![1]);

    let mut conn = check_out(&deployment).await;
    conn.mark_unusable();
    assert!(!conn.is_usable());
    drop(conn);
    assert_eq!(deployment.checked_in(), vec![1]);
    assert_eq!(deployment.discarded(), vec![2]);
}

#[tokio::test]
async fn pinned_connection_returns_to_its_handle() {
    let deployment = MockDeployment::load_balanced();

    let mut conn = check_out(&deployment).await;
    assert!(conn.service_id().is_some());
    let handle = conn.pin().unwrap();
    assert!(conn.is_pinned());
    assert!(conn.pin().is_err());
    assert_eq!(handle.id(), conn.id);
    drop(conn);
    assert!(deployment.checked_in().is_empty());

    // The connection can be borrowed from the handle any number of times.
    for _ in 0..2 {
        let conn = handle.take_connection().await.unwrap();
        assert_eq!(conn.id, 1);
        drop(conn);
    }
    let replica = handle.replicate();
    drop(handle);
    assert!(deployment.checked_in().is_empty());

    // Once the last handle is gone, the connection goes back to the pool.
    drop(replica);
    assert_eq!(deployment.checked_in(), vec![1]);
}

#[tokio::test]
async fn unusable_pinned_connection_is_discarded_on_unpin() {
    let deployment = MockDeployment::load_balanced();

    let mut conn = check_out(&deployment).await;
    let handle = conn.pin().unwrap();
    conn.mark_unusable();
    drop(conn);

    let conn = handle.take_connection().await.unwrap();
    assert!(!conn.is_usable());
    drop(conn);
    drop(handle);

    assert!(deployment.checked_in().is_empty());
    assert_eq!(deployment.discarded(), vec![1]);
}

#[tokio::test]
async fn pending_reply_is_drained_before_reuse() {
    let deployment = MockDeployment::load_balanced();

    let mut conn = check_out(&deployment).await;
    let handle = conn.pin().unwrap();
    conn.mark_pending_response();
    drop(conn);

    let mut conn = handle.take_connection().await.unwrap();
    assert!(conn.has_pending_response());
    conn.await_pending_response(None).await.unwrap();
    assert!(!conn.has_pending_response());
    drop(conn);
    drop(handle);

    assert_eq!(deployment.checked_in(), vec![1]);
    assert!(deployment.discarded().is_empty());
}

#[tokio::test]
async fn pending_reply_is_discarded_on_unpin() {
    let deployment = MockDeployment::load_balanced();

    let mut conn = check_out(&deployment).await;
    let handle = conn.pin().unwrap();
    conn.mark_pending_response();
    assert!(conn.is_usable());
    drop(conn);
    drop(handle);

    assert!(deployment.checked_in().is_empty());
    assert_eq!(deployment.discarded(), vec![1]);
}

#[tokio::test]
async fn route_availability_is_reported() {
    let deployment = MockDeployment::load_balanced();
    let conn = check_out(&deployment).await;
    assert!(conn.is_route_available());
    deployment.set_route_available(false);
    assert!(!conn.is_route_available());
}

#[test]
fn command_encoding() {
    let mut cmd = Command::new("insert", "db", rawdoc! { "insert": "coll" });
    cmd.set_txn_number(3);
    cmd.set_start_transaction();
    cmd.set_autocommit();
    cmd.set_max_time_ms(250);
    // An empty write concern leaves the server default in place.
    cmd.set_write_concern(WriteConcern::default());

    assert_eq!(
        cmd.encode().unwrap().to_document().unwrap(),
        doc! {
            "insert": "coll",
            "$db": "db",
            "txnNumber": 3_i64,
            "startTransaction": true,
            "autocommit": false,
            "maxTimeMS": 250_i64,
        }
    );

    cmd.set_write_concern(WriteConcern::majority());
    let encoded = cmd.encode().unwrap().to_document().unwrap();
    assert_eq!(
        encoded.get_document("writeConcern").unwrap(),
        &doc! { "w": "majority" }
    );
}

#[test]
fn redacted_commands() {
    assert!(Command::new("saslStart", "admin", rawdoc! { "saslStart": 1 }).should_redact());
    assert!(!Command::new("ping", "admin", rawdoc! { "ping": 1 }).should_redact());
}
