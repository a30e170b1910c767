use std::time::Duration;

use pretty_assertions::assert_eq;

use crate::{
    bson::{doc, from_document},
    options::{Acknowledgment, ClientOptions, ServerAddress, TransactionOptions, WriteConcern},
};

#[test]
fn parse_server_address() {
    let address = ServerAddress::parse("Example.COM:27018").unwrap();
    assert_eq!(address.host(), "example.com");
    assert_eq!(address.port(), Some(27018));
    assert_eq!(address.to_string(), "example.com:27018");

    let default_port: ServerAddress = "localhost".parse().unwrap();
    assert_eq!(default_port.to_string(), "localhost:27017");

    assert!(ServerAddress::parse(":27017").is_err());
    assert!(ServerAddress::parse("localhost:0").is_err());
    assert!(ServerAddress::parse("localhost:abc").is_err());
    assert!(ServerAddress::parse("a:1:2").is_err());
}

#[test]
fn deserialize_client_options() {
    let options: ClientOptions = from_document(doc! {
        "timeoutMS": 1500_i64,
        "socketTimeoutMS": 200_i64,
        "cursorCleanupGraceMS": 50_i64,
        "retryWrites": false,
        "loadBalanced": true,
        "writeConcern": { "w": "majority", "wtimeoutMS": 100_i64 },
    })
    .unwrap();

    assert_eq!(options.timeout, Some(Duration::from_millis(1500)));
    assert_eq!(options.socket_timeout, Some(Duration::from_millis(200)));
    assert_eq!(options.cursor_cleanup_grace, Some(Duration::from_millis(50)));
    assert_eq!(options.max_time_ceiling, None);
    assert_eq!(options.retry_writes, Some(false));
    assert_eq!(options.retry_reads, None);
    assert_eq!(options.load_balanced, Some(true));
    assert_eq!(
        options.write_concern,
        Some(
            WriteConcern::builder()
                .w(Acknowledgment::Majority)
                .w_timeout(Duration::from_millis(100))
                .build()
        )
    );
    assert!(options.retryable_write_label_policy.is_none());
}

#[test]
fn transaction_options_merge_defaults() {
    let defaults = TransactionOptions::builder()
        .write_concern(WriteConcern::majority())
        .max_commit_time(Duration::from_secs(3))
        .build();
    let mut options = TransactionOptions::builder()
        .max_commit_time(Duration::from_secs(1))
        .build();
    options.merge(&defaults);

    assert_eq!(options.write_concern, Some(WriteConcern::majority()));
    assert_eq!(options.max_commit_time, Some(Duration::from_secs(1)));
}

#[test]
fn invalid_write_concern_is_rejected() {
    let options = ClientOptions::builder()
        .write_concern(
            WriteConcern::builder()
                .w(Acknowledgment::Nodes(0))
                .journal(true)
                .build(),
        )
        .build();
    assert!(options.validate().is_err());
}
