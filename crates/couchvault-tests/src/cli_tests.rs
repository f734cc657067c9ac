//! Command-line runs against the mock server, checked through their exit codes.

use crate::harness::{only_entry, read_json, TestEnv};
use clap::Parser;
use couchvault::cli::{exit_code, Cli};
use serde_json::json;

fn cli(env: &TestEnv, args: &[&str]) -> Cli {
    let port = env.server().addr().port().to_string();
    let mut argv = vec!["couchvault", "--host", "127.0.0.1", "--port", port.as_str()];
    argv.extend_from_slice(args);
    Cli::parse_from(argv)
}

#[tokio::test]
async fn test_cli_dump_then_restore() {
    let env = TestEnv::start("test_cli_dump_then_restore").await;
    env.server()
        .put_document("orders", json!({"_id": "o1", "total": 10}));
    let out = env.tempdir().to_str().unwrap().to_string();

    let result = cli(&env, &["dump", "-d", "orders", "-X", "-o", out.as_str()]).run().await;
    assert_eq!(exit_code(&result), 0);
    assert_eq!(
        read_json(&env.path("orders.json")),
        json!({"docs": [{"_id": "o1", "total": 10}]})
    );

    let file = env.path("orders.json");
    let result = cli(
        &env,
        &["restore", "-d", "orders_copy", "-f", file.to_str().unwrap()],
    )
    .run()
    .await;
    assert_eq!(exit_code(&result), 0);
    assert_eq!(
        env.server().document("orders_copy", "o1"),
        Some(json!({"_id": "o1", "total": 10}))
    );
}

#[tokio::test]
async fn test_cli_database_failure_exits_two() {
    let env = TestEnv::start("test_cli_database_failure_exits_two").await;
    env.server()
        .put_document("orders", json!({"_id": "o1"}));
    env.server().fail_listing("orders");
    let out = env.tempdir().to_str().unwrap().to_string();

    let result = cli(&env, &["dump", "-d", "orders", "-X", "-o", out.as_str()]).run().await;
    assert_eq!(exit_code(&result), 2);
}

#[tokio::test]
async fn test_cli_fan_out_with_one_failure_exits_two() {
    let env = TestEnv::start("test_cli_fan_out_with_one_failure_exits_two").await;
    for db in ["a", "b", "c"] {
        env.server().put_document(db, json!({"_id": "x"}));
    }
    env.server().fail_listing("b");
    let out = env.tempdir().to_str().unwrap().to_string();

    let result = cli(&env, &["dump", "-g", "-X", "-m", "2", "-o", out.as_str()]).run().await;
    assert_eq!(exit_code(&result), 2);

    let root = only_entry(env.tempdir());
    assert!(root.join("a").join("x.json").is_file());
    assert!(root.join("c").join("x.json").is_file());
}

#[tokio::test]
async fn test_cli_config_errors_exit_one_without_requests() {
    let env = TestEnv::start("test_cli_config_errors_exit_one_without_requests").await;
    env.server().put_document("orders", json!({"_id": "o1"}));
    let out = env.tempdir().to_str().unwrap().to_string();

    let cases: Vec<Vec<&str>> = vec![
        vec!["dump", "-o", out.as_str()],
        vec!["dump", "-d", "orders", "-A", "-o", out.as_str()],
        vec!["dump", "-d", "orders", "-y", "no-such-filter-program", "-o", out.as_str()],
        vec!["restore", "-d", "orders_copy"],
        vec!["restore", "-d", "orders_copy", "-f", "/no/such/dump.json"],
    ];
    for args in cases {
        let result = cli(&env, &args).run().await;
        assert_eq!(exit_code(&result), 1, "{:?}", args);
    }
    assert_eq!(env.server().database_names(), vec!["orders"]);
    assert!(!env.path("orders.json").exists());
}
