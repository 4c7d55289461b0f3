mod common;

use pg_change_notifier::adapter::ChangeAdapter;
use pg_change_notifier::delivery::EventCallback;
use pg_change_notifier::filter::TableFilter;
use pg_change_notifier::postgres::PostgresAdapter;
use pg_change_notifier::{ChangeEvent, ChangeNotifier, Operation};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::info;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("pg_change_notifier=debug")
        .try_init()
        .ok();
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<ChangeEvent>) -> ChangeEvent {
    timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for change event")
        .expect("callback channel closed")
}

#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_end_to_end_notifications() {
    init_tracing();

    let client = common::connect().await;
    let table = common::test_table_name("e2e");
    common::create_table(&client, &table).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = common::get_test_config(&table).with_callback(move |event: ChangeEvent| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event);
            Ok(())
        }
    });

    let mut notifier = ChangeNotifier::new(config).unwrap();
    notifier.initialize().await.unwrap();
    assert!(notifier.is_active());
    assert_eq!(common::trigger_count(&client, &table).await, 1);

    let operations = [
        format!("INSERT INTO public.{table} (name, balance) VALUES ('Alice', 30)"),
        format!("UPDATE public.{table} SET balance = 31 WHERE name = 'Alice'"),
        format!("DELETE FROM public.{table} WHERE name = 'Alice'"),
    ];
    for sql in &operations {
        info!("Executing SQL: {}", sql);
        client.batch_execute(sql).await.unwrap();
    }

    let insert = next_event(&mut rx).await;
    assert_eq!(insert.operation, Operation::Insert);
    assert_eq!(insert.source.table, table);
    assert_eq!(insert.source.schema.as_deref(), Some("public"));
    assert_eq!(insert.data.new.as_ref().unwrap()["balance"], 30);
    assert!(insert.data.old.is_none());

    let update = next_event(&mut rx).await;
    assert_eq!(update.operation, Operation::Update);
    assert_eq!(update.data.old.as_ref().unwrap()["balance"], 30);
    assert_eq!(update.data.new.as_ref().unwrap()["balance"], 31);

    let delete = next_event(&mut rx).await;
    assert_eq!(delete.operation, Operation::Delete);
    assert!(delete.data.new.is_none());
    assert_eq!(delete.data.old.as_ref().unwrap()["name"], "Alice");

    let stats = notifier.stats();
    assert_eq!(stats.events_processed, 3);
    assert_eq!(stats.events_by_table[table.as_str()], 3);

    notifier.stop().await;
    assert!(!notifier.is_active());
    assert_eq!(common::trigger_count(&client, &table).await, 0);

    common::drop_table(&client, &table).await;
}

#[tokio::test]
#[ignore]
async fn test_setup_and_teardown_are_idempotent() {
    init_tracing();

    let client = common::connect().await;
    let table = common::test_table_name("idem");
    common::create_table(&client, &table).await;

    let mut adapter = PostgresAdapter::new(&common::get_test_database()).unwrap();
    assert!(adapter.test_connection().await);

    let filter = TableFilter::default().include([table.as_str()]);
    adapter.setup_change_notifications(&filter).await.unwrap();
    adapter.setup_change_notifications(&filter).await.unwrap();

    let triggers = adapter.triggers();
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].table, table);
    assert_eq!(triggers[0].schema, "public");
    assert_eq!(common::trigger_count(&client, &table).await, 1);

    adapter.teardown_change_notifications().await.unwrap();
    adapter.teardown_change_notifications().await.unwrap();
    assert!(adapter.triggers().is_empty());
    assert_eq!(common::trigger_count(&client, &table).await, 0);

    common::drop_table(&client, &table).await;
}

#[tokio::test]
#[ignore]
async fn test_excluded_table_gets_no_trigger() {
    init_tracing();

    let client = common::connect().await;
    let kept = common::test_table_name("kept");
    let skipped = common::test_table_name("skipped");
    common::create_table(&client, &kept).await;
    common::create_table(&client, &skipped).await;

    let mut adapter = PostgresAdapter::new(&common::get_test_database()).unwrap();
    let filter = TableFilter::default()
        .include([kept.as_str(), skipped.as_str()])
        .exclude([skipped.as_str()]);
    adapter.setup_change_notifications(&filter).await.unwrap();

    assert_eq!(common::trigger_count(&client, &kept).await, 1);
    assert_eq!(common::trigger_count(&client, &skipped).await, 0);

    adapter.teardown_change_notifications().await.unwrap();
    common::drop_table(&client, &kept).await;
    common::drop_table(&client, &skipped).await;
}
