//! The analytical store admits one writer at a time.

use footfall_db::{BackendError, DbConnection};
use tempfile::TempDir;

#[test]
fn second_writer_is_turned_away_until_the_first_closes() {
    let dir = TempDir::new().unwrap();
    let store = dir.path().join("nested").join("analytics.duckdb");

    let writer = DbConnection::open_duckdb(&store).unwrap();
    writer
        .execute_batch("CREATE TABLE dim_stores (store_id BIGINT, store_name TEXT)")
        .unwrap();
    assert!(dir.path().join("nested").join("analytics.duckdb.lock").exists());

    match DbConnection::open_duckdb(&store) {
        Err(BackendError::Locked(path)) => assert!(path.ends_with("analytics.duckdb")),
        other => panic!("expected Locked, got {:?}", other),
    }

    // Clones share the lock rather than contending for it.
    let clone = writer.try_clone().unwrap();
    drop(writer);
    assert!(matches!(
        DbConnection::open_duckdb(&store),
        Err(BackendError::Locked(_))
    ));
    drop(clone);

    let reopened = DbConnection::open_duckdb(&store).unwrap();
    assert!(reopened.relation_exists("dim_stores").unwrap());
}

#[test]
fn readers_need_no_lock() {
    let dir = TempDir::new().unwrap();
    let store = dir.path().join("analytics.duckdb");
    DbConnection::open_duckdb(&store)
        .unwrap()
        .execute_batch("CREATE TABLE dim_stores AS SELECT 1::BIGINT AS store_id")
        .unwrap();

    let first = DbConnection::open_duckdb_readonly(&store).unwrap();
    let second = DbConnection::open_duckdb_readonly(&store).unwrap();
    for reader in [&first, &second] {
        let id: i64 = reader
            .query_scalar("SELECT store_id FROM dim_stores", &[])
            .unwrap();
        assert_eq!(id, 1);
    }
}
