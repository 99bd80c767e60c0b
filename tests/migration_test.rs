use tempfile::tempdir;
use thinkwire::db::{init_db, SCHEMA_VERSION};

#[tokio::test]
async fn test_migrations_and_schema() {
    let dir = match tempdir() {
        Ok(d) => d,
        Err(e) => panic!("Failed to create temp dir: {:?}", e),
    };
    let db_path = dir.path().join("test_thinkwire.db");

    let pool = match init_db(&db_path).await {
        Ok(p) => p,
        Err(e) => panic!("Failed to init DB: {:?}", e),
    };

    let journal_mode: (String,) = match sqlx::query_as("PRAGMA journal_mode").fetch_one(&pool).await {
        Ok(jm) => jm,
        Err(e) => panic!("Failed to query journal_mode: {:?}", e),
    };
    assert_eq!(journal_mode.0.to_uppercase(), "WAL");

    let tables: Vec<(String,)> = match sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table'")
        .fetch_all(&pool)
        .await
    {
        Ok(t) => t,
        Err(e) => panic!("Failed to query tables: {:?}", e),
    };
    let table_names: Vec<String> = tables.into_iter().map(|t| t.0).collect();
    for expected in ["conversations", "messages", "agent_profiles", "schema_metadata"] {
        assert!(table_names.contains(&expected.to_string()), "missing table {}", expected);
    }

    let indexes: Vec<(String,)> = match sqlx::query_as("SELECT name FROM sqlite_master WHERE type='index'")
        .fetch_all(&pool)
        .await
    {
        Ok(i) => i,
        Err(e) => panic!("Failed to query indexes: {:?}", e),
    };
    let index_names: Vec<String> = indexes.into_iter().map(|i| i.0).collect();
    assert!(index_names.contains(&"idx_conversations_project_started".to_string()));
    assert!(index_names.contains(&"idx_messages_conversation_seq".to_string()));

    let columns: Vec<(i64, String, String, i64, Option<String>, i64)> =
        match sqlx::query_as("PRAGMA table_info(messages)").fetch_all(&pool).await {
            Ok(c) => c,
            Err(e) => panic!("Failed to query table_info: {:?}", e),
        };
    let column_names: Vec<String> = columns.into_iter().map(|c| c.1).collect();
    for expected in ["id", "conversation_id", "role", "content", "thinking", "reasoning", "channels_json", "timestamp"] {
        assert!(column_names.contains(&expected.to_string()), "missing column {}", expected);
    }

    let version: (String,) = match sqlx::query_as("SELECT value FROM schema_metadata WHERE key = 'schema_version'")
        .fetch_one(&pool)
        .await
    {
        Ok(v) => v,
        Err(e) => panic!("Failed to read schema version: {:?}", e),
    };
    assert_eq!(version.0, SCHEMA_VERSION);
}

#[tokio::test]
async fn test_init_is_idempotent() {
    let dir = match tempdir() {
        Ok(d) => d,
        Err(e) => panic!("Failed to create temp dir: {:?}", e),
    };
    let db_path = dir.path().join("twice.db");

    for _ in 0..2 {
        if let Err(e) = init_db(&db_path).await {
            panic!("Failed to init DB: {:?}", e);
        }
    }
}

#[tokio::test]
async fn test_messages_require_conversation_and_cascade() {
    let dir = match tempdir() {
        Ok(d) => d,
        Err(e) => panic!("Failed to create temp dir: {:?}", e),
    };
    let pool = match init_db(dir.path().join("fk.db")).await {
        Ok(p) => p,
        Err(e) => panic!("Failed to init DB: {:?}", e),
    };

    let orphan = sqlx::query(
        "INSERT INTO messages (id, conversation_id, role, content, timestamp) VALUES ('m0', 'nope', 'user', 'x', '2025-01-01T00:00:00Z')",
    )
    .execute(&pool)
    .await;
    assert!(orphan.is_err(), "foreign keys must be enforced");

    let bad_role = sqlx::query(
        "INSERT INTO conversations (id, project_id, title, started_at) VALUES ('c1', 'p1', 't', '2025-01-01T00:00:00Z')",
    )
    .execute(&pool)
    .await
    .and(
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, role, content, timestamp) VALUES ('m1', 'c1', 'tool', 'x', '2025-01-01T00:00:00Z')",
        )
        .execute(&pool)
        .await,
    );
    assert!(bad_role.is_err(), "role check must reject unknown roles");

    if let Err(e) = sqlx::query(
        "INSERT INTO messages (id, conversation_id, role, content, timestamp) VALUES ('m2', 'c1', 'user', 'x', '2025-01-01T00:00:00Z')",
    )
    .execute(&pool)
    .await
    {
        panic!("valid insert failed: {:?}", e);
    }
    if let Err(e) = sqlx::query("DELETE FROM conversations WHERE id = 'c1'").execute(&pool).await {
        panic!("delete failed: {:?}", e);
    }
    let (left,): (i64,) = match sqlx::query_as("SELECT COUNT(*) FROM messages").fetch_one(&pool).await {
        Ok(c) => c,
        Err(e) => panic!("count failed: {:?}", e),
    };
    assert_eq!(left, 0);
}
