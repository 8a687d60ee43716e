use rai_draft::cache::{CachedCompletion, CompletionSignature, SqliteCompletionCache};
use rai_draft::CompletionCache;
use tempfile::tempdir;

#[derive(Debug, serde::Deserialize)]
struct ExportRow {
    key_hash: String,
    model: String,
    language: String,
    compress: bool,
    reasoning_effort: Option<String>,
    answer: String,
    prompt_tokens: u32,
    completion_tokens: u32,
    reasoning_tokens: u32,
    input_cost_picos: i64,
    output_cost_picos: i64,
    hit_count: i64,
}

fn signature(prompt: &str) -> CompletionSignature {
    CompletionSignature::new(
        "gpt-4o",
        "English",
        prompt,
        "temperature=0.1;json",
        false,
        None,
    )
}

fn completion(answer: &str) -> CachedCompletion {
    CachedCompletion {
        model: "gpt-4o".to_string(),
        language: "English".to_string(),
        input_cost_picos: 1_250_000,
        output_cost_picos: 500_000,
        prompt_tokens: 500,
        completion_tokens: 50,
        reasoning_tokens: 0,
        answer: answer.to_string(),
    }
}

fn read_export(path: &std::path::Path) -> Vec<ExportRow> {
    let raw = std::fs::read_to_string(path).unwrap();
    raw.lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test]
async fn sqlite_cache_put_get_and_export_increments_hit_count() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cache = SqliteCompletionCache::new(&db_path).unwrap();

    let key = signature("List the intended uses of: a claims triage assistant");
    let value = completion(r#"{"intendeduses": []}"#);

    assert!(!cache.exists(&key).await.unwrap());
    cache.put(&key, &value).await.unwrap();
    assert!(cache.exists(&key).await.unwrap());

    let hit1 = cache.get(&key).await.unwrap().unwrap();
    assert_eq!(hit1, value);

    let _ = cache.get(&key).await.unwrap().unwrap();

    let export_path = dir.path().join("export.jsonl");
    let written = cache.export_jsonl(&export_path).await.unwrap();
    assert_eq!(written, 1);

    let row = read_export(&export_path)
        .into_iter()
        .find(|r| r.key_hash == key.key_hash)
        .unwrap();

    assert_eq!(row.hit_count, 2);
    assert_eq!(row.model, "gpt-4o");
    assert_eq!(row.language, "English");
    assert!(!row.compress);
    assert_eq!(row.reasoning_effort, None);
    assert_eq!(row.answer, r#"{"intendeduses": []}"#);
    assert_eq!(row.prompt_tokens, 500);
    assert_eq!(row.completion_tokens, 50);
    assert_eq!(row.reasoning_tokens, 0);
    assert_eq!(row.input_cost_picos, 1_250_000);
    assert_eq!(row.output_cost_picos, 500_000);
}

#[tokio::test]
async fn sqlite_cache_put_overwrites_existing_entry() {
    let dir = tempdir().unwrap();
    let cache = SqliteCompletionCache::new(dir.path().join("cache.sqlite")).unwrap();
    let key = signature("Describe the stakeholders");

    cache.put(&key, &completion("first")).await.unwrap();
    cache.put(&key, &completion("second")).await.unwrap();

    let hit = cache.get(&key).await.unwrap().unwrap();
    assert_eq!(hit.answer, "second");
}

#[tokio::test]
async fn sqlite_cache_survives_reopen() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let key = signature("Assess fitness for purpose");

    {
        let cache = SqliteCompletionCache::new(&db_path).unwrap();
        cache.put(&key, &completion("persisted")).await.unwrap();
    }

    let reopened = SqliteCompletionCache::new(&db_path).unwrap();
    let hit = reopened.get(&key).await.unwrap().unwrap();
    assert_eq!(hit.answer, "persisted");
}

#[tokio::test]
async fn sqlite_cache_delete_removes_only_named_entry() {
    let dir = tempdir().unwrap();
    let cache = SqliteCompletionCache::new(dir.path().join("cache.sqlite")).unwrap();
    let keep = signature("keep me");
    let drop_key = signature("drop me");

    cache.put(&keep, &completion("a")).await.unwrap();
    cache.put(&drop_key, &completion("b")).await.unwrap();

    assert!(cache.delete(&drop_key.key_hash).await.unwrap());
    assert!(!cache.delete(&drop_key.key_hash).await.unwrap());

    assert!(cache.get(&drop_key).await.unwrap().is_none());
    assert!(cache.get(&keep).await.unwrap().is_some());
}

#[tokio::test]
async fn sqlite_cache_prune_max_rows_keeps_most_recent() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cache = SqliteCompletionCache::new(&db_path).unwrap();

    let old_key = signature("old prompt");
    let new_key = signature("new prompt");

    cache.put(&old_key, &completion("old")).await.unwrap();
    cache.put(&new_key, &completion("new")).await.unwrap();

    // Make the "old" row deterministically older so prune ordering is stable.
    let conn = rusqlite::Connection::open(&db_path).unwrap();
    conn.execute(
        "UPDATE completion_cache SET updated_at = 0 WHERE key_hash = ?1",
        rusqlite::params![old_key.key_hash],
    )
    .unwrap();

    let stats = cache.prune(None, Some(1)).await.unwrap();
    assert_eq!(stats.remaining, 1);
    assert_eq!(stats.deleted, 1);

    let export_path = dir.path().join("export.jsonl");
    cache.export_jsonl(&export_path).await.unwrap();

    let rows = read_export(&export_path);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key_hash, new_key.key_hash);
}

#[tokio::test]
async fn sqlite_cache_prune_max_age_drops_stale_rows() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cache = SqliteCompletionCache::new(&db_path).unwrap();

    let stale = signature("stale");
    let fresh = signature("fresh");
    cache.put(&stale, &completion("s")).await.unwrap();
    cache.put(&fresh, &completion("f")).await.unwrap();

    let conn = rusqlite::Connection::open(&db_path).unwrap();
    conn.execute(
        "UPDATE completion_cache SET updated_at = 0 WHERE key_hash = ?1",
        rusqlite::params![stale.key_hash],
    )
    .unwrap();

    let stats = cache.prune(Some(30), None).await.unwrap();
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.remaining, 1);
    assert!(cache.get(&fresh).await.unwrap().is_some());
}

#[test]
fn sqlite_cache_lock_does_not_truncate_lockfile() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cache = SqliteCompletionCache::new(&db_path).unwrap();

    let mut lock_path = db_path.clone();
    lock_path.set_extension("lock");
    std::fs::write(&lock_path, "keep").unwrap();

    let lock = cache.lock_exclusive().unwrap();
    drop(lock);

    let contents = std::fs::read_to_string(&lock_path).unwrap();
    assert_eq!(contents, "keep");
}
