use quarry_core::config::TaskConfig;
use quarry_core::task::{TaskStatus, TaskUpdate};
use quarry_core::traits::TaskStore;
use quarry_db::TaskRepository;
use uuid::Uuid;

use crate::integration::common::setup_test_db;

const URL: &str = "https://www.amazon.com/dp/B0TEST0001";

#[tokio::test]
async fn create_task_starts_pending() {
    let (pool, _container) = setup_test_db().await;
    let repo = TaskRepository::new(pool);

    let config = TaskConfig {
        reviews: false,
        ..TaskConfig::default()
    };
    let id = repo.create_task(URL, &config).await.unwrap();
    let task = repo.get_task(id).await.unwrap().unwrap();

    assert_eq!(task.url, URL);
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.config["reviews"], false);
    assert!(task.completed_at.is_none());
    assert!(task.product_name.is_none());
}

#[tokio::test]
async fn updates_merge_and_terminal_status_stamps_completion() {
    let (pool, _container) = setup_test_db().await;
    let repo = TaskRepository::new(pool);
    let id = repo.create_task(URL, &TaskConfig::default()).await.unwrap();

    repo.update_task(id, &TaskUpdate::status(TaskStatus::Running))
        .await
        .unwrap();
    let running = repo.get_task(id).await.unwrap().unwrap();
    assert_eq!(running.status, TaskStatus::Running);
    assert!(running.completed_at.is_none());

    let summary = serde_json::json!({"images": {"hero": 1}, "validation_score": 80.0});
    repo.update_task(
        id,
        &TaskUpdate::status(TaskStatus::Completed)
            .with_product_name("Rocket Skates")
            .with_summary(summary.clone()),
    )
    .await
    .unwrap();

    // a later partial update keeps earlier fields
    repo.update_task(id, &TaskUpdate::default()).await.unwrap();

    let done = repo.get_task(id).await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.product_name.as_deref(), Some("Rocket Skates"));
    assert_eq!(done.result_summary, Some(summary));
    assert!(done.completed_at.is_some());
    assert!(done.error_message.is_none());
}

#[tokio::test]
async fn failed_task_keeps_error() {
    let (pool, _container) = setup_test_db().await;
    let repo = TaskRepository::new(pool);
    let id = repo.create_task(URL, &TaskConfig::default()).await.unwrap();

    repo.update_task(id, &TaskUpdate::status(TaskStatus::Failed).with_error("Task cancelled"))
        .await
        .unwrap();
    let task = repo.get_task(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error_message.as_deref(), Some("Task cancelled"));
}

#[tokio::test]
async fn unknown_task() {
    let (pool, _container) = setup_test_db().await;
    let repo = TaskRepository::new(pool);

    assert!(repo.get_task(Uuid::new_v4()).await.unwrap().is_none());
    let err = repo
        .update_task(Uuid::new_v4(), &TaskUpdate::status(TaskStatus::Running))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no task"));
}

#[tokio::test]
async fn list_newest_first_with_status_filter() {
    let (pool, _container) = setup_test_db().await;
    let repo = TaskRepository::new(pool);

    let first = repo.create_task("https://a.example/dp/1", &TaskConfig::default()).await.unwrap();
    let second = repo.create_task("https://b.example/dp/2", &TaskConfig::default()).await.unwrap();
    repo.update_task(first, &TaskUpdate::status(TaskStatus::Failed))
        .await
        .unwrap();

    let all = repo.list_tasks(None, 10).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id, second);

    let failed = repo.list_tasks(Some(TaskStatus::Failed), 10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, first);

    assert_eq!(repo.list_tasks(None, 1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn cleanup_removes_only_old_tasks() {
    let (pool, _container) = setup_test_db().await;
    let repo = TaskRepository::new(pool.clone());

    let old = repo.create_task(URL, &TaskConfig::default()).await.unwrap();
    let fresh = repo.create_task(URL, &TaskConfig::default()).await.unwrap();
    sqlx::query("UPDATE tasks SET created_at = NOW() - INTERVAL '40 days' WHERE id = $1")
        .bind(old)
        .execute(&pool)
        .await
        .unwrap();

    assert_eq!(repo.delete_older_than(30).await.unwrap(), 1);
    assert!(repo.get_task(old).await.unwrap().is_none());
    assert!(repo.get_task(fresh).await.unwrap().is_some());
}
