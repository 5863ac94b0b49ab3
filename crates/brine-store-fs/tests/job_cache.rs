use brine_crypto::HashType;
use brine_storage::{Jid, Job, JobReturn, JobStore, MinionId, StoreError, Target};
use brine_store_fs::FsJobStore;
use chrono::{Duration, Utc};

fn job(jid: &str) -> Job {
    Job {
        jid: Jid::from(jid),
        target: Target::glob("web*"),
        fun: "test.ping".into(),
        args: vec![],
        user: "root".into(),
        origin: Some("master01".into()),
        created_at: Utc::now(),
    }
}

fn ret(jid: &str, minion: &str) -> JobReturn {
    JobReturn {
        jid: Jid::from(jid),
        minion_id: MinionId::from(minion),
        fun: "test.ping".into(),
        success: true,
        payload: serde_json::json!(true),
        ended_at: Utc::now(),
    }
}

#[tokio::test]
async fn job_directory_layout() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsJobStore::open(dir.path(), HashType::Sha256).await.unwrap();
    let jid = Jid::from("20240501120000123456");

    store.reserve_jid(&jid, None).await.unwrap();
    store.save_job(&job(&jid.0)).await.unwrap();
    store.save_return(&ret(&jid.0, "web01")).await.unwrap();

    let hash = HashType::Sha256.digest_hex(jid.0.as_bytes());
    let job_dir = dir.path().join("jobs").join(&hash[..2]).join(&hash[2..]);
    assert_eq!(store.job_dir(&jid), job_dir);
    assert!(job_dir.join("jid").is_file());
    assert!(job_dir.join("load.json").is_file());
    assert!(job_dir.join("web01").join("return.json").is_file());
}

#[tokio::test]
async fn reservation_collides_even_without_load() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsJobStore::open(dir.path(), HashType::Sha256).await.unwrap();
    let jid = Jid::from("20240501120000123456");

    store.reserve_jid(&jid, Some("top")).await.unwrap();
    assert!(matches!(
        store.reserve_jid(&jid, None).await,
        Err(StoreError::AlreadyExists)
    ));
    assert!(matches!(
        store.get_job(&jid).await,
        Err(StoreError::NotFound)
    ));
    assert_eq!(store.jid_origin(&jid).await.unwrap().as_deref(), Some("top"));
    assert_eq!(store.list_jids().await.unwrap(), vec![jid]);
}

#[tokio::test]
async fn local_reservations_have_no_origin() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsJobStore::open(dir.path(), HashType::Sha256).await.unwrap();
    let jid = Jid::from("20240501120000123457");

    assert!(matches!(
        store.jid_origin(&jid).await,
        Err(StoreError::NotFound)
    ));
    store.reserve_jid(&jid, None).await.unwrap();
    assert_eq!(store.jid_origin(&jid).await.unwrap(), None);
}

#[tokio::test]
async fn returns_are_append_only() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsJobStore::open(dir.path(), HashType::Sha256).await.unwrap();
    let jid = "20240501120000000001";
    store.reserve_jid(&Jid::from(jid), None).await.unwrap();

    store.save_return(&ret(jid, "web02")).await.unwrap();
    store.save_return(&ret(jid, "web01")).await.unwrap();
    assert!(matches!(
        store.save_return(&ret(jid, "web01")).await,
        Err(StoreError::Conflict)
    ));

    let returns = store.get_returns(&Jid::from(jid)).await.unwrap();
    let ids: Vec<_> = returns.iter().map(|r| r.minion_id.0.as_str()).collect();
    assert_eq!(ids, vec!["web01", "web02"]);
}

#[tokio::test]
async fn expected_minions_are_merged() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsJobStore::open(dir.path(), HashType::Sha256).await.unwrap();
    let jid = Jid::from("20240501120000000002");
    store.reserve_jid(&jid, None).await.unwrap();
    assert!(store.get_minions(&jid).await.unwrap().is_empty());

    store
        .add_minions(&jid, &[MinionId::from("a"), MinionId::from("b")])
        .await
        .unwrap();
    store
        .add_minions(&jid, &[MinionId::from("c"), MinionId::from("a")])
        .await
        .unwrap();
    assert_eq!(
        store.get_minions(&jid).await.unwrap(),
        vec![MinionId::from("a"), MinionId::from("b"), MinionId::from("c")]
    );
}

#[tokio::test]
async fn cleanup_respects_cutoff() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsJobStore::open(dir.path(), HashType::Sha256).await.unwrap();
    store.reserve_jid(&Jid::from("1"), None).await.unwrap();
    store.reserve_jid(&Jid::from("2"), None).await.unwrap();

    // Cutoff in the past keeps everything.
    let removed = store
        .clean_old_jobs(Utc::now() - Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(removed, 0);

    // Cutoff in the future drops everything.
    let removed = store
        .clean_old_jobs(Utc::now() + Duration::seconds(5))
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert!(store.list_jids().await.unwrap().is_empty());
    // A purged JID may be issued again.
    store.reserve_jid(&Jid::from("1"), None).await.unwrap();
}
