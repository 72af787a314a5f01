use std::path::Path;

use codescout_distributed::ShardPublisher;
use codescout_index::query::regexp_query;
use codescout_index::{Error, Index};

fn stage_package(staging: &Path, pkg: &str, files: &[(&str, &str)]) {
    for (rel, content) in files {
        let path = staging.join(pkg).join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn index_merge_and_collect() {
    let tmp = tempfile::tempdir().unwrap();
    let staging = tmp.path().join("staging");
    stage_package(
        &staging,
        "alpha_1.0-1",
        &[("src/main.c", "int main_alpha(void) { return 0; }")],
    );
    stage_package(
        &staging,
        "beta_2.0-1",
        &[("lib.c", "void beta_helper(void) {}")],
    );

    let shard = ShardPublisher::new(tmp.path().join("shard")).unwrap();
    assert_eq!(
        shard.index_package("alpha_1.0-1", &staging).await.unwrap(),
        1
    );
    assert_eq!(
        shard.index_package("beta_2.0-1", &staging).await.unwrap(),
        1
    );

    // Accepted files were copied into the shard's source tree.
    let copied = shard.src_dir().join("alpha_1.0-1/src/main.c");
    assert_eq!(
        std::fs::read_to_string(copied).unwrap(),
        "int main_alpha(void) { return 0; }"
    );
    assert_eq!(
        shard.packages().unwrap(),
        vec!["alpha_1.0-1".to_string(), "beta_2.0-1".to_string()]
    );

    // Merge into a full index and query it.
    let full = shard.merge().await.unwrap();
    let ix = Index::open(&full).unwrap();
    assert_eq!(ix.doc_count(), 2);
    assert_eq!(ix.resolve(0).unwrap(), "alpha_1.0-1/src/main.c");
    assert_eq!(ix.resolve(1).unwrap(), "beta_2.0-1/lib.c");
    let q = regexp_query("main_alpha").unwrap();
    assert_eq!(ix.posting_query(&q).unwrap(), vec![0]);

    // Stale published indexes are collected, the current one stays.
    std::fs::write(tmp.path().join("shard/full.1"), b"stale").unwrap();
    assert_eq!(shard.collect_stale(&full).unwrap(), 1);
    assert!(full.is_file());
}

#[tokio::test(flavor = "multi_thread")]
async fn merge_is_exclusive() {
    let tmp = tempfile::tempdir().unwrap();
    let staging = tmp.path().join("staging");
    stage_package(&staging, "a_1", &[("f.c", "aaa bbb ccc")]);
    stage_package(&staging, "b_1", &[("g.c", "ddd eee fff")]);
    let shard = ShardPublisher::new(tmp.path().join("shard")).unwrap();
    shard.index_package("a_1", &staging).await.unwrap();
    shard.index_package("b_1", &staging).await.unwrap();

    let guard = shard.try_begin_merge().unwrap();
    let err = shard.merge().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::MergeInProgress)
    ));
    drop(guard);
    shard.merge().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn merge_needs_two_packages() {
    let tmp = tempfile::tempdir().unwrap();
    let staging = tmp.path().join("staging");
    stage_package(&staging, "solo_1", &[("f.c", "just one package")]);
    let shard = ShardPublisher::new(tmp.path().join("shard")).unwrap();
    shard.index_package("solo_1", &staging).await.unwrap();
    let err = shard.merge().await.unwrap_err();
    assert!(err.to_string().contains("want at least 2"));
}

#[tokio::test(flavor = "multi_thread")]
async fn garbage_collect_removes_sources_and_index() {
    let tmp = tempfile::tempdir().unwrap();
    let staging = tmp.path().join("staging");
    stage_package(&staging, "gone_1", &[("f.c", "to be removed")]);
    let shard = ShardPublisher::new(tmp.path().join("shard")).unwrap();
    shard.index_package("gone_1", &staging).await.unwrap();

    shard.garbage_collect("gone_1").unwrap();
    assert!(shard.packages().unwrap().is_empty());
    assert!(!shard.idx_dir().join("gone_1").exists());
    assert!(shard.garbage_collect("gone_1").is_err());
}
