//! Two-phase commit through the dispatcher, including restarts between
//! prepare and the coordinator's decision.

mod common;

use common::{Client, Deployment, write_params};
use serde_json::json;

const T1: &str = "7d444840-9dc0-11d1-b245-5ffdce74fad2";

#[tokio::test]
async fn commit_makes_writes_visible() {
    let deployment = Deployment::new();
    let api = deployment.start().await;
    let mut session = Client::login(&api).await.interactive();
    let mut reader = Client::login(&api).await;

    session.ok("begin", json!({ "transactionId": T1 })).await;
    session.write("S-1", "f.txt", b"hello").await;
    session.write("S-1", "nested/g.txt", b"world").await;
    assert_eq!(session.ok("prepare", json!({})).await, json!(true));
    session.ok("commit", json!({})).await;

    assert_eq!(reader.read("S-1", "f.txt").await, b"hello");
    assert_eq!(reader.read("S-1", "nested/g.txt").await, b"world");

    // The coordinator may retry a commit after losing the reply.
    let mut coordinator = Client::login(&api).await.coordinator();
    coordinator
        .ok("commit", json!({ "transactionId": T1 }))
        .await;
}

#[tokio::test]
async fn rollback_restores_previous_contents() {
    let deployment = Deployment::new();
    let api = deployment.start().await;
    let mut setup = Client::login(&api).await;
    setup.write("S-1", "keep.txt", b"original").await;

    let mut session = Client::login(&api).await.interactive();
    session.ok("begin", json!({ "transactionId": T1 })).await;
    session.write("S-1", "keep.txt", b"CHANGED!!").await;
    session
        .ok("copy", json!({ "owner": "S-1", "source": "keep.txt", "targetOwner": "DS-7", "target": "copy.txt" }))
        .await;
    session
        .ok("delete", json!({ "owner": "S-1", "source": "keep.txt" }))
        .await;
    session.ok("rollback", json!({})).await;
    // Once unbound, finishing by id is the coordinator's business.
    let status = session
        .fails("rollback", json!({ "transactionId": T1 }), "forbidden")
        .await;
    assert_eq!(status, 403);

    assert_eq!(setup.read("S-1", "keep.txt").await, b"original");
    setup
        .fails("read", json!({ "owner": "DS-7", "source": "copy.txt" }), "not_found")
        .await;
}

#[tokio::test]
async fn restart_after_prepare_then_commit() {
    let deployment = Deployment::new();
    {
        let api = deployment.start().await;
        let mut session = Client::login(&api).await.interactive();
        session.ok("begin", json!({ "transactionId": T1 })).await;
        session.write("S-1", "f.txt", b"hello").await;
        assert_eq!(session.ok("prepare", json!({})).await, json!(true));
        // Process dies here.
    }

    let api = deployment.start().await;
    let mut coordinator = Client::login(&api).await.coordinator();
    assert_eq!(coordinator.ok("recover", json!({})).await, json!([T1]));

    // Until decided, the path is held.
    let mut other = Client::login(&api).await;
    let status = other
        .fails("write", write_params("S-1", "f.txt", b"intruder"), "in_doubt")
        .await;
    assert_eq!(status, 423);

    coordinator
        .ok("commit", json!({ "transactionId": T1 }))
        .await;
    assert_eq!(coordinator.ok("recover", json!({})).await, json!([]));
    assert_eq!(other.read("S-1", "f.txt").await, b"hello");
}

#[tokio::test]
async fn restart_after_prepare_then_rollback() {
    let deployment = Deployment::new();
    {
        let api = deployment.start().await;
        let mut session = Client::login(&api).await.interactive();
        session.ok("begin", json!({ "transactionId": T1 })).await;
        session.write("S-1", "f.txt", b"hello").await;
        assert_eq!(session.ok("prepare", json!({})).await, json!(true));
    }

    let api = deployment.start().await;
    let mut coordinator = Client::login(&api).await.coordinator();
    assert_eq!(coordinator.ok("recover", json!({})).await, json!([T1]));
    coordinator
        .ok("rollback", json!({ "transactionId": T1 }))
        .await;

    let mut reader = Client::login(&api).await;
    reader
        .fails("read", json!({ "owner": "S-1", "source": "f.txt", "offset": 0, "limit": 5 }), "not_found")
        .await;
    // Nothing left behind under the share either.
    let share = deployment.store().join("1");
    assert_eq!(std::fs::read_dir(share).unwrap().count(), 0);
}

#[tokio::test]
async fn restart_after_commit_reports_nothing() {
    let deployment = Deployment::new();
    {
        let api = deployment.start().await;
        let mut session = Client::login(&api).await.interactive();
        session.ok("begin", json!({ "transactionId": T1 })).await;
        session.write("S-1", "f.txt", b"done").await;
        session.ok("prepare", json!({})).await;
        session.ok("commit", json!({})).await;
    }

    let api = deployment.start().await;
    let mut coordinator = Client::login(&api).await.coordinator().interactive();
    assert_eq!(coordinator.ok("recover", json!({})).await, json!([]));
    // Archived outcome keeps commit idempotent across restarts.
    coordinator
        .ok("commit", json!({ "transactionId": T1 }))
        .await;
    coordinator
        .fails("rollback", json!({ "transactionId": T1 }), "transaction_state")
        .await;
    coordinator
        .fails("begin", json!({ "transactionId": T1 }), "duplicate_transaction")
        .await;
}

#[tokio::test]
async fn restart_with_active_transaction_waits_for_coordinator() {
    let deployment = Deployment::new();
    {
        let api = deployment.start().await;
        let mut session = Client::login(&api).await.interactive();
        session.ok("begin", json!({ "transactionId": T1 })).await;
        session.write("S-1", "partial.txt", b"half").await;
    }

    let api = deployment.start().await;
    let mut coordinator = Client::login(&api).await.coordinator().interactive();
    assert_eq!(coordinator.ok("recover", json!({})).await, json!([T1]));
    coordinator
        .fails("begin", json!({ "transactionId": T1 }), "duplicate_transaction")
        .await;
    coordinator
        .ok("rollback", json!({ "transactionId": T1 }))
        .await;
    coordinator
        .fails("read", json!({ "owner": "S-1", "source": "partial.txt" }), "not_found")
        .await;
}

#[tokio::test]
async fn another_session_cannot_take_over_a_transaction() {
    let deployment = Deployment::new();
    let api = deployment.start().await;
    let mut owner = Client::login(&api).await.interactive();
    let mut intruder = Client::login(&api).await.interactive();

    owner.ok("begin", json!({ "transactionId": T1 })).await;
    owner.write("S-1", "mine.txt", b"mine").await;

    intruder
        .fails("begin", json!({ "transactionId": T1 }), "duplicate_transaction")
        .await;
    // Not bound, so this commits on its own.
    intruder.write("S-1", "theirs.txt", b"theirs").await;
    intruder
        .fails("rollback", json!({}), "transaction_state")
        .await;
    intruder
        .fails("rollback", json!({ "transactionId": T1 }), "forbidden")
        .await;

    // Beginning again from the owning session is harmless.
    owner.ok("begin", json!({ "transactionId": T1 })).await;
    assert_eq!(owner.ok("prepare", json!({})).await, json!(true));
    owner.ok("commit", json!({})).await;

    let mut reader = Client::login(&api).await;
    assert_eq!(reader.read("S-1", "mine.txt").await, b"mine");
    assert_eq!(reader.read("S-1", "theirs.txt").await, b"theirs");
}

#[tokio::test]
async fn session_moves_on_after_the_coordinator_finishes_its_transaction() {
    let deployment = Deployment::new();
    let api = deployment.start().await;
    let mut session = Client::login(&api).await.interactive();
    let mut coordinator = Client::login(&api).await.coordinator();

    session.ok("begin", json!({ "transactionId": T1 })).await;
    session.write("S-1", "first.txt", b"first").await;
    assert_eq!(
        coordinator.ok("prepare", json!({ "transactionId": T1 })).await,
        json!(true)
    );
    coordinator
        .ok("commit", json!({ "transactionId": T1 }))
        .await;

    // The stale binding does not swallow the next write or block the next begin.
    session.write("S-1", "loose.txt", b"loose").await;
    let t2 = uuid::Uuid::new_v4().to_string();
    session.ok("begin", json!({ "transactionId": t2 })).await;
    session.write("S-1", "second.txt", b"second").await;
    coordinator
        .ok("rollback", json!({ "transactionId": t2 }))
        .await;

    let mut reader = Client::login(&api).await;
    assert_eq!(reader.read("S-1", "first.txt").await, b"first");
    assert_eq!(reader.read("S-1", "loose.txt").await, b"loose");
    reader
        .fails("read", json!({ "owner": "S-1", "source": "second.txt" }), "not_found")
        .await;
    assert_eq!(api.manager().live_count(), 0);
}
