//! Session rules, autocommit and request validation at the dispatcher.

mod common;

use afs_server::Request;
use common::{Client, Deployment, write_params};
use serde_json::{Value, json};

#[tokio::test]
async fn non_interactive_writes_autocommit() {
    let deployment = Deployment::new();
    let api = deployment.start().await;
    let mut writer = Client::login(&api).await;
    let mut reader = Client::login(&api).await;

    writer.write("S-1", "a.txt", b"one").await;
    assert_eq!(reader.read("S-1", "a.txt").await, b"one");

    // Nothing is left registered once the call returns.
    assert_eq!(api.manager().live_count(), 0);

    writer
        .fails("begin", json!({ "transactionId": uuid_str() }), "transaction_state")
        .await;
}

#[tokio::test]
async fn checksum_mismatch_leaves_nothing_behind() {
    let deployment = Deployment::new();
    let api = deployment.start().await;
    let mut client = Client::login(&api).await;

    let mut params = write_params("S-1", "bad.bin", b"payload");
    params["md5"] = json!("00000000000000000000000000000000");
    let status = client.fails("write", params, "checksum_mismatch").await;
    assert_eq!(status, 400);

    client
        .fails("read", json!({ "owner": "S-1", "source": "bad.bin" }), "not_found")
        .await;
    assert_eq!(api.manager().live_count(), 0);
}

#[tokio::test]
async fn paths_cannot_leave_the_owner_directory() {
    let deployment = Deployment::new();
    let api = deployment.start().await;
    let mut client = Client::login(&api).await;

    for source in ["../../etc/passwd", "a/../../b", "/../x"] {
        client
            .fails("read", json!({ "owner": "S-1", "source": source }), "invalid_path")
            .await;
        client
            .fails("write", write_params("S-1", source, b"x"), "invalid_path")
            .await;
    }
    client
        .fails("read", json!({ "owner": "../S-1", "source": "a" }), "invalid_path")
        .await;
}

#[cfg(unix)]
#[tokio::test]
async fn symlinks_out_of_the_owner_directory_are_refused() {
    let deployment = Deployment::new();
    let api = deployment.start().await;
    let mut client = Client::login(&api).await;
    client.write("S-1", "inside.txt", b"in").await;

    let outside = deployment.dir.path().join("outside");
    std::fs::create_dir_all(&outside).unwrap();
    let inside = find(&deployment.store(), "inside.txt").unwrap();
    let owner_dir = inside.parent().unwrap();
    std::os::unix::fs::symlink(&outside, owner_dir.join("escape")).unwrap();

    client
        .fails("write", write_params("S-1", "escape/x.txt", b"x"), "invalid_path")
        .await;
    assert!(!outside.join("x.txt").exists());
}

#[tokio::test]
async fn listing_and_free_space() {
    let deployment = Deployment::new();
    let api = deployment.start().await;
    let mut client = Client::login(&api).await;
    client.write("S-1", "b.txt", b"bb").await;
    client.write("S-1", "a.txt", b"a").await;
    client.write("S-1", "dir/c.txt", b"ccc").await;

    let listing = client
        .ok("list", json!({ "owner": "S-1", "source": "", "recursive": true }))
        .await;
    let paths: Vec<&str> = listing
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["path"].as_str().unwrap())
        .collect();
    assert_eq!(paths, ["/a.txt", "/b.txt", "/dir", "/dir/c.txt"]);
    let dir = &listing[2];
    assert_eq!(dir["directory"], json!(true));
    assert!(dir.get("size").is_none());
    assert_eq!(listing[3]["size"], json!(3));

    let page = client
        .ok("list", json!({ "owner": "S-1", "recursive": true, "after": "/b.txt", "limit": 1 }))
        .await;
    assert_eq!(page[0]["path"], json!("/dir"));
    assert_eq!(page.as_array().unwrap().len(), 1);

    let free = client.ok("free", json!({ "owner": "S-1" })).await;
    assert!(free["totalBytes"].as_u64().unwrap() >= free["freeBytes"].as_u64().unwrap());
}

#[tokio::test]
async fn bad_tokens_and_missing_keys() {
    let deployment = Deployment::new();
    let api = deployment.start().await;

    let response = api
        .handle(Request {
            id: json!(1),
            method: "read".into(),
            params: json!({ "owner": "S-1", "source": "a" }),
            session_token: Some("not-a-token".into()),
            ..Request::default()
        })
        .await;
    let error = response.error.unwrap();
    assert_eq!((error.kind.as_str(), error.status), ("invalid_session", 401));

    let response = api
        .handle(Request {
            id: json!(2),
            method: "login".into(),
            params: json!({ "user": "lab", "password": "wrong" }),
            ..Request::default()
        })
        .await;
    assert_eq!(response.error.unwrap().kind, "invalid_session");

    let mut client = Client::login(&api).await.interactive();
    let status = client.fails("recover", json!({}), "forbidden").await;
    assert_eq!(status, 403);
    client
        .fails("nonsense", json!({}), "invalid_request")
        .await;
    client
        .fails("write", json!({ "owner": "S-1", "source": "x" }), "invalid_request")
        .await;
    client
        .fails("read", json!({ "owner": "S-1", "source": "x", "offset": -1 }), "invalid_range")
        .await;
}

#[tokio::test]
async fn logout_ends_the_session_but_not_its_transaction() {
    let deployment = Deployment::new();
    let api = deployment.start().await;
    let mut client = Client::login(&api).await.interactive();
    let id = uuid_str();

    assert_eq!(client.ok("isSessionValid", Value::Null).await, json!(true));
    client.ok("begin", json!({ "transactionId": id })).await;
    client.write("S-1", "pending.txt", b"p").await;
    client.ok("logout", Value::Null).await;

    assert_eq!(client.ok("isSessionValid", Value::Null).await, json!(false));
    client
        .fails("list", json!({ "owner": "S-1" }), "invalid_session")
        .await;
    assert!(api.sessions().is_empty());

    // The transaction is still the coordinator's to finish.
    let mut coordinator = Client::login(&api).await.coordinator();
    coordinator
        .ok("rollback", json!({ "transactionId": id }))
        .await;
    coordinator
        .fails("read", json!({ "owner": "S-1", "source": "pending.txt" }), "not_found")
        .await;
    assert_eq!(api.manager().live_count(), 0);
}

#[tokio::test]
async fn interactive_session_sees_its_own_uncommitted_writes() {
    let deployment = Deployment::new();
    let api = deployment.start().await;
    let mut session = Client::login(&api).await.interactive();
    let mut other = Client::login(&api).await;
    let id = uuid_str();

    session.ok("begin", json!({ "transactionId": id })).await;
    session.write("S-1", "draft.txt", b"draft").await;
    assert_eq!(session.read("S-1", "draft.txt").await, b"draft");

    // Another session waits on the lock, then gives up.
    other
        .fails("read", json!({ "owner": "S-1", "source": "draft.txt" }), "lock_timeout")
        .await;

    session.ok("prepare", json!({})).await;
    session.ok("commit", json!({})).await;
    assert_eq!(other.read("S-1", "draft.txt").await, b"draft");
}

#[cfg(unix)]
fn find(dir: &std::path::Path, name: &str) -> Option<std::path::PathBuf> {
    for entry in std::fs::read_dir(dir).ok()? {
        let path = entry.ok()?.path();
        if path.file_name().is_some_and(|n| n == name) {
            return Some(path);
        }
        if path.is_dir() {
            if let Some(found) = find(&path, name) {
                return Some(found);
            }
        }
    }
    None
}

fn uuid_str() -> String {
    uuid::Uuid::new_v4().to_string()
}
