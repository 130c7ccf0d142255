use std::fs;
use std::path::Path;

use higit::api::{Engine, Response};
use higit::ops::{create_tag, snapshot};
use higit::refs::write_symbolic;
use higit::{HashAlgorithm, Repo, Signature};
use serde_json::Value;
use tempfile::tempdir;

fn payload(response: &Response) -> Value {
    assert!(response.is_ok(), "{:?}", response);
    serde_json::from_str(&response.data).unwrap()
}

fn upstream(dir: &Path) -> Repo {
    let repo = Repo::init(&dir.join("upstream"), HashAlgorithm::Sha1).unwrap();
    write_symbolic(&repo, "HEAD", "refs/heads/main").unwrap();
    repo
}

fn record(repo: &Repo, source: &Path, files: &[(&str, &str)], t: i64) {
    for (path, content) in files {
        let path = source.join(path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
    let author = Signature::new("Dev", "dev@example.com", t);
    snapshot(repo, source, "main", &format!("change at {}", t), &author).unwrap();
}

#[test]
fn test_clone_inspect_fetch_delete() {
    let dir = tempdir().unwrap();
    let remote = upstream(dir.path());
    let source = dir.path().join("work");
    record(&remote, &source, &[("README.md", "# demo\n"), ("src/lib.rs", "pub fn f() {}\n")], 100);
    fs::write(source.join("data.bin"), [0u8, 1, 2, 255]).unwrap();
    record(&remote, &source, &[("notes.txt", "n")], 200);
    create_tag(&remote, "v1", "main", &Signature::new("Dev", "dev@example.com", 201), "first").unwrap();

    let base = dir.path().join("base").display().to_string();
    let url = remote.path().display().to_string();
    let engine = Engine::new();
    payload(&engine.init_system(&base));

    let branches = payload(&engine.get_branches(&url));
    assert_eq!(branches[0]["name"], "main");
    let tags = payload(&engine.get_tags(&url));
    assert_eq!(tags[0]["name"], "v1");
    assert_eq!(tags[0]["annotated"], true);
    assert_eq!(tags[0]["peeledId"], branches[0]["id"]);

    let init = payload(&engine.init_repo(&base, &url, "demo", ""));
    assert_eq!(init["defaultBranch"], "main");
    assert_eq!(init["head"], branches[0]["id"]);

    let log = payload(&engine.history(&url, "main", 10, 0));
    assert_eq!(log.as_array().unwrap().len(), 2);
    assert_eq!(log[0]["shortMessage"], "change at 200");
    assert_eq!(log[0]["parentIds"][0], log[1]["id"]);

    let tree = payload(&engine.get_file_tree(&url, "main"));
    let paths: Vec<&str> = tree
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["path"].as_str().unwrap())
        .collect();
    assert_eq!(paths, vec!["README.md", "data.bin", "notes.txt", "src", "src/lib.rs"]);

    let readme = payload(&engine.read_file(&url, "main", "README.md"));
    assert_eq!(readme["encoding"], "utf8");
    assert_eq!(readme["content"], "# demo\n");
    let binary = payload(&engine.read_file(&url, "main", "data.bin"));
    assert_eq!(binary["binary"], true);
    assert_eq!(binary["encoding"], "base64");
    assert_eq!(engine.read_file(&url, "main", "src").status, "type_mismatch");
    assert_eq!(engine.read_file(&url, "main", "nope").status, "not_found");

    record(&remote, &source, &[("src/lib.rs", "pub fn g() {}\n")], 300);
    let mut events = Vec::new();
    let fetched = engine.fetch(&url, "main", |processed, total, message| {
        events.push((processed, total, message.to_string()));
    });
    let fetched = payload(&fetched);
    assert_eq!(fetched["upToDate"], false);
    assert_eq!(fetched["previous"], branches[0]["id"]);
    assert!(!events.is_empty());
    assert!(events.windows(2).all(|w| w[0].0 <= w[1].0));

    let handle = engine.spawn_fetch(&url, "main");
    let streamed: Vec<_> = handle.events().iter().collect();
    let again = payload(&handle.wait());
    assert_eq!(again["upToDate"], true);
    assert_eq!(again["received"], 0);
    assert!(!streamed.is_empty());

    let deleted = payload(&engine.delete_repo(&base, &url, "demo", ""));
    assert_eq!(deleted["removed"], true);
    assert_eq!(engine.history(&url, "main", 10, 0).status, "not_found");
    assert!(engine.get_ssh_key().is_ok());
}

#[test]
fn test_regenerated_key_loses_access() {
    let dir = tempdir().unwrap();
    let remote = upstream(dir.path());
    let source = dir.path().join("work");
    record(&remote, &source, &[("a.txt", "a")], 1);

    let base = dir.path().join("base").display().to_string();
    let url = remote.path().display().to_string();
    let engine = Engine::new();
    let system = payload(&engine.init_system(&base));
    let key = system["publicKey"].as_str().unwrap();
    fs::write(remote.path().join("authorized_keys"), format!("{}\n", key)).unwrap();

    payload(&engine.init_repo(&base, &url, "guarded", "local"));
    payload(&engine.generate_ssh_key());

    record(&remote, &source, &[("a.txt", "b")], 2);
    let response = engine.fetch(&url, "main", |_, _, _| {});
    assert_eq!(response.status, "authentication_failure");
    assert_eq!(response.data, "null");
    assert!(!response.message.is_empty());

    let log = payload(&engine.history(&url, "main", 10, 0));
    assert_eq!(log.as_array().unwrap().len(), 1);
}

#[test]
fn test_missing_branch_and_remote() {
    let dir = tempdir().unwrap();
    let remote = upstream(dir.path());
    let source = dir.path().join("work");
    record(&remote, &source, &[("a.txt", "a")], 1);

    let base = dir.path().join("base").display().to_string();
    let url = remote.path().display().to_string();
    let engine = Engine::new();
    payload(&engine.init_system(&base));
    payload(&engine.init_repo(&base, &url, "r", ""));

    assert_eq!(engine.fetch(&url, "dev", |_, _, _| {}).status, "not_found");

    let missing = dir.path().join("gone").display().to_string();
    let response = engine.init_repo(&base, &missing, "gone", "");
    assert_eq!(response.status, "not_found");
    assert!(!dir.path().join("base/repos/local/gone").exists());

    assert_eq!(engine.get_branches("http://example.com/x.git").status, "unsupported");
}
