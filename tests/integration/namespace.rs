use std::net::{SocketAddr, TcpListener};

use namekeeper::error::NamingError;
use namekeeper::state::health::ping_unreachable;
use namekeeper::state::namespace::Namespace;
use namekeeper::state::path_index::Resolution;
use namekeeper::state::registry::{Registration, ServerHealth};
use namekeeper::wire::records::StorageRequest;

use crate::helpers::{dead_port, registration, wait_until, FakeStorageServer, LOCALHOST};

fn namespace() -> Namespace {
    Namespace::new(90, 16).unwrap()
}

#[test]
fn registration_assigns_sequential_indices() {
    let ns = namespace();
    let first = ns
        .register(&registration(5000, 5001, "/srv/a", &["/a", "/a/x.txt"]))
        .unwrap();
    let second = ns
        .register(&registration(5002, 5003, "/srv/b", &["/b/y.txt"]))
        .unwrap();

    assert_eq!(
        first,
        Registration::New {
            index: 0,
            paths: vec!["/a".to_string(), "/a/x.txt".to_string()]
        }
    );
    assert_eq!(second.index(), 1);
    assert_eq!(ns.resolve("/a/x.txt"), Resolution::Found(0));
    assert_eq!(ns.resolve("/b/y.txt"), Resolution::Found(1));
    assert_eq!(ns.path_count(), 3);
    assert_eq!(ns.server_count(), 2);
}

#[test]
fn mixed_delimiters_are_normalized() {
    let ns = namespace();
    let mut record = registration(5000, 5001, "/srv", &[]);
    record.raw_paths = "/one\n\n/two\t/three,/four\r\n".to_string();
    ns.register(&record).unwrap();

    for path in ["/one", "/two", "/three", "/four"] {
        assert_eq!(ns.resolve(path), Resolution::Found(0), "{}", path);
    }
    assert_eq!(ns.path_count(), 4);
}

#[test]
fn same_path_set_reconnects_to_same_index() {
    let ns = namespace();
    ns.register(&registration(5000, 5001, "/srv", &["/a", "/b"]))
        .unwrap();
    ns.set_health(0, ServerHealth::Unreachable);

    let again = ns
        .register(&registration(6000, 6001, "/srv", &["/b", "/a"]))
        .unwrap();
    assert_eq!(again, Registration::Returned { index: 0 });
    assert_eq!(ns.server_count(), 1);
    assert_eq!(ns.health(0), Some(ServerHealth::Active));
    assert_eq!(ns.endpoint(0).unwrap().peer_port, 6001);
}

#[test]
fn registry_capacity_is_enforced() {
    let ns = Namespace::new(4, 1).unwrap();
    ns.register(&registration(5000, 5001, "/srv", &["/a"])).unwrap();
    let err = ns
        .register(&registration(5002, 5003, "/srv", &["/b"]))
        .unwrap_err();
    assert!(matches!(err, NamingError::RegistryFull(1)));
}

#[test]
fn only_found_paths_are_cached() {
    let ns = namespace();
    ns.register(&registration(5000, 5001, "/srv", &["/dir/file"]))
        .unwrap();

    assert_eq!(ns.resolve("/dir"), Resolution::DirectoryPrefix);
    assert_eq!(ns.resolve("/missing"), Resolution::NotFound);
    assert!(ns.cached_paths().is_empty());

    assert_eq!(ns.resolve("/dir/file"), Resolution::Found(0));
    assert_eq!(ns.resolve("/dir/file"), Resolution::Found(0));
    assert_eq!(ns.cached_paths(), vec![("/dir/file".to_string(), 0)]);
    assert_eq!(ns.cache_stats().hits, 1);
}

#[test]
fn owner_of_directory_prefix_uses_subtree_owner() {
    let ns = namespace();
    ns.register(&registration(5000, 5001, "/srv", &["/x/1"])).unwrap();
    ns.register(&registration(5002, 5003, "/srv", &["/docs/a.txt"]))
        .unwrap();

    assert_eq!(ns.owner_of("/docs"), Some(1));
    assert_eq!(ns.owner_of("/docs/a.txt"), Some(1));
    assert_eq!(ns.owner_of("/nothing"), None);
}

#[test]
fn create_places_with_nearest_ancestor() {
    let ns = namespace();
    ns.register(&registration(5000, 5001, "/srv", &["/a"])).unwrap();
    ns.register(&registration(5002, 5003, "/srv", &["/b", "/b/sub/f"]))
        .unwrap();

    assert_eq!(ns.placement_for("/b/sub/new.txt"), Some(1));
    assert_eq!(ns.placement_for("/b/new.txt"), Some(1));
    assert_eq!(ns.placement_for("/elsewhere/new.txt"), Some(0));

    ns.set_health(0, ServerHealth::Unreachable);
    assert_eq!(ns.placement_for("/elsewhere/new.txt"), Some(1));
}

#[test]
fn placement_needs_a_server() {
    assert_eq!(namespace().placement_for("/new"), None);
}

#[test]
fn apply_create_indexes_and_caches() {
    let ns = namespace();
    ns.register(&registration(5000, 5001, "/srv", &["/a"])).unwrap();

    ns.apply_create(0, "/a/new.txt").unwrap();
    assert_eq!(ns.resolve("/a/new.txt"), Resolution::Found(0));
    assert_eq!(ns.cached_paths()[0], ("/a/new.txt".to_string(), 0));
    assert!(ns.list()[0].paths.contains(&"/a/new.txt".to_string()));

    let err = ns.apply_create(0, "/a/new.txt").unwrap_err();
    assert!(matches!(err, NamingError::AlreadyExists(_)));
}

#[test]
fn apply_delete_removes_subtree_owned_by_server() {
    let ns = namespace();
    ns.register(&registration(5000, 5001, "/srv", &["/d", "/d/1", "/d/sub/2", "/dx"]))
        .unwrap();
    ns.register(&registration(5002, 5003, "/srv", &["/d/other"]))
        .unwrap();
    assert_eq!(ns.resolve("/d/1"), Resolution::Found(0));

    let mut removed = ns.apply_delete(0, "/d");
    removed.sort();
    assert_eq!(removed, vec!["/d", "/d/1", "/d/sub/2"]);

    assert_eq!(ns.resolve("/d/1"), Resolution::NotFound);
    assert_eq!(ns.resolve("/dx"), Resolution::Found(0));
    assert_eq!(ns.resolve("/d/other"), Resolution::Found(1));
    assert!(ns.cached_paths().iter().all(|(p, _)| p != "/d/1"));
}

#[test]
fn delete_watermark_tracks_shortest_path() {
    let ns = namespace();
    ns.register(&registration(5000, 5001, "/srv", &["/home/user", "/home/user/a.txt"]))
        .unwrap();
    assert_eq!(ns.delete_watermark(0), Some("/home/user".len()));

    ns.apply_create(0, "/z").unwrap();
    assert_eq!(ns.delete_watermark(0), Some(2));
    assert_eq!(ns.delete_watermark(9), None);
}

#[test]
fn list_renders_each_server() {
    let ns = namespace();
    ns.register(&registration(5000, 5001, "/srv", &["/b", "/a"])).unwrap();
    ns.register(&registration(5002, 5003, "/srv", &[])).unwrap();
    ns.set_health(1, ServerHealth::Unreachable);

    let lines: Vec<String> = ns.list().iter().map(|s| s.render()).collect();
    assert_eq!(
        lines,
        vec![
            "ss_index 0 (active): /a,/b".to_string(),
            "ss_index 1 (unreachable): No paths available.".to_string(),
        ]
    );
}

#[test]
fn ping_brings_back_listening_servers() {
    let ns = namespace();
    let listener = TcpListener::bind(SocketAddr::from((LOCALHOST, 0))).unwrap();
    let live_port = listener.local_addr().unwrap().port();
    ns.register(&registration(5000, live_port, "/srv", &["/up"])).unwrap();
    ns.register(&registration(5002, dead_port(), "/srv", &["/down"]))
        .unwrap();
    ns.set_health(0, ServerHealth::Unreachable);
    ns.set_health(1, ServerHealth::Unreachable);

    assert_eq!(ping_unreachable(&ns), 1);
    assert_eq!(ns.health(0), Some(ServerHealth::Active));
    assert_eq!(ns.health(1), Some(ServerHealth::Unreachable));
    assert_eq!(ns.unreachable_servers().len(), 1);
}

#[test]
fn overlong_paths_are_never_indexed() {
    let ns = namespace();
    let long = format!("/x/{}", "a".repeat(1_000_000));
    let err = ns
        .register(&registration(5000, 5001, "/srv", &["/s", &long]))
        .unwrap_err();
    assert!(matches!(err, NamingError::Protocol(_)));
    assert_eq!(ns.server_count(), 0);
    assert_eq!(ns.path_count(), 0);

    ns.register(&registration(5000, 5001, "/srv", &["/s"])).unwrap();
    let err = ns.apply_create(0, &format!("/s/{}", "b".repeat(300))).unwrap_err();
    assert!(matches!(err, NamingError::Protocol(_)));
    assert_eq!(ns.delete_watermark(0), Some(2));
}

#[test]
fn listing_reports_registration_and_change_times() {
    let ns = namespace();
    ns.register(&registration(5000, 5001, "/srv", &["/a"])).unwrap();
    let before = ns.list()[0].clone();
    assert_eq!(before.registered_at, before.last_change);

    std::thread::sleep(std::time::Duration::from_millis(5));
    ns.set_health(0, ServerHealth::Unreachable);
    let after = ns.list()[0].clone();
    assert_eq!(after.registered_at, before.registered_at);
    assert!(after.last_change > after.registered_at);

    let json = serde_json::to_value(&after).unwrap();
    assert!(json["registered_at"].is_string());
    assert!(json["last_change"].is_string());
}

#[test]
fn health_check_sends_a_complete_ping() {
    let ns = namespace();
    let storage = FakeStorageServer::always_succeeds();
    ns.register(&registration(5000, storage.peer_port, "/srv", &["/up"]))
        .unwrap();
    ns.set_health(0, ServerHealth::Unreachable);

    assert_eq!(ping_unreachable(&ns), 1);
    assert!(wait_until(std::time::Duration::from_secs(5), || {
        storage.requests() == vec![StorageRequest::ping()]
    }));
}
