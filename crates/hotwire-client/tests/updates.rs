//! Applying `update`, `full-reload`, `prune`, `error` and `custom` payloads.

mod common;

use common::{config, eventually, FakeHost};
use hotwire_client::HmrRuntime;
use hotwire_proto::{events, ErrorPayload, HmrPayload, Update, UpdateKind};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;

fn js(path: &str, accepted_path: &str, timestamp: u64) -> Update {
    Update {
        kind: UpdateKind::Js,
        path: path.to_string(),
        accepted_path: accepted_path.to_string(),
        timestamp,
        explicit_import_required: Some(false),
    }
}

fn css(path: &str, timestamp: u64) -> Update {
    Update {
        kind: UpdateKind::Css,
        path: path.to_string(),
        accepted_path: path.to_string(),
        timestamp,
        explicit_import_required: None,
    }
}

fn update(updates: Vec<Update>) -> HmrPayload {
    HmrPayload::Update { updates }
}

fn runtime(host: FakeHost) -> HmrRuntime<FakeHost> {
    HmrRuntime::new(host, config())
}

type Seen = Arc<Mutex<Vec<Value>>>;

fn seen() -> Seen {
    Arc::new(Mutex::new(Vec::new()))
}

#[tokio::test]
async fn test_only_callbacks_for_accepted_path_run() {
    let rt = runtime(FakeHost::new());
    let hot = rt.create_hot_context("/main.js");
    let dep_seen = seen();
    let other_seen = seen();
    let sink = Arc::clone(&dep_seen);
    hot.accept_dep("/dep.js", move |module| {
        sink.lock().push(module.cloned().unwrap_or_default());
    });
    let sink = Arc::clone(&other_seen);
    hot.accept_dep("/other.js", move |_| sink.lock().push(Value::Null));

    rt.handle_message(update(vec![js("/main.js", "/dep.js", 7)]))
        .await;

    assert_eq!(rt.host().log(), vec!["import /dep.js?t=7"]);
    assert_eq!(dep_seen.lock().as_slice(), &[json!({ "url": "/dep.js?t=7" })]);
    assert!(other_seen.lock().is_empty());
}

#[tokio::test]
async fn test_accept_deps_fills_only_changed_slot() {
    let rt = runtime(FakeHost::new());
    let slots = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&slots);
    rt.create_hot_context("/main.js")
        .accept_deps(&["/a.js", "/b.js"], move |modules| {
            sink.lock().extend(modules.iter().map(Option::is_some));
        });

    rt.handle_message(update(vec![js("/main.js", "/b.js", 1)]))
        .await;

    assert_eq!(slots.lock().as_slice(), &[false, true]);
}

#[tokio::test]
async fn test_dispose_runs_before_reimport() {
    let rt = runtime(FakeHost::new());
    let hot = rt.create_hot_context("/a.js");
    let log = Arc::clone(&rt.host().log);
    hot.dispose(move |data| {
        let log = Arc::clone(&log);
        async move {
            data.lock().insert("disposed".into(), Value::Bool(true));
            log.lock().push("dispose".to_string());
        }
    });
    let log = Arc::clone(&rt.host().log);
    hot.accept_self(move |_| log.lock().push("accept".to_string()));

    rt.handle_message(update(vec![js("/a.js", "/a.js", 1)])).await;

    assert_eq!(rt.host().log(), vec!["dispose", "import /a.js?t=1", "accept"]);
    let data = rt.create_hot_context("/a.js").data();
    assert_eq!(data.lock().get("disposed"), Some(&Value::Bool(true)));
}

#[tokio::test]
async fn test_import_url_keeps_query_and_marks_explicit_imports() {
    let rt = runtime(FakeHost::new());
    rt.create_hot_context("/main.js")
        .accept_deps(&["/logo.svg?raw"], |_| {});

    let mut asset = js("/main.js", "/logo.svg?raw", 9);
    asset.explicit_import_required = Some(true);
    rt.handle_message(update(vec![asset])).await;

    assert_eq!(rt.host().log(), vec!["import /logo.svg?import&t=9&raw"]);
}

#[tokio::test]
async fn test_unknown_boundary_is_ignored() {
    let rt = runtime(FakeHost::new());
    rt.handle_message(update(vec![js("/never-ran.js", "/never-ran.js", 1)]))
        .await;
    assert!(rt.host().log().is_empty());
    assert_eq!(rt.host().reloads(), 0);
}

#[tokio::test]
async fn test_failed_import_drops_only_that_update() {
    let host = FakeHost::new();
    host.page.lock().failing.push("/bad.js".to_string());
    let rt = runtime(host);
    let applied = Arc::new(Mutex::new(Vec::new()));

    for path in ["/good.js", "/bad.js"] {
        let sink = Arc::clone(&applied);
        rt.create_hot_context(path)
            .accept_self(move |_| sink.lock().push(path));
    }

    rt.handle_message(update(vec![js("/bad.js", "/bad.js", 1), js("/good.js", "/good.js", 1)]))
        .await;

    assert_eq!(applied.lock().as_slice(), &["/good.js"]);
    assert_eq!(rt.host().reloads(), 0);
}

#[tokio::test]
async fn test_batch_applies_after_every_fetch_finished() {
    let rt = runtime(FakeHost::new());
    let applied = Arc::new(Mutex::new(Vec::new()));
    for path in ["/a.js", "/b.js"] {
        let sink = Arc::clone(&applied);
        rt.create_hot_context(path)
            .accept_self(move |_| sink.lock().push(path));
    }
    let release = rt.host().gate_import("/a.js");

    let task = tokio::spawn({
        let rt = rt.clone();
        async move {
            rt.handle_message(update(vec![js("/a.js", "/a.js", 1), js("/b.js", "/b.js", 1)]))
                .await;
        }
    });

    eventually(|| rt.host().log().contains(&"import /b.js?t=1".to_string())).await;
    assert!(applied.lock().is_empty());

    release.send(()).unwrap();
    task.await.unwrap();
    assert_eq!(applied.lock().as_slice(), &["/a.js", "/b.js"]);
}

#[tokio::test]
async fn test_superseded_fetch_in_same_burst_is_dropped() {
    let rt = runtime(FakeHost::new());
    let versions = seen();
    let sink = Arc::clone(&versions);
    rt.create_hot_context("/a.js").accept_self(move |module| {
        sink.lock().push(module.cloned().unwrap_or_default());
    });

    rt.handle_messages([
        update(vec![js("/a.js", "/a.js", 1)]),
        update(vec![js("/a.js", "/a.js", 2)]),
    ])
    .await;

    assert_eq!(versions.lock().as_slice(), &[json!({ "url": "/a.js?t=2" })]);
}

#[tokio::test]
async fn test_css_swap_keeps_old_link_until_new_one_loads() {
    let rt = runtime(FakeHost::new().with_link("http://localhost:5173/style.css"));
    let loaded = rt.host().gate_link_load();

    let task = tokio::spawn({
        let rt = rt.clone();
        async move { rt.handle_message(update(vec![css("/style.css", 3)])).await }
    });

    eventually(|| rt.host().hrefs().len() == 2).await;
    assert_eq!(
        rt.host().hrefs(),
        vec!["http://localhost:5173/style.css", "/style.css?t=3"]
    );

    loaded.send(()).unwrap();
    task.await.unwrap();
    assert_eq!(rt.host().hrefs(), vec!["/style.css?t=3"]);
}

#[tokio::test]
async fn test_concurrent_css_updates_match_link_once() {
    let rt = runtime(FakeHost::new().with_link("/style.css?t=1"));

    rt.handle_message(update(vec![css("/style.css", 3), css("/style.css", 4)]))
        .await;

    assert_eq!(rt.host().log(), vec!["insert /style.css?t=3", "remove 1"]);
    assert_eq!(rt.host().hrefs(), vec!["/style.css?t=3"]);
}

#[tokio::test]
async fn test_css_update_without_link_is_skipped() {
    let rt = runtime(FakeHost::new().with_link("/other.css"));
    rt.handle_message(update(vec![css("/style.css", 3)])).await;
    assert!(rt.host().log().is_empty());
    assert_eq!(rt.host().reloads(), 0);
}

#[tokio::test]
async fn test_full_reload_scoped_to_current_page() {
    let cases = [
        ("/about.html", Some("/about.html"), 1),
        ("/about.html", Some("/index.html"), 1),
        ("/docs/", Some("/docs/index.html"), 1),
        ("/about.html", Some("/contact.html"), 0),
        ("/about.html", None, 1),
        ("/about.html", Some("/src/main.js"), 1),
    ];
    for (page, path, reloads) in cases {
        let host = FakeHost::new();
        host.page.lock().pathname = page.to_string();
        let rt = runtime(host);
        rt.handle_message(HmrPayload::FullReload {
            path: path.map(str::to_string),
        })
        .await;
        assert_eq!(rt.host().reloads(), reloads, "page {page}, path {path:?}");
    }
}

#[tokio::test]
async fn test_first_update_after_error_overlay_reloads() {
    let err = HmrPayload::Error {
        err: ErrorPayload {
            message: "Transform failed".into(),
            ..Default::default()
        },
    };

    let rt = runtime(FakeHost::new());
    rt.create_hot_context("/a.js").accept_self(|_| {});
    rt.handle_message(err.clone()).await;
    assert!(rt.host().page.lock().overlay.is_some());
    rt.handle_message(update(vec![js("/a.js", "/a.js", 1)])).await;
    assert_eq!(rt.host().reloads(), 1);
    assert!(rt.host().log().is_empty());

    // Once an update went through, later overlays are just cleared.
    let rt = runtime(FakeHost::new());
    rt.create_hot_context("/a.js").accept_self(|_| {});
    rt.handle_message(update(vec![js("/a.js", "/a.js", 1)])).await;
    rt.handle_message(err).await;
    rt.handle_message(update(vec![js("/a.js", "/a.js", 2)])).await;
    assert_eq!(rt.host().reloads(), 0);
    assert!(rt.host().page.lock().overlay.is_none());
}

#[tokio::test]
async fn test_error_without_overlay_is_only_logged() {
    let mut config = config();
    config.overlay = false;
    let rt = HmrRuntime::new(FakeHost::new(), config);
    let errors = seen();
    let sink = Arc::clone(&errors);
    rt.create_hot_context("/a.js")
        .on(events::ERROR, move |data| sink.lock().push(data.clone()));

    rt.handle_message(HmrPayload::Error {
        err: ErrorPayload {
            message: "boom".into(),
            ..Default::default()
        },
    })
    .await;

    assert!(rt.host().page.lock().overlay.is_none());
    assert_eq!(errors.lock()[0]["err"]["message"], "boom");
}

#[tokio::test]
async fn test_prune_runs_callback_with_data() {
    let rt = runtime(FakeHost::new());
    let hot = rt.create_hot_context("/widget.js");
    hot.data().lock().insert("mounted".into(), Value::Bool(true));
    let pruned = seen();
    let sink = Arc::clone(&pruned);
    hot.prune(move |data| sink.lock().push(Value::Object(data.lock().clone())));

    rt.handle_message(HmrPayload::Prune {
        paths: vec!["/widget.js".into(), "/unknown.js".into()],
    })
    .await;

    assert_eq!(pruned.lock().as_slice(), &[json!({ "mounted": true })]);
}

#[tokio::test]
async fn test_lifecycle_and_custom_events_reach_listeners() {
    let rt = runtime(FakeHost::new());
    let hot = rt.create_hot_context("/main.js");
    let received = seen();
    for event in [events::BEFORE_UPDATE, events::BEFORE_PRUNE, "app:ready"] {
        let sink = Arc::clone(&received);
        hot.on(event, move |data| sink.lock().push(data.clone()));
    }

    rt.handle_messages([
        update(vec![]),
        HmrPayload::Prune { paths: vec![] },
        HmrPayload::Custom {
            event: "app:ready".into(),
            data: json!({ "ok": true }),
        },
    ])
    .await;

    assert_eq!(
        received.lock().as_slice(),
        &[
            json!({ "type": "update", "updates": [] }),
            json!({ "type": "prune", "paths": [] }),
            json!({ "ok": true }),
        ]
    );
}
