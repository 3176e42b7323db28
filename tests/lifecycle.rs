mod common;

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time;

use ldapmux::{
    ConnEvent, LdapConnSettings, LdapConnection, LdapError, ReconnectOptions, Scope,
    SearchEntry, SearchOptions, StreamState,
};

use common::{serve, ServerProfile};

fn fast_reconnect() -> ReconnectOptions {
    ReconnectOptions::new()
        .initial_delay(Duration::from_millis(20))
        .max_delay(Duration::from_millis(100))
}

async fn start_server(profile: ServerProfile) -> (String, std::sync::Arc<common::ServerStats>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ldap://{}", listener.local_addr().unwrap());
    let stats = serve(listener, profile);
    (url, stats)
}

#[tokio::test]
async fn bind_success() {
    let (url, stats) = start_server(ServerProfile::default()).await;
    let (conn, mut ldap) = LdapConnection::new(&url).unwrap();
    ldapmux::drive!(conn);
    let res = ldap.simple_bind("cn=admin,dc=x", "secret").await.unwrap();
    assert_eq!(res.rc, 0);
    assert_eq!(stats.binds.load(Ordering::SeqCst), 1);
    ldap.unbind().await.unwrap();
}

#[tokio::test]
async fn bind_bad_credentials_is_an_error() {
    let profile = ServerProfile {
        bind_rc: 49,
        ..Default::default()
    };
    let (url, _stats) = start_server(profile).await;
    let (mut conn, mut ldap) = LdapConnection::new(&url).unwrap();
    let mut events = conn.events().unwrap();
    ldapmux::drive!(conn);
    match ldap.simple_bind("cn=admin,dc=x", "wrong").await {
        Err(LdapError::LdapResult { result }) => assert_eq!(result.rc, 49),
        other => panic!("unexpected bind outcome: {:?}", other),
    }
    // Connected first, then the result error is echoed on the event channel
    let mut saw_result_error = false;
    while let Ok(ev) = time::timeout(Duration::from_millis(200), events.recv()).await {
        match ev {
            Some(ConnEvent::ResultError(res)) => {
                assert_eq!(res.rc, 49);
                saw_result_error = true;
                break;
            }
            Some(_) => continue,
            None => break,
        }
    }
    assert!(saw_result_error);
}

#[tokio::test]
async fn compare_answers_boolean() {
    let (url, _stats) = start_server(ServerProfile::default()).await;
    let (conn, mut ldap) = LdapConnection::new(&url).unwrap();
    ldapmux::drive!(conn);
    let matched = ldap
        .compare("cn=a,dc=x", "sn", "Smith")
        .await
        .unwrap()
        .equal()
        .unwrap();
    assert!(matched);
}

#[tokio::test]
async fn search_streams_entries_then_ends() {
    let profile = ServerProfile {
        entries: vec![
            String::from("cn=a,dc=x"),
            String::from("cn=b,dc=x"),
            String::from("cn=c,dc=x"),
        ],
        ..Default::default()
    };
    let (url, _stats) = start_server(profile).await;
    let (conn, mut ldap) = LdapConnection::new(&url).unwrap();
    ldapmux::drive!(conn);
    let opts = SearchOptions::new().scope(Scope::Subtree);
    let (entries, res) = ldap.search("dc=x", opts).await.unwrap().success().unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(res.rc, 0);
    let parsed = SearchEntry::construct(entries[0].clone());
    assert_eq!(parsed.dn, "cn=a,dc=x");
    assert_eq!(parsed.attrs["objectClass"], vec!["top"]);
}

#[tokio::test]
async fn paged_search_chases_cookies() {
    let profile = ServerProfile {
        entries: (0..5).map(|i| format!("cn=e{},dc=x", i)).collect(),
        paged: true,
        ..Default::default()
    };
    let (url, stats) = start_server(profile).await;
    let (conn, mut ldap) = LdapConnection::new(&url).unwrap();
    ldapmux::drive!(conn);
    let opts = SearchOptions::new().scope(Scope::Subtree).paged(2);
    let mut stream = ldap.streaming_search("dc=x", opts).await.unwrap();
    let mut seen = 0;
    while let Some(_entry) = stream.next().await.unwrap() {
        seen += 1;
    }
    let res = stream.finish().await;
    assert_eq!(res.rc, 0);
    assert_eq!(seen, 5);
    assert_eq!(stream.pages(), 3);
    assert_eq!(stream.requests_sent(), 3);
    assert_eq!(stats.searches.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn paged_search_pause_and_resume() {
    let profile = ServerProfile {
        entries: (0..5).map(|i| format!("cn=e{},dc=x", i)).collect(),
        paged: true,
        ..Default::default()
    };
    let (url, stats) = start_server(profile).await;
    let (conn, mut ldap) = LdapConnection::new(&url).unwrap();
    ldapmux::drive!(conn);
    let opts = SearchOptions::new()
        .scope(Scope::Subtree)
        .paged(2)
        .page_pause(true);
    let mut stream = ldap.streaming_search("dc=x", opts).await.unwrap();

    let mut first_page = 0;
    while let Some(_entry) = stream.next().await.unwrap() {
        first_page += 1;
    }
    assert_eq!(first_page, 2);
    assert_eq!(stream.state(), StreamState::PageEnd);
    assert!(stream.page_result().is_some());

    stream.resume().await.unwrap();
    let mut second_page = 0;
    while let Some(_entry) = stream.next().await.unwrap() {
        second_page += 1;
    }
    assert_eq!(second_page, 2);
    assert_eq!(stream.state(), StreamState::PageEnd);

    // stop here; the server must never see a third page request
    stream.resume_with(true).await.unwrap();
    let res = stream.finish().await;
    assert_eq!(res.rc, 0);
    assert_eq!(stats.searches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn add_queued_while_down_is_delivered_once() {
    let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = placeholder.local_addr().unwrap();
    drop(placeholder);

    let settings = LdapConnSettings::new().set_reconnect(fast_reconnect());
    let (conn, mut ldap) =
        LdapConnection::with_settings(settings, &format!("ldap://{}", addr)).unwrap();
    ldapmux::drive!(conn);

    let add_task = tokio::spawn(async move {
        let attrs = vec![("objectClass", HashSet::from(["person"]))];
        ldap.add("cn=queued,dc=x", attrs).await
    });

    // let at least one connect attempt fail while the server is down
    time::sleep(Duration::from_millis(60)).await;
    let listener = TcpListener::bind(addr).await.unwrap();
    let stats = serve(listener, ServerProfile::default());

    let res = add_task.await.unwrap().unwrap();
    assert_eq!(res.rc, 0);
    assert_eq!(stats.adds.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn frozen_queue_fails_fast_while_down() {
    let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = placeholder.local_addr().unwrap();
    drop(placeholder);

    let settings = LdapConnSettings::new()
        .set_reconnect(fast_reconnect())
        .set_queue_disabled(true);
    let (conn, mut ldap) =
        LdapConnection::with_settings(settings, &format!("ldap://{}", addr)).unwrap();
    ldapmux::drive!(conn);

    // wait out the first connect attempt so the request hits the frozen queue
    time::sleep(Duration::from_millis(60)).await;
    match ldap.delete("cn=gone,dc=x").await {
        Err(LdapError::QueueUnavailable) => (),
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn timed_out_request_is_abandoned() {
    let profile = ServerProfile {
        response_delay: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    let (url, stats) = start_server(profile).await;
    let (conn, mut ldap) = LdapConnection::new(&url).unwrap();
    ldapmux::drive!(conn);
    let outcome = ldap
        .with_timeout(Duration::from_millis(50))
        .delete("cn=slow,dc=x")
        .await;
    assert!(matches!(outcome, Err(LdapError::Timeout { .. })));
    // the delayed response must be discarded, and the server must see the
    // AbandonRequest once it finishes sleeping
    time::sleep(Duration::from_millis(300)).await;
    assert_eq!(stats.abandons.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failover_reaches_the_live_server() {
    let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = placeholder.local_addr().unwrap();
    drop(placeholder);
    let (live_url, stats) = start_server(ServerProfile::default()).await;

    let settings = LdapConnSettings::new().set_reconnect(fast_reconnect());
    let dead_url = format!("ldap://{}", dead_addr);
    let (conn, mut ldap) =
        LdapConnection::multi_with_settings(settings, &[&dead_url, &live_url]).unwrap();
    ldapmux::drive!(conn);

    let res = ldap.simple_bind("cn=admin,dc=x", "secret").await.unwrap();
    assert_eq!(res.rc, 0);
    assert_eq!(stats.binds.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn implicit_bind_runs_during_setup() {
    let (url, stats) = start_server(ServerProfile::default()).await;
    let settings = LdapConnSettings::new().set_bind("cn=admin,dc=x", "secret");
    let (mut conn, mut ldap) = LdapConnection::with_settings(settings, &url).unwrap();
    let mut events = conn.events().unwrap();
    ldapmux::drive!(conn);
    // the first explicit operation rides a connection that is already bound
    let matched = ldap
        .compare("cn=a,dc=x", "sn", "Smith")
        .await
        .unwrap()
        .equal()
        .unwrap();
    assert!(matched);
    assert_eq!(stats.binds.load(Ordering::SeqCst), 1);
    let ev = time::timeout(Duration::from_millis(200), events.recv())
        .await
        .expect("event in time");
    assert!(matches!(ev, Some(ConnEvent::Connected)));
}

#[tokio::test]
async fn idle_event_fires_when_quiet() {
    let (url, _stats) = start_server(ServerProfile::default()).await;
    let settings = LdapConnSettings::new().set_idle_timeout(Duration::from_millis(50));
    let (mut conn, mut ldap) = LdapConnection::with_settings(settings, &url).unwrap();
    let mut events = conn.events().unwrap();
    ldapmux::drive!(conn);
    let res = ldap.simple_bind("cn=admin,dc=x", "secret").await.unwrap();
    assert_eq!(res.rc, 0);
    let mut saw_idle = false;
    for _ in 0..4 {
        match time::timeout(Duration::from_millis(300), events.recv()).await {
            Ok(Some(ConnEvent::Idle)) => {
                saw_idle = true;
                break;
            }
            Ok(Some(_)) => continue,
            _ => break,
        }
    }
    assert!(saw_idle);
}

#[tokio::test]
async fn destroy_is_idempotent_and_final() {
    let (url, _stats) = start_server(ServerProfile::default()).await;
    let (mut conn, mut ldap) = LdapConnection::new(&url).unwrap();
    let mut events = conn.events().unwrap();
    ldapmux::drive!(conn);
    let res = ldap.simple_bind("cn=admin,dc=x", "secret").await.unwrap();
    assert_eq!(res.rc, 0);
    ldap.destroy().await.unwrap();
    ldap.destroy().await.unwrap();
    match ldap.delete("cn=later,dc=x").await {
        Err(LdapError::ConnectionClosed) => (),
        other => panic!("operation survived destroy: {:?}", other),
    }
    let mut saw_destroyed = false;
    while let Ok(Some(ev)) = time::timeout(Duration::from_millis(200), events.recv()).await {
        if matches!(ev, ConnEvent::Destroyed) {
            saw_destroyed = true;
            break;
        }
    }
    assert!(saw_destroyed);
}

#[tokio::test]
async fn unbind_resolves_on_close_and_stops_the_client() {
    let (url, stats) = start_server(ServerProfile::default()).await;
    let (conn, mut ldap) = LdapConnection::new(&url).unwrap();
    ldapmux::drive!(conn);
    let res = ldap.simple_bind("cn=admin,dc=x", "secret").await.unwrap();
    assert_eq!(res.rc, 0);
    ldap.unbind().await.unwrap();
    assert_eq!(stats.unbinds.load(Ordering::SeqCst), 1);
    // the connection task has exited; nothing serves requests anymore
    assert!(ldap.delete("cn=x,dc=x").await.is_err());
}

#[tokio::test]
async fn whoami_roundtrip() {
    use ldapmux::exop::{WhoAmI, WhoAmIResp};

    let (url, _stats) = start_server(ServerProfile::default()).await;
    let (conn, mut ldap) = LdapConnection::new(&url).unwrap();
    ldapmux::drive!(conn);
    let (exop, res) = ldap.extended(WhoAmI).await.unwrap().success().unwrap();
    assert_eq!(res.rc, 0);
    let resp: WhoAmIResp = exop.parse();
    assert_eq!(resp.authzid, "dn:cn=admin,dc=example,dc=org");
}

#[cfg(unix)]
#[tokio::test]
async fn ldapi_over_unix_socket() {
    use tokio::net::UnixListener;

    let dir = std::env::temp_dir().join(format!("ldapmux-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("ldapi");
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();
    let stats = common::serve_unix(listener, ServerProfile::default());

    let url = format!(
        "ldapi://{}",
        percent_encode_path(path.to_str().unwrap())
    );
    let (conn, mut ldap) = LdapConnection::new(&url).unwrap();
    ldapmux::drive!(conn);
    let res = ldap.simple_bind("cn=admin,dc=x", "secret").await.unwrap();
    assert_eq!(res.rc, 0);
    assert_eq!(stats.binds.load(Ordering::SeqCst), 1);
}

#[cfg(unix)]
fn percent_encode_path(path: &str) -> String {
    path.replace('/', "%2f")
}

#[tokio::test]
async fn strict_dn_rejects_before_io() {
    // no server at all: validation must fail synchronously
    let (conn, mut ldap) = LdapConnection::new("ldap://127.0.0.1:1").unwrap();
    drop(conn);
    match ldap.delete("not a dn").await {
        Err(LdapError::InvalidDN(_)) => (),
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn reconnect_budget_exhaustion_reports_refusal() {
    let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = placeholder.local_addr().unwrap();
    drop(placeholder);

    let settings = LdapConnSettings::new().set_reconnect(
        fast_reconnect().fail_after(2),
    );
    let (mut conn, _ldap) =
        LdapConnection::with_settings(settings, &format!("ldap://{}", addr)).unwrap();
    let mut events = conn.events().unwrap();
    let outcome = conn.drive().await;
    assert!(matches!(
        outcome,
        Err(LdapError::ReconnectExhausted { .. })
    ));
    let mut saw_refused = false;
    while let Ok(Some(ev)) = time::timeout(Duration::from_millis(100), events.recv()).await {
        if matches!(ev, ConnEvent::ConnectRefused) {
            saw_refused = true;
        }
    }
    assert!(saw_refused);
}
