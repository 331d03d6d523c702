use super::*;
use std::time::Instant;

use crate::config::{AuthMethod, ImapConfig, TlsMode, TuningOverrides};
use crate::credentials::testing::ScriptedRefresher;
use crate::credentials::{CredentialResolver, MemorySecretStore, SecretKind, SecretStore};
use crate::error::AuthError;
use crate::mail::fake::{FakeServer, message};
use crate::publish::{ChannelSink, EventPublisher, IngestionEvent};
use crate::retry::RetryConfig;
use crate::schedule::BackoffPolicy;
use crate::store::{LeaseKey, Store};

const WAIT: Duration = Duration::from_secs(5);

fn provider(auth: AuthMethod, folders: &[&str]) -> ProviderConnection {
    ProviderConnection {
        id: "support".to_string(),
        tenant: "acme".to_string(),
        enabled: true,
        imap: ImapConfig {
            server: "imap.example.com".to_string(),
            port: 993,
            tls: TlsMode::Tls,
        },
        username: "support@example.com".to_string(),
        auth,
        folders: folders.iter().map(|f| f.to_string()).collect(),
        tuning: TuningOverrides::default(),
    }
}

fn settings() -> SupervisorSettings {
    SupervisorSettings {
        listener: ListenerSettings {
            connect_timeout: Duration::from_secs(1),
            io_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(50),
            heartbeat_interval: Duration::from_millis(40),
            idle_timeout: Duration::from_secs(10),
            lease_ttl: Duration::from_secs(2),
            lease_renew: Duration::from_millis(50),
            catch_up_window: 50,
            max_messages_per_sync: 10,
            max_skips_per_batch: 3,
            max_consecutive_failures: 0,
            keepalive: true,
            backoff: BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(50), 0.5),
        },
        stagger_span: Duration::from_millis(20),
        restart_delay: Duration::from_millis(20),
        shutdown_timeout: Duration::from_secs(2),
    }
}

struct Harness {
    server: FakeServer,
    store: Store,
    secrets: Arc<MemorySecretStore>,
    events: mpsc::Receiver<IngestionEvent>,
    alerts: mpsc::Receiver<OperatorAlert>,
    handle: SupervisorHandle,
}

impl Harness {
    async fn start(
        server: FakeServer,
        provider: ProviderConnection,
        secrets: &[(&str, SecretKind, &str)],
        refresher: ScriptedRefresher,
    ) -> Self {
        let store = Store::open_in_memory().await.unwrap();
        let secrets = Arc::new(MemorySecretStore::with(secrets));
        let credentials = Arc::new(CredentialResolver::new(secrets.clone(), Arc::new(refresher)));
        credentials.register(&provider);

        let (sink, events) = ChannelSink::new(256);
        let publisher = EventPublisher::new(Arc::new(sink), 2, false)
            .with_retry_config(RetryConfig::new(1, Duration::from_millis(5), Duration::from_millis(10)));
        let deps = ListenerDeps {
            connector: Arc::new(server.clone()),
            credentials,
            folder_states: Arc::new(store.clone()),
            leases: Arc::new(store.clone()),
            publisher: Arc::new(publisher),
            instance_id: "node-1".to_string(),
        };

        let (alert_tx, alerts) = mpsc::channel(16);
        let handle = spawn_supervisor(deps, Arc::new(provider), settings(), alert_tx);

        Self {
            server,
            store,
            secrets,
            events,
            alerts,
            handle,
        }
    }

    async fn password(server: FakeServer, folders: &[&str], password: &str) -> Self {
        Self::start(
            server,
            provider(AuthMethod::Password, folders),
            &[("support", SecretKind::Password, password)],
            ScriptedRefresher::default(),
        )
        .await
    }

    async fn next_uids(&mut self, n: usize) -> Vec<(String, u32)> {
        let mut seen = Vec::new();
        for _ in 0..n {
            let event = tokio::time::timeout(WAIT, self.events.recv()).await.unwrap().unwrap();
            seen.push((event.folder().to_string(), event.uid()));
        }
        seen.sort();
        seen
    }

    async fn wait_status(&self, check: impl Fn(&[FolderReport]) -> bool) -> Vec<FolderReport> {
        let deadline = Instant::now() + WAIT;
        loop {
            let report = self.handle.status().await.unwrap();
            if check(&report) {
                return report;
            }
            assert!(Instant::now() < deadline, "status never matched: {:?}", report);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn folders(report: &[FolderReport]) -> Vec<&str> {
    report.iter().map(|r| r.folder.as_str()).collect()
}

#[tokio::test]
async fn test_default_folder_is_inbox() {
    let server = FakeServer::new("pw").with_idle(true);
    server.folder("INBOX", "1", 1..=2);
    server.folder("Archive", "1", 1..=2);
    let mut h = Harness::password(server, &[], "pw").await;

    assert_eq!(
        h.next_uids(2).await,
        vec![("INBOX".to_string(), 1), ("INBOX".to_string(), 2)]
    );
    let report = h
        .wait_status(|r| r.iter().all(|f| f.state == ListenerState::Idle))
        .await;
    assert_eq!(folders(&report), vec!["INBOX"]);

    h.handle.shutdown(WAIT).await;
    let key = LeaseKey::new("acme", "support", "INBOX");
    assert_eq!(h.store.inspect_lease(&key).await.unwrap(), None);
}

#[tokio::test]
async fn test_glob_filters_expand_to_one_listener_per_folder() {
    let server = FakeServer::new("pw").with_idle(true);
    server.folder("INBOX", "1", 1..=1);
    server.folder("Support/Billing", "1", 1..=1);
    server.folder("Support/Abuse", "1", 1..=1);
    server.folder("Archive", "1", 1..=1);
    let mut h = Harness::password(server, &["INBOX", "Support/*"], "pw").await;

    assert_eq!(
        h.next_uids(3).await,
        vec![
            ("INBOX".to_string(), 1),
            ("Support/Abuse".to_string(), 1),
            ("Support/Billing".to_string(), 1),
        ]
    );
    let report = h.handle.status().await.unwrap();
    assert_eq!(folders(&report), vec!["INBOX", "Support/Abuse", "Support/Billing"]);

    h.handle.shutdown(WAIT).await;
}

#[tokio::test]
async fn test_suspended_listener_alerts_and_waits_for_reset() {
    let server = FakeServer::new("right").with_idle(true);
    server.folder("INBOX", "1", 1..=1);
    let mut h = Harness::password(server, &[], "wrong").await;

    let alert = tokio::time::timeout(WAIT, h.alerts.recv()).await.unwrap().unwrap();
    assert_eq!(alert.tenant, "acme");
    assert_eq!(alert.provider, "support");
    assert_eq!(alert.folder, "INBOX");

    // No automatic restart while suspended.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.server.lock().connects, 1);
    let report = h.handle.status().await.unwrap();
    assert_eq!(report[0].state, ListenerState::Suspended);
    assert!(report[0].suspended.is_some());

    h.secrets.set("support", SecretKind::Password, "right").unwrap();
    h.handle.send(SupervisorCommand::Reset).await.unwrap();
    assert_eq!(h.next_uids(1).await, vec![("INBOX".to_string(), 1)]);
    h.wait_status(|r| r[0].suspended.is_none()).await;

    h.handle.shutdown(WAIT).await;
}

#[tokio::test]
async fn test_rotation_restarts_listeners_without_replay() {
    let server = FakeServer::new("pw").with_idle(true);
    server.folder("INBOX", "1", 1..=2);
    let mut h = Harness::password(server, &[], "pw").await;

    h.next_uids(2).await;
    h.wait_status(|r| r.iter().all(|f| f.state == ListenerState::Idle)).await;

    h.handle.send(SupervisorCommand::CredentialsRotated).await.unwrap();
    let deadline = Instant::now() + WAIT;
    while h.server.lock().connects < 2 {
        assert!(Instant::now() < deadline, "listener was not restarted");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    h.wait_status(|r| r.iter().all(|f| f.state == ListenerState::Idle)).await;

    let uid = h.server.deliver("INBOX", Some(message(3)));
    assert_eq!(h.next_uids(1).await, vec![("INBOX".to_string(), uid)]);
    assert!(h.events.try_recv().is_err());

    h.handle.shutdown(WAIT).await;
}

#[tokio::test]
async fn test_disable_stops_listeners() {
    let server = FakeServer::new("pw").with_idle(true);
    server.folder("INBOX", "1", 1..=1);
    server.folder("Sales", "1", 1..=1);
    let mut h = Harness::password(server, &["INBOX", "Sales"], "pw").await;

    h.next_uids(2).await;
    h.handle.stop(SupervisorCommand::Disable, WAIT).await;

    for folder in ["INBOX", "Sales"] {
        let key = LeaseKey::new("acme", "support", folder);
        assert_eq!(h.store.inspect_lease(&key).await.unwrap(), None);
    }
}

#[tokio::test]
async fn test_discovery_failure_alerts_for_provider() {
    // The first exchange is refused, the second mints "token-2".
    let server = FakeServer::new("token-2").with_idle(true);
    server.folder("INBOX", "1", 1..=1);
    let auth = AuthMethod::OAuth2 {
        token_url: "https://login.example/token".to_string(),
        client_id: "client".to_string(),
        scopes: None,
    };
    let mut h = Harness::start(
        server,
        provider(auth, &["*"]),
        &[("support", SecretKind::RefreshToken, "rt")],
        ScriptedRefresher::new(vec![Err(AuthError::Revoked("invalid_grant".into()))]),
    )
    .await;

    let alert = tokio::time::timeout(WAIT, h.alerts.recv()).await.unwrap().unwrap();
    assert_eq!(alert.folder, "*");
    assert!(h.handle.status().await.unwrap().is_empty());

    h.handle.send(SupervisorCommand::Reset).await.unwrap();
    assert_eq!(h.next_uids(1).await, vec![("INBOX".to_string(), 1)]);

    h.handle.shutdown(WAIT).await;
}

#[test]
fn test_expand_filters() {
    let available: Vec<String> = ["INBOX", "Support/Billing", "Support/Abuse", "Archive"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let filters = vec![
        "Support/*".to_string(),
        "Missing".to_string(),
        "Support/Billing".to_string(),
    ];

    let folders = expand_filters(&filters, &available).unwrap();
    assert_eq!(folders, vec!["Support/Billing", "Support/Abuse", "Missing"]);

    let invalid = expand_filters(&["Support/[".to_string()], &available);
    assert!(matches!(invalid, Err(SyncError::Protocol(_))));
}

#[test]
fn test_pattern_detection() {
    assert!(is_pattern("*"));
    assert!(is_pattern("Support/?"));
    assert!(is_pattern("[A-Z]*"));
    assert!(!is_pattern("INBOX"));
    assert!(!is_pattern("Support/Billing"));
}
