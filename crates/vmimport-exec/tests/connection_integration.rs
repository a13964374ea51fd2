use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use vmimport_exec::session::{RemoteReader, RemoteWriter};
use vmimport_exec::*;

// Session that reports loss while the shared `down` flag is set
struct FlakySession {
    inner: LocalSession,
    down: Arc<AtomicBool>,
}

impl FlakySession {
    fn check(&self) -> Result<(), SessionError> {
        if self.down.load(Ordering::Acquire) {
            return Err(SessionError::Lost("broken pipe".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteSession for FlakySession {
    async fn probe(&self) -> Result<(), SessionError> {
        self.check()?;
        self.inner.probe().await
    }

    async fn exec(&self, cmd: &str) -> Result<CommandOutput, SessionError> {
        self.check()?;
        self.inner.exec(cmd).await
    }

    async fn stat(&self, path: &str) -> Result<FileStat, SessionError> {
        self.check()?;
        self.inner.stat(path).await
    }

    async fn lstat(&self, path: &str) -> Result<FileStat, SessionError> {
        self.check()?;
        self.inner.lstat(path).await
    }

    async fn mkdir_all(&self, path: &str) -> Result<(), SessionError> {
        self.check()?;
        self.inner.mkdir_all(path).await
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, SessionError> {
        self.check()?;
        self.inner.read_dir(path).await
    }

    async fn create(&self, path: &str) -> Result<RemoteWriter, SessionError> {
        self.check()?;
        self.inner.create(path).await
    }

    async fn open(&self, path: &str) -> Result<RemoteReader, SessionError> {
        self.check()?;
        self.inner.open(path).await
    }

    async fn remove_file(&self, path: &str) -> Result<(), SessionError> {
        self.check()?;
        self.inner.remove_file(path).await
    }

    async fn remove_dir(&self, path: &str) -> Result<(), SessionError> {
        self.check()?;
        self.inner.remove_dir(path).await
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.inner.close().await
    }

    fn session_type(&self) -> &'static str {
        "flaky"
    }
}

#[derive(Default)]
struct FlakyConnector {
    connects: AtomicUsize,
    down: Arc<AtomicBool>,
    // the network comes back when a new session is dialed
    heal_on_connect: bool,
    refuse_after: Option<usize>,
}

impl FlakyConnector {
    fn connects(&self) -> usize {
        self.connects.load(Ordering::Acquire)
    }

    fn drop_sessions(&self) {
        self.down.store(true, Ordering::Release);
    }
}

#[async_trait]
impl Connector for FlakyConnector {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn RemoteSession>, ExecError> {
        let n = self.connects.fetch_add(1, Ordering::AcqRel) + 1;
        if self.refuse_after.is_some_and(|max| n > max) {
            return Err(ExecError::Connect {
                target: credentials.target(),
                stage: ConnectStage::Transport,
                source: SessionError::Rejected("connection refused".to_string()),
            });
        }
        if self.heal_on_connect {
            self.down.store(false, Ordering::Release);
        }
        Ok(Arc::new(FlakySession {
            inner: LocalSession::new(),
            down: Arc::clone(&self.down),
        }))
    }
}

// Session whose liveness probe never answers
struct HungProbeSession {
    inner: LocalSession,
}

#[async_trait]
impl RemoteSession for HungProbeSession {
    async fn probe(&self) -> Result<(), SessionError> {
        std::future::pending().await
    }

    async fn exec(&self, cmd: &str) -> Result<CommandOutput, SessionError> {
        self.inner.exec(cmd).await
    }

    async fn stat(&self, path: &str) -> Result<FileStat, SessionError> {
        self.inner.stat(path).await
    }

    async fn lstat(&self, path: &str) -> Result<FileStat, SessionError> {
        self.inner.lstat(path).await
    }

    async fn mkdir_all(&self, path: &str) -> Result<(), SessionError> {
        self.inner.mkdir_all(path).await
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, SessionError> {
        self.inner.read_dir(path).await
    }

    async fn create(&self, path: &str) -> Result<RemoteWriter, SessionError> {
        self.inner.create(path).await
    }

    async fn open(&self, path: &str) -> Result<RemoteReader, SessionError> {
        self.inner.open(path).await
    }

    async fn remove_file(&self, path: &str) -> Result<(), SessionError> {
        self.inner.remove_file(path).await
    }

    async fn remove_dir(&self, path: &str) -> Result<(), SessionError> {
        self.inner.remove_dir(path).await
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.inner.close().await
    }

    fn session_type(&self) -> &'static str {
        "hung-probe"
    }
}

struct HungProbeConnector;

#[async_trait]
impl Connector for HungProbeConnector {
    async fn connect(&self, _credentials: &Credentials) -> Result<Arc<dyn RemoteSession>, ExecError> {
        Ok(Arc::new(HungProbeSession {
            inner: LocalSession::new(),
        }))
    }
}

// Connector whose handshake never completes
struct HungDialConnector;

#[async_trait]
impl Connector for HungDialConnector {
    async fn connect(&self, _credentials: &Credentials) -> Result<Arc<dyn RemoteSession>, ExecError> {
        std::future::pending().await
    }
}

fn credentials() -> Credentials {
    Credentials::new("node1", SecretKey::new("unused"))
}

fn local_connection() -> Connection {
    Connection::new(
        Credentials::new("localhost", SecretKey::new("unused")),
        Arc::new(LocalConnector),
    )
}

#[tokio::test]
async fn test_lost_session_reconnects_once() {
    let connector = Arc::new(FlakyConnector {
        heal_on_connect: true,
        ..Default::default()
    });
    let conn = Connection::open(credentials(), connector.clone(), &CancelScope::new())
        .await
        .unwrap();
    assert_eq!(connector.connects(), 1);

    connector.drop_sessions();
    let out = conn.exec("echo still here", &CancelScope::new()).await.unwrap();

    assert_eq!(String::from_utf8(out).unwrap(), "still here\n");
    assert_eq!(connector.connects(), 2);
    assert!(matches!(
        conn.manager().state().await,
        ConnectionState::Connected(_)
    ));
}

#[tokio::test]
async fn test_second_loss_surfaces() {
    // the fresh session is broken too; it must not be retried again
    let connector = Arc::new(FlakyConnector::default());
    let conn = Connection::open(credentials(), connector.clone(), &CancelScope::new())
        .await
        .unwrap();

    connector.drop_sessions();
    let err = conn.exec("true", &CancelScope::new()).await.unwrap_err();

    assert!(err.is_session_lost(), "unexpected error: {err}");
    assert_eq!(connector.connects(), 2);
}

#[tokio::test]
async fn test_failed_reconnect_is_connect_error() {
    let connector = Arc::new(FlakyConnector {
        refuse_after: Some(1),
        ..Default::default()
    });
    let conn = Connection::open(credentials(), connector.clone(), &CancelScope::new())
        .await
        .unwrap();

    connector.drop_sessions();
    let err = conn.is_exists("/", &CancelScope::new()).await.unwrap_err();

    match err {
        ExecError::Connect { stage, .. } => assert_eq!(stage, ConnectStage::Transport),
        other => panic!("unexpected error: {other}"),
    }
    assert!(err_is_retryable(&conn).await);
}

async fn err_is_retryable(conn: &Connection) -> bool {
    conn.exec("true", &CancelScope::new())
        .await
        .is_err_and(|e| e.is_retryable())
}

#[tokio::test]
async fn test_lazy_connect_on_first_use() {
    let connector = Arc::new(FlakyConnector::default());
    let conn = Connection::new(credentials(), connector.clone());
    assert_eq!(connector.connects(), 0);

    assert!(conn.is_exists("/", &CancelScope::new()).await.unwrap());
    assert!(conn.is_exists("/", &CancelScope::new()).await.unwrap());
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn test_close_is_idempotent_and_final() {
    let conn = local_connection();
    conn.exec("true", &CancelScope::new()).await.unwrap();

    conn.close().await.unwrap();
    conn.close().await.unwrap();

    let err = conn.exec("true", &CancelScope::new()).await.unwrap_err();
    assert!(matches!(err, ExecError::ConfigError(_)));
    assert!(matches!(conn.manager().state().await, ConnectionState::Closed));
}

#[tokio::test]
async fn test_upload_download_list_remove() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("upload");
    let root = root.to_str().unwrap();
    let conn = local_connection().with_read_ahead(ReadAhead::new(4096, 3));
    let scope = CancelScope::new();

    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
    let stats = conn
        .upload(std::io::Cursor::new(data.clone()), root, "disk.img", &scope)
        .await
        .unwrap();
    assert_eq!(stats.bytes, data.len() as u64);
    assert!(stats.peak_buffered <= ReadAhead::new(4096, 3).max_buffered());

    let entries = conn.list(root, &scope).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "disk.img");
    assert!(entries[0].stat.is_file());

    let path = format!("{root}/disk.img");
    let mut reader = conn.download(&path, &scope).await.unwrap();
    let mut fetched = Vec::new();
    reader.read_to_end(&mut fetched).await.unwrap();
    assert_eq!(fetched, data);

    let err = conn.list(&path, &scope).await.unwrap_err();
    assert!(matches!(err, ExecError::NotADirectory { .. }));

    conn.remove(root, &scope).await.unwrap();
    assert!(!conn.is_exists(root, &scope).await.unwrap());
}

#[tokio::test]
async fn test_remove_deep_tree() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("tree");
    let mut current = root.clone();
    for depth in 0..20 {
        std::fs::create_dir_all(&current).unwrap();
        for i in 0..5 {
            std::fs::write(current.join(format!("file-{depth}-{i}")), b"x").unwrap();
        }
        current = current.join(format!("level-{depth}"));
    }

    let conn = local_connection();
    let scope = CancelScope::new();
    conn.remove(root.to_str().unwrap(), &scope).await.unwrap();

    assert!(!root.exists());
    // removing a missing path is success
    conn.remove(root.to_str().unwrap(), &scope).await.unwrap();
}

#[tokio::test]
async fn test_upload_into_file_fails_before_writing() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"keep").unwrap();

    let conn = local_connection();
    let err = conn
        .upload(
            std::io::Cursor::new(b"payload".to_vec()),
            blocker.to_str().unwrap(),
            "disk.img",
            &CancelScope::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ExecError::NotADirectory { .. }));
    assert_eq!(std::fs::read(&blocker).unwrap(), b"keep");
}

#[tokio::test]
async fn test_upload_cancelled_mid_transfer() {
    let dir = tempfile::tempdir().unwrap();
    // writer half stays open and silent, so the source never reaches EOF
    let (_source_writer, source) = tokio::io::duplex(64);

    let scope = CancelScope::new();
    let trigger = scope.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = local_connection()
        .upload(source, dir.path().to_str().unwrap(), "stuck.img", &scope)
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert!(!err.is_deadline_exceeded());
}

#[tokio::test]
async fn test_download_deadline_fails_reader() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big.img");
    std::fs::write(&path, vec![1u8; 4 * 1024 * 1024]).unwrap();

    let conn = local_connection();
    let scope = CancelScope::with_timeout(Duration::from_millis(50));
    let mut reader = conn.download(path.to_str().unwrap(), &scope).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut sink = Vec::new();
    let err = reader.read_to_end(&mut sink).await.unwrap_err();

    assert_eq!(CancelReason::from_io(&err), Some(CancelReason::DeadlineExceeded));
    let exec_err = ExecError::from_io("download", "big.img", err);
    assert!(exec_err.is_deadline_exceeded());
}

#[tokio::test]
async fn test_hung_probe_respects_deadline() {
    let conn = Connection::open(credentials(), Arc::new(HungProbeConnector), &CancelScope::new())
        .await
        .unwrap();

    let scope = CancelScope::with_timeout(Duration::from_millis(100));
    let err = tokio::time::timeout(Duration::from_secs(5), conn.exec("true", &scope))
        .await
        .expect("exec stayed blocked on the probe")
        .unwrap_err();

    assert!(err.is_deadline_exceeded(), "unexpected error: {err}");
    assert!(err.to_string().starts_with("probe"));
}

#[tokio::test]
async fn test_hung_connect_respects_cancel() {
    let conn = Connection::new(credentials(), Arc::new(HungDialConnector));

    let scope = CancelScope::new();
    let trigger = scope.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = tokio::time::timeout(Duration::from_secs(5), conn.is_exists("/", &scope))
        .await
        .expect("is_exists stayed blocked on connect")
        .unwrap_err();

    assert!(err.is_cancelled());
    assert!(!err.is_deadline_exceeded());
    assert!(matches!(
        conn.manager().state().await,
        ConnectionState::Disconnected
    ));
}
