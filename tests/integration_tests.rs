//! # Integration Tests for the Batch Encrypter
//!
//! End-to-end checks through the public API only.
//!
//! ## Test Categories
//!
//! - **Ordering & Completeness**: one result per message, in input order
//! - **Concurrency Bound**: never more than `limit` capability calls at once
//! - **Failure Isolation**: per-item errors never shorten a batch
//! - **Real Cryptography**: envelopes decrypt and verify, tampering is rejected
//! - **HTTP Service**: requests over a real TCP socket, then graceful shutdown

use async_trait::async_trait;
use batch_encrypter::{
    crypto::{jwe, jws, Encrypter, JoseEncrypter, MockEncrypter, MockFailure, RsaKeyPair},
    error::EncrypterError,
    pipeline::Dispatcher,
    server::{build_encrypter, EncrypterServer, ServerConfig},
    IncomingMessage, MessageResult,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// One key pair for the whole test binary; generation dominates runtime.
fn shared_keys() -> Arc<RsaKeyPair> {
    static KEYS: OnceLock<Arc<RsaKeyPair>> = OnceLock::new();
    Arc::clone(KEYS.get_or_init(|| {
        Arc::new(RsaKeyPair::generate(2048).expect("Failed to generate test key pair"))
    }))
}

fn batch_of(n: usize) -> Vec<IncomingMessage> {
    (0..n).map(|i| IncomingMessage::new(format!("message-{i}"))).collect()
}

/// Records how many calls are in flight at once and echoes the plaintext.
#[derive(Debug)]
struct RecordingEncrypter {
    delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
    calls: AtomicUsize,
}

impl RecordingEncrypter {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Encrypter for RecordingEncrypter {
    async fn encrypt_and_sign(&self, plaintext: Vec<u8>) -> MessageResult {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        let content = String::from_utf8(plaintext).expect("test plaintext is UTF-8");
        MessageResult::sealed(content.clone(), format!("signed:{content}"))
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Fails every third message, succeeds otherwise.
#[derive(Debug)]
struct FlakyEncrypter;

#[async_trait]
impl Encrypter for FlakyEncrypter {
    async fn encrypt_and_sign(&self, plaintext: Vec<u8>) -> MessageResult {
        let content = String::from_utf8(plaintext).expect("test plaintext is UTF-8");
        let position: usize = content
            .rsplit('-')
            .next()
            .and_then(|n| n.parse().ok())
            .expect("numbered message");
        if position % 3 == 0 {
            MessageResult::encrypt_failed(EncrypterError::cipher_error("flaky", None))
        } else {
            MessageResult::sealed(content, String::new())
        }
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}

#[tokio::test(start_paused = true)]
async fn test_every_message_gets_one_result_in_order() {
    let encrypter = Arc::new(RecordingEncrypter::new(Duration::from_millis(10)));
    let dispatcher = Dispatcher::new(encrypter.clone(), 7).unwrap();

    let results = dispatcher.process(batch_of(50)).await;

    assert_eq!(results.len(), 50);
    assert_eq!(encrypter.calls.load(Ordering::SeqCst), 50);
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.index, i);
        assert_eq!(result.encrypted_message, format!("message-{i}"));
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_never_exceeds_limit() {
    let encrypter = Arc::new(RecordingEncrypter::new(Duration::from_millis(50)));
    let dispatcher = Dispatcher::new(encrypter.clone(), 5).unwrap();

    let results = dispatcher.process(batch_of(23)).await;

    assert_eq!(results.len(), 23);
    assert_eq!(encrypter.max_active(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_limit_one_serializes_calls() {
    let encrypter = Arc::new(RecordingEncrypter::new(Duration::from_millis(20)));
    let dispatcher = Dispatcher::new(encrypter.clone(), 1).unwrap();

    let results = dispatcher.process(batch_of(6)).await;

    assert_eq!(results.len(), 6);
    assert_eq!(encrypter.max_active(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_limit_larger_than_batch() {
    let encrypter = Arc::new(RecordingEncrypter::new(Duration::from_millis(20)));
    let dispatcher = Dispatcher::new(encrypter.clone(), 100).unwrap();

    let results = dispatcher.process(batch_of(4)).await;

    assert_eq!(results.len(), 4);
    assert_eq!(encrypter.max_active(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_mock_batch_takes_waves_of_delay() {
    // 10 messages, 3 at a time, 100ms each: ceil(10 / 3) = 4 waves
    let dispatcher =
        Dispatcher::new(Arc::new(MockEncrypter::new(Duration::from_millis(100))), 3).unwrap();
    let start = tokio::time::Instant::now();

    let results = dispatcher.process(batch_of(10)).await;

    let elapsed = start.elapsed();
    assert_eq!(results.len(), 10);
    assert!(elapsed >= Duration::from_millis(400), "took {elapsed:?}");
    assert!(elapsed < Duration::from_millis(450), "took {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_abc_batch_with_limit_one() {
    let dispatcher =
        Dispatcher::new(Arc::new(MockEncrypter::new(Duration::from_secs(1))), 1).unwrap();
    let batch = vec![
        IncomingMessage::new("a"),
        IncomingMessage::new("b"),
        IncomingMessage::new("c"),
    ];
    let start = tokio::time::Instant::now();

    let results = dispatcher.process(batch).await;

    assert_eq!(results.len(), 3);
    assert!(start.elapsed() >= Duration::from_secs(3));
    for result in &results {
        assert!(result.is_success());
        assert_eq!(result.encrypted_message.len(), 5000);
    }
}

#[tokio::test]
async fn test_encrypt_failures_fill_every_position() {
    let mock = Arc::new(MockEncrypter::new(Duration::ZERO).with_failure(MockFailure::Encrypt));
    let dispatcher = Dispatcher::new(mock, 4).unwrap();

    let results = dispatcher.process(batch_of(9)).await;

    assert_eq!(results.len(), 9);
    for result in &results {
        assert!(result.encrypt_error.is_some());
        assert!(result.sign_error.is_none());
        assert!(result.encrypted_message.is_empty());
        assert!(result.signed_message.is_empty());
    }
    assert_eq!(dispatcher.metrics().snapshot().encrypt_errors, 9);
}

#[tokio::test]
async fn test_sign_failures_keep_ciphertext() {
    let mock = Arc::new(MockEncrypter::new(Duration::ZERO).with_failure(MockFailure::Sign));
    let dispatcher = Dispatcher::new(mock, 4).unwrap();

    let results = dispatcher.process(batch_of(5)).await;

    assert_eq!(results.len(), 5);
    for result in &results {
        assert!(result.encrypt_error.is_none());
        assert!(result.sign_error.is_some());
        assert!(!result.encrypted_message.is_empty());
        assert!(result.signed_message.is_empty());
    }
}

#[tokio::test]
async fn test_failures_are_isolated_per_message() {
    let dispatcher = Dispatcher::new(Arc::new(FlakyEncrypter), 3).unwrap();

    let results = dispatcher.process(batch_of(10)).await;

    assert_eq!(results.len(), 10);
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.encrypt_error.is_some(), i % 3 == 0, "position {i}");
    }
    let snapshot = dispatcher.metrics().snapshot();
    assert_eq!(snapshot.messages, 10);
    assert_eq!(snapshot.encrypt_errors, 4);
}

#[tokio::test]
async fn test_empty_batch() {
    let mock = Arc::new(MockEncrypter::default());
    let dispatcher = Dispatcher::new(mock.clone(), 75).unwrap();

    assert!(dispatcher.process(Vec::new()).await.is_empty());
    assert_eq!(mock.call_count(), 0);
}

#[tokio::test]
async fn test_real_capability_round_trip() {
    let encrypter = JoseEncrypter::new(shared_keys());
    let dispatcher = Dispatcher::new(Arc::new(encrypter.clone()), 4).unwrap();
    let batch = vec![
        IncomingMessage::new("first secret"),
        IncomingMessage::new(""),
        IncomingMessage::new("third \u{1F510} secret"),
    ];
    let plaintexts: Vec<String> = batch.iter().map(|m| m.content.clone()).collect();

    let results = dispatcher.process(batch).await;

    assert_eq!(results.len(), 3);
    for (result, plaintext) in results.iter().zip(&plaintexts) {
        assert!(result.is_success(), "{result:?}");
        assert_eq!(result.encrypted_message.split('.').count(), 5);
        assert_eq!(result.signed_message.split('.').count(), 3);

        let signed_payload = encrypter.verify(&result.signed_message).unwrap();
        assert_eq!(signed_payload, result.encrypted_message);

        let decrypted = encrypter.decrypt(&result.encrypted_message).unwrap();
        assert_eq!(decrypted, plaintext.as_bytes());
    }
}

#[tokio::test]
async fn test_real_capability_rejects_tampering() {
    let keys = shared_keys();
    let encrypter = JoseEncrypter::new(Arc::clone(&keys));
    let result = encrypter.encrypt_and_sign(b"integrity matters".to_vec()).await;
    assert!(result.is_success());

    // flip one character of the ciphertext segment
    let mut parts: Vec<String> = result
        .encrypted_message
        .split('.')
        .map(str::to_string)
        .collect();
    let ciphertext = &mut parts[3];
    let replacement = if ciphertext.starts_with('A') { "B" } else { "A" };
    ciphertext.replace_range(0..1, replacement);
    let tampered = parts.join(".");
    assert!(jwe::open(&keys, &tampered).is_err());

    // a signature over one envelope does not verify another
    let other = encrypter.seal(b"something else");
    let (header_and_payload, _) = result.signed_message.rsplit_once('.').unwrap();
    let (_, other_signature) = other.signed_message.rsplit_once('.').unwrap();
    let forged = format!("{header_and_payload}.{other_signature}");
    assert!(jws::verify(&keys, &forged).is_err());
}

#[test]
fn test_key_loaded_from_pem_file() {
    let dir = TempDir::new().unwrap();
    let key_path = dir.path().join("private_key.pem");
    let private_key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
    let pem = private_key.to_pkcs8_pem(LineEnding::LF).unwrap();
    std::fs::write(&key_path, pem.as_bytes()).unwrap();

    let config = ServerConfig {
        rsa_private_key_path: Some(key_path.clone()),
        config_path: dir.path().to_path_buf(),
        ..ServerConfig::default()
    };
    assert!(config.validate().is_ok());

    let encrypter = build_encrypter(&config).unwrap();
    assert_eq!(encrypter.name(), "jose");
    assert!(encrypter
        .public_key_pem()
        .unwrap()
        .starts_with("-----BEGIN PUBLIC KEY-----"));

    let keys = RsaKeyPair::from_pem_file(&key_path).unwrap();
    assert_eq!(keys.bits(), 2048);
}

#[test]
fn test_undersized_key_rejected() {
    let private_key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
    let pem = private_key.to_pkcs8_pem(LineEnding::LF).unwrap();

    let err = RsaKeyPair::from_pem(&pem).unwrap_err();
    assert_eq!(err.status_code(), 500);
    assert!(RsaKeyPair::generate(1024).is_err());
}

#[test]
fn test_error_status_mapping() {
    assert_eq!(EncrypterError::request_error("bad").status_code(), 400);
    assert_eq!(EncrypterError::PayloadTooLarge { limit: 1 }.status_code(), 413);
    assert_eq!(
        EncrypterError::UnsupportedMediaType {
            content_type: "text/plain".into()
        }
        .status_code(),
        415
    );
    assert_eq!(EncrypterError::timeout_error(5).status_code(), 504);
    assert_eq!(EncrypterError::cipher_error("x", None).status_code(), 500);

    // internal detail never reaches the client
    let err = EncrypterError::rsa_error("modulus is 1023 bits", None);
    assert!(!err.client_message().contains("1023"));
    assert!(err.internal_message().contains("1023"));
}

async fn send_raw(addr: std::net::SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

fn post(path: &str, content_type: &str, body: &str) -> String {
    format!(
        "POST {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: {content_type}\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

#[tokio::test]
async fn test_http_service_end_to_end() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("config.json"),
        r#"{"logLevel":"info","overrides":{"user":"alice","loglevel":"debug"}}"#,
    )
    .unwrap();

    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        config_path: dir.path().to_path_buf(),
        mock: true,
        mock_delay_ms: 10,
        concurrency_limit: 2,
        max_payload_size: 256,
        graceful_timeout_secs: 5,
        enable_metrics: true,
        ..ServerConfig::default()
    };
    let encrypter = build_encrypter(&config).unwrap();
    let server = EncrypterServer::with_encrypter(config, encrypter).unwrap();
    let metrics = Arc::clone(server.metrics());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(server.serve(listener, async {
        let _ = stop_rx.await;
    }));

    let created = send_raw(
        addr,
        &post(
            "/encrypt",
            "application/json",
            r#"[{"content":"a"},{"content":"b"},{"content":"c"}]"#,
        ),
    )
    .await;
    assert!(created.starts_with("HTTP/1.1 201"), "{created}");
    assert_eq!(metrics.snapshot().messages, 3);

    let unsupported = send_raw(addr, &post("/encrypt", "text/plain", "[]")).await;
    assert!(unsupported.starts_with("HTTP/1.1 415"), "{unsupported}");
    assert!(unsupported.contains("Content-Type header is not application/json"));

    let trailing = send_raw(
        addr,
        &post("/encrypt", "application/json", r#"[] {"content":"x"}"#),
    )
    .await;
    assert!(trailing.starts_with("HTTP/1.1 400"), "{trailing}");
    assert!(trailing.contains("Request body must only contain a single JSON object"));

    let too_large = format!(r#"[{{"content":"{}"}}]"#, "x".repeat(300));
    let rejected = send_raw(addr, &post("/encrypt", "application/json", &too_large)).await;
    assert!(rejected.starts_with("HTTP/1.1 413"), "{rejected}");

    let logged = send_raw(addr, &post("/log", "application/json", r#"{"user":"alice"}"#)).await;
    assert!(logged.starts_with("HTTP/1.1 200"), "{logged}");

    let health = send_raw(
        addr,
        "GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(health.starts_with("HTTP/1.1 200"));
    assert!(health.contains("\"capability\":\"mock\""));

    let prometheus = send_raw(
        addr,
        "GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(prometheus.contains("batch_encrypter_messages_total 3"));

    stop_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("server did not shut down")
        .unwrap()
        .unwrap();
}
