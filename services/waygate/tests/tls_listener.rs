
use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use harness::{echo_roundtrip, wait_until, MarkerBackend, ProxyHandle, TEST_TIMEOUT};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use waygate::TlsConfig;

struct TestCert {
    cert_file: NamedTempFile,
    key_file: NamedTempFile,
    connector: TlsConnector,
}

impl TestCert {
    fn generate() -> Self {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();

        let mut cert_file = NamedTempFile::new().unwrap();
        cert_file.write_all(certified.cert.pem().as_bytes()).unwrap();
        let mut key_file = NamedTempFile::new().unwrap();
        key_file
            .write_all(certified.key_pair.serialize_pem().as_bytes())
            .unwrap();

        let mut roots = RootCertStore::empty();
        roots.add(certified.cert.der().clone()).unwrap();

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self {
            cert_file,
            key_file,
            connector: TlsConnector::from(Arc::new(config)),
        }
    }

    fn tls_config(&self) -> TlsConfig {
        TlsConfig {
            cert: self.cert_file.path().to_path_buf(),
            key: self.key_file.path().to_path_buf(),
        }
    }
}

#[tokio::test]
async fn tls_front_pipes_plaintext_to_backend() {
    let cert = TestCert::generate();
    let backend = MarkerBackend::spawn_echo().await.unwrap();
    let proxy = ProxyHandle::spawn_tls(&[backend.addr], cert.tls_config())
        .await
        .unwrap();
    assert!(proxy.proxy.is_tls());
    proxy.wait_all_alive().await;

    let tcp = TcpStream::connect(proxy.addr).await.unwrap();
    let server_name = ServerName::try_from("localhost").unwrap();
    let tls = cert.connector.connect(server_name, tcp).await.unwrap();

    let echoed = timeout(TEST_TIMEOUT, echo_roundtrip(tls, b"over tls"))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(echoed, b"over tls");

    let stats = proxy.proxy.stats();
    wait_until("session recorded", || {
        stats.connections_closed.load(Ordering::Relaxed) == 1
    })
    .await;
    assert_eq!(stats.bytes_to_backend.load(Ordering::Relaxed), 8);
}

#[tokio::test]
async fn plaintext_client_fails_handshake() {
    let cert = TestCert::generate();
    let backend = MarkerBackend::spawn_echo().await.unwrap();
    let proxy = ProxyHandle::spawn_tls(&[backend.addr], cert.tls_config())
        .await
        .unwrap();
    proxy.wait_all_alive().await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let mut buf = Vec::new();
    let _ = timeout(TEST_TIMEOUT, client.read_to_end(&mut buf))
        .await
        .expect("connection was not closed");
    assert!(!buf.windows(3).any(|w| w == b"GET"), "plaintext was echoed");

    let stats = proxy.proxy.stats();
    wait_until("handshake failure recorded", || {
        stats.connections_closed.load(Ordering::Relaxed) == 1
    })
    .await;
    assert_eq!(stats.bytes_to_backend.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn tls_client_hangup_without_close_notify_is_clean() {
    let cert = TestCert::generate();
    let backend = MarkerBackend::spawn_echo().await.unwrap();
    let proxy = ProxyHandle::spawn_tls(&[backend.addr], cert.tls_config())
        .await
        .unwrap();
    proxy.wait_all_alive().await;

    let tcp = TcpStream::connect(proxy.addr).await.unwrap();
    let server_name = ServerName::try_from("localhost").unwrap();
    let mut tls = cert.connector.connect(server_name, tcp).await.unwrap();

    tls.write_all(b"hi").await.unwrap();
    let mut echoed = [0u8; 2];
    timeout(TEST_TIMEOUT, tls.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&echoed, b"hi");

    // Close the socket without sending close_notify.
    let (raw, _session) = tls.into_inner();
    drop(raw);

    let stats = proxy.proxy.stats();
    wait_until("session recorded", || {
        stats.connections_closed.load(Ordering::Relaxed) == 1
    })
    .await;
    assert_eq!(stats.pipe_errors.load(Ordering::Relaxed), 0);
    assert_eq!(stats.bytes_to_backend.load(Ordering::Relaxed), 2);
    assert_eq!(proxy.backend(0).active_connections(), 0);
}
