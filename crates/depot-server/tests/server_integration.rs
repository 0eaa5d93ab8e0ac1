//! Integration tests for the depot server.
//!
//! Each test starts an in-process server on an ephemeral port and
//! exercises the HTTP surface with a real client.

use std::net::SocketAddr;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tempfile::TempDir;

use depot_server::auth::signer::FileSigner;
use depot_server::auth::{AuthConfig, create_jwt};
use depot_server::downloadcounter;
use depot_server::kv::{Kv, SqliteKv, UNBOUNDED};
use depot_server::nix::{NixDb, NixState, SigningKey};
use depot_server::npm::{NpmDb, NpmState};
use depot_server::python::{PythonDb, PythonState};
use depot_server::storage::{FsStorage, LoggedStorage};
use depot_server::{AccessLog, Metrics};

const TEST_SIGNING_KEY_SEED: [u8; 32] = [7u8; 32];

struct TestServer {
    addr: SocketAddr,
    kv: Kv,
    client: reqwest::Client,
    _storage_dir: TempDir,
}

impl TestServer {
    async fn start(auth: AuthConfig, signing_key: Option<SigningKey>) -> Self {
        let storage_dir = TempDir::new().expect("failed to create temp storage dir");
        let kv = Kv::new(Arc::new(SqliteKv::open_in_memory().expect("failed to open kv")));
        let metrics = Metrics::new().expect("failed to create metrics");
        let (downloads, _counter_shutdown) = downloadcounter::spawn_buffered(kv.clone(), metrics.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("failed to bind");
        let addr = listener.local_addr().expect("failed to get local addr");

        let nix_storage = Arc::new(FsStorage::new(storage_dir.path().join("nix")));
        let (nix_storage, _nix_shutdown) = LoggedStorage::new(nix_storage, AccessLog::new(kv.clone()), metrics.clone());
        let npm_storage = Arc::new(FsStorage::new(storage_dir.path().join("npm")));
        let (npm_storage, _npm_shutdown) = LoggedStorage::new(npm_storage, AccessLog::new(kv.clone()), metrics.clone());
        let python_storage = Arc::new(FsStorage::new(storage_dir.path().join("python")));
        let (python_storage, _python_shutdown) =
            LoggedStorage::new(python_storage, AccessLog::new(kv.clone()), metrics.clone());

        let app = depot_server::router(
            NixState {
                db: NixDb::new(kv.clone()),
                storage: Arc::new(nix_storage),
                signing_key: signing_key.map(Arc::new),
                downloads: downloads.clone(),
                metrics: metrics.clone(),
            },
            NpmState {
                db: NpmDb::new(kv.clone()),
                storage: Arc::new(npm_storage),
                downloads: downloads.clone(),
                metrics: metrics.clone(),
            },
            PythonState {
                db: PythonDb::new(kv.clone()),
                storage: Arc::new(python_storage),
                base_url: format!("http://{addr}/python"),
                downloads,
                metrics,
            },
            auth,
        );

        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("server error");
        });

        TestServer {
            addr,
            kv,
            client: reqwest::Client::new(),
            _storage_dir: storage_dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

fn test_signing_key() -> SigningKey {
    let key = ed25519_dalek::SigningKey::from_bytes(&TEST_SIGNING_KEY_SEED);
    let encoded = format!("depot-test-1:{}", BASE64.encode(key.to_keypair_bytes()));
    SigningKey::parse(&encoded).expect("failed to parse test key")
}

const NARINFO: &str = "StorePath: /nix/store/16hvpw4b3r05girazh4rnwbw0jgjkb4l-sl-5.05\n\
URL: nar/0v1p2gdn5kv7rycpqrgvzrhb5vc8j0hjhfyvvbi8csbqsgaslxjc.nar.xz\n\
Compression: xz\n\
FileHash: sha256:0v1p2gdn5kv7rycpqrgvzrhb5vc8j0hjhfyvvbi8csbqsgaslxjc\n\
FileSize: 17104\n\
NarHash: sha256:1f2jryqw9nnnsr2zbrqr91nkgjba2415x92sbd8slpwez0f7xvjr\n\
NarSize: 80256\n\
References: 16hvpw4b3r05girazh4rnwbw0jgjkb4l-sl-5.05\n";

#[tokio::test]
async fn nix_cache_info_advertises_the_public_key() {
    let server = TestServer::start(AuthConfig::default(), Some(test_signing_key())).await;

    for path in ["/nix-cache-info", "/nix/nix-cache-info"] {
        let response = server.client.get(server.url(path)).send().await.unwrap();
        assert_eq!(response.status(), 200);
        let body = response.text().await.unwrap();
        assert!(body.contains("StoreDir: /nix/store\n"), "{body}");
        assert!(body.contains("WantMassQuery: 1\n"));
        assert!(body.contains("Priority: 30\n"));
        let expected = format!("PublicKey: {}\n", test_signing_key().public_key());
        assert!(body.contains(&expected), "{body}");
    }
}

#[tokio::test]
async fn narinfo_upload_is_signed_and_served_back() {
    let server = TestServer::start(AuthConfig::default(), Some(test_signing_key())).await;
    let path = "/nix/16hvpw4b3r05girazh4rnwbw0jgjkb4l.narinfo";

    let response = server
        .client
        .put(server.url(path))
        .body(NARINFO)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    let response = server.client.get(server.url(path)).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/x-nix-narinfo"
    );
    let body = response.text().await.unwrap();

    let ni = depot_server::nix::NarInfo::parse(&body).unwrap();
    assert_eq!(ni.store_path, "/nix/store/16hvpw4b3r05girazh4rnwbw0jgjkb4l-sl-5.05");
    let sig = ni
        .signatures
        .iter()
        .find(|s| s.starts_with("depot-test-1:"))
        .expect("server signature missing");

    // The appended signature must verify over the canonical fingerprint.
    use ed25519_dalek::Verifier;
    let (_, sig_b64) = sig.split_once(':').unwrap();
    let sig_bytes: [u8; 64] = BASE64.decode(sig_b64).unwrap().try_into().unwrap();
    let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
    let verifying = ed25519_dalek::SigningKey::from_bytes(&TEST_SIGNING_KEY_SEED).verifying_key();
    verifying.verify(ni.fingerprint().as_bytes(), &signature).unwrap();
}

#[tokio::test]
async fn narinfo_hash_mismatch_is_rejected() {
    let server = TestServer::start(AuthConfig::default(), None).await;

    // URL hash part differs from the StorePath hash part.
    let response = server
        .client
        .put(server.url("/nix/0000000000000000000000000000000a.narinfo"))
        .body(NARINFO)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn nar_round_trips_with_content_type() {
    let server = TestServer::start(AuthConfig::default(), None).await;
    let nar_url = server.url("/nix/nar/0v1p2gdn5kv7rycpqrgvzrhb5vc8j0hjhfyvvbi8csbqsgaslxjc.nar.xz");
    let payload = vec![0x5a; 4096];

    let missing = server.client.get(&nar_url).send().await.unwrap();
    assert_eq!(missing.status(), 404);

    let response = server.client.put(&nar_url).body(payload.clone()).send().await.unwrap();
    assert_eq!(response.status(), 201);

    let response = server.client.get(&nar_url).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers().get("content-type").unwrap(), "application/x-xz");
    assert_eq!(response.headers().get("content-length").unwrap(), "4096");
    assert_eq!(response.bytes().await.unwrap().to_vec(), payload);

    // 'e' is not a nixbase32 character.
    let bad = server.client.get(server.url("/nix/nar/helloworld.nar")).send().await.unwrap();
    assert_eq!(bad.status(), 400);
}

#[tokio::test]
async fn npm_scoped_package_aggregates_versions() {
    let server = TestServer::start(AuthConfig::default(), None).await;

    let version = serde_json::json!({
        "name": "@types/node",
        "version": "1.0.0",
        "dist": {
            "shasum": "da39a3ee5e6b4b0d3255bfef95601890afd80709",
            "tarball": "https://registry.npmjs.org/@types/node/-/node-1.0.0.tgz"
        }
    });
    let response = server
        .client
        .put(server.url("/npm/@types/node/1.0.0"))
        .json(&version)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    let body: serde_json::Value = server
        .client
        .get(server.url("/npm/@types/node"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["name"], "@types/node");
    assert_eq!(body["dist-tags"]["latest"], "1.0.0");
    assert_eq!(body["versions"]["1.0.0"]["name"], "@types/node");

    // Direct version fetch and the latest alias resolve to the same record.
    let direct: serde_json::Value = server
        .client
        .get(server.url("/npm/@types/node/1.0.0"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let latest: serde_json::Value = server
        .client
        .get(server.url("/npm/@types/node/latest"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(direct, latest);

    // Name mismatch between URL and body is rejected.
    let response = server
        .client
        .put(server.url("/npm/other/1.0.0"))
        .json(&version)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = server
        .client
        .delete(server.url("/npm/@types/node/1.0.0"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);
    let response = server.client.get(server.url("/npm/@types/node")).send().await.unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn npm_tarball_round_trips() {
    let server = TestServer::start(AuthConfig::default(), None).await;
    let url = server.url("/npm/left-pad/-/left-pad-1.3.0.tgz");
    let payload = b"not really gzip".to_vec();

    let response = server.client.put(&url).body(payload.clone()).send().await.unwrap();
    assert_eq!(response.status(), 201);

    let response = server.client.get(&url).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/octet-stream"
    );
    assert_eq!(response.bytes().await.unwrap().to_vec(), payload);
}

#[tokio::test]
async fn python_simple_api_negotiates_json_and_html() {
    let server = TestServer::start(AuthConfig::default(), None).await;
    let file_bytes = b"sdist contents".to_vec();

    let response = server
        .client
        .put(server.url("/python/flask/Flask-2.3.0.tar.gz"))
        .body(file_bytes.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    let metadata = serde_json::json!({
        "filename": "Flask-2.3.0.tar.gz",
        "url": "https://files.pythonhosted.org/packages/x/Flask-2.3.0.tar.gz",
        "hashes": {"sha256": "d1e2f3"},
        "requires-python": ">=3.8",
        "size": file_bytes.len()
    });
    let response = server
        .client
        .put(server.url("/python/flask/Flask-2.3.0.tar.gz.json"))
        .json(&metadata)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    // PEP 691 JSON when asked for it.
    let response = server
        .client
        .get(server.url("/python/flask/"))
        .header("accept", "application/vnd.pypi.simple.v1+json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/vnd.pypi.simple.v1+json"
    );
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["meta"]["api-version"], "1.0");
    let url = body["files"][0]["url"].as_str().unwrap();
    assert!(url.ends_with("/python/flask/Flask-2.3.0.tar.gz"), "{url}");

    // PEP 503 HTML otherwise.
    let response = server
        .client
        .get(server.url("/python/flask/"))
        .header("accept", "text/html")
        .send()
        .await
        .unwrap();
    let html = response.text().await.unwrap();
    assert!(html.contains(">Flask-2.3.0.tar.gz</a>"), "{html}");
    assert!(html.contains("data-requires-python=\">=3.8\""), "{html}");

    // The rewritten link streams the uploaded bytes back.
    let response = server.client.get(url).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().to_vec(), file_bytes);

    // Root listing includes the normalized project name.
    let response = server
        .client
        .get(server.url("/python/"))
        .header("accept", "application/vnd.pypi.simple.v1+json")
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["projects"][0]["name"], "flask");

    // The /simple alias serves the same index.
    let response = server.client.get(server.url("/python/simple/flask/")).send().await.unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn auth_policy_distinguishes_read_and_write_keys() {
    let read_key = ssh_key::PrivateKey::random(
        &mut rand_core::OsRng,
        ssh_key::Algorithm::Ecdsa {
            curve: ssh_key::EcdsaCurve::NistP256,
        },
    )
    .unwrap();
    let write_key = ssh_key::PrivateKey::random(
        &mut rand_core::OsRng,
        ssh_key::Algorithm::Ecdsa {
            curve: ssh_key::EcdsaCurve::NistP256,
        },
    )
    .unwrap();

    let config = AuthConfig::parse(&format!(
        "r {}\nw {}\n",
        read_key.public_key().to_openssh().unwrap(),
        write_key.public_key().to_openssh().unwrap(),
    ))
    .unwrap();
    let server = TestServer::start(config, None).await;

    let read_token = create_jwt(&FileSigner::new(read_key)).unwrap();
    let write_token = create_jwt(&FileSigner::new(write_key)).unwrap();

    // A read key is configured, so even reads need a token.
    let response = server.client.get(server.url("/nix-cache-info")).send().await.unwrap();
    assert_eq!(response.status(), 401);

    let response = server
        .client
        .get(server.url("/nix-cache-info"))
        .bearer_auth(&read_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let version = serde_json::json!({
        "name": "lodash",
        "version": "4.17.21",
        "dist": {"shasum": "abc", "tarball": "https://registry.npmjs.org/lodash/-/lodash-4.17.21.tgz"}
    });

    // Writes need a write key.
    let response = server
        .client
        .put(server.url("/npm/lodash/4.17.21"))
        .bearer_auth(&read_token)
        .json(&version)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    let response = server
        .client
        .put(server.url("/npm/lodash/4.17.21"))
        .bearer_auth(&write_token)
        .json(&version)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    // Garbage tokens are rejected outright.
    let response = server
        .client
        .get(server.url("/nix-cache-info"))
        .bearer_auth("not-a-jwt")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn downloads_are_recorded_in_the_access_log_and_counter() {
    let server = TestServer::start(AuthConfig::default(), None).await;
    let url = server.url("/npm/left-pad/-/left-pad-1.3.0.tgz");

    server.client.put(&url).body("bytes".to_string()).send().await.unwrap();
    for _ in 0..3 {
        let response = server.client.get(&url).send().await.unwrap();
        assert_eq!(response.status(), 200);
    }

    // Both sinks are eventually consistent with the request path.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let counters = server
            .kv
            .get_prefix("/downloadcounter/npm/", 0, UNBOUNDED)
            .await
            .unwrap();
        let accesses = server.kv.get_prefix("/accesslog/", 0, UNBOUNDED).await.unwrap();
        let counted = counters.first().map(|r| r.version).unwrap_or(0);
        let reads = accesses
            .iter()
            .filter(|r| r.key.ends_with("/r"))
            .map(|r| r.version)
            .sum::<i64>();
        if counted == 3 && reads >= 3 {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "counters never caught up: downloads={counted} reads={reads}"
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn unknown_paths_return_not_found() {
    let server = TestServer::start(AuthConfig::default(), None).await;
    let response = server.client.get(server.url("/nix/unknown-thing")).send().await.unwrap();
    assert_eq!(response.status(), 404);
    let response = server.client.get(server.url("/nope")).send().await.unwrap();
    assert_eq!(response.status(), 404);
}
