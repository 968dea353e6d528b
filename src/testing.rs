use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use blob_store::{objects::ObjectStoreBackend, postgres::PostgresBackend, Backend, Backends};
use file_repo::{testing::TestDb, FileRepo};
use object_store::{aws::AmazonS3Builder, memory::InMemory};
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::routes::{create_routes, RouteState};

/// Object store backend answering reads itself.
pub const S3: &str = "s3";

/// Object store backend answering reads with a signed-URL redirect.
pub const SIGNED: &str = "signed";

/// The HTTP gateway served on a local port over a fresh database.
pub struct TestServer {
    pub base_url: String,
    pub client: reqwest::Client,
    pub repo: FileRepo,
    pub store: Arc<InMemory>,
    _db: TestDb,
}

impl TestServer {
    pub async fn start(default_backend: &str) -> Result<Option<Self>> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let Some(db) = TestDb::create().await? else {
            return Ok(None);
        };
        let store = Arc::new(InMemory::new());
        let signer = AmazonS3Builder::new()
            .with_bucket_name("blobs")
            .with_region("us-east-1")
            .with_access_key_id("AKIDEXAMPLE")
            .with_secret_access_key("secret")
            .build()?;
        let backends = Backends::new(
            vec![
                Arc::new(PostgresBackend::new()) as Arc<dyn Backend>,
                Arc::new(ObjectStoreBackend::new(S3, store.clone(), None)),
                Arc::new(ObjectStoreBackend::new(
                    SIGNED,
                    store.clone(),
                    Some(Arc::new(signer)),
                )),
            ],
            default_backend,
        )?;
        let repo = FileRepo::new(db.pool.clone(), backends);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr: SocketAddr = listener.local_addr()?;
        let router = create_routes(RouteState { repo: repo.clone() });
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!("test server failed: {:?}", e);
            }
        });

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Some(Self {
            base_url: format!("http://{addr}"),
            client,
            repo,
            store,
            _db: db,
        }))
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn put(&self, path: &str, body: &'static [u8]) -> Result<reqwest::Response> {
        Ok(self.client.put(self.url(path)).body(body).send().await?)
    }

    pub async fn get(&self, path: &str) -> Result<reqwest::Response> {
        Ok(self.client.get(self.url(path)).send().await?)
    }
}
