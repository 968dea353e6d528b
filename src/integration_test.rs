#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use anyhow::Result;
    use base64::{engine::general_purpose::STANDARD, Engine};
    use data_model::POSTGRES_BACKEND;
    use futures::StreamExt;
    use object_store::ObjectStore;
    use reqwest::{
        header::{
            ACCEPT_RANGES,
            CONTENT_LENGTH,
            CONTENT_RANGE,
            CONTENT_TYPE,
            ETAG,
            IF_NONE_MATCH,
            LOCATION,
            RANGE,
        },
        StatusCode,
    };
    use sha2::{Digest, Sha512};

    use crate::{
        routes::{COPY_FROM_HEADER, OFFSET_HEADER},
        testing::{TestServer, S3, SIGNED},
    };

    fn quoted_etag(data: &[u8]) -> String {
        format!("\"{}\"", STANDARD.encode(Sha512::digest(data)))
    }

    #[tokio::test]
    async fn test_put_append_and_mismatch() -> Result<()> {
        for backend in [POSTGRES_BACKEND, S3] {
            let Some(server) = TestServer::start(backend).await? else {
                return Ok(());
            };

            let resp = server.put("/foo", b"hello").await?;
            assert_eq!(resp.status(), StatusCode::OK);

            let resp = server.get("/foo").await?;
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(resp.headers()[ETAG], quoted_etag(b"hello").as_str());
            assert_eq!(resp.headers()[CONTENT_TYPE], "application/octet-stream");
            assert_eq!(resp.headers()[ACCEPT_RANGES], "bytes");
            assert_eq!(resp.bytes().await?.as_ref(), b"hello");

            let resp = server.put("/foo?offset=5", b" world").await?;
            assert_eq!(resp.status(), StatusCode::OK);
            let resp = server.get("/foo").await?;
            assert_eq!(resp.headers()[ETAG], quoted_etag(b"hello world").as_str());
            assert_eq!(resp.bytes().await?.as_ref(), b"hello world");

            let resp = server.put("/foo?offset=3", b"xyz").await?;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
            assert_eq!(
                resp.text().await?,
                "offset (3) does not match blob size (11)"
            );
            let resp = server.get("/foo").await?;
            assert_eq!(resp.bytes().await?.as_ref(), b"hello world");
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_offset_header_and_content_type() -> Result<()> {
        let Some(server) = TestServer::start(POSTGRES_BACKEND).await? else {
            return Ok(());
        };
        let resp = server
            .client
            .put(server.url("/doc.txt"))
            .header(CONTENT_TYPE, "text/plain")
            .body("abc")
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = server
            .client
            .put(server.url("/doc.txt"))
            .header(OFFSET_HEADER, "3")
            .body("def")
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = server.get("/doc.txt").await?;
        assert_eq!(resp.headers()[CONTENT_TYPE], "text/plain");
        assert_eq!(resp.text().await?, "abcdef");

        let resp = server.put("/doc.txt?offset=abc", b"x").await?;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = server.put("/missing?offset=4", b"x").await?;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn test_directory_delete() -> Result<()> {
        let Some(server) = TestServer::start(S3).await? else {
            return Ok(());
        };
        for path in ["/a/x", "/a/y", "/a/y/z", "/b"] {
            assert_eq!(server.put(path, b"data").await?.status(), StatusCode::OK);
        }

        let resp = server.client.delete(server.url("/a")).send().await?;
        assert_eq!(resp.status(), StatusCode::OK);
        for path in ["/a/x", "/a/y", "/a/y/z"] {
            assert_eq!(server.get(path).await?.status(), StatusCode::NOT_FOUND);
        }
        assert_eq!(server.get("/b").await?.status(), StatusCode::OK);

        let resp = server.client.delete(server.url("/a")).send().await?;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn test_range_conditional_and_head() -> Result<()> {
        let Some(server) = TestServer::start(POSTGRES_BACKEND).await? else {
            return Ok(());
        };
        server.put("/foo", b"hello world").await?;

        let resp = server
            .client
            .get(server.url("/foo"))
            .header(RANGE, "bytes=6-")
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.headers()[CONTENT_RANGE], "bytes 6-10/11");
        assert_eq!(resp.headers()[CONTENT_LENGTH], "5");
        assert_eq!(resp.text().await?, "world");

        let resp = server
            .client
            .get(server.url("/foo"))
            .header(RANGE, "bytes=20-")
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(resp.headers()[CONTENT_RANGE], "bytes */11");

        let resp = server
            .client
            .get(server.url("/foo"))
            .header(IF_NONE_MATCH, quoted_etag(b"hello world"))
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);

        let resp = server.client.head(server.url("/foo")).send().await?;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[CONTENT_LENGTH], "11");
        assert_eq!(resp.headers()[ETAG], quoted_etag(b"hello world").as_str());
        assert!(resp.bytes().await?.is_empty());

        let resp = server.client.head(server.url("/nope")).send().await?;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn test_signed_backend_redirects() -> Result<()> {
        let Some(server) = TestServer::start(SIGNED).await? else {
            return Ok(());
        };
        server.put("/report.pdf", b"%PDF").await?;

        let resp = server.get("/report.pdf").await?;
        assert_eq!(resp.status(), StatusCode::FOUND);
        let location = resp.headers()[LOCATION].to_str()?.to_string();
        assert!(location.contains("X-Amz-Expires=600"), "{location}");

        // HEAD is answered from the row without signing.
        let resp = server.client.head(server.url("/report.pdf")).send().await?;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[CONTENT_LENGTH], "4");
        Ok(())
    }

    #[tokio::test]
    async fn test_copy_header() -> Result<()> {
        let Some(server) = TestServer::start(S3).await? else {
            return Ok(());
        };
        server.put("/src", b"payload").await?;

        let copy = |dst: &str, src: &str| {
            server
                .client
                .put(server.url(dst))
                .header(COPY_FROM_HEADER, src)
                .send()
        };
        assert_eq!(copy("/dst", "/src").await?.status(), StatusCode::OK);
        let resp = server.get("/dst").await?;
        assert_eq!(resp.headers()[ETAG], quoted_etag(b"payload").as_str());
        assert_eq!(resp.text().await?, "payload");

        assert_eq!(copy("/dst", "/src").await?.status(), StatusCode::CONFLICT);
        assert_eq!(copy("/other", "/missing").await?.status(), StatusCode::NOT_FOUND);

        // The copy owns its object.
        server.client.delete(server.url("/src")).send().await?;
        assert_eq!(server.get("/dst").await?.text().await?, "payload");
        Ok(())
    }

    #[tokio::test]
    async fn test_listing_and_encoded_names() -> Result<()> {
        let Some(server) = TestServer::start(POSTGRES_BACKEND).await? else {
            return Ok(());
        };
        for path in ["/dir/one", "/dir/sub/two", "/dir%20x/three", "/top"] {
            assert_eq!(server.put(path, b"1").await?.status(), StatusCode::OK);
        }

        let root: Vec<String> = server.get("/?dir=/").await?.json().await?;
        assert_eq!(root, vec!["/dir x/", "/dir/", "/top"]);
        let dir: Vec<String> = server.get("/?dir=/dir").await?.json().await?;
        assert_eq!(dir, vec!["/dir/one", "/dir/sub/"]);

        assert!(server.repo.get("/dir x/three", false).await.is_ok());
        assert_eq!(server.get("/dir%20x/three").await?.text().await?, "1");
        Ok(())
    }

    #[tokio::test]
    async fn test_method_not_allowed() -> Result<()> {
        let Some(server) = TestServer::start(POSTGRES_BACKEND).await? else {
            return Ok(());
        };
        let resp = server.client.post(server.url("/foo")).body("x").send().await?;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        Ok(())
    }

    #[tokio::test]
    async fn test_gets_during_overwrites() -> Result<()> {
        for backend in [POSTGRES_BACKEND, S3] {
            let Some(server) = TestServer::start(backend).await? else {
                return Ok(());
            };
            let bodies = [vec![b'a'; 120 * 1024], vec![b'b'; 90 * 1024]];
            let put = |body: &Vec<u8>| {
                server
                    .client
                    .put(server.url("/hot"))
                    .body(body.clone())
                    .send()
            };
            assert_eq!(put(&bodies[0]).await?.status(), StatusCode::OK);

            let done = Arc::new(AtomicBool::new(false));
            let readers: Vec<_> = (0..4)
                .map(|_| {
                    let client = server.client.clone();
                    let url = server.url("/hot");
                    let done = done.clone();
                    tokio::spawn(async move {
                        let mut reads = Vec::new();
                        while !done.load(Ordering::Acquire) {
                            let resp = client.get(&url).send().await?;
                            assert_eq!(resp.status(), StatusCode::OK);
                            let etag = resp.headers()[ETAG].to_str()?.to_string();
                            reads.push((etag, resp.bytes().await?.to_vec()));
                        }
                        anyhow::Ok(reads)
                    })
                })
                .collect();

            for i in 0..30 {
                assert_eq!(put(&bodies[(i + 1) % 2]).await?.status(), StatusCode::OK);
            }
            done.store(true, Ordering::Release);

            for reader in futures::future::join_all(readers).await {
                for (etag, body) in reader?? {
                    assert!(bodies.contains(&body), "torn read on {backend}");
                    assert_eq!(etag, quoted_etag(&body));
                }
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_overwrite_removes_old_object() -> Result<()> {
        let Some(server) = TestServer::start(S3).await? else {
            return Ok(());
        };
        server.put("/foo", b"first").await?;
        server.put("/foo", b"second").await?;
        assert_eq!(server.get("/foo").await?.text().await?, "second");

        let objects = server.store.list(None).collect::<Vec<_>>().await;
        assert_eq!(objects.len(), 1);
        Ok(())
    }
}
