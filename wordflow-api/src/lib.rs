//! HTTP implementations of the core's word and progress endpoints.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;
use url::Url;

use wordflow_core::{Checkpoint, DocumentId, DocumentWords, ProgressSink, WordSource};

/// Client for the reader API: `GET /api/words/{doc}` and
/// `POST /api/progress/{doc}`.
pub struct HttpWordService {
    client: Client,
    base_url: Url,
}

impl HttpWordService {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: &str) -> Result<Self> {
        let mut base = base_url.to_owned();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url =
            Url::parse(&base).with_context(|| format!("invalid server URL {base_url:?}"))?;
        Ok(Self { client, base_url })
    }

    fn words_url(&self, doc: &DocumentId) -> Result<Url> {
        self.base_url
            .join(&format!("api/words/{doc}"))
            .with_context(|| format!("invalid words URL for document {doc}"))
    }

    fn progress_url(&self, doc: &DocumentId) -> Result<Url> {
        self.base_url
            .join(&format!("api/progress/{doc}"))
            .with_context(|| format!("invalid progress URL for document {doc}"))
    }
}

#[async_trait]
impl WordSource for HttpWordService {
    async fn fetch(&self, doc: &DocumentId) -> Result<DocumentWords> {
        let url = self.words_url(doc)?;
        debug!(%url, "fetching word sequence");
        let words: DocumentWords = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("word endpoint rejected document {doc}"))?
            .json()
            .await
            .context("malformed words payload")?;
        debug!(
            doc = %doc,
            words = words.words.len(),
            pages = words.pages.len(),
            "loaded word sequence"
        );
        Ok(words)
    }
}

#[async_trait]
impl ProgressSink for HttpWordService {
    async fn save(&self, doc: &DocumentId, checkpoint: Checkpoint) -> Result<()> {
        let url = self.progress_url(doc)?;
        debug!(%url, index = checkpoint.last_word_index, "saving progress");
        // No meaningful response body; only the status matters.
        self.client
            .post(url.clone())
            .json(&checkpoint)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("progress endpoint rejected document {doc}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn endpoint_urls_join_with_and_without_trailing_slash() {
        let service = HttpWordService::new("http://127.0.0.1:5000").unwrap();
        assert_eq!(
            service.words_url(&"doc-7".to_string()).unwrap().as_str(),
            "http://127.0.0.1:5000/api/words/doc-7"
        );
        let service = HttpWordService::new("http://127.0.0.1:5000/reader/").unwrap();
        assert_eq!(
            service.progress_url(&"9".to_string()).unwrap().as_str(),
            "http://127.0.0.1:5000/reader/api/progress/9"
        );
    }

    #[test]
    fn rejects_unparseable_server_url() {
        assert!(HttpWordService::new("not a url").is_err());
    }

    /// Serves one canned HTTP response and returns the raw request.
    async fn serve_once(listener: TcpListener, status: String, body: String) -> String {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        let header_end = loop {
            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before headers");
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos;
            }
        };
        let headers = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let content_length = headers
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                if name.eq_ignore_ascii_case("content-length") {
                    value.trim().parse::<usize>().ok()
                } else {
                    None
                }
            })
            .unwrap_or(0);
        while buf.len() < header_end + 4 + content_length {
            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before body");
            buf.extend_from_slice(&chunk[..n]);
        }
        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.ok();
        String::from_utf8_lossy(&buf).to_string()
    }

    #[tokio::test]
    async fn fetch_decodes_words_and_pages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_once(
            listener,
            "200 OK".into(),
            r#"{"words":["alpha","beta"],"pages":[{"page":1,"start":0,"end":1}]}"#.into(),
        ));

        let service = HttpWordService::new(&format!("http://{addr}")).unwrap();
        let doc = service.fetch(&"doc-7".to_string()).await.unwrap();
        assert_eq!(doc.words, vec!["alpha", "beta"]);
        assert_eq!(doc.pages.len(), 1);

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /api/words/doc-7 "));
    }

    #[tokio::test]
    async fn save_posts_the_checkpoint_body() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_once(listener, "200 OK".into(), String::new()));

        let service = HttpWordService::new(&format!("http://{addr}")).unwrap();
        service
            .save(
                &"doc-7".to_string(),
                Checkpoint {
                    last_word_index: 12,
                    wpm: 240,
                    font_size: 48,
                },
            )
            .await
            .unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/progress/doc-7 "));
        let body = request.split("\r\n\r\n").nth(1).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(parsed["last_word_index"], 12);
        assert_eq!(parsed["wpm"], 240);
        assert_eq!(parsed["font_size"], 48);
    }

    #[tokio::test]
    async fn server_errors_surface_as_failures() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_once(
            listener,
            "500 Internal Server Error".into(),
            String::new(),
        ));

        let service = HttpWordService::new(&format!("http://{addr}")).unwrap();
        let result = service.fetch(&"doc-7".to_string()).await;
        assert!(result.is_err());
        server.await.unwrap();
    }
}
