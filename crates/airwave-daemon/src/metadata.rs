//! "Now playing" scraping.
//!
//! The poller is a cancelable task bound to exactly one station URL.  It
//! fetches once immediately, then every poll interval, and forwards whatever
//! it finds to the controller.  Failures are logged and otherwise ignored.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::MetadataFetchError;

fn title_patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // ICY inline metadata
            Regex::new(r"StreamTitle='(.*?)';").expect("static pattern"),
            Regex::new(r"<title>(.*?)</title>").expect("static pattern"),
            // Icecast status XML, title may span lines
            Regex::new(r"(?s)icestats>.*?<title>(.*?)</title>").expect("static pattern"),
        ]
    })
}

/// Pull a title out of a metadata response.  Patterns are tried in order
/// and the first non-empty match wins.
pub fn extract_now_playing(body: &str) -> Option<String> {
    title_patterns().iter().find_map(|re| {
        re.captures(body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    })
}

pub trait MetadataFetcher: Send + Sync + 'static {
    /// Fetch the raw text served at `url`.
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<String, MetadataFetchError>>;
}

/// Reads the beginning of a station's stream over HTTP.
///
/// Live streams never finish, so reading stops at `read_limit` bytes, at the
/// timeout, or as soon as a title is visible.
pub struct HttpMetadataFetcher {
    client: reqwest::Client,
    read_limit: usize,
    timeout: Duration,
}

impl HttpMetadataFetcher {
    pub fn new(client: reqwest::Client, read_limit: usize, timeout: Duration) -> Self {
        Self {
            client,
            read_limit,
            timeout,
        }
    }
}

impl MetadataFetcher for HttpMetadataFetcher {
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<String, MetadataFetchError>> {
        let client = self.client.clone();
        let url = url.to_string();
        let read_limit = self.read_limit;
        let timeout = self.timeout;

        Box::pin(async move {
            let response = client.get(&url).header("Icy-MetaData", "1").send().await?;
            if !response.status().is_success() {
                return Err(MetadataFetchError::Status(response.status()));
            }

            let mut body: Vec<u8> = Vec::new();
            let mut chunks = response.bytes_stream();
            let read = async {
                while let Some(chunk) = chunks.next().await {
                    body.extend_from_slice(&chunk?);
                    if body.len() >= read_limit
                        || extract_now_playing(&String::from_utf8_lossy(&body)).is_some()
                    {
                        break;
                    }
                }
                Ok::<(), reqwest::Error>(())
            };

            let outcome = tokio::time::timeout(timeout, read).await;
            match outcome {
                Ok(result) => result?,
                Err(_) if body.is_empty() => return Err(MetadataFetchError::Timeout(timeout)),
                Err(_) => {}
            }
            Ok(String::from_utf8_lossy(&body).into_owned())
        })
    }
}

/// Result of one poll.  `text` is `None` when the response had no title.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataUpdate {
    pub url: String,
    pub text: Option<String>,
}

struct PollTask {
    url: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct MetadataPoller<M: MetadataFetcher> {
    fetcher: Arc<M>,
    interval: Duration,
    updates: mpsc::Sender<MetadataUpdate>,
    current: Option<PollTask>,
}

impl<M: MetadataFetcher> MetadataPoller<M> {
    pub fn new(fetcher: M, interval: Duration, updates: mpsc::Sender<MetadataUpdate>) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            interval,
            updates,
            current: None,
        }
    }

    /// Poll `url`, replacing any running task.
    pub fn start(&mut self, url: &str) {
        self.stop();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poll_loop(
            Arc::clone(&self.fetcher),
            url.to_string(),
            self.interval,
            self.updates.clone(),
            cancel.clone(),
        ));
        debug!("metadata: polling {}", url);
        self.current = Some(PollTask {
            url: url.to_string(),
            cancel,
            handle,
        });
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.current.take() {
            debug!("metadata: stopped polling {}", task.url);
            task.cancel.cancel();
            task.handle.abort();
        }
    }

    /// Whether the live task is polling `url`.
    pub fn is_for(&self, url: &str) -> bool {
        self.current
            .as_ref()
            .is_some_and(|t| t.url == url && !t.cancel.is_cancelled())
    }

    #[cfg(test)]
    pub fn current_url(&self) -> Option<&str> {
        self.current.as_ref().map(|t| t.url.as_str())
    }
}

impl<M: MetadataFetcher> Drop for MetadataPoller<M> {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_loop<M: MetadataFetcher>(
    fetcher: Arc<M>,
    url: String,
    interval: Duration,
    updates: mpsc::Sender<MetadataUpdate>,
    cancel: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            r = fetcher.fetch(&url) => r,
        };

        match result {
            Ok(body) => {
                let update = MetadataUpdate {
                    url: url.clone(),
                    text: extract_now_playing(&body),
                };
                if updates.send(update).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!("metadata fetch for {} failed: {}", url, e),
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Answers every fetch with an ICY title naming the URL, or with an HTTP
    /// 503 while `failing` is set.
    #[derive(Clone, Default)]
    pub struct FakeFetcher {
        pub calls: Arc<Mutex<Vec<String>>>,
        pub failing: Arc<AtomicBool>,
    }

    impl FakeFetcher {
        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    impl MetadataFetcher for FakeFetcher {
        fn fetch(&self, url: &str) -> BoxFuture<'static, Result<String, MetadataFetchError>> {
            self.calls.lock().unwrap().push(url.to_string());
            if self.failing.load(Ordering::SeqCst) {
                return Box::pin(async {
                    Err(MetadataFetchError::Status(
                        reqwest::StatusCode::SERVICE_UNAVAILABLE,
                    ))
                });
            }
            let body = format!("StreamTitle='Live on {}';", url);
            Box::pin(async move { Ok(body) })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeFetcher;
    use super::*;
    use tokio::time::Instant;

    #[test]
    fn test_extract_icy_title() {
        let body = "\u{0}StreamTitle='Sauti Sol - Suzanna';StreamUrl='';";
        assert_eq!(
            extract_now_playing(body).as_deref(),
            Some("Sauti Sol - Suzanna")
        );
    }

    #[test]
    fn test_extract_bare_title() {
        let body = "<html><head><title>Capital FM</title></head></html>";
        assert_eq!(extract_now_playing(body).as_deref(), Some("Capital FM"));
    }

    #[test]
    fn test_extract_icestats_title() {
        let body = "<?xml version=\"1.0\"?>\n<icestats>\n<source mount=\"/live\">\n<title>\nMorning Drive\n</title>\n</source>\n</icestats>";
        assert_eq!(extract_now_playing(body).as_deref(), Some("Morning Drive"));
    }

    #[test]
    fn test_icy_title_takes_priority() {
        let body = "<title>Station Page</title> StreamTitle='Artist - Song';";
        assert_eq!(extract_now_playing(body).as_deref(), Some("Artist - Song"));
    }

    #[test]
    fn test_empty_matches_fall_through() {
        assert_eq!(
            extract_now_playing("StreamTitle='';<title>Fallback</title>").as_deref(),
            Some("Fallback")
        );
        assert_eq!(extract_now_playing("no metadata here"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_fetches_immediately_then_on_interval() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut poller = MetadataPoller::new(FakeFetcher::default(), Duration::from_secs(10), tx);
        let started = Instant::now();

        poller.start("http://a");
        let first = rx.recv().await.unwrap();
        assert_eq!(first.url, "http://a");
        assert_eq!(first.text.as_deref(), Some("Live on http://a"));
        assert!(started.elapsed() < Duration::from_secs(1));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.url, "http://a");
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_errors_do_not_stop_polling() {
        let (tx, mut rx) = mpsc::channel(8);
        let fetcher = FakeFetcher::default();
        fetcher.set_failing(true);
        let mut poller = MetadataPoller::new(fetcher.clone(), Duration::from_secs(10), tx);

        poller.start("http://a");
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(fetcher.calls.lock().unwrap().len(), 3);
        assert!(rx.try_recv().is_err());
        assert!(poller.is_for("http://a"));

        fetcher.set_failing(false);
        let update = rx.recv().await.unwrap();
        assert_eq!(update.text.as_deref(), Some("Live on http://a"));
        assert_eq!(fetcher.calls.lock().unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_previous_task() {
        let (tx, mut rx) = mpsc::channel(8);
        let fetcher = FakeFetcher::default();
        let mut poller = MetadataPoller::new(fetcher.clone(), Duration::from_secs(10), tx);

        poller.start("http://a");
        assert_eq!(rx.recv().await.unwrap().url, "http://a");

        poller.start("http://b");
        assert!(poller.is_for("http://b"));
        assert!(!poller.is_for("http://a"));
        for _ in 0..3 {
            assert_eq!(rx.recv().await.unwrap().url, "http://b");
        }

        poller.stop();
        poller.stop();
        assert_eq!(poller.current_url(), None);
        let quiet = tokio::time::timeout(Duration::from_secs(60), rx.recv()).await;
        assert!(quiet.is_err());
        assert_eq!(
            fetcher.calls.lock().unwrap().iter().filter(|u| *u == "http://a").count(),
            1
        );
    }
}
