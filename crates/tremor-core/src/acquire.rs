//! Source acquisition with retry and staleness detection.
//!
//! The [`Fetcher`] trait abstracts the transport so tests can swap in canned
//! bytes. [`SourceAcquirer`] wraps a fetcher with the shared retry policy and
//! remembers the content hashes of recent successful fetches per source.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::AcquisitionError;
use crate::retry::RetryPolicy;

/// Transport for one fetch attempt.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, AcquisitionError>;
}

impl<F: Fetcher + ?Sized> Fetcher for Arc<F> {
    fn fetch(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, AcquisitionError> {
        (**self).fetch(url, timeout)
    }
}

/// HTTP(S) fetcher on blocking reqwest.
pub struct HttpFetcher {
    user_agent: String,
}

impl HttpFetcher {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, AcquisitionError> {
        // Built per call: fetches only ever run on blocking threads.
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(self.user_agent.clone())
            .build()
            .map_err(|e| AcquisitionError::Network(e.to_string()))?;

        let resp = client.get(url).send().map_err(|e| {
            if e.is_timeout() {
                AcquisitionError::Timeout(e.to_string())
            } else {
                AcquisitionError::Network(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AcquisitionError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let bytes = resp.bytes().map_err(|e| {
            if e.is_timeout() {
                AcquisitionError::Timeout(e.to_string())
            } else {
                AcquisitionError::Network(e.to_string())
            }
        })?;
        if bytes.is_empty() {
            return Err(AcquisitionError::EmptyBody(url.to_string()));
        }
        Ok(bytes.to_vec())
    }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// A successful fetch.
#[derive(Debug, Clone)]
pub struct Acquisition {
    pub url: String,
    pub bytes: Vec<u8>,
    pub hash: String,
    /// The hash matched every remembered hash for this source.
    pub stale: bool,
    pub fetched_at: DateTime<Utc>,
    pub attempts: u32,
}

pub struct SourceAcquirer {
    retry: RetryPolicy,
    timeout: Duration,
    history_len: usize,
    history: HashMap<String, VecDeque<String>>,
}

impl SourceAcquirer {
    /// `history_len` is the number of previous hashes an unchanged source
    /// must repeat before it counts as stale. 0 disables staleness.
    pub fn new(retry: RetryPolicy, timeout: Duration, history_len: usize) -> Self {
        Self {
            retry,
            timeout,
            history_len,
            history: HashMap::new(),
        }
    }

    pub fn fetch(
        &mut self,
        fetcher: &dyn Fetcher,
        url: &str,
    ) -> Result<Acquisition, AcquisitionError> {
        let mut attempts = 0;
        let bytes = self.retry.run(
            url,
            |n| {
                attempts = n;
                fetcher.fetch(url, self.timeout)
            },
            AcquisitionError::is_transient,
        )?;
        if bytes.is_empty() {
            return Err(AcquisitionError::EmptyBody(url.to_string()));
        }

        let hash = content_hash(&bytes);
        let stale = self.observe(url, &hash);
        if stale {
            info!(url, hash = %hash, repeats = self.history_len, "source unchanged, flagged stale");
        } else {
            debug!(url, hash = %hash, attempts, "source fetched");
        }

        Ok(Acquisition {
            url: url.to_string(),
            bytes,
            hash,
            stale,
            fetched_at: Utc::now(),
            attempts,
        })
    }

    /// Record `hash` for `url` and report whether it repeats the full ring.
    fn observe(&mut self, url: &str, hash: &str) -> bool {
        if self.history_len == 0 {
            return false;
        }
        let ring = self.history.entry(url.to_string()).or_default();
        let stale = ring.len() == self.history_len && ring.iter().all(|h| h == hash);
        ring.push_back(hash.to_string());
        while ring.len() > self.history_len {
            ring.pop_front();
        }
        stale
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Serves queued responses per URL; the last response for a URL repeats.
    #[derive(Default)]
    pub struct ScriptedFetcher {
        responses: Mutex<HashMap<String, VecDeque<Result<Vec<u8>, AcquisitionError>>>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl ScriptedFetcher {
        pub fn push(&self, url: &str, response: Result<Vec<u8>, AcquisitionError>) {
            self.responses
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default()
                .push_back(response);
        }

        pub fn calls_to(&self, url: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
        }
    }

    fn clone_response(
        r: &Result<Vec<u8>, AcquisitionError>,
    ) -> Result<Vec<u8>, AcquisitionError> {
        match r {
            Ok(b) => Ok(b.clone()),
            Err(AcquisitionError::Network(m)) => Err(AcquisitionError::Network(m.clone())),
            Err(AcquisitionError::Timeout(m)) => Err(AcquisitionError::Timeout(m.clone())),
            Err(AcquisitionError::Status { status, url }) => Err(AcquisitionError::Status {
                status: *status,
                url: url.clone(),
            }),
            Err(AcquisitionError::EmptyBody(u)) => Err(AcquisitionError::EmptyBody(u.clone())),
        }
    }

    impl Fetcher for ScriptedFetcher {
        fn fetch(&self, url: &str, _timeout: Duration) -> Result<Vec<u8>, AcquisitionError> {
            self.calls.lock().unwrap().push(url.to_string());
            let mut map = self.responses.lock().unwrap();
            let queue = map
                .get_mut(url)
                .ok_or_else(|| AcquisitionError::Network(format!("no script for {url}")))?;
            if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                clone_response(queue.front().unwrap())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::ScriptedFetcher;
    use super::*;

    const URL: &str = "https://charts.example/tremor.png";

    fn acquirer(history: usize) -> SourceAcquirer {
        SourceAcquirer::new(RetryPolicy::immediate(3), Duration::from_secs(5), history)
    }

    #[test]
    fn hash_is_stable_hex_sha256() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn retries_transient_network_errors() {
        let f = ScriptedFetcher::default();
        f.push(URL, Err(AcquisitionError::Network("reset".into())));
        f.push(URL, Err(AcquisitionError::Timeout("slow".into())));
        f.push(URL, Ok(b"png".to_vec()));
        let got = acquirer(3).fetch(&f, URL).unwrap();
        assert_eq!(got.bytes, b"png");
        assert_eq!(got.attempts, 3);
        assert_eq!(f.calls_to(URL), 3);
    }

    #[test]
    fn gives_up_after_attempt_cap() {
        let f = ScriptedFetcher::default();
        f.push(URL, Err(AcquisitionError::Network("down".into())));
        let err = acquirer(3).fetch(&f, URL).unwrap_err();
        assert_eq!(err.kind(), "network");
        assert_eq!(f.calls_to(URL), 3);
    }

    #[test]
    fn client_errors_are_not_retried() {
        let f = ScriptedFetcher::default();
        f.push(
            URL,
            Err(AcquisitionError::Status {
                status: 404,
                url: URL.into(),
            }),
        );
        assert!(acquirer(3).fetch(&f, URL).is_err());
        assert_eq!(f.calls_to(URL), 1);
    }

    #[test]
    fn server_errors_and_rate_limits_are_transient() {
        let s = |status| AcquisitionError::Status {
            status,
            url: URL.into(),
        };
        assert!(s(503).is_transient());
        assert!(s(429).is_transient());
        assert!(!s(403).is_transient());
    }

    #[test]
    fn stale_after_history_fills_with_same_hash() {
        let f = ScriptedFetcher::default();
        f.push(URL, Ok(b"same".to_vec()));
        let mut acq = acquirer(3);
        // three fetches fill the ring; the fourth repeat is stale
        for _ in 0..3 {
            assert!(!acq.fetch(&f, URL).unwrap().stale);
        }
        assert!(acq.fetch(&f, URL).unwrap().stale);
        assert!(acq.fetch(&f, URL).unwrap().stale);
    }

    #[test]
    fn change_clears_staleness() {
        let f = ScriptedFetcher::default();
        for body in ["a", "a", "a", "b", "b"] {
            f.push(URL, Ok(body.as_bytes().to_vec()));
        }
        let mut acq = acquirer(2);
        let flags: Vec<bool> = (0..5).map(|_| acq.fetch(&f, URL).unwrap().stale).collect();
        assert_eq!(flags, vec![false, false, true, false, false]);
    }

    #[test]
    fn histories_are_per_source() {
        let f = ScriptedFetcher::default();
        f.push(URL, Ok(b"x".to_vec()));
        f.push("https://other/", Ok(b"x".to_vec()));
        let mut acq = acquirer(1);
        assert!(!acq.fetch(&f, URL).unwrap().stale);
        assert!(!acq.fetch(&f, "https://other/").unwrap().stale);
        assert!(acq.fetch(&f, URL).unwrap().stale);
    }

    #[test]
    fn zero_history_never_stale() {
        let f = ScriptedFetcher::default();
        f.push(URL, Ok(b"x".to_vec()));
        let mut acq = acquirer(0);
        for _ in 0..5 {
            assert!(!acq.fetch(&f, URL).unwrap().stale);
        }
    }

    #[test]
    fn http_fetcher_reads_body() {
        let mut server = mockito::Server::new();
        let m = server
            .mock("GET", "/chart.png")
            .with_status(200)
            .with_body(b"\x89PNG fake")
            .create();
        let url = format!("{}/chart.png", server.url());
        let body = HttpFetcher::new("tremor-test")
            .fetch(&url, Duration::from_secs(5))
            .unwrap();
        assert_eq!(body, b"\x89PNG fake");
        m.assert();
    }

    #[test]
    fn http_fetcher_maps_status_codes() {
        let mut server = mockito::Server::new();
        let _gone = server.mock("GET", "/gone.png").with_status(404).create();
        let _busy = server.mock("GET", "/busy.png").with_status(503).create();
        let fetcher = HttpFetcher::new("tremor-test");

        let err = fetcher
            .fetch(&format!("{}/gone.png", server.url()), Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::Status { status: 404, .. }));
        assert!(!err.is_transient());

        let err = fetcher
            .fetch(&format!("{}/busy.png", server.url()), Duration::from_secs(5))
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn http_fetcher_rejects_empty_body() {
        let mut server = mockito::Server::new();
        let _empty = server
            .mock("GET", "/empty.png")
            .with_status(200)
            .with_body("")
            .create();
        let err = HttpFetcher::new("tremor-test")
            .fetch(&format!("{}/empty.png", server.url()), Duration::from_secs(5))
            .unwrap_err();
        assert_eq!(err.kind(), "empty_body");
    }
}
