//! Responsiveness probe: query an instance's status endpoint, with one retry.
//!
//! A single failed query is not conclusive (a GC pause or a request backlog can
//! stall one request on a healthy process). Only two consecutive failures,
//! separated by `retry_delay`, mark the instance unresponsive.

use crate::location::{resolve_api_port, LocationError, LocationStore};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Result of a single status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeAttempt {
    /// The instance answered with a parseable status document.
    Responded,
    /// No answer, an empty answer, or one that failed to parse.
    Failed,
}

/// Where the two-strike probe currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    FirstAttempt,
    WaitingRetry,
    SecondAttempt,
    /// Final verdict: `true` if the instance is responsive.
    Decided(bool),
}

/// Two-strike decision state machine:
/// `FirstAttempt -> [fail] -> WaitingRetry -> SecondAttempt -> Decided`.
#[derive(Debug)]
pub struct TwoStrike {
    state: ProbeState,
}

impl TwoStrike {
    pub fn new() -> Self {
        Self {
            state: ProbeState::FirstAttempt,
        }
    }

    pub fn state(&self) -> ProbeState {
        self.state
    }

    /// Record the result of the attempt the machine is waiting for.
    /// Ignored unless the machine is in an attempt state.
    pub fn record(&mut self, attempt: ProbeAttempt) -> ProbeState {
        self.state = match (self.state, attempt) {
            (ProbeState::FirstAttempt, ProbeAttempt::Responded)
            | (ProbeState::SecondAttempt, ProbeAttempt::Responded) => ProbeState::Decided(true),
            (ProbeState::FirstAttempt, ProbeAttempt::Failed) => ProbeState::WaitingRetry,
            (ProbeState::SecondAttempt, ProbeAttempt::Failed) => ProbeState::Decided(false),
            (state, _) => state,
        };
        self.state
    }

    /// The retry delay has passed; move on to the second attempt.
    pub fn retry_delay_elapsed(&mut self) -> ProbeState {
        if self.state == ProbeState::WaitingRetry {
            self.state = ProbeState::SecondAttempt;
        }
        self.state
    }
}

impl Default for TwoStrike {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport for a single status query against a local instance.
#[async_trait]
pub trait StatusClient: Send + Sync {
    async fn query_state(&self, port: u16) -> ProbeAttempt;
}

/// Queries `POST https://localhost:{port}/state/` with the fleet's API key.
///
/// Instances serve self-signed certificates, so certificate validation is off.
/// The endpoint is only ever contacted on localhost.
pub struct HttpsStatusClient {
    client: reqwest::Client,
    api_key: String,
}

impl HttpsStatusClient {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
        })
    }

    fn state_url(port: u16) -> String {
        format!("https://localhost:{port}/state/")
    }

    fn state_request(&self, port: u16) -> Result<reqwest::Request, reqwest::Error> {
        self.client
            .post(Self::state_url(port))
            .json(&serde_json::json!({ "apiKey": self.api_key }))
            .build()
    }
}

#[async_trait]
impl StatusClient for HttpsStatusClient {
    async fn query_state(&self, port: u16) -> ProbeAttempt {
        let url = Self::state_url(port);
        let response = match self.state_request(port) {
            Ok(request) => self.client.execute(request).await,
            Err(e) => Err(e),
        };
        let response = match response {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, %url, "status query failed");
                return ProbeAttempt::Failed;
            }
        };
        match response.text().await {
            Ok(text) if body_is_alive(&text) => ProbeAttempt::Responded,
            Ok(_) => {
                debug!(%url, "status query returned an empty or unparseable body");
                ProbeAttempt::Failed
            }
            Err(e) => {
                debug!(error = %e, %url, "failed to read status response");
                ProbeAttempt::Failed
            }
        }
    }
}

/// Whether a status response body counts as a sign of life: it must be a
/// JSON document other than `null` or `false`.
pub fn body_is_alive(body: &str) -> bool {
    if body.trim().is_empty() {
        return false;
    }
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::Null) | Ok(serde_json::Value::Bool(false)) => false,
        Ok(_) => true,
        Err(_) => false,
    }
}

/// Outcome of probing one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// The API port the instance was probed on.
    pub port: u16,
    pub responsive: bool,
}

/// Decides whether an instance is responsive.
pub struct Prober {
    client: Arc<dyn StatusClient>,
    locations: Arc<dyn LocationStore>,
    hostname: String,
    retry_delay: Duration,
}

impl Prober {
    pub fn new(
        client: Arc<dyn StatusClient>,
        locations: Arc<dyn LocationStore>,
        hostname: impl Into<String>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            client,
            locations,
            hostname: hostname.into(),
            retry_delay,
        }
    }

    /// Probe `name` on its registered API port.
    ///
    /// Fails only if the port cannot be resolved, which means the state of the
    /// instance is unknown, not that it is unresponsive.
    pub async fn is_responsive(&self, name: &str) -> Result<ProbeOutcome, LocationError> {
        let port = resolve_api_port(self.locations.as_ref(), name, &self.hostname)?;
        debug!(instance = name, port, "checking instance status endpoint");

        let mut probe = TwoStrike::new();
        loop {
            match probe.state() {
                ProbeState::FirstAttempt | ProbeState::SecondAttempt => {
                    let attempt = self.client.query_state(port).await;
                    probe.record(attempt);
                }
                ProbeState::WaitingRetry => {
                    warn!(
                        instance = name,
                        port,
                        retry_delay_secs = self.retry_delay.as_secs(),
                        "status query failed, checking again"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    probe.retry_delay_elapsed();
                }
                ProbeState::Decided(responsive) => {
                    return Ok(ProbeOutcome { port, responsive });
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::location::InstanceLocation;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays scripted attempts; fails once the script runs out.
    pub(crate) struct ScriptedClient {
        script: Mutex<VecDeque<ProbeAttempt>>,
        pub(crate) calls: AtomicUsize,
    }

    impl ScriptedClient {
        pub(crate) fn new(script: &[ProbeAttempt]) -> Self {
            Self {
                script: Mutex::new(script.iter().copied().collect()),
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StatusClient for ScriptedClient {
        async fn query_state(&self, _port: u16) -> ProbeAttempt {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ProbeAttempt::Failed)
        }
    }

    /// In-memory location store with one port per instance name.
    pub(crate) struct FixedLocations(pub(crate) Vec<(String, Option<u16>)>);

    impl LocationStore for FixedLocations {
        fn latest(
            &self,
            name: &str,
            hostname: &str,
        ) -> Result<Option<InstanceLocation>, LocationError> {
            Ok(self
                .0
                .iter()
                .find(|(n, _)| n == name)
                .map(|(n, port)| InstanceLocation {
                    name: n.clone(),
                    hostname: hostname.to_string(),
                    api_port: *port,
                    last_contact: chrono::Utc::now(),
                }))
        }
    }

    fn prober(client: Arc<ScriptedClient>) -> Prober {
        let locations = FixedLocations(vec![("Bot2".to_string(), Some(8443))]);
        Prober::new(client, Arc::new(locations), "host-a", Duration::ZERO)
    }

    #[test]
    fn test_two_strike_success_first() {
        let mut probe = TwoStrike::new();
        assert_eq!(probe.record(ProbeAttempt::Responded), ProbeState::Decided(true));
    }

    #[test]
    fn test_two_strike_fail_then_success() {
        let mut probe = TwoStrike::new();
        assert_eq!(probe.record(ProbeAttempt::Failed), ProbeState::WaitingRetry);
        assert_eq!(probe.retry_delay_elapsed(), ProbeState::SecondAttempt);
        assert_eq!(probe.record(ProbeAttempt::Responded), ProbeState::Decided(true));
    }

    #[test]
    fn test_two_strike_fail_fail() {
        let mut probe = TwoStrike::new();
        probe.record(ProbeAttempt::Failed);
        probe.retry_delay_elapsed();
        assert_eq!(probe.record(ProbeAttempt::Failed), ProbeState::Decided(false));
    }

    #[test]
    fn test_two_strike_ignores_attempt_while_waiting() {
        let mut probe = TwoStrike::new();
        probe.record(ProbeAttempt::Failed);
        assert_eq!(probe.record(ProbeAttempt::Responded), ProbeState::WaitingRetry);
    }

    #[test]
    fn test_two_strike_decision_is_final() {
        let mut probe = TwoStrike::new();
        probe.record(ProbeAttempt::Responded);
        assert_eq!(probe.record(ProbeAttempt::Failed), ProbeState::Decided(true));
        assert_eq!(probe.retry_delay_elapsed(), ProbeState::Decided(true));
    }

    #[test]
    fn test_body_is_alive() {
        assert!(body_is_alive(r#"{"running": true}"#));
        assert!(body_is_alive("[]"));
        assert!(body_is_alive("true"));
        assert!(!body_is_alive(""));
        assert!(!body_is_alive("   \n"));
        assert!(!body_is_alive("false"));
        assert!(!body_is_alive("null"));
        assert!(!body_is_alive("<html>502 Bad Gateway</html>"));
    }

    #[test]
    fn test_state_url() {
        assert_eq!(HttpsStatusClient::state_url(8443), "https://localhost:8443/state/");
    }

    #[tokio::test]
    async fn test_success_first_attempt_skips_retry() {
        let client = Arc::new(ScriptedClient::new(&[ProbeAttempt::Responded]));
        let outcome = prober(Arc::clone(&client)).is_responsive("Bot2").await.unwrap();
        assert_eq!(
            outcome,
            ProbeOutcome {
                port: 8443,
                responsive: true
            }
        );
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_fail_then_success_is_responsive() {
        let client = Arc::new(ScriptedClient::new(&[
            ProbeAttempt::Failed,
            ProbeAttempt::Responded,
        ]));
        let outcome = prober(Arc::clone(&client)).is_responsive("Bot2").await.unwrap();
        assert!(outcome.responsive);
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn test_fail_twice_is_unresponsive() {
        let client = Arc::new(ScriptedClient::new(&[
            ProbeAttempt::Failed,
            ProbeAttempt::Failed,
        ]));
        let outcome = prober(Arc::clone(&client)).is_responsive("Bot2").await.unwrap();
        assert!(!outcome.responsive);
        assert_eq!(outcome.port, 8443);
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn test_unknown_port_is_error_without_query() {
        let client = Arc::new(ScriptedClient::new(&[]));
        let err = prober(Arc::clone(&client)).is_responsive("Bot9").await.unwrap_err();
        assert!(matches!(err, LocationError::NotFound { .. }));
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_retry_waits_for_delay() {
        let client = Arc::new(ScriptedClient::new(&[
            ProbeAttempt::Failed,
            ProbeAttempt::Responded,
        ]));
        let locations = FixedLocations(vec![("Bot2".to_string(), Some(8443))]);
        let prober = Prober::new(
            client,
            Arc::new(locations),
            "host-a",
            Duration::from_millis(100),
        );
        let start = std::time::Instant::now();
        assert!(prober.is_responsive("Bot2").await.unwrap().responsive);
        assert!(start.elapsed().as_millis() >= 80);
    }

    #[tokio::test]
    async fn test_https_client_connection_refused_is_failed() {
        // Nothing listens on port 1
        let client = HttpsStatusClient::new("key", Duration::from_secs(2)).unwrap();
        assert_eq!(client.query_state(1).await, ProbeAttempt::Failed);
    }

    #[test]
    fn test_state_request_posts_api_key() {
        let client = HttpsStatusClient::new("s3cret", Duration::from_secs(2)).unwrap();
        let request = client.state_request(8443).unwrap();

        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.url().as_str(), "https://localhost:8443/state/");
        assert_eq!(
            request.headers()[reqwest::header::CONTENT_TYPE],
            "application/json"
        );
        let body = request.body().and_then(|b| b.as_bytes()).unwrap();
        let json: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(json, serde_json::json!({ "apiKey": "s3cret" }));
    }
}
