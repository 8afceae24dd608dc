//! Authenticated RPC session
//!
//! One [`RpcSessionManager`] owns one transport. Every call, connect and reconnect runs under
//! the same lock, so calls never interleave on the wire and a caller that finds a reconnect in
//! progress waits for it and reuses the resulting session.

use rmpv::Value;
use std::{fmt, sync::Arc, time::{Duration, Instant}};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::{ReconError, Result},
    metrics::MetricsCollector,
    rpc::{
        codec,
        transport::{ConnectionState, Connector, RpcTransport},
    },
};

const LOGIN_METHOD: &str = "auth.login";

#[derive(Clone, PartialEq, Eq)]
pub struct RpcCredentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl RpcCredentials {
    fn same_endpoint(&self, other: &RpcCredentials) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl fmt::Debug for RpcCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"********")
            .finish()
    }
}

struct SessionState {
    transport: RpcTransport,
    token: Option<String>,
    /// Credentials of the last successful login, used to reconnect
    credentials: Option<RpcCredentials>,
}

impl SessionState {
    fn drop_session(&mut self) {
        self.transport.close();
        self.token = None;
    }
}

pub struct RpcSessionManager {
    connector: Arc<dyn Connector>,
    state: Mutex<SessionState>,
    metrics: Arc<MetricsCollector>,
}

impl RpcSessionManager {
    pub fn new(connector: Arc<dyn Connector>, call_timeout: Duration, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            connector,
            state: Mutex::new(SessionState {
                transport: RpcTransport::new(call_timeout),
                token: None,
                credentials: None,
            }),
            metrics,
        }
    }

    /// Open a connection and log in.
    ///
    /// Already being ready against the same host and port is a no-op.
    pub async fn connect(&self, credentials: RpcCredentials) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.transport.state() == ConnectionState::Ready
            && state.credentials.as_ref().is_some_and(|c| c.same_endpoint(&credentials))
        {
            debug!(host = %credentials.host, port = credentials.port, "RPC session already ready");
            return Ok(());
        }
        self.login(&mut state, credentials).await
    }

    async fn login(&self, state: &mut SessionState, credentials: RpcCredentials) -> Result<()> {
        state.drop_session();
        state.credentials = None;

        state
            .transport
            .open(self.connector.as_ref(), &credentials.host, credentials.port)
            .await?;
        state.transport.set_state(ConnectionState::Authenticating);

        let params = vec![
            Value::from(credentials.username.as_str()),
            Value::from(credentials.password.as_str()),
        ];
        let started = Instant::now();
        let outcome = state.transport.call(LOGIN_METHOD, params).await;
        self.metrics.record_rpc_call(LOGIN_METHOD, started.elapsed(), outcome.is_ok());

        let token = match outcome {
            Ok(response) => codec::get_string(&response, "token").filter(|t| !t.is_empty()),
            Err(ReconError::RpcProtocol { message, .. }) => {
                state.drop_session();
                return Err(ReconError::auth_failed(message));
            }
            Err(e) => {
                state.drop_session();
                return Err(e);
            }
        };

        match token {
            Some(token) => {
                state.token = Some(token);
                state.transport.set_state(ConnectionState::Ready);
                info!(host = %credentials.host, port = credentials.port, "RPC session authenticated");
                state.credentials = Some(credentials);
                Ok(())
            }
            None => {
                state.drop_session();
                Err(ReconError::auth_failed("login response carried no token"))
            }
        }
    }

    /// Re-establish a dropped session with the last good credentials.
    ///
    /// Returns whether a new login happened.
    pub async fn reconnect_if_needed(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        self.reconnect_locked(&mut state).await
    }

    async fn reconnect_locked(&self, state: &mut SessionState) -> Result<bool> {
        if state.transport.state() != ConnectionState::Disconnected {
            return Ok(false);
        }
        let Some(credentials) = state.credentials.clone() else {
            return Ok(false);
        };
        info!(host = %credentials.host, port = credentials.port, "Reconnecting RPC session");
        self.login(state, credentials).await?;
        Ok(true)
    }

    /// Call `method` with the session token prepended to `params`
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let mut state = self.state.lock().await;

        if state.transport.has_abandoned_call() {
            warn!(method, "Previous RPC call was abandoned mid-exchange, starting a fresh session");
            state.drop_session();
        }
        if state.token.is_none() {
            self.reconnect_locked(&mut state).await?;
        }
        let Some(token) = state.token.clone() else {
            return Err(ReconError::NotAuthenticated);
        };

        let mut full_params = Vec::with_capacity(params.len() + 1);
        full_params.push(Value::from(token));
        full_params.extend(params);

        let started = Instant::now();
        let outcome = state.transport.call(method, full_params).await;
        self.metrics.record_rpc_call(method, started.elapsed(), outcome.is_ok());

        if state.transport.state() == ConnectionState::Disconnected {
            warn!(method, "RPC connection lost, session token discarded");
            state.token = None;
        }
        outcome
    }

    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        state.drop_session();
        state.credentials = None;
    }

    pub async fn state(&self) -> ConnectionState {
        self.state.lock().await.transport.state()
    }

    pub async fn is_ready(&self) -> bool {
        self.state().await == ConnectionState::Ready
    }

    /// Endpoint of the current or last authenticated session
    pub async fn endpoint(&self) -> Option<(String, u16)> {
        let state = self.state.lock().await;
        state.credentials.as_ref().map(|c| (c.host.clone(), c.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::testing::{enveloped, standard_reply, FakeFramework, Reply};

    fn manager(framework: &FakeFramework) -> Arc<RpcSessionManager> {
        Arc::new(RpcSessionManager::new(
            Arc::new(framework.clone()),
            Duration::from_secs(2),
            Arc::new(MetricsCollector::new()),
        ))
    }

    fn credentials(password: &str) -> RpcCredentials {
        RpcCredentials {
            host: "127.0.0.1".to_string(),
            port: 55553,
            username: "msf".to_string(),
            password: password.to_string(),
        }
    }

    #[tokio::test]
    async fn test_call_before_connect_is_not_authenticated() {
        let framework = FakeFramework::standard();
        let session = manager(&framework);

        let error = session.call("core.version", vec![]).await.unwrap_err();
        assert!(matches!(error, ReconError::NotAuthenticated));
        assert_eq!(framework.connects(), 0);
        assert!(framework.events().is_empty());
    }

    #[tokio::test]
    async fn test_token_is_prepended() {
        let framework = FakeFramework::standard();
        let session = manager(&framework);
        session.connect(credentials("good")).await.unwrap();
        assert!(session.is_ready().await);

        let response = session.call("module.info", vec![Value::from("exploit")]).await.unwrap();
        let params = codec::map_get(&response, "params").and_then(Value::as_array).unwrap();
        assert_eq!(params[0].as_str(), Some("TEMP-TOKEN"));
        assert_eq!(params[1].as_str(), Some("exploit"));
    }

    #[tokio::test]
    async fn test_missing_token_rejects_connect() {
        let framework = FakeFramework::new(|method, params| match method {
            "auth.login" => Reply::Value(codec::map([("result", Value::from("success"))])),
            _ => standard_reply(method, params),
        });
        let session = manager(&framework);

        let error = session.connect(credentials("good")).await.unwrap_err();
        assert!(matches!(error, ReconError::AuthenticationFailed { .. }));
        assert_eq!(session.state().await, ConnectionState::Disconnected);

        let error = session.call("core.version", vec![]).await.unwrap_err();
        assert!(matches!(error, ReconError::NotAuthenticated));
        assert_eq!(framework.requests(), vec!["auth.login"]);
    }

    #[tokio::test]
    async fn test_enveloped_login_token_is_used() {
        let framework = FakeFramework::new(|method, params| match method {
            "auth.login" => enveloped(codec::map([
                ("result", Value::from("success")),
                ("token", Value::from("T1")),
            ])),
            _ => enveloped(codec::map([("params", Value::Array(params.to_vec()))])),
        });
        let session = manager(&framework);
        session.connect(credentials("good")).await.unwrap();
        assert!(session.is_ready().await);

        let response = session.call("core.version", vec![]).await.unwrap();
        let params = codec::map_get(&response, "params").and_then(Value::as_array).unwrap();
        assert_eq!(params[0].as_str(), Some("T1"));
    }

    #[tokio::test]
    async fn test_bad_password_is_authentication_failure() {
        let framework = FakeFramework::standard();
        let session = manager(&framework);

        let error = session.connect(credentials("wrong")).await.unwrap_err();
        assert!(matches!(error, ReconError::AuthenticationFailed { ref message } if message == "Login Failed"));
        assert_eq!(session.state().await, ConnectionState::Disconnected);

        session.connect(credentials("good")).await.unwrap();
        assert!(session.call("core.version", vec![]).await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let framework = FakeFramework::standard();
        let session = manager(&framework);
        session.connect(credentials("good")).await.unwrap();
        session.connect(credentials("good")).await.unwrap();

        assert_eq!(framework.connects(), 1);
        assert_eq!(framework.requests(), vec!["auth.login"]);
    }

    #[tokio::test]
    async fn test_connection_refused_stays_disconnected() {
        let framework = FakeFramework::refusing();
        let session = manager(&framework);
        assert!(matches!(
            session.connect(credentials("good")).await,
            Err(ReconError::Network { .. })
        ));
        assert_eq!(session.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_concurrent_calls_never_overlap() {
        let framework = FakeFramework::standard();
        let session = manager(&framework);
        session.connect(credentials("good")).await.unwrap();

        let calls = (0..4).map(|i| {
            let session = session.clone();
            tokio::spawn(async move { session.call(&format!("test.call{}", i), vec![]).await })
        });
        for call in futures::future::join_all(calls).await {
            call.unwrap().unwrap();
        }

        let events = framework.events();
        assert!(!events.contains(&"overlap".to_string()), "events: {:?}", events);
        // Every request is answered before the next one is read.
        for pair in events.chunks(2) {
            let method = pair[0].strip_prefix("request:").unwrap();
            assert_eq!(pair[1], format!("response:{}", method));
        }
    }

    #[tokio::test]
    async fn test_reconnect_after_drop_shares_one_login() {
        let framework = FakeFramework::new(|method, params| match method {
            "session.drop" => Reply::Hangup,
            _ => standard_reply(method, params),
        });
        let session = manager(&framework);
        session.connect(credentials("good")).await.unwrap();

        assert!(session.call("session.drop", vec![]).await.is_err());
        assert_eq!(session.state().await, ConnectionState::Disconnected);

        let calls = (0..3).map(|_| {
            let session = session.clone();
            tokio::spawn(async move { session.call("core.version", vec![]).await })
        });
        for call in futures::future::join_all(calls).await {
            call.unwrap().unwrap();
        }

        assert_eq!(framework.connects(), 2);
        let logins = framework.requests().iter().filter(|m| *m == "auth.login").count();
        assert_eq!(logins, 2);
    }

    #[tokio::test]
    async fn test_abandoned_call_forces_fresh_session() {
        let framework = FakeFramework::new(|method, params| match method {
            "module.slow" => Reply::Silence,
            _ => standard_reply(method, params),
        });
        let session = manager(&framework);
        session.connect(credentials("good")).await.unwrap();

        let abandoned = tokio::time::timeout(Duration::from_millis(100), session.call("module.slow", vec![])).await;
        assert!(abandoned.is_err());

        let response = session.call("core.version", vec![]).await.unwrap();
        assert_eq!(codec::get_string(&response, "version").as_deref(), Some("6.4.0"));
        assert_eq!(framework.connects(), 2);
    }

    #[tokio::test]
    async fn test_reconnect_without_credentials_is_noop() {
        let framework = FakeFramework::standard();
        let session = manager(&framework);
        assert!(!session.reconnect_if_needed().await.unwrap());
        assert_eq!(framework.connects(), 0);
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let text = format!("{:?}", credentials("hunter2"));
        assert!(!text.contains("hunter2"));
    }
}
