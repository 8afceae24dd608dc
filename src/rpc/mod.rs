//! Exploitation-framework RPC client
//!
//! - [`codec`]: MessagePack request and response frames
//! - [`transport`]: one socket, one call at a time
//! - [`session`]: authentication, token handling and call serialization

pub mod codec;
pub mod session;
pub mod transport;

pub use session::{RpcCredentials, RpcSessionManager};
pub use transport::{ConnectionState, Connector, RpcTransport, TcpConnector};

/// In-process framework double speaking the wire protocol over `tokio::io::duplex`
#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use rmpv::Value;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
        time::timeout,
    };

    use super::{codec, transport::{BoxedStream, Connector}};
    use crate::error::{ReconError, Result};

    pub enum Reply {
        Value(Value),
        /// Close the socket without answering
        Hangup,
        /// Never answer
        Silence,
    }

    type Handler = dyn Fn(&str, &[Value]) -> Reply + Send + Sync;

    /// Connector whose every connection is served by the same handler
    #[derive(Clone)]
    pub struct FakeFramework {
        handler: Arc<Handler>,
        events: Arc<Mutex<Vec<String>>>,
        connects: Arc<AtomicUsize>,
        refuse: bool,
    }

    impl FakeFramework {
        pub fn new<F>(handler: F) -> Self
        where
            F: Fn(&str, &[Value]) -> Reply + Send + Sync + 'static,
        {
            Self {
                handler: Arc::new(handler),
                events: Arc::new(Mutex::new(Vec::new())),
                connects: Arc::new(AtomicUsize::new(0)),
                refuse: false,
            }
        }

        /// Framework that logs in `msf`/`good`, answers `core.version`, and echoes anything else
        pub fn standard() -> Self {
            Self::new(|method, params| standard_reply(method, params))
        }

        pub fn refusing() -> Self {
            Self {
                refuse: true,
                ..Self::standard()
            }
        }

        /// Wire events in order: `request:<method>`, `response:<method>`, `overlap`
        pub fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        pub fn requests(&self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter_map(|e| e.strip_prefix("request:").map(str::to_string))
                .collect()
        }

        pub fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    /// Answer wrapped the way an `{id, result}` envelope carries it
    pub fn enveloped(result: Value) -> Reply {
        Reply::Value(codec::map([("id", Value::from("env-1")), ("result", result)]))
    }

    pub fn standard_reply(method: &str, params: &[Value]) -> Reply {
        match method {
            "auth.login" => {
                let password = params.get(1).and_then(codec::value_as_string);
                if password.as_deref() == Some("good") {
                    Reply::Value(codec::map([
                        ("result", Value::from("success")),
                        ("token", Value::from("TEMP-TOKEN")),
                    ]))
                } else {
                    Reply::Value(codec::map([
                        ("error", Value::from(true)),
                        ("error_message", Value::from("Login Failed")),
                    ]))
                }
            }
            "core.version" => Reply::Value(codec::map([
                ("version", Value::from("6.4.0")),
                ("ruby", Value::from("3.1.2")),
                ("api", Value::from("1.0")),
            ])),
            _ => Reply::Value(codec::map([
                ("method", Value::from(method)),
                ("params", Value::Array(params.to_vec())),
            ])),
        }
    }

    #[async_trait]
    impl Connector for FakeFramework {
        async fn connect(&self, _host: &str, _port: u16) -> Result<BoxedStream> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                return Err(ReconError::network("connection refused"));
            }
            let (client, server) = tokio::io::duplex(64 * 1024);
            tokio::spawn(serve(server, self.handler.clone(), self.events.clone()));
            Ok(Box::new(client))
        }
    }

    async fn serve(mut stream: DuplexStream, handler: Arc<Handler>, events: Arc<Mutex<Vec<String>>>) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let (request, used) = loop {
                match codec::try_decode_frame(&buf) {
                    Ok(Some(frame)) => break frame,
                    Ok(None) => {}
                    Err(_) => return,
                }
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            };
            buf.drain(..used);

            let method = codec::get_string(&request, "method").unwrap_or_default();
            let params = codec::map_get(&request, "params")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            events.lock().unwrap().push(format!("request:{}", method));

            // A client that does not wait for this response would have written more by now.
            if let Ok(Ok(n)) = timeout(Duration::from_millis(20), stream.read(&mut chunk)).await {
                if n == 0 {
                    return;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            if !buf.is_empty() {
                events.lock().unwrap().push("overlap".to_string());
            }

            match handler(&method, &params) {
                Reply::Value(response) => {
                    let Ok(bytes) = codec::encode_value(&response) else { return };
                    if stream.write_all(&bytes).await.is_err() {
                        return;
                    }
                    events.lock().unwrap().push(format!("response:{}", method));
                }
                Reply::Hangup => return,
                Reply::Silence => {
                    // Hold the socket open until the client goes away.
                    while let Ok(n) = stream.read(&mut chunk).await {
                        if n == 0 {
                            return;
                        }
                    }
                    return;
                }
            }
        }
    }
}
