/*
 * Copyright 2024 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::time::Duration;

use hyper::client::HttpConnector;
use serde::{Deserialize, Serialize};

/// Hard deadline covering connect, request, and body read of a single poll.
/// Independent of any deadline on the surrounding reconcile.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(2);

/// Occupancy report served by every game server on its status endpoint.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub players: i32,
    pub max_players: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("request timed out")]
    TimedOut,
    #[error("HTTP {}", .0.as_u16())]
    Status(hyper::StatusCode),
    #[error("{0}")]
    Transport(#[from] hyper::Error),
    #[error("invalid endpoint: {0}")]
    Uri(#[from] hyper::http::uri::InvalidUri),
    #[error("malformed status body: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Polls game-server status endpoints. Cheap to clone; the underlying hyper
/// client pools connections across polls.
#[derive(Clone)]
pub struct StatusPoller {
    client: hyper::Client<HttpConnector>,
    timeout: Duration,
}

impl Default for StatusPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusPoller {
    pub fn new() -> Self {
        Self {
            client: hyper::Client::new(),
            timeout: POLL_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_timeout(timeout: Duration) -> Self {
        Self {
            client: hyper::Client::new(),
            timeout,
        }
    }

    /// Issues a GET against `endpoint` and decodes the occupancy report. Any
    /// transport failure, timeout, non-2xx status, or decode failure is an
    /// error; callers treat all of them as the server being unreachable.
    pub async fn poll(&self, endpoint: &str) -> Result<ServerStatus, PollError> {
        let uri: hyper::Uri = endpoint.parse()?;

        let request = async {
            let response = self.client.get(uri).await?;
            let status = response.status();
            // Drain the body before acting on the status code so the
            // connection can return to the pool on every path.
            let body = hyper::body::to_bytes(response.into_body()).await;
            if !status.is_success() {
                return Err(PollError::Status(status));
            }
            Ok(serde_json::from_slice(&body?)?)
        };

        tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| PollError::TimedOut)?
    }
}

#[cfg(test)]
mod tests {
    use std::{convert::Infallible, net::SocketAddr};

    use hyper::{
        service::{make_service_fn, service_fn},
        Body, Response, Server, StatusCode,
    };

    use super::*;

    async fn serve(status: StatusCode, body: &'static str) -> SocketAddr {
        let make_svc = make_service_fn(move |_conn| async move {
            Ok::<_, Infallible>(service_fn(move |_req| async move {
                Ok::<_, Infallible>(
                    Response::builder()
                        .status(status)
                        .body(Body::from(body))
                        .unwrap(),
                )
            }))
        });
        let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_svc);
        let addr = server.local_addr();
        tokio::spawn(server);
        addr
    }

    #[tokio::test]
    async fn decodes_occupancy_report() {
        let addr = serve(StatusCode::OK, r#"{"players": 12, "maxPlayers": 64}"#).await;
        let status = StatusPoller::new()
            .poll(&format!("http://{addr}/status"))
            .await
            .unwrap();

        assert_eq!(
            status,
            ServerStatus {
                players: 12,
                max_players: 64
            }
        );
    }

    #[tokio::test]
    async fn non_2xx_reports_the_code() {
        let addr = serve(StatusCode::INTERNAL_SERVER_ERROR, "boom").await;
        let error = StatusPoller::new()
            .poll(&format!("http://{addr}/status"))
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            PollError::Status(StatusCode::INTERNAL_SERVER_ERROR)
        ));
        assert_eq!(error.to_string(), "HTTP 500");
    }

    #[tokio::test]
    async fn malformed_body_is_a_poll_failure() {
        let addr = serve(StatusCode::OK, "not json").await;
        let error = StatusPoller::new()
            .poll(&format!("http://{addr}/status"))
            .await
            .unwrap_err();

        assert!(matches!(error, PollError::Decode(_)));
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() {
        // Bind-then-drop guarantees nothing is listening on the port.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let error = StatusPoller::new()
            .poll(&format!("http://{addr}/status"))
            .await
            .unwrap_err();
        assert!(matches!(error, PollError::Transport(_)));
    }

    #[tokio::test]
    async fn slow_server_times_out() {
        let make_svc = make_service_fn(|_conn| async {
            Ok::<_, Infallible>(service_fn(|_req| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, Infallible>(Response::new(Body::from("{}")))
            }))
        });
        let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_svc);
        let addr = server.local_addr();
        tokio::spawn(server);

        let error = StatusPoller::with_timeout(Duration::from_millis(50))
            .poll(&format!("http://{addr}/status"))
            .await
            .unwrap_err();
        assert!(matches!(error, PollError::TimedOut));
    }
}
