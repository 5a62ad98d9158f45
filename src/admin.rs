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

use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server as HyperServer, StatusCode,
};

/// Serves Prometheus metrics on `/metrics`.
pub fn spawn_metrics(address: SocketAddr) -> tokio::task::JoinHandle<Result<(), hyper::Error>> {
    tracing::info!(%address, "starting metrics endpoint");

    let make_svc = make_service_fn(move |_conn| async move {
        Ok::<_, Infallible>(service_fn(move |req| async move {
            Ok::<_, Infallible>(handle_metrics_request(req))
        }))
    });

    tokio::spawn(HyperServer::bind(&address).serve(make_svc))
}

/// Serves `/healthz` and `/readyz`. Both answer 200 once `live` has been
/// flipped by the controller runtime.
pub fn spawn_probes(
    address: SocketAddr,
    live: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<Result<(), hyper::Error>> {
    tracing::info!(%address, "starting health probe endpoint");

    let make_svc = make_service_fn(move |_conn| {
        let live = live.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let live = live.clone();
                async move { Ok::<_, Infallible>(handle_probe_request(req, &live)) }
            }))
        }
    });

    tokio::spawn(HyperServer::bind(&address).serve(make_svc))
}

fn handle_metrics_request(request: Request<Body>) -> Response<Body> {
    match (request.method(), request.uri().path()) {
        (&Method::GET, "/metrics") => collect_metrics(),
        (_, _) => not_found(),
    }
}

fn handle_probe_request(request: Request<Body>, live: &AtomicBool) -> Response<Body> {
    match (request.method(), request.uri().path()) {
        (&Method::GET, "/healthz" | "/readyz") => {
            if live.load(Ordering::SeqCst) {
                Response::new("ok".into())
            } else {
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
        }
        (_, _) => not_found(),
    }
}

fn not_found() -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

fn collect_metrics() -> Response<Body> {
    let mut buffer = Vec::new();
    let encoder = prometheus::TextEncoder::new();
    let gathered = crate::metrics::registry().gather();

    match prometheus::Encoder::encode(&encoder, &gathered, &mut buffer) {
        // The text exposition format is plain UTF-8, so the raw buffer can be
        // served as the body directly.
        Ok(()) => Response::new(Body::from(buffer)),
        Err(error) => {
            tracing::warn!(%error, "failed to encode metrics");
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collect_metrics() {
        let response = super::collect_metrics();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn probes_track_liveness() {
        let live = AtomicBool::new(false);
        let request = || Request::get("/healthz").body(Body::empty()).unwrap();

        let response = handle_probe_request(request(), &live);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        live.store(true, Ordering::SeqCst);
        let response = handle_probe_request(request(), &live);
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let request = Request::get("/config").body(Body::empty()).unwrap();
        let response = handle_metrics_request(request);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
