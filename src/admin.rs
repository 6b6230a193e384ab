/*
 * Copyright 2025 Google LLC All Rights Reserved.
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

use hyper::{Body, Method, Request, Response, StatusCode};

pub const PORT: u16 = 8000;

/// Serves the admin endpoint: liveness, readiness, metrics and a config dump.
pub async fn server(
    config: Arc<crate::Config>,
    ready: Arc<AtomicBool>,
    address: Option<SocketAddr>,
    mut shutdown: crate::signal::ShutdownRx,
) -> crate::Result<()> {
    let address = address.unwrap_or_else(|| (std::net::Ipv6Addr::UNSPECIFIED, PORT).into());
    tracing::info!(%address, "starting admin endpoint");

    let make_svc = hyper::service::make_service_fn(move |_conn| {
        let config = config.clone();
        let ready = ready.clone();
        async move {
            Ok::<_, Infallible>(hyper::service::service_fn(move |request| {
                let config = config.clone();
                let ready = ready.clone();
                async move {
                    Ok::<_, Infallible>(handle_request(request, config, &ready))
                }
            }))
        }
    });

    hyper::Server::try_bind(&address)?
        .serve(make_svc)
        .with_graceful_shutdown(async move {
            shutdown.changed().await.ok();
        })
        .await
        .map_err(From::from)
}

fn handle_request(
    request: Request<Body>,
    config: Arc<crate::Config>,
    ready: &AtomicBool,
) -> Response<Body> {
    match (request.method(), request.uri().path()) {
        (&Method::GET, "/metrics") => collect_metrics(),
        (&Method::GET, "/live" | "/livez") => Response::new("ok".into()),
        (&Method::GET, "/ready" | "/readyz") => check_readiness(ready),
        (&Method::GET, "/config") => match serde_json::to_string(&config) {
            Ok(body) => Response::builder()
                .status(StatusCode::OK)
                .header(
                    hyper::header::CONTENT_TYPE,
                    hyper::header::HeaderValue::from_static("application/json"),
                )
                .body(Body::from(body))
                .unwrap(),
            Err(error) => {
                let mut response =
                    Response::new(Body::from(format!("failed to create config dump: {error}")));
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
        },
        (_, _) => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    }
}

fn check_readiness(ready: &AtomicBool) -> Response<Body> {
    if ready.load(Ordering::SeqCst) {
        return Response::new("ok".into());
    }

    let mut response = Response::new(Body::from("NOT READY"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

fn collect_metrics() -> Response<Body> {
    let mut response = Response::new(Body::empty());
    let mut buffer = vec![];
    let encoder = prometheus::TextEncoder::new();
    let body =
        prometheus::Encoder::encode(&encoder, &crate::metrics::registry().gather(), &mut buffer)
            .map_err(|error| tracing::warn!(%error, "failed to encode metrics"))
            .and_then(|_| {
                String::from_utf8(buffer)
                    .map_err(|error| tracing::warn!(%error, "failed to convert metrics to utf8"))
            });

    match body {
        Ok(body) => {
            *response.body_mut() = Body::from(body);
        }
        Err(_) => {
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    response
}

#[cfg(test)]
mod tests {
    #[tokio::test]
    async fn collect_metrics() {
        let response = super::collect_metrics();
        assert_eq!(response.status(), hyper::StatusCode::OK);
    }
}
