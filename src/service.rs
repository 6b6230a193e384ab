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

//! The HTTP allocation request interface.

use std::{collections::BTreeMap, convert::Infallible, net::SocketAddr, sync::Arc};

use hyper::{Body, Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::allocation::{AllocationRequest, Allocator};

/// The reference handed back to a successful requester: the claimed server's
/// identity and connection-relevant placement.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationResponse {
    pub name: String,
    pub game_server_set: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Serves `POST /v1/allocations` until shutdown.
pub async fn serve(
    allocator: Arc<Allocator>,
    address: SocketAddr,
    mut shutdown: crate::signal::ShutdownRx,
) -> crate::Result<()> {
    let make_svc = hyper::service::make_service_fn(move |_conn| {
        let allocator = allocator.clone();
        async move {
            Ok::<_, Infallible>(hyper::service::service_fn(move |request| {
                handle_request(request, allocator.clone())
            }))
        }
    });

    tracing::info!(%address, "starting allocation endpoint");
    hyper::Server::try_bind(&address)?
        .serve(make_svc)
        .with_graceful_shutdown(async move {
            shutdown.changed().await.ok();
        })
        .await
        .map_err(From::from)
}

async fn handle_request(
    request: Request<Body>,
    allocator: Arc<Allocator>,
) -> Result<Response<Body>, Infallible> {
    let response = match (request.method(), request.uri().path()) {
        (&Method::POST, "/v1/allocations") => allocate(request, allocator).await,
        (_, _) => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    };

    Ok(response)
}

async fn allocate(request: Request<Body>, allocator: Arc<Allocator>) -> Response<Body> {
    let body = match hyper::body::to_bytes(request.into_body()).await {
        Ok(body) => body,
        Err(error) => return plain(StatusCode::BAD_REQUEST, format!("reading body: {error}")),
    };

    let allocation: AllocationRequest = match serde_json::from_slice(&body) {
        Ok(allocation) => allocation,
        Err(error) => return plain(StatusCode::BAD_REQUEST, format!("invalid request: {error}")),
    };

    match allocator.allocate(allocation).await {
        Ok(gs) => {
            let payload = AllocationResponse {
                name: gs.name().to_owned(),
                game_server_set: gs.set_name().unwrap_or_default().to_owned(),
                node_name: gs.node_name().map(str::to_owned),
                labels: gs.metadata.labels.clone().unwrap_or_default(),
            };
            match serde_json::to_vec(&payload) {
                Ok(body) => Response::builder()
                    .status(StatusCode::OK)
                    .header(
                        hyper::header::CONTENT_TYPE,
                        hyper::header::HeaderValue::from_static("application/json"),
                    )
                    .body(Body::from(body))
                    .unwrap(),
                Err(error) => plain(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("encoding response: {error}"),
                ),
            }
        }
        // Scarcity and contention are deliberately indistinguishable here:
        // both ask the caller for the same backoff-and-retry.
        Err(error) if error.is_exhausted() => {
            plain(StatusCode::TOO_MANY_REQUESTS, "no game servers available, retry later")
        }
        Err(error) => {
            tracing::warn!(%error, "allocation request failed");
            plain(StatusCode::INTERNAL_SERVER_ERROR, "allocation failed")
        }
    }
}

fn plain(status: StatusCode, message: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(message.into());
    *response.status_mut() = status;
    response
}
