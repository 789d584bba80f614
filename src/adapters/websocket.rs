use std::time::Duration;

use axum::body::Body as AxumBody;
use hyper::{
    HeaderMap, Request, Response, StatusCode, Uri,
    header::{CONNECTION, UPGRADE},
    upgrade::OnUpgrade,
};
use hyper_util::rt::TokioIo;
use tokio::{
    io::{AsyncWriteExt, copy, split},
    net::TcpStream,
    time::timeout,
};

use crate::{adapters::http_handler::text_response, core::Backend};

/// Whether the request asks for a websocket upgrade.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    let upgrade_websocket = headers
        .get(UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("websocket"));
    connection_upgrade && upgrade_websocket
}

/// Proxy an upgrade request over a dedicated backend connection.
///
/// The backend's answer is relayed to the client. When it is `101 Switching
/// Protocols`, both connections are handed to a background task that copies bytes
/// in each direction until either side closes or fails.
pub async fn proxy_upgrade(
    mut req: Request<AxumBody>,
    backend: &Backend,
    dial_timeout: Duration,
) -> Response<AxumBody> {
    let Some(client_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
        tracing::error!("Connection cannot be upgraded");
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "cannot hijack writer");
    };

    let stream = match timeout(dial_timeout, TcpStream::connect(backend.host())).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::error!(backend = %backend.id(), error = %e, "Websocket dial failed");
            return text_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "couldn't connect to backend server",
            );
        }
        Err(_) => {
            tracing::error!(backend = %backend.id(), "Websocket dial timed out");
            return text_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "couldn't connect to backend server",
            );
        }
    };

    let (mut sender, connection) =
        match hyper::client::conn::http1::handshake::<_, AxumBody>(TokioIo::new(stream)).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(backend = %backend.id(), error = %e, "Websocket handshake failed");
                return text_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "couldn't connect to backend server",
                );
            }
        };
    tokio::spawn(async move {
        if let Err(e) = connection.with_upgrades().await {
            tracing::debug!("Websocket backend connection ended: {}", e);
        }
    });

    // The dedicated connection takes origin-form targets
    let origin_form = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .parse::<Uri>();
    if let Ok(uri) = origin_form {
        *req.uri_mut() = uri;
    }

    let mut response = match sender.send_request(req).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(backend = %backend.id(), error = %e, "Websocket request failed");
            return text_response(StatusCode::SERVICE_UNAVAILABLE, "Error processing request.");
        }
    };

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return response.map(AxumBody::new);
    }

    let backend_upgrade = hyper::upgrade::on(&mut response);
    let backend_id = backend.id().to_string();
    tokio::spawn(relay(client_upgrade, backend_upgrade, backend_id));

    response.map(|_| AxumBody::empty())
}

/// Copy bytes both ways until the first direction finishes, then close both sides.
async fn relay(client: OnUpgrade, backend: OnUpgrade, backend_id: String) {
    let (client, backend) = match tokio::try_join!(client, backend) {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(backend = %backend_id, error = %e, "Websocket upgrade failed");
            return;
        }
    };

    let (mut client_read, mut client_write) = split(TokioIo::new(client));
    let (mut backend_read, mut backend_write) = split(TokioIo::new(backend));

    let (direction, result) = tokio::select! {
        result = copy(&mut client_read, &mut backend_write) => ("client to backend", result),
        result = copy(&mut backend_read, &mut client_write) => ("backend to client", result),
    };
    match result {
        Ok(bytes) => tracing::debug!(backend = %backend_id, bytes, "Websocket {} closed", direction),
        Err(e) => tracing::debug!(backend = %backend_id, error = %e, "Websocket {} failed", direction),
    }

    let _ = client_write.shutdown().await;
    let _ = backend_write.shutdown().await;
}
