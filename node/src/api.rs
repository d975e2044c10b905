use std::convert::Infallible;
use std::net::SocketAddr;

use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{body::Bytes, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;

use crate::network_client::NetworkClient;
use crate::node::ChordNode;

fn format_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

fn not_found() -> Response<Full<Bytes>> {
    format_response(
        StatusCode::NOT_FOUND,
        json!({ "error": "Not Found" }).to_string(),
    )
}

fn ping() -> Response<Full<Bytes>> {
    let response_body = json!({ "message": "pong" }).to_string();
    format_response(StatusCode::OK, response_body)
}

fn ring<T: NetworkClient>(node: &ChordNode<T>) -> Response<Full<Bytes>> {
    match serde_json::to_string(&node.ring_snapshot()) {
        Ok(body) => format_response(StatusCode::OK, body),
        Err(e) => format_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": e.to_string() }).to_string(),
        ),
    }
}

pub(crate) fn respond<T: NetworkClient>(
    node: &ChordNode<T>,
    method: &Method,
    path: &str,
) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/ping") => ping(),
        (&Method::GET, "/ring") => ring(node),
        _ => not_found(),
    }
}

/// Serves the read-only status API until the listener fails.
pub async fn run<T: NetworkClient>(
    addr: SocketAddr,
    node: ChordNode<T>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;

    log_info!(node.info.address, "API is listening on http://{}", addr);
    loop {
        let (tcp, _) = listener.accept().await?;
        let io = TokioIo::new(tcp);
        let node = node.clone();
        tokio::task::spawn(async move {
            let service_node = node.clone();
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let response = respond(&service_node, req.method(), req.uri().path());
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                log_debug!(node.info.address, "Error serving connection: {:?}", err);
            }
        });
    }
}
