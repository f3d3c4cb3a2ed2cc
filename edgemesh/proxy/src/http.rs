use crate::{lb::LoadBalancer, tcp};
use bytes::Bytes;
use edgemesh_core::{split_service_domain, ServiceKey};
use http::{header::HOST, uri::Authority, Request, Response, StatusCode, Uri, Version};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use std::{
    convert::Infallible,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use tokio::net::TcpStream;
use tracing::{debug, info, trace};

pub type ResponseBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Serves HTTP/1 requests from an intercepted connection, forwarding each one to a backend of
/// the service named by its `Host` header.
///
/// Requests that cannot be forwarded are answered with `503 Service Unavailable`; the connection
/// stays open for the next request.
pub async fn serve(
    lb: Arc<LoadBalancer>,
    stream: TcpStream,
    client: SocketAddr,
    key: ServiceKey,
    port: u16,
) {
    let svc = hyper::service::service_fn(move |req| {
        let lb = lb.clone();
        let key = key.clone();
        async move { Ok::<_, Infallible>(forward(&lb, req, client, &key, port).await) }
    });
    let conn = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(stream), svc);
    if let Err(error) = conn.await {
        debug!(%error, "Connection failed");
    }
}

async fn forward(
    lb: &LoadBalancer,
    mut req: Request<Incoming>,
    client: SocketAddr,
    intercepted: &ServiceKey,
    port: u16,
) -> Response<ResponseBody> {
    let version = req.version();
    let host = req.headers().get(HOST).and_then(|h| h.to_str().ok());
    let key = target_service(host, intercepted);
    *req.uri_mut() = origin_form(req.uri());
    trace!(%key, method = %req.method(), uri = %req.uri(), ?version, "Forwarding");

    // A request is sent to at most one backend; it is never retried against another.
    let session = client.ip().to_string();
    let backend = match lb.pick(&key, port, Some(&session)).await {
        Ok(backend) => backend,
        Err(error) => {
            info!(%key, %port, %error, "No backend available");
            return unavailable(version);
        }
    };
    let io = match tcp::connect(backend.addr).await {
        Ok(io) => {
            lb.report(&key, &session, true);
            io
        }
        Err(error) => {
            info!(pod = %backend.pod, addr = %backend.addr, %error, "Failed to connect");
            lb.report(&key, &session, false);
            return unavailable(version);
        }
    };

    let (mut sender, conn) = match hyper::client::conn::http1::handshake(TokioIo::new(io)).await
    {
        Ok(parts) => parts,
        Err(error) => {
            info!(pod = %backend.pod, %error, "Handshake failed");
            lb.report(&key, &session, false);
            return unavailable(version);
        }
    };
    tokio::spawn(async move {
        if let Err(error) = conn.await {
            debug!(%error, "Backend connection failed");
        }
    });

    match sender.send_request(req).await {
        Ok(rsp) => {
            debug!(pod = %backend.pod, status = %rsp.status(), "Forwarded");
            rsp.map(BodyExt::boxed_unsync)
        }
        Err(error) => {
            info!(pod = %backend.pod, %error, "Request failed");
            lb.report(&key, &session, false);
            unavailable(version)
        }
    }
}

/// Names the service a request is addressed to.
///
/// Requests addressed by service name are routed by that name. Requests addressed by IP or
/// without a usable `Host` header go to the service whose synthetic IP was dialed.
fn target_service(host: Option<&str>, intercepted: &ServiceKey) -> ServiceKey {
    let Some(authority) = host.and_then(|h| h.parse::<Authority>().ok()) else {
        return intercepted.clone();
    };
    let host = authority.host();
    if host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>().is_ok() {
        return intercepted.clone();
    }
    split_service_domain(host).unwrap_or_else(|| intercepted.clone())
}

/// Reduces a request target to its path and query, as sent to an origin server.
fn origin_form(uri: &Uri) -> Uri {
    match uri.path_and_query() {
        Some(pq) if pq.as_str().starts_with('/') => Uri::from(pq.clone()),
        _ => Uri::from_static("/"),
    }
}

fn unavailable(version: Version) -> Response<ResponseBody> {
    let body = Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync();
    let mut rsp = Response::new(body);
    *rsp.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
    *rsp.version_mut() = version;
    rsp
}
