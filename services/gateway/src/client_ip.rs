//! Client IP extraction for connection-admission rate limiting.
//!
//! Priority: `X-Forwarded-For` (first IP) -> `X-Real-IP` -> the socket's
//! actual peer address from `ConnectInfo`. Unlike a bare reverse-proxy
//! header read, the fallback here is the real connection IP rather than
//! a hardcoded loopback address, since the gateway is also reachable
//! directly in deployments without a fronting proxy.

use std::net::{IpAddr, SocketAddr};

use axum::extract::connect_info::ConnectInfo;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

#[derive(Debug, Clone, Copy)]
pub struct ClientIp(pub IpAddr);

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if let Some(ip) = header_ip(parts, "x-forwarded-for").and_then(first_forwarded_ip) {
            return Ok(Self(ip));
        }
        if let Some(ip) = header_ip(parts, "x-real-ip").and_then(|v| v.trim().parse().ok()) {
            return Ok(Self(ip));
        }
        let connect_info = ConnectInfo::<SocketAddr>::from_request_parts(parts, state)
            .await
            .ok();
        let ip = connect_info
            .map(|ConnectInfo(addr)| addr.ip())
            .unwrap_or_else(|| "127.0.0.1".parse().unwrap());
        Ok(Self(ip))
    }
}

fn header_ip<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok())
}

fn first_forwarded_ip(value: &str) -> Option<IpAddr> {
    value.split(',').next()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(req: Request<()>) -> ClientIp {
        let (mut parts, _) = req.into_parts();
        ClientIp::from_request_parts(&mut parts, &()).await.unwrap()
    }

    #[tokio::test]
    async fn prefers_x_forwarded_for_first_hop() {
        let req = Request::builder()
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(())
            .unwrap();
        assert_eq!(extract(req).await.0.to_string(), "203.0.113.7");
    }

    #[tokio::test]
    async fn falls_back_to_x_real_ip() {
        let req = Request::builder()
            .header("x-real-ip", "198.51.100.9")
            .body(())
            .unwrap();
        assert_eq!(extract(req).await.0.to_string(), "198.51.100.9");
    }

    #[tokio::test]
    async fn falls_back_to_loopback_with_no_connect_info() {
        let req = Request::builder().body(()).unwrap();
        assert_eq!(extract(req).await.0.to_string(), "127.0.0.1");
    }
}
