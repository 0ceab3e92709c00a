use admit_limit::ClientIdentity;

/// Derives the [`ClientIdentity`] a request is limited under.
pub trait Identify<Req> {
    fn identify(&self, req: &Req) -> ClientIdentity;
}

impl<F, Req> Identify<Req> for F
where
    F: Fn(&Req) -> ClientIdentity,
{
    fn identify(&self, req: &Req) -> ClientIdentity {
        self(req)
    }
}

/// Identifies HTTP callers by their real IP address.
///
/// Checks, in order, the first hop of `X-Forwarded-For`, `X-Real-IP`, and the
/// peer address recorded by axum's `ConnectInfo`. Requests that carry none of
/// these share the `"unknown"` identity.
#[cfg(feature = "axum")]
#[derive(Debug, Clone, Copy, Default)]
pub struct RealIp;

#[cfg(feature = "axum")]
impl<B> Identify<http::Request<B>> for RealIp {
    fn identify(&self, req: &http::Request<B>) -> ClientIdentity {
        use std::net::IpAddr;
        use std::net::SocketAddr;

        use axum::extract::ConnectInfo;

        let header_ip = |name: &str, first_hop: bool| -> Option<IpAddr> {
            let value = req.headers().get(name)?.to_str().ok()?;
            let candidate = if first_hop {
                value.split(',').next()?
            } else {
                value
            };
            candidate.trim().parse().ok()
        };

        header_ip("x-forwarded-for", true)
            .or_else(|| header_ip("x-real-ip", false))
            .or_else(|| {
                req.extensions()
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip())
            })
            .map(ClientIdentity::from)
            .unwrap_or_else(|| ClientIdentity::from("unknown"))
    }
}
