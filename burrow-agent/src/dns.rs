//! Name resolution: bootstrap lookup for the SSH server itself, and
//! DNS-over-HTTPS (JSON flavour) tunneled through the session for
//! everything the proxies resolve.
//!
//! Each query is one HTTP/1.1 GET over TLS:
//!
//! ```text
//! GET /dns-query?name=example.com&type=A
//! accept: application/dns-json
//! ```

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

// ---

use anyhow::{anyhow, bail, Context};
use bytes::Bytes;
use http::header::{ACCEPT, HOST};
use http::{Request, StatusCode, Uri};
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

// ---

use burrow_domain::Target;

use super::proxy::TunnelDialer;

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_NAME_LEN: usize = 253;

// ---------------------------------------------------------------------------
// RecordType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
    Aaaa,
}

// ---

impl RecordType {
    // ---
    fn as_str(self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
        }
    }

    // ---

    /// Numeric RR type in the JSON answer section.
    fn code(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Aaaa => 28,
        }
    }
}

// ---------------------------------------------------------------------------
// DohServer
// ---------------------------------------------------------------------------

/// One DoH endpoint, parsed from an `https://host[:port]/path` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DohServer {
    // ---
    pub target: Target,
    pub path: String,
}

// ---

impl DohServer {
    // ---
    pub fn parse(url: &str) -> anyhow::Result<Self> {
        // ---
        let uri: Uri = url.parse().with_context(|| format!("bad DoH url {url:?}"))?;
        if uri.scheme_str() != Some("https") {
            bail!("DoH url {url:?} must be https");
        }
        let host = uri
            .host()
            .ok_or_else(|| anyhow!("DoH url {url:?} has no host"))?;
        let port = uri.port_u16().unwrap_or(443);
        let path = match uri.path() {
            "" => "/".to_string(),
            p => p.to_string(),
        };
        Ok(Self {
            target: Target::new(host, port),
            path,
        })
    }

    // ---

    fn query_uri(&self, name: &str, rtype: RecordType) -> anyhow::Result<String> {
        // ---
        check_query_name(name)?;
        Ok(format!("{}?name={}&type={}", self.path, name, rtype.as_str()))
    }
}

// ---------------------------------------------------------------------------
// JSON answer
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DohResponse {
    // ---
    #[serde(rename = "Status")]
    status: u32,

    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    // ---
    #[serde(rename = "type")]
    rtype: u16,
    data: String,
}

// ---

/// Addresses of type `rtype` in a `application/dns-json` body. CNAME and
/// other records in the answer section are skipped.
pub fn parse_answer(body: &[u8], rtype: RecordType) -> anyhow::Result<Vec<IpAddr>> {
    // ---
    let resp: DohResponse = serde_json::from_slice(body).context("malformed DoH JSON")?;
    if resp.status != 0 {
        bail!("DoH status {}", resp.status);
    }
    Ok(resp
        .answer
        .iter()
        .filter(|a| a.rtype == rtype.code())
        .filter_map(|a| a.data.parse::<IpAddr>().ok())
        .collect())
}

// ---------------------------------------------------------------------------
// DnsResolver
// ---------------------------------------------------------------------------

pub struct DnsResolver {
    // ---
    servers: Vec<DohServer>,
    allow_v6: bool,
    tls: TlsConnector,

    /// Set once the session is up; `resolve` dials servers through it.
    dialer: Option<Arc<TunnelDialer>>,
}

// ---

impl DnsResolver {
    // ---
    pub fn new(servers: Vec<DohServer>, allow_v6: bool) -> anyhow::Result<Self> {
        // ---
        Ok(Self {
            servers,
            allow_v6,
            tls: tls_connector()?,
            dialer: None,
        })
    }

    // ---

    /// Resolver whose queries travel through `dialer`, and so show up in
    /// the traffic counters like any proxied connection.
    pub fn tunneled(&self, dialer: Arc<TunnelDialer>) -> Self {
        Self {
            servers: self.servers.clone(),
            allow_v6: self.allow_v6,
            tls: self.tls.clone(),
            dialer: Some(dialer),
        }
    }

    // ---

    /// Resolve the SSH server name before any session exists: the system
    /// resolver first, then direct DoH against each server in order.
    pub async fn resolve_boot(&self, host: &str) -> anyhow::Result<IpAddr> {
        // ---
        if let Ok(ip) = host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
            return Ok(ip);
        }

        match tokio::net::lookup_host((host, 0)).await {
            Ok(addrs) => {
                if let Some(ip) = addrs.map(|a| a.ip()).find(|ip| self.accepts(ip)) {
                    return Ok(ip);
                }
            }
            Err(e) => tracing::debug!(%host, "system resolver failed: {e}"),
        }

        self.resolve_with(host, |server| async move {
            let tcp = TcpStream::connect((server.target.host.as_str(), server.target.port)).await?;
            anyhow::Ok(tcp)
        })
        .await
    }

    // ---

    /// Resolve through the tunnel (or directly, before a session exists).
    pub async fn resolve(&self, host: &str) -> anyhow::Result<IpAddr> {
        // ---
        if let Ok(ip) = host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
            return Ok(ip);
        }

        let Some(dialer) = self.dialer.clone() else {
            return self.resolve_boot(host).await;
        };

        self.resolve_with(host, move |server| {
            let dialer = Arc::clone(&dialer);
            async move {
                let conn = dialer.dial(&server.target).await?;
                anyhow::Ok(conn)
            }
        })
        .await
    }

    // ---

    fn accepts(&self, ip: &IpAddr) -> bool {
        self.allow_v6 || ip.is_ipv4()
    }

    // ---

    fn record_types(&self) -> &'static [RecordType] {
        // ---
        if self.allow_v6 {
            &[RecordType::A, RecordType::Aaaa]
        } else {
            &[RecordType::A]
        }
    }

    // ---

    /// Try each server in order until one yields an address. `connect`
    /// opens a fresh byte stream to a server for every query.
    async fn resolve_with<F, Fut, S>(&self, host: &str, connect: F) -> anyhow::Result<IpAddr>
    where
        F: Fn(DohServer) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<S>>,
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        // ---
        check_query_name(host)?;
        let mut last = anyhow!("no DoH servers configured");

        for server in &self.servers {
            for &rtype in self.record_types() {
                let attempt = async {
                    let io = connect(server.clone()).await?;
                    let tls = self.tls_handshake(io, &server.target.host).await?;
                    query(tls, server, host, rtype).await
                };
                match tokio::time::timeout(QUERY_TIMEOUT, attempt).await {
                    Ok(Ok(ips)) => {
                        if let Some(ip) = ips.into_iter().find(|ip| self.accepts(ip)) {
                            tracing::trace!(%host, %ip, server = %server.target, "resolved");
                            return Ok(ip);
                        }
                        last = anyhow!("{host}: no {} records", rtype.as_str());
                    }
                    Ok(Err(e)) => {
                        tracing::debug!(%host, server = %server.target, "DoH query failed: {e:#}");
                        last = e;
                    }
                    Err(_) => {
                        last = anyhow!("DoH query to {} timed out", server.target);
                    }
                }
            }
        }

        Err(last.context(format!("resolve {host}")))
    }

    // ---

    async fn tls_handshake<S>(
        &self,
        io: S,
        host: &str,
    ) -> anyhow::Result<tokio_rustls::client::TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // ---
        let name = ServerName::try_from(host.to_string())
            .with_context(|| format!("invalid TLS server name {host:?}"))?;
        let tls = self.tls.connect(name, io).await.context("TLS handshake")?;
        Ok(tls)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Only plain host names go into the query string; anything that would need
/// escaping is refused.
fn check_query_name(name: &str) -> anyhow::Result<()> {
    // ---
    let plain = name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_'));
    if name.is_empty() || name.len() > MAX_NAME_LEN || !plain {
        bail!("not a resolvable host name: {name:?}");
    }
    Ok(())
}

// ---

fn tls_connector() -> anyhow::Result<TlsConnector> {
    // ---
    let roots = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("TLS protocol versions")?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

// ---

/// One DoH JSON GET over an already-established (TLS) stream.
async fn query<S>(
    io: S,
    server: &DohServer,
    name: &str,
    rtype: RecordType,
) -> anyhow::Result<Vec<IpAddr>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // ---
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .context("DoH HTTP handshake")?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::trace!("DoH connection ended: {e}");
        }
    });

    let req = Request::get(server.query_uri(name, rtype)?)
        .header(HOST, server.target.host.as_str())
        .header(ACCEPT, "application/dns-json")
        .body(Empty::<Bytes>::new())?;

    let resp = sender.send_request(req).await.context("DoH request")?;
    if resp.status() != StatusCode::OK {
        bail!("DoH server answered {}", resp.status());
    }
    let body = resp.into_body().collect().await?.to_bytes();
    parse_answer(&body, rtype)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::net::{IpAddr, Ipv4Addr};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::super::proxy::tests::sim_dialer;
    use super::{parse_answer, query, DnsResolver, DohServer, RecordType};

    // ---

    const CLOUDFLARE: &str = r#"{
        "Status": 0, "TC": false, "RD": true, "RA": true,
        "Question": [{"name": "example.com", "type": 1}],
        "Answer": [
            {"name": "www.example.com", "type": 5, "TTL": 60, "data": "example.com."},
            {"name": "example.com", "type": 1, "TTL": 300, "data": "93.184.216.34"}
        ]
    }"#;

    #[test]
    fn parses_a_records_and_skips_cname() {
        // ---
        let ips = parse_answer(CLOUDFLARE.as_bytes(), RecordType::A).unwrap();
        assert_eq!(ips, vec![IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))]);
        assert!(parse_answer(CLOUDFLARE.as_bytes(), RecordType::Aaaa)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn nxdomain_and_garbage_are_errors() {
        // ---
        assert!(parse_answer(br#"{"Status": 3}"#, RecordType::A).is_err());
        assert!(parse_answer(b"<html>", RecordType::A).is_err());
        assert!(parse_answer(br#"{"Status": 0}"#, RecordType::A)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn server_urls_parse() {
        // ---
        let s = DohServer::parse("https://1.1.1.1/dns-query").unwrap();
        assert_eq!(s.target.host, "1.1.1.1");
        assert_eq!(s.target.port, 443);
        assert_eq!(s.path, "/dns-query");
        assert_eq!(
            s.query_uri("example.com", RecordType::Aaaa).unwrap(),
            "/dns-query?name=example.com&type=AAAA"
        );

        let s = DohServer::parse("https://dns.example:8443/resolve").unwrap();
        assert_eq!(s.target.port, 8443);
        assert!(DohServer::parse("http://1.1.1.1/dns-query").is_err());
    }

    #[tokio::test]
    async fn ip_literals_pass_through() {
        // ---
        let r = DnsResolver::new(vec![], false).unwrap();
        assert_eq!(
            r.resolve("10.1.2.3").await.unwrap(),
            IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))
        );
        assert!(r.resolve("[::1]").await.unwrap().is_ipv6());
    }

    /// The HTTP leg of a query, against a canned server on an in-memory pipe.
    #[tokio::test]
    async fn query_speaks_doh_json() {
        // ---
        let (client, mut server) = tokio::io::duplex(4096);
        let doh = DohServer::parse("https://1.1.1.1/dns-query").unwrap();

        let fake = tokio::spawn(async move {
            let mut req = Vec::new();
            let mut buf = [0u8; 512];
            while !req.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = server.read(&mut buf).await.unwrap();
                req.extend_from_slice(&buf[..n]);
            }
            let body = CLOUDFLARE.as_bytes();
            let head = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/dns-json\r\ncontent-length: {}\r\n\r\n",
                body.len()
            );
            server.write_all(head.as_bytes()).await.unwrap();
            server.write_all(body).await.unwrap();
            String::from_utf8(req).unwrap()
        });

        let ips = query(client, &doh, "example.com", RecordType::A).await.unwrap();
        assert_eq!(ips, vec![IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))]);

        let req = fake.await.unwrap().to_ascii_lowercase();
        assert!(req.starts_with("get /dns-query?name=example.com&type=a http/1.1"));
        assert!(req.contains("accept: application/dns-json"));
    }

    // ---

    #[test]
    fn query_names_with_url_syntax_are_refused() {
        // ---
        let s = DohServer::parse("https://1.1.1.1/dns-query").unwrap();
        assert!(s.query_uri("_dmarc.example.com", RecordType::A).is_ok());

        for bad in ["a.com&type=MX", "evil#frag", "a b.com", "a.com/x", "", "caf\u{e9}.fr"] {
            assert!(s.query_uri(bad, RecordType::A).is_err(), "{bad:?}");
        }
        assert!(s.query_uri(&"a".repeat(254), RecordType::A).is_err());
    }

    // ---

    #[tokio::test]
    async fn refused_names_never_reach_a_server() {
        // ---
        let (dialer, counters) = sim_dialer().await;
        let servers = vec![DohServer::parse("https://1.1.1.1/dns-query").unwrap()];
        let r = DnsResolver::new(servers, false).unwrap().tunneled(dialer);

        assert!(r.resolve("a.com&type=MX").await.is_err());
        assert_eq!(counters.swap_bytes(), 0);
    }

    // ---

    /// Tunneled queries dial through the proxy dialer, so their bytes and
    /// connections are counted. The simulated far end echoes, so the TLS
    /// handshake fails once the dial has gone through.
    #[tokio::test]
    async fn tunneled_queries_use_the_dialer() {
        // ---
        let (dialer, counters) = sim_dialer().await;
        let servers = vec![DohServer::parse("https://1.1.1.1/dns-query").unwrap()];
        let r = DnsResolver::new(servers, false).unwrap().tunneled(dialer);

        assert!(r.resolve("example.com").await.is_err());
        assert!(counters.swap_bytes() > 0);
        assert_eq!(counters.open_conns(), 0);
    }
}
