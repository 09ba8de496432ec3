//! SOCKS5 front-end (RFC 1928): no-auth, CONNECT only.
//!
//! Domain targets are resolved locally through the tunneled resolver, so
//! the remote only ever sees IP destinations from this front-end.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

// ---

use anyhow::{bail, ensure, Context};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

// ---

use burrow_domain::Target;

use super::super::{DnsResolver, SessionError};
use super::{relay, DialError, TunnelDialer, SESSION_LIFETIME};

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;

const ATYP_V4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V6: u8 = 0x04;

// ---------------------------------------------------------------------------
// Reply
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    HostUnreachable = 0x04,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

// ---

impl Reply {
    // ---
    fn for_dial_error(e: &DialError) -> Self {
        match e {
            DialError::Ipv6Rejected => Reply::NotAllowed,
            DialError::Timeout(_)
            | DialError::Session(SessionError::Refused(_))
            | DialError::Session(SessionError::InvalidTarget(_)) => Reply::HostUnreachable,
            DialError::Session(_) => Reply::GeneralFailure,
        }
    }
}

// ---

async fn send_reply<S: AsyncWrite + Unpin>(stream: &mut S, reply: Reply) -> std::io::Result<()> {
    // Bound address is always reported as 0.0.0.0:0.
    stream
        .write_all(&[VERSION, reply as u8, 0x00, ATYP_V4, 0, 0, 0, 0, 0, 0])
        .await
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Accept SOCKS5 clients on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    dialer: Arc<TunnelDialer>,
    resolver: Arc<DnsResolver>,
    shutdown: CancellationToken,
) {
    // ---
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(listen = %addr, "SOCKS5 proxy listening");
    }

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = listener.accept() => res,
        };

        let (stream, peer) = match accepted {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("SOCKS5 accept failed: {e}");
                continue;
            }
        };

        let dialer = Arc::clone(&dialer);
        let resolver = Arc::clone(&resolver);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                res = handle(stream, &dialer, &resolver) => {
                    if let Err(e) = res {
                        tracing::debug!(%peer, "SOCKS5 session: {e:#}");
                    }
                }
            }
        });
    }

    tracing::info!("SOCKS5 proxy stopped");
}

// ---

/// Serve one client connection end to end.
pub(crate) async fn handle<S>(
    mut stream: S,
    dialer: &TunnelDialer,
    resolver: &DnsResolver,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ---
    negotiate(&mut stream).await?;

    let dest = match read_request(&mut stream, resolver).await {
        Ok(dest) => dest,
        Err((reply, e)) => {
            send_reply(&mut stream, reply).await?;
            return Err(e);
        }
    };

    let mut upstream = match dialer.dial(&dest).await {
        Ok(conn) => conn,
        Err(e) => {
            send_reply(&mut stream, Reply::for_dial_error(&e)).await?;
            return Err(e).with_context(|| format!("dial {dest}"));
        }
    };

    send_reply(&mut stream, Reply::Succeeded).await?;
    tracing::debug!(%dest, "SOCKS5 CONNECT");

    relay(&mut stream, &mut upstream, SESSION_LIFETIME).await;
    Ok(())
}

// ---

/// Greeting and method selection. Only "no authentication" is offered.
async fn negotiate<S>(stream: &mut S) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ---
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    ensure!(head[0] == VERSION, "not SOCKS5 (version {})", head[0]);

    let mut methods = vec![0u8; usize::from(head[1])];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[VERSION, METHOD_NONE_ACCEPTABLE]).await?;
        bail!("client offers no acceptable auth method");
    }
    stream.write_all(&[VERSION, METHOD_NO_AUTH]).await?;
    Ok(())
}

// ---

/// Read the CONNECT request. On failure returns the reply to send.
async fn read_request<S>(
    stream: &mut S,
    resolver: &DnsResolver,
) -> Result<Target, (Reply, anyhow::Error)>
where
    S: AsyncRead + Unpin,
{
    // ---
    let io = |e: std::io::Error| (Reply::GeneralFailure, anyhow::Error::from(e));

    let mut hdr = [0u8; 4];
    stream.read_exact(&mut hdr).await.map_err(io)?;
    if hdr[0] != VERSION {
        return Err((
            Reply::GeneralFailure,
            anyhow::anyhow!("bad request version {}", hdr[0]),
        ));
    }
    if hdr[1] != CMD_CONNECT {
        return Err((
            Reply::CommandNotSupported,
            anyhow::anyhow!("only CONNECT supported, got command {}", hdr[1]),
        ));
    }

    let ip = match hdr[3] {
        ATYP_V4 => {
            let mut a = [0u8; 4];
            stream.read_exact(&mut a).await.map_err(io)?;
            IpAddr::V4(Ipv4Addr::from(a))
        }
        ATYP_V6 => {
            let mut a = [0u8; 16];
            stream.read_exact(&mut a).await.map_err(io)?;
            IpAddr::V6(Ipv6Addr::from(a))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(io)?;
            let mut name = vec![0u8; usize::from(len[0])];
            stream.read_exact(&mut name).await.map_err(io)?;
            let name = String::from_utf8(name)
                .map_err(|e| (Reply::GeneralFailure, anyhow::Error::from(e)))?;

            // port follows the name; read it before resolving
            let port = read_port(stream).await.map_err(io)?;
            let ip = resolver
                .resolve(&name)
                .await
                .map_err(|e| (Reply::HostUnreachable, e))?;
            return Ok(Target::new(ip.to_string(), port));
        }
        other => {
            return Err((
                Reply::AddressTypeNotSupported,
                anyhow::anyhow!("unsupported address type {other}"),
            ));
        }
    };

    let port = read_port(stream).await.map_err(io)?;
    Ok(Target::new(ip.to_string(), port))
}

// ---

async fn read_port<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<u16> {
    let mut p = [0u8; 2];
    stream.read_exact(&mut p).await?;
    Ok(u16::from_be_bytes(p))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::super::super::DnsResolver;
    use super::super::tests::sim_dialer;
    use super::handle;

    // ---

    async fn greet(client: &mut DuplexStream) {
        // ---
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut sel = [0u8; 2];
        client.read_exact(&mut sel).await.unwrap();
        assert_eq!(sel, [0x05, 0x00]);
    }

    async fn reply_code(client: &mut DuplexStream) -> u8 {
        // ---
        let mut rep = [0u8; 10];
        client.read_exact(&mut rep).await.unwrap();
        assert_eq!(rep[0], 0x05);
        rep[1]
    }

    // ---

    #[tokio::test]
    async fn connect_ipv4_relays_through_tunnel() {
        // ---
        let (dialer, counters) = sim_dialer().await;
        let resolver = DnsResolver::new(vec![], false).unwrap();
        let (mut client, server) = tokio::io::duplex(1024);

        let session = tokio::spawn(async move { handle(server, &dialer, &resolver).await });

        greet(&mut client).await;
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x01, 0xBB])
            .await
            .unwrap();
        assert_eq!(reply_code(&mut client).await, 0x00);

        client.write_all(b"hello").await.unwrap();
        let mut echo = [0u8; 5];
        client.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"hello");
        assert_eq!(counters.open_conns(), 1);

        drop(client);
        session.await.unwrap().unwrap();
        assert_eq!(counters.open_conns(), 0);
    }

    // ---

    #[tokio::test]
    async fn bind_command_is_not_supported() {
        // ---
        let (dialer, _) = sim_dialer().await;
        let resolver = DnsResolver::new(vec![], false).unwrap();
        let (mut client, server) = tokio::io::duplex(1024);
        let session = tokio::spawn(async move { handle(server, &dialer, &resolver).await });

        greet(&mut client).await;
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        assert_eq!(reply_code(&mut client).await, 0x07);
        assert!(session.await.unwrap().is_err());
    }

    // ---

    #[tokio::test]
    async fn unknown_address_type_is_rejected() {
        // ---
        let (dialer, _) = sim_dialer().await;
        let resolver = DnsResolver::new(vec![], false).unwrap();
        let (mut client, server) = tokio::io::duplex(1024);
        let session = tokio::spawn(async move { handle(server, &dialer, &resolver).await });

        greet(&mut client).await;
        client.write_all(&[0x05, 0x01, 0x00, 0x09]).await.unwrap();
        assert_eq!(reply_code(&mut client).await, 0x08);
        assert!(session.await.unwrap().is_err());
    }

    // ---

    #[tokio::test]
    async fn ipv6_target_is_not_allowed_by_default() {
        // ---
        let (dialer, _) = sim_dialer().await;
        let resolver = DnsResolver::new(vec![], false).unwrap();
        let (mut client, server) = tokio::io::duplex(1024);
        let session = tokio::spawn(async move { handle(server, &dialer, &resolver).await });

        greet(&mut client).await;
        let mut req = vec![0x05, 0x01, 0x00, 0x04];
        req.extend_from_slice(&"2001:db8::1".parse::<std::net::Ipv6Addr>().unwrap().octets());
        req.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        assert_eq!(reply_code(&mut client).await, 0x02);
        assert!(session.await.unwrap().is_err());
    }

    // ---

    #[tokio::test]
    async fn domain_literal_ip_is_accepted() {
        // ---
        let (dialer, _) = sim_dialer().await;
        let resolver = DnsResolver::new(vec![], false).unwrap();
        let (mut client, server) = tokio::io::duplex(1024);
        let session = tokio::spawn(async move { handle(server, &dialer, &resolver).await });

        greet(&mut client).await;
        let name = b"10.9.8.7";
        let mut req = vec![0x05, 0x01, 0x00, 0x03, name.len() as u8];
        req.extend_from_slice(name);
        req.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        assert_eq!(reply_code(&mut client).await, 0x00);
        drop(client);
        session.await.unwrap().unwrap();
    }

    // ---

    #[tokio::test]
    async fn auth_only_clients_are_turned_away() {
        // ---
        let (dialer, _) = sim_dialer().await;
        let resolver = DnsResolver::new(vec![], false).unwrap();
        let (mut client, server) = tokio::io::duplex(1024);
        let session = tokio::spawn(async move { handle(server, &dialer, &resolver).await });

        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut sel = [0u8; 2];
        client.read_exact(&mut sel).await.unwrap();
        assert_eq!(sel, [0x05, 0xFF]);
        assert!(session.await.unwrap().is_err());
    }
}
