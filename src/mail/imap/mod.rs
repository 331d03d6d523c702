//! IMAP implementation of the mail session traits.
//!
//! This module is split into:
//! - `mod.rs` - Stream and authenticator types, connection setup
//! - `client.rs` - Folder, search, fetch and IDLE operations

mod client;

use async_trait::async_trait;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::config::{ProviderConnection, TlsMode};
use crate::credentials::{Credential, Secret};
use crate::error::{SyncError, SyncResult};
use crate::oauth2::xoauth2_payload;

use super::{MailConnector, MailSession};

pub(crate) use client::ImapMailSession;

/// XOAUTH2 authenticator for IMAP
pub(crate) struct XOAuth2Authenticator {
    response: String,
}

impl XOAuth2Authenticator {
    pub fn new(user: &str, access_token: &str) -> Self {
        Self {
            response: xoauth2_payload(user, access_token),
        }
    }
}

impl async_imap::Authenticator for XOAuth2Authenticator {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        // A second challenge carries the server's error details; answering it
        // with an empty line lets the server finish with a tagged NO.
        std::mem::take(&mut self.response)
    }
}

/// Plain or TLS transport under one type so sessions stay monomorphic.
pub(crate) enum ImapStream {
    Tls(Box<TlsStream<TcpStream>>),
    Plain(TcpStream),
}

impl AsyncRead for ImapStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ImapStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            ImapStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl tokio::io::AsyncWrite for ImapStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ImapStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            ImapStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ImapStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            ImapStream::Plain(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ImapStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            ImapStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for ImapStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImapStream::Tls(_) => write!(f, "ImapStream::Tls"),
            ImapStream::Plain(_) => write!(f, "ImapStream::Plain"),
        }
    }
}

pub(crate) type ImapSession = async_imap::Session<ImapStream>;

/// Opens authenticated IMAP sessions over TLS, STARTTLS or plain TCP.
pub struct ImapConnector {
    tls: tokio_rustls::TlsConnector,
}

impl ImapConnector {
    pub fn new() -> anyhow::Result<Self> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();

        Ok(Self {
            tls: tokio_rustls::TlsConnector::from(Arc::new(config)),
        })
    }

    async fn open_stream(&self, provider: &ProviderConnection) -> SyncResult<ImapStream> {
        let server = provider.imap.server.as_str();
        let addr = (server, provider.imap.port);

        let mut tcp = TcpStream::connect(addr).await.map_err(|e| {
            SyncError::TransientNetwork(format!(
                "connect to {}:{} failed: {}",
                server, provider.imap.port, e
            ))
        })?;

        match provider.imap.tls {
            TlsMode::Plain => Ok(ImapStream::Plain(tcp)),
            TlsMode::Tls => self.upgrade(server, tcp).await,
            TlsMode::StartTls => {
                starttls(&mut tcp).await?;
                self.upgrade(server, tcp).await
            }
        }
    }

    async fn upgrade(&self, server: &str, tcp: TcpStream) -> SyncResult<ImapStream> {
        let server_name = rustls::pki_types::ServerName::try_from(server.to_string())
            .map_err(|e| SyncError::Protocol(format!("invalid server name '{}': {}", server, e)))?;
        let tls = self
            .tls
            .connect(server_name, tcp)
            .await
            .map_err(|e| SyncError::TransientNetwork(format!("TLS handshake failed: {}", e)))?;
        Ok(ImapStream::Tls(Box::new(tls)))
    }

    async fn authenticate(
        &self,
        provider: &ProviderConnection,
        credential: &Credential,
    ) -> SyncResult<ImapSession> {
        let stream = self.open_stream(provider).await?;
        let client = async_imap::Client::new(stream);

        let result = match &credential.secret {
            Secret::Password(password) => client
                .login(&credential.username, password)
                .await
                .map_err(|(e, _)| e),
            Secret::Bearer { access_token, .. } => {
                let authenticator = XOAuth2Authenticator::new(&credential.username, access_token);
                client
                    .authenticate("XOAUTH2", authenticator)
                    .await
                    .map_err(|(e, _)| e)
            }
        };

        result.map_err(|e| match e {
            async_imap::error::Error::No(msg) => SyncError::AuthExpired(msg),
            other => SyncError::from(other),
        })
    }
}

/// Issue STARTTLS on a fresh plain connection and wait for the go-ahead.
///
/// The greeting is consumed here, so the IMAP client created on the upgraded
/// stream starts directly with authentication.
async fn starttls(tcp: &mut TcpStream) -> SyncResult<()> {
    let (read, mut write) = tcp.split();
    let mut reader = BufReader::new(read);
    let mut line = String::new();

    reader.read_line(&mut line).await?;
    if !line.starts_with("* OK") {
        return Err(SyncError::Protocol(format!(
            "unexpected greeting: {}",
            line.trim_end()
        )));
    }

    write.write_all(b"a001 STARTTLS\r\n").await?;
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Err(SyncError::TransientNetwork(
                "connection closed during STARTTLS".into(),
            ));
        }
        if line.starts_with('*') {
            continue;
        }
        if line.starts_with("a001 OK") {
            break;
        }
        return Err(SyncError::Protocol(format!(
            "STARTTLS rejected: {}",
            line.trim_end()
        )));
    }

    // Anything buffered past the tagged OK would be plaintext injected ahead
    // of the handshake.
    if !reader.buffer().is_empty() {
        return Err(SyncError::Protocol("data after STARTTLS response".into()));
    }
    Ok(())
}

#[async_trait]
impl MailConnector for ImapConnector {
    async fn connect(
        &self,
        provider: &ProviderConnection,
        credential: &Credential,
        timeout: Duration,
    ) -> SyncResult<Box<dyn MailSession>> {
        let mut session = tokio::time::timeout(timeout, self.authenticate(provider, credential))
            .await
            .map_err(|_| {
                SyncError::TransientNetwork(format!(
                    "connect to {} timed out after {:?}",
                    provider.imap.server, timeout
                ))
            })??;

        let supports_idle = match session.capabilities().await {
            Ok(caps) => caps.has_str("IDLE"),
            Err(e) => {
                tracing::debug!(provider = %provider.id, error = %e, "CAPABILITY failed, assuming no IDLE");
                false
            }
        };

        tracing::info!(
            provider = %provider.id,
            server = %provider.imap.server,
            idle = supports_idle,
            "Connected to IMAP server"
        );

        Ok(Box::new(ImapMailSession::new(session, supports_idle)))
    }
}
