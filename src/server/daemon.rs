//! Listener bring-up: binds every `<listen>` block from the configuration,
//! wraps TLS-enabled ones in a `rustls` acceptor with SNI certificate
//! selection, and serves each accepted connection with `hyper`'s low-level
//! connection API (spec §2, §6).

use std::io;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::config::{Encryption, ServerConfig};
use crate::tls::CertStore;

use super::{handle, ServerContext};

/// Bind and serve every configured listener; runs until the process is
/// killed (there is no graceful-shutdown signal in spec scope).
pub async fn run(
    ctx: Arc<ServerContext>,
    config: &ServerConfig,
    cert_store: Option<Arc<CertStore>>,
) -> io::Result<()> {
    if config.listen.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "no <listen> blocks configured"));
    }

    let acceptor = match &cert_store {
        Some(store) => Some(build_tls_acceptor(store.clone())?),
        None => None,
    };

    let mut tasks = Vec::new();
    for listen in &config.listen {
        if listen.encryption == Encryption::Ssl && acceptor.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("listen block on port {} requires ssl but no <ssl-cert> was configured", listen.port),
            ));
        }

        let host = listen.host.clone().unwrap_or_else(|| "0.0.0.0".to_string());
        let addr = format!("{host}:{}", listen.port);
        let tcp = TcpListener::bind(&addr).await?;
        log::info!("listening on {addr} ({})", if listen.encryption == Encryption::Ssl { "https" } else { "http" });

        let ctx = ctx.clone();
        let acceptor = acceptor.clone();
        let ssl = listen.encryption == Encryption::Ssl;
        tasks.push(tokio::spawn(accept_loop(tcp, ctx, acceptor, ssl)));
    }

    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

async fn accept_loop(listener: TcpListener, ctx: Arc<ServerContext>, acceptor: Option<TlsAcceptor>, ssl: bool) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                log::warn!("accept error: {e}");
                continue;
            }
        };
        let ctx = ctx.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            let remote_ip = peer.ip();
            let service = hyper::service::service_fn(move |req| {
                let ctx = ctx.clone();
                async move { Ok::<_, std::convert::Infallible>(handle(ctx, remote_ip, req).await) }
            });

            let result = if ssl {
                match acceptor.expect("ssl listener without an acceptor").accept(stream).await {
                    Ok(tls_stream) => {
                        hyper::server::conn::Http::new().serve_connection(tls_stream, service).await
                    }
                    Err(e) => {
                        log::debug!("tls handshake with {remote_ip} failed: {e}");
                        return;
                    }
                }
            } else {
                hyper::server::conn::Http::new().serve_connection(stream, service).await
            };
            if let Err(e) = result {
                log::debug!("connection from {remote_ip} ended: {e}");
            }
        });
    }
}

fn build_tls_acceptor(cert_store: Arc<CertStore>) -> io::Result<TlsAcceptor> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(cert_store as Arc<dyn rustls::server::ResolvesServerCert>);
    Ok(TlsAcceptor::from(Arc::new(config)))
}
