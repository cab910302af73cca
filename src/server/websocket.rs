use crate::auth::HandshakeInfo;
use crate::cli::Args;
use crate::models::websocket::{ CloseReason, ServerMessage };
use super::session::Session;
use super::ChatContext;

use std::error::Error;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use tokio::io::{ AsyncRead, AsyncWrite };
use tokio::net::TcpListener;
use tokio::sync::{ mpsc, oneshot };

use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ ErrorResponse, Request, Response };
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{ CloseFrame, Message };
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{ accept_hdr_async, WebSocketStream };

use rustls::pki_types::{ CertificateDer, PrivateKeyDer };
use rustls::ServerConfig;
use rustls_pemfile::{ certs, pkcs8_private_keys };

use governor::{ clock::DefaultClock, state::{ InMemoryState, NotKeyed }, Quota, RateLimiter };
use lazy_static::lazy_static;

use futures::{ SinkExt, StreamExt };
use log::{ debug, error, info, warn };

const MAX_FRAME_SIZE: usize = 1 * 1024 * 1024;

lazy_static! {
    static ref CONNECTION_LIMITER: RateLimiter<NotKeyed, InMemoryState, DefaultClock> =
        RateLimiter::direct(Quota::per_second(NonZeroU32::new(10).unwrap()));
}

fn load_tls_config(
    cert_path: &str,
    key_path: &str
) -> Result<Arc<ServerConfig>, Box<dyn Error + Send + Sync>> {
    let cert_file = File::open(cert_path).map_err(|e|
        format!("Failed to open TLS certificate file '{}': {}", cert_path, e)
    )?;
    let key_file = File::open(key_path).map_err(|e|
        format!("Failed to open TLS key file '{}': {}", key_path, e)
    )?;

    let mut cert_reader = BufReader::new(cert_file);
    let mut key_reader = BufReader::new(key_file);
    let cert_chain: Vec<CertificateDer<'static>> = certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| format!("Failed to read certificate(s): {}", e))?;

    let key = match pkcs8_private_keys(&mut key_reader).next() {
        Some(Ok(k)) => PrivateKeyDer::Pkcs8(k),
        Some(Err(e)) => {
            return Err(format!("Error reading private key: {}", e).into());
        }
        None => {
            return Err("No PKCS8 private key found in key file".into());
        }
    };

    let config = ServerConfig::builder().with_no_client_auth().with_single_cert(cert_chain, key)?;
    Ok(Arc::new(config))
}

fn tls_acceptor(args: &Args) -> Result<Option<TlsAcceptor>, Box<dyn Error + Send + Sync>> {
    if !args.enable_tls {
        info!("TLS not enabled. Running plain WebSocket (WS) server.");
        return Ok(None);
    }
    match (&args.tls_cert_path, &args.tls_key_path) {
        (Some(cert_path), Some(key_path)) => {
            info!("TLS enabled. Loading certificate from '{}' and key from '{}'", cert_path, key_path);
            Ok(Some(TlsAcceptor::from(load_tls_config(cert_path, key_path)?)))
        }
        (Some(_), None) | (None, Some(_)) => {
            error!("Both --tls-cert-path and --tls-key-path must be provided to enable TLS.");
            Err("Missing TLS certificate or key path".into())
        }
        (None, None) => {
            error!("--enable-tls was set but no certificate/key paths provided.");
            Err("TLS enabled without cert/key".into())
        }
    }
}

pub async fn start_ws_server(
    addr: &str,
    ctx: Arc<ChatContext>,
    args: Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let tls_acceptor = tls_acceptor(&args)?;
    let listener = TcpListener::bind(addr).await?;
    let protocol = if tls_acceptor.is_some() { "wss" } else { "ws" };
    info!("{} server listening on: {}", protocol.to_uppercase(), addr);

    loop {
        let (stream, peer) = listener.accept().await?;

        if CONNECTION_LIMITER.check().is_err() {
            warn!("Global connection rate limit exceeded for {}. Dropping connection.", peer);
            continue;
        }

        debug!("Incoming connection from: {}", peer);
        let ctx = Arc::clone(&ctx);
        let tls_acceptor = tls_acceptor.clone();

        tokio::spawn(async move {
            let result = match tls_acceptor {
                Some(acceptor) =>
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => process_connection(peer, tls_stream, ctx).await,
                        Err(e) => {
                            error!("TLS handshake error for {}: {}", peer, e);
                            Err(Box::new(e) as Box<dyn Error + Send + Sync>)
                        }
                    }
                None => process_connection(peer, stream, ctx).await,
            };

            if let Err(e) = result {
                error!("Failed to process connection for {}: {}", peer, e);
            }
        });
    }
}

async fn process_connection<S>(
    peer: SocketAddr,
    stream: S,
    ctx: Arc<ChatContext>
) -> Result<(), Box<dyn Error + Send + Sync>>
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    let mut info = HandshakeInfo::default();
    let capture = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        info = HandshakeInfo::from_request(req);
        Ok(response)
    };

    let accepted = accept_hdr_async(stream, capture).await;
    match accepted {
        Ok(ws) => {
            handle_connection(peer, ws, ctx, info).await;
            Ok(())
        }
        Err(e) => {
            error!("Handshake failed for {}: {}", peer, e);
            Err(Box::new(e) as _)
        }
    }
}

pub async fn handle_connection<S>(
    peer: SocketAddr,
    websocket: WebSocketStream<S>,
    ctx: Arc<ChatContext>,
    info: HandshakeInfo
)
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    let (mut tx, mut rx) = websocket.split();
    let identity = ctx.auth.identify(info.token.as_deref());
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(ctx.settings.send_queue.max(1));

    let mut session = match Session::open(ctx.clone(), identity, info.conversation_id, out_tx).await {
        Ok(session) => session,
        Err(reason) => {
            info!("Refusing {} with {} ({})", peer, reason.code(), reason.reason());
            if let Err(e) = tx.send(close_message(reason)).await {
                debug!("Failed to send close frame to {}: {}", peer, e);
            }
            return;
        }
    };
    info!("Connection {} bound to session {} in {}", peer, session.id(), session.conversation_id());

    // Pings from the client are answered by tungstenite itself.
    let (close_tx, mut close_rx) = oneshot::channel::<CloseReason>();
    let writer = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                reason = &mut close_rx => {
                    if let Ok(reason) = reason {
                        if let Err(e) = tx.send(close_message(reason)).await {
                            debug!("Failed to send close frame to {}: {}", peer, e);
                        }
                    }
                    return;
                }
                event = out_rx.recv() => event,
            };
            let Some(event) = event else {
                break;
            };
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize event for {}: {}", peer, e);
                    continue;
                }
            };
            if let Err(e) = tx.send(Message::Text(json)).await {
                debug!("Write to {} failed: {}", peer, e);
                break;
            }
        }
        let _ = tx.close().await;
    });

    let eviction = session.eviction();
    let mut close_tx = Some(close_tx);
    loop {
        let frame = tokio::select! {
            frame = rx.next() => frame,
            _ = eviction.notified() => {
                session.evicted();
                if let Some(close) = close_tx.take() {
                    let _ = close.send(CloseReason::SlowConsumer);
                }
                break;
            }
        };
        let Some(frame) = frame else {
            break;
        };
        match frame {
            Ok(Message::Text(text)) => {
                if text.len() > MAX_FRAME_SIZE {
                    warn!("Frame from {} exceeds size limit ({} > {})", peer, text.len(), MAX_FRAME_SIZE);
                    break;
                }
                session.receive(&text).await;
            }
            Ok(Message::Close(frame)) => {
                debug!("Client {} closed: {:?}", peer, frame);
                break;
            }
            Ok(Message::Binary(_)) => {
                warn!("Ignoring binary frame from {}", peer);
            }
            Ok(_) => {}
            Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                break;
            }
            Err(e) => {
                warn!("WebSocket error from {}: {}", peer, e);
                break;
            }
        }
    }

    session.close();
    drop(session);
    if let Err(e) = writer.await {
        error!("Writer task for {} panicked: {}", peer, e);
    }
    drop(close_tx);
    info!("Connection {} finished", peer);
}

fn close_message(reason: CloseReason) -> Message {
    Message::Close(
        Some(CloseFrame {
            code: CloseCode::from(reason.code()),
            reason: reason.reason().into(),
        })
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refusals_carry_application_codes() {
        match close_message(CloseReason::Forbidden) {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 4003);
                assert_eq!(frame.reason, "forbidden");
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }
}
