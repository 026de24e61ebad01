use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::dispatch::Dispatcher;
use crate::error::{RpcError, SessionError};
use crate::protocol::{
    encode_response, parse_request, RpcRequest, RpcResponse, CMD_CLOSE_SESSION, CMD_HANDSHAKE,
    CMD_HELP,
};

#[derive(Clone, Debug, Default)]
pub struct ServerOptions {
    /// When set, the first request of every session must be a `handshake`
    /// carrying this value.
    pub secret: Option<String>,
}

/// Accepts connections and runs one request loop per connection.
#[derive(Debug)]
pub struct SessionServer {
    dispatcher: Arc<Dispatcher>,
    options: ServerOptions,
    shutdown: CancellationToken,
    next_session: AtomicU64,
}

impl SessionServer {
    pub fn new(dispatcher: Arc<Dispatcher>, options: ServerOptions) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            options,
            shutdown: CancellationToken::new(),
            next_session: AtomicU64::new(1),
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Cancelled when the server stops, either through `closeSession` or
    /// [`SessionServer::shutdown`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Serves until shut down. Open sessions are aborted on return.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        let addr = listener.local_addr()?;
        log::info!("session_server: listen on <{}>", addr);

        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    break;
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let session_id = self.next_session.fetch_add(1, Ordering::SeqCst);
                        log::info!("session_server: session {} from <{}>", session_id, peer);
                        let server = Arc::clone(&self);
                        sessions.spawn(async move {
                            if let Err(err) = server.run_session(session_id, stream).await {
                                log::warn!("session_server: {}", err);
                            }
                            log::debug!("session_server: session {} closed", session_id);
                        });
                    }
                    Err(err) => {
                        log::warn!("session_server: accept on <{}> failed: {}", addr, err);
                    }
                },

                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }

        sessions.shutdown().await;
        log::info!("session_server: stopped listening on <{}>", addr);
        Ok(())
    }

    /// Runs the request loop of one session until EOF, `closeSession`, a
    /// malformed line, or server shutdown.
    pub async fn run_session<S>(&self, session_id: u64, stream: S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(reader).lines();
        let mut authenticated = self.options.secret.is_none();

        loop {
            let line = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else { break };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let request = parse_request(line).map_err(|err| SessionError::Protocol {
                session_id,
                message: err.to_string(),
            })?;

            if !authenticated {
                if request.method == CMD_HANDSHAKE && self.secret_matches(&request) {
                    authenticated = true;
                    let response = handshake_response(request.id, session_id);
                    write_response(&mut writer, &response).await?;
                    continue;
                }
                let response = RpcResponse::error(request.id, "handshake rejected");
                write_response(&mut writer, &response).await?;
                let _ = writer.shutdown().await;
                return Err(SessionError::Handshake { session_id });
            }

            match request.method.as_str() {
                CMD_HELP => {
                    let help = self.dispatcher.registry().help_text();
                    write_response(&mut writer, &RpcResponse::result(request.id, json!(help)))
                        .await?;
                }
                CMD_HANDSHAKE => {
                    write_response(&mut writer, &handshake_response(request.id, session_id))
                        .await?;
                }
                CMD_CLOSE_SESSION => {
                    log::info!("session_server: session {} requested close", session_id);
                    let dispatcher = Arc::clone(&self.dispatcher);
                    let closing = tokio::task::spawn_blocking(move || dispatcher.shutdown());
                    if let Err(err) = closing.await {
                        log::warn!("session_server: dispatcher shutdown failed: {}", err);
                    }
                    write_response(&mut writer, &RpcResponse::empty(request.id)).await?;
                    let _ = writer.shutdown().await;
                    self.shutdown.cancel();
                    return Ok(());
                }
                _ => {
                    let response = self.dispatch(session_id, request).await;
                    write_response(&mut writer, &response).await?;
                }
            }
        }
        Ok(())
    }

    async fn dispatch(&self, session_id: u64, request: RpcRequest) -> RpcResponse {
        let RpcRequest { id, method, params } = request;
        let started = Instant::now();
        let dispatcher = Arc::clone(&self.dispatcher);
        let target = method.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            dispatcher.invoke(session_id, id, &target, &params)
        })
        .await
        .unwrap_or_else(|err| {
            Err(RpcError::InvocationFailure { method: method.clone(), trace: err.to_string() })
        });
        log::debug!(
            "session_server: session={} id={} method={} ok={} elapsed_ms={}",
            session_id,
            id,
            method,
            outcome.is_ok(),
            started.elapsed().as_millis()
        );
        RpcResponse::from_outcome(id, outcome)
    }

    fn secret_matches(&self, request: &RpcRequest) -> bool {
        match (&self.options.secret, request.params.first()) {
            (Some(secret), Some(offered)) => offered.as_str() == Some(secret.as_str()),
            (None, _) => true,
            _ => false,
        }
    }
}

fn handshake_response(id: i64, session_id: u64) -> RpcResponse {
    RpcResponse::result(id, json!({ "status": true, "uid": session_id }))
}

async fn write_response<W>(writer: &mut W, response: &RpcResponse) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    let line = encode_response(response)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
