//! Data-plane TCP server of a storage node.

use super::service::StorageNodeService;
use crate::error::{FlexError, Result};
use crate::observability::record_chunk_request;
use crate::protocol::{read_frame, write_frame, DataRequest, DataResponse, Envelope, Operation};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Accepts data-channel connections and serves them from one service.
pub struct DataServer {
    listener: TcpListener,
    service: Arc<StorageNodeService>,
}

impl DataServer {
    /// Bind the listening socket.
    pub async fn bind(addr: SocketAddr, service: Arc<StorageNodeService>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| FlexError::Network(format!("Failed to bind {}: {}", addr, e)))?;
        Ok(Self { listener, service })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve connections until shutdown.
    pub async fn run(self, mut shutdown_rx: tokio::sync::broadcast::Receiver<()>) -> Result<()> {
        let addr = self.local_addr()?;
        info!(node_id = self.service.node_id(), addr = %addr, "Data server listening");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "New data connection");
                        let service = Arc::clone(&self.service);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, service).await {
                                warn!(peer = %peer, error = %e, "Data connection error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "Accept error"),
                },
                _ = shutdown_rx.recv() => {
                    info!(addr = %addr, "Data server shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, service: Arc<StorageNodeService>) -> Result<()> {
    stream.set_nodelay(true)?;
    while let Some(envelope) = read_frame::<_, DataRequest>(&mut stream).await? {
        let response = dispatch(&service, envelope.body);
        let reply = Envelope::new(envelope.request_id, response.operation(), response);
        write_frame(&mut stream, &reply).await?;
    }
    debug!("Data connection closed");
    Ok(())
}

/// Execute one data request against the service.
pub fn dispatch(service: &StorageNodeService, request: DataRequest) -> DataResponse {
    let op = request.operation();
    let result = match request {
        DataRequest::Write {
            token,
            offset,
            data,
        } => service
            .handle_write(&token, offset, &data)
            .map(|bytes| DataResponse::Written { bytes }),
        DataRequest::Read {
            token,
            offset,
            length,
        } => service
            .handle_read(&token, offset, length)
            .map(DataResponse::Data),
        DataRequest::Discard { tokens } => service
            .discard(&tokens)
            .map(|chunks| DataResponse::Discarded { chunks }),
    };
    record_chunk_request(op, result.is_ok());
    result.unwrap_or_else(|e| DataResponse::Error(e.to_wire()))
}
