// SPDX-License-Identifier: AGPL-3.0-only
//! TCP listener and per-connection request driver.

use crate::metrics::metrics;
use anyhow::{Context, Result, bail};
use std::net::SocketAddr;
use std::sync::Arc;
use tacplus_core::{ConnectionId, MachineCtx, Request, RunStatus, Signal, StateStore, machine};
use tacplus_policy::PolicyEngine;
use tacplus_proto::{FrameAssembler, PacketKind};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct Shared {
    pub store: Arc<StateStore>,
    pub engine: Arc<PolicyEngine>,
    pub secret: Arc<Vec<u8>>,
}

pub async fn serve(addr: SocketAddr, shared: Shared) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding TACACS+ listener {addr}"))?;
    info!("listening for TACACS+ on {}", addr);
    loop {
        let (socket, peer_addr) = listener.accept().await?;
        let conn_shared = shared.clone();
        tokio::spawn(async move {
            metrics().connections_active.inc();
            if let Err(err) = handle_connection(socket, peer_addr, conn_shared).await {
                warn!(error = %err, peer = %peer_addr, "connection closed with error");
            }
            metrics().connections_active.dec();
        });
    }
}

/// Read packets off one connection and drive each through the session
/// machine. Any read or framing error marks the connection end-of-life: the
/// task exits and the socket drops. State entries keyed under this connection
/// are left to the store's time-based reaping.
async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, shared: Shared) -> Result<()> {
    let conn = ConnectionId::next();
    let local = stream.local_addr().context("resolving local address")?;
    let mut assembler = FrameAssembler::new();
    let mut buf = [0u8; 4096];
    debug!(peer = %peer, conn = conn.0, "connection open");

    loop {
        let n = stream
            .read(&mut buf)
            .await
            .with_context(|| "reading TACACS+ stream")?;
        if n == 0 {
            if assembler.is_idle() {
                debug!(peer = %peer, "client closed connection");
                return Ok(());
            }
            bail!("connection closed mid-packet");
        }
        assembler.feed(&buf[..n]);

        while let Some(frame) = assembler.next_frame()? {
            let Some(kind) = PacketKind::from_wire(frame.header.packet_type) else {
                bail!("unsupported TACACS+ type {}", frame.header.packet_type);
            };
            metrics().requests_total.with_label_values(&[kind.name()]).inc();

            let mut request = Request::new(conn, peer, local, kind, frame);
            loop {
                let status = {
                    let ctx = MachineCtx {
                        store: &shared.store,
                        policy: shared.engine.as_ref(),
                        auth_types: shared.engine.auth_types(),
                        secret: &shared.secret,
                    };
                    machine::run(&mut request, &ctx, Signal::Run)
                };
                match status {
                    // Cooperative suspension: give other requests a turn,
                    // then re-enter at the preserved phase.
                    RunStatus::Yielded => tokio::task::yield_now().await,
                    RunStatus::Done => break,
                }
            }

            if let Some(bytes) = request.reply_frame.take() {
                stream
                    .write_all(&bytes)
                    .await
                    .with_context(|| "sending TACACS+ reply")?;
                stream.flush().await.context("flushing reply")?;
                metrics().replies_total.with_label_values(&[kind.name()]).inc();
            }
            metrics().state_entries.set(shared.store.len() as f64);
        }
    }
}
