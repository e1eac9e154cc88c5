use crate::core::DaemonEvent;
use crate::BroadcastMessage;
use airwave_proto::protocol::{Broadcast, FrameError, Message, PROTOCOL_VERSION};
use airwave_proto::state::SessionStore;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{error, info, warn};

pub fn start_server(
    bind_address: String,
    port: u16,
    store: Arc<SessionStore>,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };

        info!("TCP server listening at {}", addr);
        serve(listener, store, event_tx, broadcast_tx).await;
    })
}

async fn serve(
    listener: TcpListener,
    store: Arc<SessionStore>,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) {
    let mut client_id = 0usize;

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                client_id += 1;
                let id = client_id;
                info!("Client {} connected from {}", id, peer);

                let store = store.clone();
                let evt_tx = event_tx.clone();
                let bcast_rx = broadcast_tx.subscribe();

                tokio::spawn(async move {
                    handle_client(stream, store, id, evt_tx, bcast_rx).await;
                    info!("Client {} disconnected", id);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    store: Arc<SessionStore>,
    client_id: usize,
    event_tx: mpsc::Sender<DaemonEvent>,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    // Send Hello with current state snapshot on connect
    if let Ok(encoded) = encode_hello(&store).await {
        if write_half.write_all(&encoded).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            if read_buf.len() < 4 { break; }
                            match Message::decode(&read_buf) {
                                Ok((Message::Command(cmd), consumed)) => {
                                    read_buf.drain(..consumed);
                                    info!("Client {} sent command: {:?}", client_id, cmd);

                                    let (ack_tx, ack_rx) = oneshot::channel();
                                    if event_tx.send(DaemonEvent::ClientCommand(cmd, Some(ack_tx))).await.is_err() {
                                        warn!("DaemonEvent channel closed");
                                        return;
                                    }
                                    // Reply with the state the command produced.
                                    let _ = ack_rx.await;

                                    if let Ok(encoded) = encode_state(&store).await {
                                        if write_half.write_all(&encoded).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                Ok((_, consumed)) => {
                                    read_buf.drain(..consumed);
                                }
                                Err(FrameError::Incomplete) => break,
                                Err(FrameError::Malformed { consumed, source }) => {
                                    warn!("Client {} sent a malformed frame: {}", client_id, source);
                                    read_buf.drain(..consumed);
                                }
                                Err(e @ FrameError::TooLarge(_)) => {
                                    warn!("Dropping client {}: {}", client_id, e);
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                let outgoing = match msg {
                    Ok(BroadcastMessage::StateUpdated) => encode_state(&store).await,
                    Ok(BroadcastMessage::NowPlaying(text)) => {
                        Message::Broadcast(Broadcast::NowPlaying { text }).encode()
                    }
                    Ok(BroadcastMessage::Log(message)) => {
                        Message::Broadcast(Broadcast::Log { message }).encode()
                    }
                    Ok(BroadcastMessage::Error(message)) => {
                        Message::Broadcast(Broadcast::Error { message }).encode()
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} broadcast messages", client_id, n);
                        encode_state(&store).await
                    }
                    Err(_) => break,
                };
                if let Ok(encoded) = outgoing {
                    if write_half.write_all(&encoded).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

async fn encode_hello(store: &SessionStore) -> anyhow::Result<Vec<u8>> {
    let state = store.get_state().await;
    let rev = state.rev;
    Message::Broadcast(Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        rev,
        state,
    })
    .encode()
}

async fn encode_state(store: &SessionStore) -> anyhow::Result<Vec<u8>> {
    let state = store.get_state().await;
    Message::Broadcast(Broadcast::State { data: state }).encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use airwave_proto::protocol::{Command, Station};

    async fn read_message(stream: &mut TcpStream) -> Message {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.unwrap();
        let len = u32::from_be_bytes(header) as usize;
        let mut frame = header.to_vec();
        frame.resize(4 + len, 0);
        stream.read_exact(&mut frame[4..]).await.unwrap();
        Message::decode(&frame).unwrap().0
    }

    fn store() -> Arc<SessionStore> {
        Arc::new(SessionStore::new(
            vec![Station::new("Classic 105", "https://example.com/classic105")],
            1.0,
        ))
    }

    /// Starts the server plus a stand-in for the controller loop that
    /// applies station selection to the store.
    async fn start(
        store: Arc<SessionStore>,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
    ) -> std::net::SocketAddr {
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, store.clone(), event_tx, broadcast_tx));

        tokio::spawn(async move {
            while let Some(DaemonEvent::ClientCommand(cmd, ack)) = event_rx.recv().await {
                if let Command::SelectStation { station_idx } = cmd {
                    store.set_selected(station_idx).await;
                }
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_client_gets_hello_then_state_after_command() {
        let store = store();
        let (broadcast_tx, _) = broadcast::channel(16);
        let addr = start(store, broadcast_tx.clone()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        match read_message(&mut client).await {
            Message::Broadcast(Broadcast::Hello {
                protocol_version,
                rev,
                state,
            }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(rev, state.rev);
                assert_eq!(state.stations.len(), 1);
            }
            other => panic!("expected hello, got {:?}", other),
        }

        let cmd = Message::Command(Command::SelectStation { station_idx: 0 });
        client.write_all(&cmd.encode().unwrap()).await.unwrap();
        match read_message(&mut client).await {
            Message::Broadcast(Broadcast::State { data }) => {
                assert_eq!(data.active_station, Some(0));
                assert!(data.is_loading);
            }
            other => panic!("expected state, got {:?}", other),
        }

        broadcast_tx
            .send(BroadcastMessage::NowPlaying(Some("Artist - Song".to_string())))
            .unwrap();
        match read_message(&mut client).await {
            Message::Broadcast(Broadcast::NowPlaying { text }) => {
                assert_eq!(text.as_deref(), Some("Artist - Song"));
            }
            other => panic!("expected now playing, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let store = store();
        let (broadcast_tx, _) = broadcast::channel(16);
        let addr = start(store, broadcast_tx).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        assert!(matches!(
            read_message(&mut client).await,
            Message::Broadcast(Broadcast::Hello { .. })
        ));

        let mut bytes = 5u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"{bad}");
        bytes.extend_from_slice(
            &Message::Command(Command::SelectStation { station_idx: 0 })
                .encode()
                .unwrap(),
        );
        client.write_all(&bytes).await.unwrap();

        match read_message(&mut client).await {
            Message::Broadcast(Broadcast::State { data }) => {
                assert_eq!(data.active_station, Some(0));
            }
            other => panic!("expected state, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        let (broadcast_tx, _) = broadcast::channel(16);
        let addr = start(store(), broadcast_tx).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        read_message(&mut client).await;

        client.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let mut rest = Vec::new();
        let n = client.read_to_end(&mut rest).await.unwrap();
        assert_eq!(n, 0);
    }
}
