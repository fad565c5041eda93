// SPDX-License-Identifier: MIT
//
// Embedded single-client MQTT broker.
//
// SDCP printers are MQTT *clients*: the firmware opens a connection to
// whatever broker the redirect datagram names.  So the controlling host
// runs this throwaway broker on an ephemeral port for the lifetime of one
// printer interaction.  Exactly one client ever connects, which is why
// there is no fan-out, ACL, retained-message, or persistence logic here —
// a deliberate protocol subset, not a general-purpose broker.
//
// Inbound PUBLISHes are queued in arrival order and handed to exactly one
// waiter at a time via [`EmbeddedBroker::next_published_message`]; the
// session layer serializes all protocol consumption through one driving
// task.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use resinwerk_core::{Error, Result};

use crate::packet::{self, Packet};

/// One client-originated PUBLISH, in arrival order.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Senders handed to the serve task when it starts.
struct ServeState {
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    connected_tx: oneshot::Sender<String>,
    subscribed_tx: oneshot::Sender<String>,
}

/// State shared between the serve task and the broker handle.
struct Shared {
    /// Outbound frame channel to the live client, if any.
    client_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

/// A single-session MQTT-protocol server on an ephemeral port.
pub struct EmbeddedBroker {
    port: u16,
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<()>>,
    shared: Arc<Shared>,
    serve_state: Option<ServeState>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
    connected_rx: Mutex<Option<oneshot::Receiver<String>>>,
    subscribed_rx: Mutex<Option<oneshot::Receiver<String>>>,
}

impl EmbeddedBroker {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = oneshot::channel();
        let (subscribed_tx, subscribed_rx) = oneshot::channel();
        Self {
            port: 0,
            shutdown: Arc::new(Notify::new()),
            task: None,
            shared: Arc::new(Shared {
                client_tx: Mutex::new(None),
            }),
            serve_state: Some(ServeState {
                inbound_tx,
                connected_tx,
                subscribed_tx,
            }),
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            connected_rx: Mutex::new(Some(connected_rx)),
            subscribed_rx: Mutex::new(Some(subscribed_rx)),
        }
    }

    /// Bind an ephemeral port and start the serve loop.
    pub async fn start(&mut self) -> Result<()> {
        let state = self
            .serve_state
            .take()
            .ok_or_else(|| Error::Broker("broker already started".into()))?;

        let listener = TcpListener::bind(("0.0.0.0", 0))
            .await
            .map_err(|e| Error::Broker(format!("bind: {e}")))?;
        self.port = listener
            .local_addr()
            .map_err(|e| Error::Broker(format!("local_addr: {e}")))?
            .port();

        info!(port = self.port, "embedded MQTT broker listening");

        let shutdown = Arc::clone(&self.shutdown);
        let shared = Arc::clone(&self.shared);
        self.task = Some(tokio::spawn(async move {
            Self::serve(listener, shutdown, shared, state).await;
        }));
        Ok(())
    }

    /// The resolved ephemeral port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Signal the serve loop to exit and await it.
    pub async fn stop(&mut self) -> Result<()> {
        self.shutdown.notify_one();
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| Error::Broker(format!("task join: {e}")))?;
        }
        Ok(())
    }

    /// Host→client publish, QoS 0, fire-and-forget.  A no-op when no
    /// client is connected.
    pub fn publish(&self, topic: &str, payload: Vec<u8>) {
        let guard = self.shared.client_tx.lock().expect("client_tx poisoned");
        match guard.as_ref() {
            Some(tx) => {
                let frame = packet::encode(&Packet::Publish {
                    topic: topic.to_owned(),
                    payload,
                    qos: 0,
                    packet_id: None,
                });
                let _ = tx.send(frame);
            }
            None => debug!(topic, "publish with no connected client; dropped"),
        }
    }

    /// Suspend until the next client-originated publish, or fail with
    /// `Error::Timeout`.  A timeout consumes nothing; a later call still
    /// observes messages in their original order.  Once the session ends,
    /// returns `Error::Broker` after the queue drains.
    pub async fn next_published_message(&self, timeout: Duration) -> Result<InboundMessage> {
        let mut rx = self.inbound_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Err(_) => Err(Error::Timeout {
                operation: "next published message",
            }),
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(Error::Broker("session ended; message stream closed".into())),
        }
    }

    /// Wait for the one-shot "client connected" signal; yields the client
    /// identifier from CONNECT.  The signal fires at most once per broker.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<String> {
        let rx = self
            .connected_rx
            .lock()
            .expect("connected_rx poisoned")
            .take()
            .ok_or_else(|| Error::Broker("connect signal already consumed".into()))?;
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => Err(Error::Timeout {
                operation: "client connect",
            }),
            Ok(Ok(client_id)) => Ok(client_id),
            Ok(Err(_)) => Err(Error::Broker("broker stopped before a client connected".into())),
        }
    }

    /// Wait for the one-shot "client subscribed" signal; yields the first
    /// topic filter of the first SUBSCRIBE.
    pub async fn wait_subscribed(&self, timeout: Duration) -> Result<String> {
        let rx = self
            .subscribed_rx
            .lock()
            .expect("subscribed_rx poisoned")
            .take()
            .ok_or_else(|| Error::Broker("subscribe signal already consumed".into()))?;
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => Err(Error::Timeout {
                operation: "client subscribe",
            }),
            Ok(Ok(topic)) => Ok(topic),
            Ok(Err(_)) => Err(Error::Broker("broker stopped before a client subscribed".into())),
        }
    }

    /// Accept exactly one connection and serve it to completion.
    async fn serve(
        listener: TcpListener,
        shutdown: Arc<Notify>,
        shared: Arc<Shared>,
        state: ServeState,
    ) {
        let stream = tokio::select! {
            _ = shutdown.notified() => {
                debug!("broker shut down before any client connected");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!(peer = %peer, "printer connected to embedded broker");
                    stream
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        };

        // The listener is dropped here: one session per broker, later
        // connection attempts are refused.
        drop(listener);

        if let Err(e) = Self::serve_client(stream, &shutdown, &shared, state).await {
            warn!(error = %e, "broker session ended with error");
        } else {
            debug!("broker session ended");
        }
    }

    /// The per-connection packet loop.  Replies are funneled through one
    /// writer task so CONNACK/SUBACK/PUBACK and host publishes stay ordered.
    async fn serve_client(
        stream: TcpStream,
        shutdown: &Notify,
        shared: &Shared,
        state: ServeState,
    ) -> Result<()> {
        let (read_half, write_half) = stream.into_split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        *shared.client_tx.lock().expect("client_tx poisoned") = Some(out_tx.clone());

        let writer = tokio::spawn(async move {
            let mut w = write_half;
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = w.write_all(&frame).await {
                    debug!(error = %e, "write to client failed");
                    break;
                }
            }
            let _ = w.shutdown().await;
        });

        let mut reader = BufReader::new(read_half);
        let mut connected_tx = Some(state.connected_tx);
        let mut subscribed_tx = Some(state.subscribed_tx);
        let mut subscriptions: Vec<String> = Vec::new();

        let result = loop {
            let pkt = tokio::select! {
                _ = shutdown.notified() => break Ok(()),
                pkt = packet::read_packet(&mut reader) => pkt,
            };

            match pkt {
                Ok(Packet::Connect { client_id }) => {
                    let _ = out_tx.send(packet::encode(&Packet::ConnAck));
                    match connected_tx.take() {
                        Some(tx) => {
                            info!(client_id = %client_id, "MQTT client connected");
                            let _ = tx.send(client_id);
                        }
                        None => debug!(client_id = %client_id, "duplicate CONNECT ignored"),
                    }
                }
                Ok(Packet::Subscribe { packet_id, filters }) => {
                    // QoS 2 is not supported; grants cap at 1.
                    let granted = filters.iter().map(|(_, qos)| (*qos).min(1)).collect();
                    for (topic, qos) in &filters {
                        debug!(topic = %topic, qos, "subscription recorded");
                        subscriptions.push(topic.clone());
                    }
                    let _ = out_tx.send(packet::encode(&Packet::SubAck { packet_id, granted }));
                    if let Some(tx) = subscribed_tx.take() {
                        let _ = tx.send(filters[0].0.clone());
                    }
                }
                Ok(Packet::Publish {
                    topic,
                    payload,
                    qos,
                    packet_id,
                }) => {
                    if qos == 1 {
                        if let Some(packet_id) = packet_id {
                            let _ = out_tx.send(packet::encode(&Packet::PubAck { packet_id }));
                        }
                    }
                    if state
                        .inbound_tx
                        .send(InboundMessage { topic, payload })
                        .is_err()
                    {
                        debug!("inbound queue closed; message dropped");
                    }
                }
                Ok(Packet::PingReq) => {
                    let _ = out_tx.send(packet::encode(&Packet::PingResp));
                }
                Ok(Packet::Disconnect) => {
                    debug!("client disconnected cleanly");
                    break Ok(());
                }
                Ok(Packet::Unsupported { packet_type }) => {
                    warn!(packet_type, "unsupported packet type ignored");
                }
                Ok(other) => {
                    debug!(packet = ?other, "unexpected broker-bound packet ignored");
                }
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("client closed connection");
                    break Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "malformed frame; closing session");
                    break Err(e);
                }
            }
        };

        // Tear down: clear the publish slot, close the writer, and (by
        // dropping `state.inbound_tx`) fail any blocked waiter with
        // end-of-stream.
        shared.client_tx.lock().expect("client_tx poisoned").take();
        drop(out_tx);
        let _ = writer.await;
        result
    }
}

impl Default for EmbeddedBroker {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
