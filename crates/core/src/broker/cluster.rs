use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, Signer, Verifier};
use log::*;
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crate::broker::BrokerError;
use crate::broker::kv::KvOp;
use crate::signing;

const RECONNECT_INTERVAL: Duration = Duration::from_secs(2);
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Clone, Debug, Default)]
pub struct ClusterOptions {
  pub name: String,
  pub port: u16,
  pub peers: Vec<String>,
  pub leaf_port: u16,
  pub leaf_remotes: Vec<String>,
  pub replicas: usize,
}

/// Operations fanned out to connected peers.
#[derive(Clone, Debug)]
pub(crate) enum Outbound {
  Publish {
    subject: String,
    payload: Vec<u8>,
    msg_id: Option<String>,
    headers: HashMap<String, String>,
  },
  KvOp {
    bucket: String,
    op: KvOp,
  },
}

/// Operations received from peers, applied locally without re-forwarding.
#[derive(Clone, Debug)]
pub(crate) enum Inbound {
  Publish {
    subject: String,
    payload: Vec<u8>,
    msg_id: Option<String>,
    headers: HashMap<String, String>,
  },
  KvOp {
    bucket: String,
    op: KvOp,
  },
}

#[derive(Clone, Serialize, Deserialize)]
enum Frame {
  Info {
    server_name: String,
    cluster_name: String,
    nonce: String,
  },
  Auth {
    server_name: String,
    sig: String,
  },
  Publish {
    subject: String,
    payload: String,
    msg_id: Option<String>,
    headers: HashMap<String, String>,
  },
  KvOp {
    bucket: String,
    op: KvOp,
  },
}

#[derive(Debug)]
struct Links {
  /// Cluster members by server name; these count toward quorum.
  members: HashMap<String, mpsc::UnboundedSender<Frame>>,
  /// Leaf links; replicated to but not part of the quorum.
  leaves: Vec<mpsc::UnboundedSender<Frame>>,
}

/// Cluster membership and replication links of one broker node. Frames are
/// length-prefixed JSON over plain TCP; peers optionally authenticate by
/// signing the accept-side nonce with their Nkey seed.
#[derive(Debug)]
pub(crate) struct Cluster {
  server_name: String,
  cluster_name: String,
  trusted_users: Vec<ed25519_dalek::VerifyingKey>,
  user_seed: Option<ed25519_dalek::SigningKey>,
  links: Mutex<Links>,
  inbound_tx: mpsc::UnboundedSender<Inbound>,
  shutdown: watch::Receiver<bool>,
}

impl Cluster {
  pub(crate) async fn start(
    server_name: String,
    opts: &ClusterOptions,
    trusted_users_hex: &[String],
    user_seed_hex: Option<&str>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    shutdown: watch::Receiver<bool>,
  ) -> Result<Arc<Self>, BrokerError> {
    let trusted_users = trusted_users_hex
      .iter()
      .filter_map(|k| match signing::parse_verifying_key(k) {
        Ok(key) => Some(key),
        Err(err) => {
          warn!("Ignoring malformed trusted user key: {err}");
          None
        }
      })
      .collect();

    let user_seed = match user_seed_hex {
      Some(seed) => match signing::parse_signing_key(seed) {
        Ok(key) => Some(key),
        Err(err) => {
          warn!("Ignoring malformed user seed: {err}");
          None
        }
      },
      None => None,
    };

    let cluster = Arc::new(Self {
      server_name,
      cluster_name: opts.name.clone(),
      trusted_users,
      user_seed,
      links: Mutex::new(Links {
        members: HashMap::new(),
        leaves: Vec::new(),
      }),
      inbound_tx,
      shutdown,
    });

    if opts.port != 0 {
      cluster.clone().listen(opts.port, false).await?;
    }
    if opts.leaf_port != 0 {
      cluster.clone().listen(opts.leaf_port, true).await?;
    }

    for peer in &opts.peers {
      cluster.clone().dial_loop(peer.clone(), false);
    }
    for remote in &opts.leaf_remotes {
      cluster.clone().dial_loop(remote.clone(), true);
    }

    return Ok(cluster);
  }

  /// Connected cluster members, this node excluded.
  pub(crate) fn member_count(&self) -> usize {
    return self.links.lock().members.len();
  }

  pub(crate) fn broadcast(&self, out: Outbound) {
    let frame = match out {
      Outbound::Publish {
        subject,
        payload,
        msg_id,
        headers,
      } => Frame::Publish {
        subject,
        payload: BASE64.encode(payload),
        msg_id,
        headers,
      },
      Outbound::KvOp { bucket, op } => Frame::KvOp { bucket, op },
    };

    let links = self.links.lock();
    for sender in links.members.values().chain(links.leaves.iter()) {
      let _ = sender.send(frame.clone());
    }
  }

  async fn listen(self: Arc<Self>, port: u16, leaf: bool) -> Result<(), BrokerError> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(
      "Cluster {} listening on port {port}",
      if leaf { "leaf node" } else { "routes" }
    );

    let mut shutdown = self.shutdown.clone();
    tokio::spawn(async move {
      loop {
        tokio::select! {
          accepted = listener.accept() => {
            match accepted {
              Ok((socket, addr)) => {
                debug!("Inbound cluster connection from {addr}");
                let cluster = self.clone();
                tokio::spawn(async move {
                  if let Err(err) = cluster.handle_link(socket, /* initiator= */ false, leaf).await {
                    warn!("Cluster link from {addr} closed: {err}");
                  }
                });
              }
              Err(err) => {
                warn!("Cluster accept failed: {err}");
                tokio::time::sleep(Duration::from_millis(100)).await;
              }
            }
          }
          _ = shutdown.changed() => return,
        }
      }
    });
    return Ok(());
  }

  fn dial_loop(self: Arc<Self>, url: String, leaf: bool) {
    let Some(addr) = peer_addr(&url) else {
      warn!("Invalid cluster peer URL: {url}");
      return;
    };

    let mut shutdown = self.shutdown.clone();
    tokio::spawn(async move {
      loop {
        if *shutdown.borrow() {
          return;
        }
        match TcpStream::connect(&addr).await {
          Ok(socket) => {
            info!("Cluster route established to {addr}");
            if let Err(err) = self.clone().handle_link(socket, /* initiator= */ true, leaf).await {
              warn!("Cluster route to {addr} dropped: {err}");
            }
          }
          Err(err) => {
            debug!("Cluster route to {addr} pending: {err}");
          }
        }
        tokio::select! {
          _ = tokio::time::sleep(RECONNECT_INTERVAL) => {}
          _ = shutdown.changed() => return,
        }
      }
    });
  }

  /// Runs one link to completion: handshake, then pump frames both ways.
  async fn handle_link(
    self: Arc<Self>,
    mut socket: TcpStream,
    initiator: bool,
    leaf: bool,
  ) -> Result<(), BrokerError> {
    let mut nonce_bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let our_nonce = hex::encode(nonce_bytes);

    write_frame(
      &mut socket,
      &Frame::Info {
        server_name: self.server_name.clone(),
        cluster_name: self.cluster_name.clone(),
        nonce: our_nonce.clone(),
      },
    )
    .await?;

    let Frame::Info {
      server_name: peer_name,
      cluster_name: peer_cluster,
      nonce: peer_nonce,
    } = read_frame(&mut socket).await?
    else {
      return Err(BrokerError::Cluster("expected INFO frame".to_string()));
    };

    if !leaf && !self.cluster_name.is_empty() && peer_cluster != self.cluster_name {
      return Err(BrokerError::Cluster(format!(
        "cluster name mismatch: '{peer_cluster}' != '{}'",
        self.cluster_name
      )));
    }

    // The initiator authenticates against the acceptor's nonce.
    if initiator {
      if let Some(ref seed) = self.user_seed {
        let sig = seed.sign(peer_nonce.as_bytes());
        write_frame(
          &mut socket,
          &Frame::Auth {
            server_name: self.server_name.clone(),
            sig: hex::encode(sig.to_bytes()),
          },
        )
        .await?;
      }
    } else if !self.trusted_users.is_empty() {
      let Frame::Auth { sig, .. } = read_frame(&mut socket).await? else {
        return Err(BrokerError::Cluster("peer did not authenticate".to_string()));
      };
      self.verify_peer(&our_nonce, &sig)?;
      debug!("Peer '{peer_name}' authenticated");
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    {
      let mut links = self.links.lock();
      if leaf {
        links.leaves.push(tx);
      } else {
        links.members.insert(peer_name.clone(), tx);
      }
    }

    let (mut reader, mut writer) = socket.into_split();
    let mut shutdown = self.shutdown.clone();

    // Writes run on their own task so a frame read in progress is never
    // cancelled halfway by outbound traffic.
    let writer_task = tokio::spawn(async move {
      while let Some(frame) = rx.recv().await {
        if write_frame_half(&mut writer, &frame).await.is_err() {
          return;
        }
      }
    });

    let result = loop {
      tokio::select! {
        frame = read_frame_half(&mut reader) => {
          match frame {
            Ok(frame) => self.apply(frame),
            Err(err) => break Err(err),
          }
        }
        _ = shutdown.changed() => break Ok(()),
      }
    };

    writer_task.abort();
    {
      let mut links = self.links.lock();
      links.members.remove(&peer_name);
      links.leaves.retain(|l| !l.is_closed());
    }
    return result;
  }

  fn verify_peer(&self, nonce: &str, sig_hex: &str) -> Result<(), BrokerError> {
    let sig_bytes = hex::decode(sig_hex)
      .map_err(|_| BrokerError::Cluster("malformed auth signature".to_string()))?;
    let sig_array: [u8; 64] = sig_bytes
      .try_into()
      .map_err(|_| BrokerError::Cluster("malformed auth signature".to_string()))?;
    let signature = Signature::from_bytes(&sig_array);

    for key in &self.trusted_users {
      if key.verify(nonce.as_bytes(), &signature).is_ok() {
        return Ok(());
      }
    }
    return Err(BrokerError::Cluster("peer signature not trusted".to_string()));
  }

  fn apply(&self, frame: Frame) {
    let inbound = match frame {
      Frame::Publish {
        subject,
        payload,
        msg_id,
        headers,
      } => Inbound::Publish {
        subject,
        payload: BASE64.decode(&payload).unwrap_or_default(),
        msg_id,
        headers,
      },
      Frame::KvOp { bucket, op } => Inbound::KvOp { bucket, op },
      Frame::Info { .. } | Frame::Auth { .. } => return,
    };
    let _ = self.inbound_tx.send(inbound);
  }
}

/// Accepts `nats://host:port`, `tls://host:port` or bare `host:port`.
fn peer_addr(url: &str) -> Option<String> {
  let rest = match url.split_once("://") {
    Some((_scheme, rest)) => rest,
    None => url,
  };
  let host_port = rest.split('/').next().unwrap_or(rest);
  if host_port.is_empty() || !host_port.contains(':') {
    return None;
  }
  return Some(host_port.to_string());
}

async fn write_frame(socket: &mut TcpStream, frame: &Frame) -> Result<(), BrokerError> {
  let bytes = serde_json::to_vec(frame)
    .map_err(|err| BrokerError::Cluster(format!("frame encode: {err}")))?;
  socket.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
  socket.write_all(&bytes).await?;
  return Ok(());
}

async fn read_frame(socket: &mut TcpStream) -> Result<Frame, BrokerError> {
  let mut len_bytes = [0u8; 4];
  socket.read_exact(&mut len_bytes).await?;
  let len = u32::from_le_bytes(len_bytes);
  if len > MAX_FRAME_LEN {
    return Err(BrokerError::Cluster("oversized frame".to_string()));
  }
  let mut buf = vec![0u8; len as usize];
  socket.read_exact(&mut buf).await?;
  return serde_json::from_slice(&buf)
    .map_err(|err| BrokerError::Cluster(format!("frame decode: {err}")));
}

async fn write_frame_half(
  writer: &mut tokio::net::tcp::OwnedWriteHalf,
  frame: &Frame,
) -> Result<(), BrokerError> {
  let bytes = serde_json::to_vec(frame)
    .map_err(|err| BrokerError::Cluster(format!("frame encode: {err}")))?;
  writer.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
  writer.write_all(&bytes).await?;
  return Ok(());
}

async fn read_frame_half(
  reader: &mut tokio::net::tcp::OwnedReadHalf,
) -> Result<Frame, BrokerError> {
  let mut len_bytes = [0u8; 4];
  reader.read_exact(&mut len_bytes).await?;
  let len = u32::from_le_bytes(len_bytes);
  if len > MAX_FRAME_LEN {
    return Err(BrokerError::Cluster("oversized frame".to_string()));
  }
  let mut buf = vec![0u8; len as usize];
  reader.read_exact(&mut buf).await?;
  return serde_json::from_slice(&buf)
    .map_err(|err| BrokerError::Cluster(format!("frame decode: {err}")));
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_peer_addr_parsing() {
    assert_eq!(peer_addr("nats://10.0.0.1:6222"), Some("10.0.0.1:6222".to_string()));
    assert_eq!(peer_addr("10.0.0.1:6222"), Some("10.0.0.1:6222".to_string()));
    assert_eq!(peer_addr("tls://peer.example:7422/path"), Some("peer.example:7422".to_string()));
    assert_eq!(peer_addr("not-a-url"), None);
    assert_eq!(peer_addr(""), None);
  }
}
