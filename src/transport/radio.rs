//! Short-range radio transport.
//!
//! The radio hardware sits behind [`RadioAdapter`]; [`MemoryRadio`] is an
//! in-process medium for tests and demos. Every new link goes through a
//! pairing step: both ends exchange nonces, derive the same six-digit code,
//! and the link only opens once both users confirm it.

use crate::identity::{Address, PeerId, TransportKind};
use crate::transport::{
    emit, ensure_kind, framing, BoxedIo, Connection, ConnectionState, DiscoveredPeer, Stream,
    Transport, TransportEvent, TransportRuntime, PAYLOAD_STREAM,
};
use crate::utils::{NetworkError, RadioConfig, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const NONCE_SIZE: usize = 32;
const PAIRING_CONTEXT: &[u8] = b"swm-radio-pairing-v1";
const PAIRING_FRAME_MAX: usize = 64;
const LINK_BUFFER: usize = 64 * 1024;

/// One advertisement seen during a scan
#[derive(Debug, Clone)]
pub struct RadioSighting {
    /// Remote device
    pub device_id: String,
    /// Identity it advertises
    pub peer: PeerId,
    /// Received signal strength
    pub rssi: i16,
}

/// Inbound radio link and the device that opened it
pub type InboundLink = (String, BoxedIo);

/// Radio hardware
#[async_trait]
pub trait RadioAdapter: Send + Sync {
    /// Our device identifier
    fn device_id(&self) -> String;

    /// Advertise the service and deliver inbound links to `inbound`
    async fn advertise(
        &self,
        service_id: &str,
        peer: &PeerId,
        inbound: mpsc::Sender<InboundLink>,
    ) -> Result<()>;

    /// Withdraw the advertisement
    fn stop_advertising(&self);

    /// Start scanning for a service
    fn start_scan(&self, service_id: &str) -> Result<()>;

    /// Advertisements seen since the scan started
    fn sightings(&self) -> Vec<RadioSighting>;

    /// Stop scanning. Must be safe to call when no scan runs.
    fn stop_scan(&self);

    /// Open a link to a device
    async fn connect(&self, device_id: &str) -> Result<BoxedIo>;
}

/// Confirms pairing codes, typically by asking the user
#[async_trait]
pub trait PairingConfirmer: Send + Sync {
    /// Whether the code shown for `device_id` matches the other screen
    async fn confirm(&self, device_id: &str, code: &str) -> bool;
}

/// Accepts every code. Logs it so it can still be compared by eye.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoConfirm;

#[async_trait]
impl PairingConfirmer for AutoConfirm {
    async fn confirm(&self, device_id: &str, code: &str) -> bool {
        log::info!("Pairing with {device_id}: code {code}");
        true
    }
}

/// Stops the scan when dropped, so a cancelled discovery cannot leave the
/// radio scanning
struct ScanGuard<'a> {
    adapter: &'a dyn RadioAdapter,
}

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.adapter.stop_scan();
    }
}

/// Six-digit code derived from both nonces, initiator first
pub fn pairing_code(initiator_nonce: &[u8], responder_nonce: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(PAIRING_CONTEXT);
    hasher.update(initiator_nonce);
    hasher.update(responder_nonce);
    let digest = hasher.finalize();
    let value = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    format!("{:06}", value % 1_000_000)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Initiator,
    Responder,
}

struct PairingContext {
    confirmer: Arc<dyn PairingConfirmer>,
    timeout: Duration,
    max_frame: usize,
}

fn pairing_failed(device: &str) -> crate::utils::MessengerError {
    NetworkError::PairingRejected {
        device: device.to_string(),
    }
    .into()
}

async fn exchange_nonces(io: &mut BoxedIo, role: Role, device: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut ours = vec![0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut ours);

    let theirs = match role {
        Role::Initiator => {
            framing::write_frame(io, &ours, PAIRING_FRAME_MAX).await?;
            framing::read_frame(io, PAIRING_FRAME_MAX).await?
        }
        Role::Responder => {
            let theirs = framing::read_frame(io, PAIRING_FRAME_MAX).await?;
            framing::write_frame(io, &ours, PAIRING_FRAME_MAX).await?;
            theirs
        }
    };
    let theirs = theirs
        .filter(|n| n.len() == NONCE_SIZE)
        .ok_or_else(|| pairing_failed(device))?;

    Ok(match role {
        Role::Initiator => (ours, theirs),
        Role::Responder => (theirs, ours),
    })
}

/// Run the pairing exchange and open the connection
async fn pair(
    mut io: BoxedIo,
    connection: &Connection,
    device: &str,
    role: Role,
    ctx: &PairingContext,
) -> Result<()> {
    let (initiator_nonce, responder_nonce) = exchange_nonces(&mut io, role, device).await?;
    let code = pairing_code(&initiator_nonce, &responder_nonce);
    connection.transition(ConnectionState::Pairing { code: code.clone() })?;

    let accepted = tokio::time::timeout(ctx.timeout, ctx.confirmer.confirm(device, &code))
        .await
        .unwrap_or(false);
    framing::write_frame(&mut io, &[u8::from(accepted)], PAIRING_FRAME_MAX).await?;
    let remote = framing::read_frame(&mut io, PAIRING_FRAME_MAX).await?;
    let remote_accepted = matches!(remote.as_deref(), Some([1]));

    if !(accepted && remote_accepted) {
        log::warn!("Pairing with {device} rejected (local {accepted}, remote {remote_accepted})");
        connection.fail("pairing rejected");
        return Err(pairing_failed(device));
    }

    connection.add_stream(Stream::new(PAYLOAD_STREAM, io, ctx.max_frame));
    connection.transition(ConnectionState::Open)?;
    log::debug!("Radio link with {device} paired");
    Ok(())
}

/// Radio transport over any [`RadioAdapter`]
pub struct RadioTransport {
    config: RadioConfig,
    local: PeerId,
    adapter: Arc<dyn RadioAdapter>,
    confirmer: Arc<dyn PairingConfirmer>,
    max_frame: usize,
    runtime: TransportRuntime,
}

impl RadioTransport {
    /// Create a radio transport
    ///
    /// # Arguments
    ///
    /// * `config` - Radio settings
    /// * `local` - Identity to advertise
    /// * `adapter` - Radio hardware
    /// * `confirmer` - Who confirms pairing codes
    /// * `max_frame` - Largest payload frame accepted
    pub fn new(
        config: RadioConfig,
        local: PeerId,
        adapter: Arc<dyn RadioAdapter>,
        confirmer: Arc<dyn PairingConfirmer>,
        max_frame: usize,
    ) -> Self {
        Self {
            config,
            local,
            adapter,
            confirmer,
            max_frame,
            runtime: TransportRuntime::new(TransportKind::Radio),
        }
    }

    fn pairing_context(&self) -> PairingContext {
        PairingContext {
            confirmer: self.confirmer.clone(),
            timeout: Duration::from_millis(self.config.pairing_timeout_ms),
            max_frame: self.max_frame,
        }
    }
}

#[async_trait]
impl Transport for RadioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Radio
    }

    async fn init(&self, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        self.runtime.attach(events);
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        if !self.runtime.begin()? {
            return Ok(());
        }
        let events = self.runtime.sender()?;
        let (tx, mut rx) = mpsc::channel::<InboundLink>(16);
        if let Err(e) = self
            .adapter
            .advertise(&self.config.service_id, &self.local, tx)
            .await
        {
            self.runtime.shutdown();
            return Err(e);
        }

        let ctx = Arc::new(self.pairing_context());
        self.runtime.spawn(async move {
            while let Some((device, io)) = rx.recv().await {
                let ctx = ctx.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    let connection = Connection::new(
                        TransportKind::Radio,
                        Address::Radio {
                            device_id: device.clone(),
                        },
                    );
                    match pair(io, &connection, &device, Role::Responder, &ctx).await {
                        Ok(()) => emit(&events, TransportEvent::IncomingConnection(connection)).await,
                        Err(e) => log::warn!("Inbound radio link from {device} failed: {e}"),
                    }
                });
            }
        });

        log::info!(
            "Radio advertising {} as {}",
            self.config.service_id,
            self.adapter.device_id()
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.runtime.shutdown();
        self.adapter.stop_advertising();
        self.adapter.stop_scan();
        Ok(())
    }

    async fn dial(&self, address: &Address) -> Result<Connection> {
        ensure_kind(TransportKind::Radio, address)?;
        self.runtime.require_started()?;
        let Address::Radio { device_id } = address else {
            return Err(NetworkError::UnsupportedAddress {
                transport: TransportKind::Radio.to_string(),
                address: address.to_string(),
            }
            .into());
        };

        let io = self.adapter.connect(device_id).await?;
        let connection = Connection::new(TransportKind::Radio, address.clone());
        pair(io, &connection, device_id, Role::Initiator, &self.pairing_context()).await?;
        Ok(connection)
    }

    fn listen_addresses(&self) -> Vec<Address> {
        if !self.runtime.is_started() {
            return Vec::new();
        }
        vec![Address::Radio {
            device_id: self.adapter.device_id(),
        }]
    }

    async fn discover(&self) -> Result<Vec<DiscoveredPeer>> {
        self.runtime.require_started()?;
        let events = self.runtime.sender()?;

        self.adapter.start_scan(&self.config.service_id)?;
        let guard = ScanGuard {
            adapter: self.adapter.as_ref(),
        };
        tokio::time::sleep(Duration::from_millis(self.config.scan_window_ms)).await;
        let sightings = self.adapter.sightings();
        drop(guard);

        let mut found = Vec::with_capacity(sightings.len());
        for sighting in sightings {
            let peer = DiscoveredPeer::now(
                sighting.peer,
                Address::Radio {
                    device_id: sighting.device_id,
                },
                Some(sighting.rssi),
            );
            emit(&events, TransportEvent::PeerDiscovered(peer.clone())).await;
            found.push(peer);
        }
        Ok(found)
    }
}

struct Advert {
    service_id: String,
    peer: PeerId,
    inbound: mpsc::Sender<InboundLink>,
    rssi: i16,
}

/// Shared airspace for [`MemoryRadio`] devices
#[derive(Default)]
pub struct RadioMedium {
    adverts: Mutex<HashMap<String, Advert>>,
}

impl RadioMedium {
    /// Empty medium
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// In-process radio device
pub struct MemoryRadio {
    device_id: String,
    medium: Arc<RadioMedium>,
    rssi: i16,
    scan: Mutex<Option<String>>,
    scanning: AtomicBool,
}

impl MemoryRadio {
    /// Device on `medium`, heard by others at `rssi`
    pub fn new(medium: Arc<RadioMedium>, device_id: impl Into<String>, rssi: i16) -> Self {
        Self {
            device_id: device_id.into(),
            medium,
            rssi,
            scan: Mutex::new(None),
            scanning: AtomicBool::new(false),
        }
    }

    /// Whether a scan is running
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RadioAdapter for MemoryRadio {
    fn device_id(&self) -> String {
        self.device_id.clone()
    }

    async fn advertise(
        &self,
        service_id: &str,
        peer: &PeerId,
        inbound: mpsc::Sender<InboundLink>,
    ) -> Result<()> {
        self.medium.adverts.lock().insert(
            self.device_id.clone(),
            Advert {
                service_id: service_id.to_string(),
                peer: peer.clone(),
                inbound,
                rssi: self.rssi,
            },
        );
        Ok(())
    }

    fn stop_advertising(&self) {
        self.medium.adverts.lock().remove(&self.device_id);
    }

    fn start_scan(&self, service_id: &str) -> Result<()> {
        *self.scan.lock() = Some(service_id.to_string());
        self.scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn sightings(&self) -> Vec<RadioSighting> {
        let Some(service_id) = self.scan.lock().clone() else {
            return Vec::new();
        };
        self.medium
            .adverts
            .lock()
            .iter()
            .filter(|(device, advert)| **device != self.device_id && advert.service_id == service_id)
            .map(|(device, advert)| RadioSighting {
                device_id: device.clone(),
                peer: advert.peer.clone(),
                rssi: advert.rssi,
            })
            .collect()
    }

    fn stop_scan(&self) {
        *self.scan.lock() = None;
        self.scanning.store(false, Ordering::SeqCst);
    }

    async fn connect(&self, device_id: &str) -> Result<BoxedIo> {
        let inbound = self
            .medium
            .adverts
            .lock()
            .get(device_id)
            .map(|advert| advert.inbound.clone())
            .ok_or_else(|| NetworkError::ConnectionFailed {
                peer: device_id.to_string(),
                reason: "device not in range".to_string(),
            })?;

        let (local, remote) = tokio::io::duplex(LINK_BUFFER);
        inbound
            .send((self.device_id.clone(), Box::new(remote)))
            .await
            .map_err(|_| NetworkError::ConnectionFailed {
                peer: device_id.to_string(),
                reason: "device stopped listening".to_string(),
            })?;
        Ok(Box::new(local))
    }
}
