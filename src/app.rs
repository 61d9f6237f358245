//! Application wiring.
//!
//! Every long-lived component (peer table, transports, transport manager,
//! stores, session service, messaging orchestrator) is constructed exactly
//! once here and handed to its consumers explicitly. Nothing in the library
//! reaches for a global.

use crate::crypto::{IdentityKeyPair, UserProfile};
use crate::identity::{PeerId, PeerStore, TransportKind};
use crate::messaging::{MessagingEvent, MessagingService, MessagingStores};
use crate::session::SessionService;
use crate::store::{
    MemoryGroupSessionStore, MemoryMessageStore, MemoryPreKeyStore, MemorySessionStore, PreKeyStore,
};
use crate::transport::data_channel::{DataChannelTransport, MemoryRtc, MemorySignaling, RtcBackend, RtcFabric, Signaling};
use crate::transport::radio::{AutoConfirm, MemoryRadio, PairingConfirmer, RadioAdapter, RadioMedium, RadioTransport};
use crate::transport::relay::RelayTransport;
use crate::transport::socket::SocketTransport;
use crate::transport::{Transport, TransportManager};
use crate::utils::{ConfigError, MessengerConfig, Result, StorageConfig, TransportConfig};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const PROFILE_FILE: &str = "profile.json";
const PRIVATE_KEY_FILE: &str = "private_key";

/// Signal strength reported by in-process radios
const IN_PROCESS_RSSI: i16 = -40;

/// Platform services the radio and data-channel transports run on
pub struct Platform {
    /// Short-range radio
    pub radio: Arc<dyn RadioAdapter>,
    /// Asks the user to confirm a pairing code
    pub confirmer: Arc<dyn PairingConfirmer>,
    /// Offer/answer/candidate exchange
    pub signaling: Arc<dyn Signaling>,
    /// Data-channel stack
    pub rtc: Arc<dyn RtcBackend>,
    /// Our id on the signaling channel
    pub signaling_id: String,
}

impl Platform {
    /// In-process adapters over shared media.
    ///
    /// Nodes built with the same medium, signaling hub and fabric can reach
    /// each other over radio and data channels inside one process.
    pub fn in_process(
        local: &PeerId,
        medium: Arc<RadioMedium>,
        signaling: Arc<MemorySignaling>,
        fabric: Arc<RtcFabric>,
    ) -> Self {
        let signaling_id = format!("{}-{}", local.chain_type(), local.address());
        Self {
            radio: Arc::new(MemoryRadio::new(
                medium,
                format!("radio-{}", local.address()),
                IN_PROCESS_RSSI,
            )),
            confirmer: Arc::new(AutoConfirm),
            signaling,
            rtc: Arc::new(MemoryRtc::new(fabric, signaling_id.clone())),
            signaling_id,
        }
    }

    /// In-process adapters nobody else shares
    pub fn standalone(local: &PeerId) -> Self {
        Self::in_process(local, RadioMedium::new(), MemorySignaling::new(), RtcFabric::new())
    }
}

/// Build one transport from its validated configuration
pub fn build_transport(
    config: &TransportConfig,
    local: &PeerId,
    platform: &Platform,
    max_frame: usize,
) -> Result<Arc<dyn Transport>> {
    config.validate()?;
    let transport: Arc<dyn Transport> = match config {
        TransportConfig::Radio(radio) => Arc::new(RadioTransport::new(
            radio.clone(),
            local.clone(),
            platform.radio.clone(),
            platform.confirmer.clone(),
            max_frame,
        )),
        TransportConfig::DataChannel(data_channel) => Arc::new(DataChannelTransport::new(
            data_channel.clone(),
            local.clone(),
            platform.signaling_id.clone(),
            platform.signaling.clone(),
            platform.rtc.clone(),
            max_frame,
        )),
        TransportConfig::Socket(socket) => {
            Arc::new(SocketTransport::new(socket.clone(), local.clone(), max_frame))
        }
        TransportConfig::Relay(relay) => {
            Arc::new(RelayTransport::new(relay.clone(), local.clone(), max_frame))
        }
    };
    Ok(transport)
}

/// Persist an identity under the keys directory
pub fn save_profile(storage: &StorageConfig, profile: &UserProfile) -> Result<()> {
    std::fs::create_dir_all(&storage.keys_dir).map_err(|_| ConfigError::DirectoryCreation {
        path: storage.keys_dir.display().to_string(),
    })?;
    let profile_json = serde_json::to_string_pretty(&profile.peer)?;
    std::fs::write(storage.keys_dir.join(PROFILE_FILE), profile_json)?;
    std::fs::write(
        storage.keys_dir.join(PRIVATE_KEY_FILE),
        profile.export_private_key(),
    )?;
    Ok(())
}

/// Load the identity saved by [`save_profile`]
///
/// # Errors
///
/// Returns `ConfigError::FileNotFound` when no identity has been generated.
pub fn load_profile(storage: &StorageConfig) -> Result<UserProfile> {
    let profile_path = storage.keys_dir.join(PROFILE_FILE);
    let private_key_path = storage.keys_dir.join(PRIVATE_KEY_FILE);
    if !profile_path.exists() || !private_key_path.exists() {
        return Err(ConfigError::FileNotFound {
            path: profile_path.display().to_string(),
        }
        .into());
    }

    let peer: PeerId = serde_json::from_str(&std::fs::read_to_string(&profile_path)?)?;
    let keypair = IdentityKeyPair::from_secret_bytes(&std::fs::read(&private_key_path)?)?;
    Ok(UserProfile::from_keypair(peer, keypair))
}

/// Whether an identity exists in the keys directory
pub fn profile_exists(keys_dir: &Path) -> bool {
    keys_dir.join(PROFILE_FILE).exists()
}

/// Main application structure
pub struct App {
    config: MessengerConfig,
    profile: Arc<UserProfile>,
    peers: Arc<PeerStore>,
    manager: TransportManager,
    messaging: MessagingService,
    dispatch: JoinHandle<()>,
    events: Option<mpsc::Receiver<MessagingEvent>>,
}

impl App {
    /// Construct every component for `profile`
    ///
    /// # Arguments
    ///
    /// * `config` - Validated configuration; its transport list decides
    ///   which transports are registered
    /// * `profile` - Local identity
    /// * `platform` - Radio and data-channel services
    pub async fn new(config: MessengerConfig, profile: UserProfile, platform: Platform) -> Result<Self> {
        config.validate()?;
        let profile = Arc::new(profile);
        let local = profile.peer.clone();

        let peers = Arc::new(PeerStore::new());
        let (manager, manager_events) =
            TransportManager::new(local.clone(), config.network.clone(), peers.clone());
        for transport in &config.network.transports {
            let transport = build_transport(transport, &local, &platform, config.network.max_frame_size)?;
            manager.register(transport).await?;
        }

        let prekeys: Arc<dyn PreKeyStore> = Arc::new(MemoryPreKeyStore::new());
        let sessions = Arc::new(SessionService::new(
            profile.clone(),
            prekeys.clone(),
            Arc::new(MemorySessionStore::new()),
            &config.crypto,
        ));
        let stores = MessagingStores {
            prekeys,
            groups: Arc::new(MemoryGroupSessionStore::new()),
            messages: Arc::new(MemoryMessageStore::new()),
        };
        let (messaging, events) =
            MessagingService::new(profile.clone(), manager.clone(), sessions, stores, &config.crypto)?;
        let dispatch = messaging.start(manager_events);

        log::info!(
            "Messenger for {} ready with transports {:?}",
            local,
            manager.transport_kinds()
        );
        Ok(Self {
            config,
            profile,
            peers,
            manager,
            messaging,
            dispatch,
            events: Some(events),
        })
    }

    /// Start every registered transport
    pub async fn start(&self) -> Result<()> {
        self.manager.start().await?;
        for address in self.manager.local_addresses() {
            log::info!("Listening on {}", address);
        }
        Ok(())
    }

    /// Configuration in use
    pub fn config(&self) -> &MessengerConfig {
        &self.config
    }

    /// Local identity
    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    /// Peer table shared by all transports
    pub fn peers(&self) -> &Arc<PeerStore> {
        &self.peers
    }

    /// Transport manager
    pub fn manager(&self) -> &TransportManager {
        &self.manager
    }

    /// Messaging orchestrator
    pub fn messaging(&self) -> &MessagingService {
        &self.messaging
    }

    /// Registered transports, in dial priority order
    pub fn transport_kinds(&self) -> Vec<TransportKind> {
        self.manager.transport_kinds()
    }

    /// Take the UI event receiver; only the first call gets it
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<MessagingEvent>> {
        self.events.take()
    }

    /// Stop transports and the dispatch loop
    pub async fn shutdown(self) {
        log::info!("Shutting down messenger for {}", self.profile.peer);
        self.manager.stop().await;
        self.dispatch.abort();
    }
}
