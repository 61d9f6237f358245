//! Group session state with membership epochs.

use super::sender_key::{GroupMessage, ReceiverChain, SenderChain, SenderKeyDistribution};
use super::GroupId;
use crate::identity::PeerId;
use crate::utils::{GroupError, Result};
use std::collections::{BTreeSet, HashMap, VecDeque};

/// Shared group state as held by one member.
///
/// Each member encrypts with its own sender chain for the current epoch and
/// decrypts with the chains the others distributed. A membership change
/// starts a new epoch with fresh sender keys. A retired epoch's receiver
/// chains are frozen where we last saw them, and a member's next-epoch
/// distribution moves its own freeze point to where its chain really
/// stopped. History sent under a retired key stays readable; new content
/// never is.
#[derive(Debug, Clone)]
pub struct GroupSession {
    id: GroupId,
    local: PeerId,
    epoch: u64,
    members: BTreeSet<PeerId>,
    sender: SenderChain,
    receivers: HashMap<(PeerId, u64), ReceiverChain>,
    /// Retired epochs still readable, oldest first
    retired_epochs: VecDeque<u64>,
    retained_epochs: usize,
    max_skip: u32,
}

impl GroupSession {
    /// Create a group we own at epoch 0
    ///
    /// # Arguments
    ///
    /// * `id` - Group identifier
    /// * `local` - Our identity; always a member
    /// * `members` - The other members
    /// * `retained_epochs` - Retired epochs kept readable
    /// * `max_skip` - Largest iteration gap accepted per sender chain
    pub fn create(
        id: GroupId,
        local: PeerId,
        members: impl IntoIterator<Item = PeerId>,
        retained_epochs: usize,
        max_skip: u32,
    ) -> Self {
        let mut members: BTreeSet<PeerId> = members.into_iter().collect();
        members.insert(local.clone());
        log::info!("Created group {} with {} members", id, members.len());

        Self {
            id,
            local,
            epoch: 0,
            members,
            sender: SenderChain::generate(0),
            receivers: HashMap::new(),
            retired_epochs: VecDeque::new(),
            retained_epochs,
            max_skip,
        }
    }

    /// Join a group from the first distribution we received for it
    ///
    /// # Errors
    ///
    /// Returns `GroupError::NotMember` if the distribution does not list us.
    pub fn join(
        local: PeerId,
        distribution: &SenderKeyDistribution,
        retained_epochs: usize,
        max_skip: u32,
    ) -> Result<Self> {
        if !distribution.members.contains(&local) {
            return Err(GroupError::NotMember {
                group: distribution.group.to_string(),
                peer: local.to_string(),
            }
            .into());
        }

        let mut session = Self {
            id: distribution.group.clone(),
            local,
            epoch: distribution.epoch,
            members: distribution.members.iter().cloned().collect(),
            sender: SenderChain::generate(distribution.epoch),
            receivers: HashMap::new(),
            retired_epochs: VecDeque::new(),
            retained_epochs,
            max_skip,
        };
        session.install(distribution)?;
        log::info!("Joined group {} at epoch {}", session.id, session.epoch);
        Ok(session)
    }

    /// Group identifier
    pub fn id(&self) -> &GroupId {
        &self.id
    }

    /// Current epoch
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Current members, including us
    pub fn members(&self) -> impl Iterator<Item = &PeerId> {
        self.members.iter()
    }

    /// Whether a peer is a member of the current epoch
    pub fn is_member(&self, peer: &PeerId) -> bool {
        self.members.contains(peer)
    }

    /// Members our sender key must be distributed to
    pub fn recipients(&self) -> Vec<PeerId> {
        self.members
            .iter()
            .filter(|member| **member != self.local)
            .cloned()
            .collect()
    }

    /// Retired epochs still readable
    pub fn retained_epochs(&self) -> impl Iterator<Item = u64> + '_ {
        self.retired_epochs.iter().copied()
    }

    /// Our sender key for the current epoch
    pub fn distribution(&self) -> SenderKeyDistribution {
        self.sender
            .distribution(&self.id, &self.local, self.members.iter().cloned().collect())
    }

    /// Add a member; starts a new epoch
    pub fn add_member(&mut self, peer: PeerId) -> u64 {
        if self.members.insert(peer.clone()) {
            log::info!("Added {} to group {}", peer, self.id);
            self.advance_epoch(self.epoch + 1);
        }
        self.epoch
    }

    /// Remove a member; starts a new epoch whose keys the removed member
    /// never receives
    ///
    /// # Errors
    ///
    /// Returns `GroupError::NotMember` if the peer is not a member.
    pub fn remove_member(&mut self, peer: &PeerId) -> Result<u64> {
        if peer == &self.local || !self.members.remove(peer) {
            return Err(GroupError::NotMember {
                group: self.id.to_string(),
                peer: peer.to_string(),
            }
            .into());
        }
        log::info!("Removed {} from group {}", peer, self.id);
        self.advance_epoch(self.epoch + 1);
        Ok(self.epoch)
    }

    fn advance_epoch(&mut self, epoch: u64) {
        let retired = self.epoch;
        for ((_, chain_epoch), chain) in self.receivers.iter_mut() {
            if *chain_epoch == retired {
                chain.freeze();
            }
        }
        self.retired_epochs.push_back(retired);
        while self.retired_epochs.len() > self.retained_epochs {
            if let Some(dropped) = self.retired_epochs.pop_front() {
                self.receivers.retain(|(_, e), _| *e != dropped);
                log::debug!("Group {} dropped keys of epoch {}", self.id, dropped);
            }
        }

        self.epoch = epoch;
        self.sender = self.sender.rotate(epoch);
        log::debug!("Group {} now at epoch {}", self.id, epoch);
    }

    fn install(&mut self, distribution: &SenderKeyDistribution) -> Result<()> {
        if !self.members.contains(&distribution.sender) {
            return Err(GroupError::NotMember {
                group: self.id.to_string(),
                peer: distribution.sender.to_string(),
            }
            .into());
        }
        let key = (distribution.sender.clone(), distribution.epoch);
        let keep_existing = self.receivers.get(&key).is_some_and(|existing| {
            existing.signing_key() == &distribution.signing_key
                && existing.iteration() >= distribution.iteration
        });
        if !keep_existing {
            self.receivers.insert(
                key,
                ReceiverChain::from_distribution(distribution, self.max_skip),
            );
        }
        if let Some((retired_epoch, final_iteration)) = distribution.retired_chain {
            if retired_epoch < distribution.epoch {
                if let Some(chain) = self
                    .receivers
                    .get_mut(&(distribution.sender.clone(), retired_epoch))
                {
                    chain.extend_freeze(final_iteration);
                }
            }
        }
        Ok(())
    }

    /// Accept another member's sender key.
    ///
    /// A distribution for a newer epoch means membership changed elsewhere:
    /// we adopt its member list and rotate our own sender key. Returns true
    /// in that case, and the caller must distribute our new key.
    ///
    /// # Errors
    ///
    /// * `GroupError::UnknownGroup` - the distribution is for another group
    /// * `GroupError::EpochMismatch` - the distribution is for a retired epoch
    /// * `GroupError::NotMember` - the sender or we are not members
    pub fn process_distribution(&mut self, distribution: &SenderKeyDistribution) -> Result<bool> {
        if distribution.group != self.id {
            return Err(GroupError::UnknownGroup {
                group: distribution.group.to_string(),
            }
            .into());
        }
        if distribution.sender == self.local {
            return Ok(false);
        }
        if distribution.epoch < self.epoch {
            return Err(GroupError::EpochMismatch {
                group: self.id.to_string(),
                message_epoch: distribution.epoch,
                current_epoch: self.epoch,
            }
            .into());
        }

        let mut advanced = false;
        if distribution.epoch > self.epoch {
            if !distribution.members.contains(&self.local) {
                return Err(GroupError::NotMember {
                    group: self.id.to_string(),
                    peer: self.local.to_string(),
                }
                .into());
            }
            self.advance_epoch(distribution.epoch);
            self.members = distribution.members.iter().cloned().collect();
            advanced = true;
        }

        self.install(distribution)?;
        Ok(advanced)
    }

    /// Encrypt for the group under the current epoch
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<GroupMessage> {
        self.sender.encrypt(&self.id, &self.local, plaintext)
    }

    /// Decrypt a group message.
    ///
    /// # Errors
    ///
    /// * `GroupError::EpochMismatch` - the epoch is unknown to us, dropped,
    ///   or the retired chain is frozen against new content
    /// * `GroupError::MissingSenderKey` - no key from that sender for the epoch
    /// * `GroupError::NotMember` - the sender is not a current member
    pub fn decrypt(&mut self, message: &GroupMessage) -> Result<Vec<u8>> {
        if message.group != self.id {
            return Err(GroupError::UnknownGroup {
                group: message.group.to_string(),
            }
            .into());
        }
        let readable = message.epoch == self.epoch || self.retired_epochs.contains(&message.epoch);
        if !readable {
            return Err(GroupError::EpochMismatch {
                group: self.id.to_string(),
                message_epoch: message.epoch,
                current_epoch: self.epoch,
            }
            .into());
        }
        if message.epoch == self.epoch && !self.members.contains(&message.sender) {
            return Err(GroupError::NotMember {
                group: self.id.to_string(),
                peer: message.sender.to_string(),
            }
            .into());
        }

        let key = (message.sender.clone(), message.epoch);
        let chain = self
            .receivers
            .get(&key)
            .ok_or_else(|| GroupError::MissingSenderKey {
                group: self.id.to_string(),
                sender: message.sender.to_string(),
            })?;

        let mut next = chain.clone();
        let plaintext = next.decrypt(message, self.max_skip, self.epoch)?;
        self.receivers.insert(key, next);
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ChainType;
    use crate::utils::ErrorKind;

    fn peer(address: &str, name: &str) -> PeerId {
        PeerId::new(address, ChainType::Ethereum, name)
    }

    /// Alice owns the group; everyone exchanges sender keys
    fn trio() -> (GroupSession, GroupSession, GroupSession) {
        let (a, b, c) = (peer("0xA", "Alice"), peer("0xB", "Bob"), peer("0xC", "Carol"));
        let mut alice = GroupSession::create(
            GroupId::new("friends"),
            a,
            [b.clone(), c.clone()],
            4,
            1000,
        );
        let invite = alice.distribution();
        let mut bob = GroupSession::join(b, &invite, 4, 1000).unwrap();
        let mut carol = GroupSession::join(c, &invite, 4, 1000).unwrap();

        let from_bob = bob.distribution();
        let from_carol = carol.distribution();
        alice.process_distribution(&from_bob).unwrap();
        alice.process_distribution(&from_carol).unwrap();
        bob.process_distribution(&from_carol).unwrap();
        carol.process_distribution(&from_bob).unwrap();
        (alice, bob, carol)
    }

    #[test]
    fn test_all_members_decrypt() {
        let (mut alice, mut bob, mut carol) = trio();
        let message = alice.encrypt(b"hi all").unwrap();
        assert_eq!(bob.decrypt(&message).unwrap(), b"hi all");
        assert_eq!(carol.decrypt(&message).unwrap(), b"hi all");

        let reply = carol.encrypt(b"hey").unwrap();
        assert_eq!(alice.decrypt(&reply).unwrap(), b"hey");
        assert_eq!(bob.decrypt(&reply).unwrap(), b"hey");
    }

    #[test]
    fn test_removed_member_loses_future_keeps_history() {
        let (mut alice, mut bob, mut carol) = trio();
        let before = alice.encrypt(b"before").unwrap();
        let late = alice.encrypt(b"in flight").unwrap();
        assert_eq!(carol.decrypt(&before).unwrap(), b"before");

        let carol_id = peer("0xC", "Carol");
        assert_eq!(alice.remove_member(&carol_id).unwrap(), 1);
        assert_eq!(alice.recipients(), vec![peer("0xB", "Bob")]);

        // only Bob receives the epoch 1 key
        assert!(bob.process_distribution(&alice.distribution()).unwrap());
        assert!(!bob.is_member(&carol_id));
        alice.process_distribution(&bob.distribution()).unwrap();

        let after = alice.encrypt(b"after").unwrap();
        assert_eq!(after.epoch, 1);
        assert_eq!(bob.decrypt(&after).unwrap(), b"after");
        assert_eq!(
            carol.decrypt(&after).unwrap_err().kind(),
            ErrorKind::GroupEpochMismatch
        );

        // history from epoch 0 stays readable for everyone who held the key
        assert_eq!(carol.decrypt(&late).unwrap(), b"in flight");
        assert_eq!(bob.decrypt(&before).unwrap(), b"before");
        assert_eq!(bob.decrypt(&late).unwrap(), b"in flight");
    }

    #[test]
    fn test_removed_member_cannot_inject_into_retired_epoch() {
        let (mut alice, mut bob, mut carol) = trio();
        let seen = carol.encrypt(b"while a member").unwrap();
        assert_eq!(bob.decrypt(&seen).unwrap(), b"while a member");

        alice.remove_member(&peer("0xC", "Carol")).unwrap();
        bob.process_distribution(&alice.distribution()).unwrap();
        assert_eq!(bob.epoch(), 1);

        // Carol keeps sending under epoch 0 after her removal
        let first = carol.encrypt(b"new content after removal").unwrap();
        let err = bob.decrypt(&first).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GroupEpochMismatch);
        let err = alice.decrypt(&first).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GroupEpochMismatch);
    }

    #[test]
    fn test_in_flight_messages_of_remaining_members_still_decrypt() {
        let (mut alice, mut bob, _carol) = trio();
        let in_flight = bob.encrypt(b"sent before the change").unwrap();

        alice.remove_member(&peer("0xC", "Carol")).unwrap();
        // frozen where Alice last saw Bob's chain
        assert_eq!(
            alice.decrypt(&in_flight).unwrap_err().kind(),
            ErrorKind::GroupEpochMismatch
        );

        // Bob's epoch 1 key says where his epoch 0 chain stopped
        bob.process_distribution(&alice.distribution()).unwrap();
        let from_bob = bob.distribution();
        assert_eq!(from_bob.retired_chain, Some((0, 1)));
        alice.process_distribution(&from_bob).unwrap();
        assert_eq!(alice.decrypt(&in_flight).unwrap(), b"sent before the change");
    }

    #[test]
    fn test_replay_and_forgery_rejected() {
        let (mut alice, mut bob, _carol) = trio();
        let message = alice.encrypt(b"once").unwrap();
        bob.decrypt(&message).unwrap();
        assert_eq!(bob.decrypt(&message).unwrap_err().kind(), ErrorKind::ReplayDetected);

        let mut forged = alice.encrypt(b"twice").unwrap();
        forged.ciphertext[0] ^= 1;
        assert!(bob.decrypt(&forged).unwrap_err().is_security_violation());
    }

    #[test]
    fn test_out_of_order_group_messages() {
        let (mut alice, mut bob, _carol) = trio();
        let messages: Vec<_> = (0..4)
            .map(|i| alice.encrypt(format!("g{i}").as_bytes()).unwrap())
            .collect();
        for i in [2usize, 0, 3, 1] {
            assert_eq!(bob.decrypt(&messages[i]).unwrap(), format!("g{i}").as_bytes());
        }
    }

    #[test]
    fn test_retired_epochs_are_bounded() {
        let (mut alice, _bob, _carol) = trio();
        for i in 0..6 {
            alice.add_member(peer(&format!("0x{i}F"), "extra"));
        }
        assert_eq!(alice.epoch(), 6);
        assert_eq!(alice.retained_epochs().collect::<Vec<_>>(), vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_join_requires_membership() {
        let alice = GroupSession::create(GroupId::new("g"), peer("0xA", "Alice"), [], 4, 1000);
        let err = GroupSession::join(peer("0xE", "Eve"), &alice.distribution(), 4, 1000);
        assert!(err.is_err());
    }
}
