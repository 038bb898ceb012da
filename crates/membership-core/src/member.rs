//! Realm membership collaborator.
//!
//! The disconnect machinery never owns the member list. It asks a
//! `MemberManager` whether a peer is a member, how large the realm is, and
//! tells it to remove peers or flip their online status.

use crate::PeerId;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum MemberError {
    #[error("Not a member: {0}")]
    NotMember(PeerId),

    #[error("Cannot remove the local peer")]
    LocalPeer,
}

/// Membership store of one realm.
pub trait MemberManager: Send + Sync {
    fn is_member(&self, peer_id: &PeerId) -> bool;

    /// Members in the realm, the local peer included.
    fn total_count(&self) -> usize;

    fn remove(&self, peer_id: &PeerId) -> Result<(), MemberError>;

    fn update_status(&self, peer_id: &PeerId, online: bool) -> Result<(), MemberError>;
}

/// A member of an in-memory realm.
#[derive(Debug, Clone)]
pub struct Member {
    pub peer_id: PeerId,
    pub online: bool,
    pub joined_at: Instant,
    /// Last time the online flag changed
    pub status_changed_at: Instant,
}

impl Member {
    fn new(peer_id: PeerId) -> Self {
        let now = Instant::now();
        Self {
            peer_id,
            online: true,
            joined_at: now,
            status_changed_at: now,
        }
    }
}

/// In-memory `MemberManager`.
///
/// The local peer is always a member and cannot be removed.
pub struct RealmMembers {
    local_id: PeerId,
    members: RwLock<HashMap<PeerId, Member>>,
}

impl RealmMembers {
    pub fn new(local_id: PeerId) -> Self {
        let mut members = HashMap::new();
        members.insert(local_id, Member::new(local_id));
        Self {
            local_id,
            members: RwLock::new(members),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Add a member. Returns `false` if already present.
    pub fn add(&self, peer_id: PeerId) -> bool {
        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        if members.contains_key(&peer_id) {
            return false;
        }
        members.insert(peer_id, Member::new(peer_id));
        true
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<Member> {
        self.members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer_id)
            .cloned()
    }

    pub fn is_online(&self, peer_id: &PeerId) -> bool {
        self.get(peer_id).is_some_and(|m| m.online)
    }

    /// All member IDs, sorted.
    pub fn member_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<_> = self
            .members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    pub fn online_count(&self) -> usize {
        self.members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|m| m.online)
            .count()
    }
}

impl MemberManager for RealmMembers {
    fn is_member(&self, peer_id: &PeerId) -> bool {
        self.members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(peer_id)
    }

    fn total_count(&self) -> usize {
        self.members.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn remove(&self, peer_id: &PeerId) -> Result<(), MemberError> {
        if *peer_id == self.local_id {
            return Err(MemberError::LocalPeer);
        }
        self.members
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peer_id)
            .map(|_| ())
            .ok_or(MemberError::NotMember(*peer_id))
    }

    fn update_status(&self, peer_id: &PeerId, online: bool) -> Result<(), MemberError> {
        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        let member = members
            .get_mut(peer_id)
            .ok_or(MemberError::NotMember(*peer_id))?;
        if member.online != online {
            member.online = online;
            member.status_changed_at = Instant::now();
        }
        Ok(())
    }
}
