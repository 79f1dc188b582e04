//! Kademlia routing table

use std::collections::VecDeque;

use mockroute_lib::dht_messages::{NodeId, PeerInfo};
use mockroute_lib::{bucket_index, distance_cmp, ID_BITS};

/// Outcome of offering a contact to the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insertion {
    Inserted,
    Refreshed,
    /// The bucket is full; the contact was parked in the replacement cache
    /// until a liveness check of `oldest` decides who stays.
    Pending { oldest: PeerInfo },
    Ignored,
}

#[derive(Debug, Clone, Default)]
struct KBucket {
    // Least recently seen at the front
    contacts: VecDeque<PeerInfo>,
    replacements: VecDeque<PeerInfo>,
}

impl KBucket {
    fn position(&self, id: &NodeId) -> Option<usize> {
        self.contacts.iter().position(|c| &c.id == id)
    }

    fn touch(&mut self, contact: PeerInfo, k: usize) -> Insertion {
        if let Some(pos) = self.position(&contact.id) {
            self.contacts.remove(pos);
            self.contacts.push_back(contact);
            return Insertion::Refreshed;
        }

        if self.contacts.len() < k {
            self.contacts.push_back(contact);
            return Insertion::Inserted;
        }

        self.replacements.retain(|c| c.id != contact.id);
        self.replacements.push_back(contact);
        if self.replacements.len() > k {
            self.replacements.pop_front();
        }
        match self.contacts.front() {
            Some(oldest) => Insertion::Pending {
                oldest: oldest.clone(),
            },
            None => Insertion::Ignored,
        }
    }

    // Removes a contact and promotes the freshest replacement, if any.
    fn remove(&mut self, id: &NodeId) -> Option<PeerInfo> {
        let removed = self.position(id).and_then(|pos| self.contacts.remove(pos));
        if removed.is_some() {
            if let Some(replacement) = self.replacements.pop_back() {
                self.contacts.push_back(replacement);
            }
        } else {
            self.replacements.retain(|c| &c.id != id);
        }
        removed
    }
}

#[derive(Debug, Clone)]
pub struct RoutingTable {
    local_id: NodeId,
    k: usize,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, k: usize) -> Self {
        Self {
            local_id,
            k: k.max(1),
            buckets: vec![KBucket::default(); ID_BITS],
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Add or refresh a contact. Our own ID is never stored.
    pub fn update(&mut self, contact: PeerInfo) -> Insertion {
        let k = self.k;
        match bucket_index(&self.local_id, &contact.id)
            .and_then(|idx| self.buckets.get_mut(idx))
        {
            Some(bucket) => bucket.touch(contact, k),
            None => Insertion::Ignored,
        }
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<PeerInfo> {
        bucket_index(&self.local_id, id)
            .and_then(|idx| self.buckets.get_mut(idx))
            .and_then(|bucket| bucket.remove(id))
    }

    pub fn get(&self, id: &NodeId) -> Option<&PeerInfo> {
        let bucket = bucket_index(&self.local_id, id).and_then(|idx| self.buckets.get(idx))?;
        bucket.contacts.iter().find(|c| &c.id == id)
    }

    /// The `count` known contacts closest to `target`, nearest first.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<PeerInfo> {
        let mut all: Vec<PeerInfo> = self
            .buckets
            .iter()
            .flat_map(|b| b.contacts.iter().cloned())
            .collect();
        all.sort_by(|a, b| distance_cmp(target, &a.id, &b.id));
        all.truncate(count);
        all
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.contacts.is_empty())
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.buckets
            .iter()
            .flat_map(|b| b.contacts.iter().cloned())
            .collect()
    }
}
