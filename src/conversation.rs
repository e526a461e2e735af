//! Conversation identity and the conversation table
//!
//! A conversation is one bidirectional flow between two endpoints over one
//! transport. Endpoints are stored in sorted order, so lookups from either
//! direction resolve to the same [`ConversationId`].

use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Network-layer address of one side of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Address {
    Ipv4([u8; 4]),
    Ipv6([u8; 16]),
    /// 24-bit Fibre Channel port address (D_ID / S_ID)
    Fc([u8; 3]),
}

impl Address {
    pub fn fc(id: u32) -> Self {
        let b = id.to_be_bytes();
        Address::Fc([b[1], b[2], b[3]])
    }
}

impl From<Ipv4Addr> for Address {
    fn from(addr: Ipv4Addr) -> Self {
        Address::Ipv4(addr.octets())
    }
}

impl From<Ipv6Addr> for Address {
    fn from(addr: Ipv6Addr) -> Self {
        Address::Ipv6(addr.octets())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Address::Ipv4(o) => write!(f, "{}", Ipv4Addr::from(o)),
            Address::Ipv6(o) => write!(f, "{}", Ipv6Addr::from(o)),
            Address::Fc([a, b, c]) => write!(f, "{:02x}.{:02x}.{:02x}", a, b, c),
        }
    }
}

/// Address plus port; FC endpoints use port 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub addr: Address,
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: impl Into<Address>, port: u16) -> Self {
        Endpoint {
            addr: addr.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// Transport a conversation was observed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Transport {
    Tcp,
    FibreChannel,
}

/// Stable index of a conversation within one analysis session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationId(pub u32);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conv#{}", self.0)
    }
}

/// Canonical (direction independent) conversation identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub low: Endpoint,
    pub high: Endpoint,
    pub transport: Transport,
}

impl ConversationKey {
    pub fn new(a: Endpoint, b: Endpoint, transport: Transport) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        ConversationKey {
            low,
            high,
            transport,
        }
    }
}

/// Table of every conversation seen in the current session
#[derive(Debug, Default)]
pub struct ConversationTable {
    index: HashMap<ConversationKey, ConversationId>,
    keys: Vec<ConversationKey>,
}

impl ConversationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the conversation between `a` and `b`, creating it on first sight
    pub fn find_or_create(
        &mut self,
        a: Endpoint,
        b: Endpoint,
        transport: Transport,
    ) -> ConversationId {
        let key = ConversationKey::new(a, b, transport);
        if let Some(&id) = self.index.get(&key) {
            return id;
        }
        let id = ConversationId(self.keys.len() as u32);
        log::trace!("New {:?} conversation {} between {} and {}", transport, id, a, b);
        self.keys.push(key);
        self.index.insert(key, id);
        id
    }

    /// Read-only lookup
    pub fn lookup(&self, a: Endpoint, b: Endpoint, transport: Transport) -> Option<ConversationId> {
        self.index.get(&ConversationKey::new(a, b, transport)).copied()
    }

    pub fn key(&self, id: ConversationId) -> Option<&ConversationKey> {
        self.keys.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
