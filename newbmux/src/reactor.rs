//! Boundary towards the readiness reactor.
//!
//! Endpoints and transport policies never poll anything themselves. They
//! state which tokens want write readiness and when each token's next
//! deadline is, and the reactor calls back into the endpoint.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use crate::error::Operation;
use crate::registry::ConnectionKey;

/// What a registration refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Token {
    /// The acceptor's shared socket.
    Acceptor,
    /// The dialer's socket and its connect deadline.
    Dialer,
    /// One connection's transport policy.
    Connection(ConnectionKey),
}

pub trait Reactor {
    fn register(&mut self, token: Token, op: Operation);

    fn deregister(&mut self, token: Token, op: Operation);

    /// Arms (or with `None`, disarms) the single deadline held by `token`.
    fn set_timeout(&mut self, token: Token, deadline: Option<Instant>);
}

/// Reactor that records interests and deadlines.
///
/// The tokio driver consults it between events; tests inspect it directly.
#[derive(Debug, Default, Clone)]
pub struct InterestSet {
    read: BTreeSet<Token>,
    write: BTreeSet<Token>,
    deadlines: BTreeMap<Token, Instant>,
}

impl InterestSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, token: Token, op: Operation) -> bool {
        match op {
            Operation::Read => self.read.contains(&token),
            Operation::Write => self.write.contains(&token),
        }
    }

    /// True while any token holds write interest.
    pub fn wants_write(&self) -> bool {
        !self.write.is_empty()
    }

    pub fn write_tokens(&self) -> impl Iterator<Item = Token> + '_ {
        self.write.iter().copied()
    }

    pub fn deadline(&self, token: Token) -> Option<Instant> {
        self.deadlines.get(&token).copied()
    }

    /// Earliest armed deadline across all tokens.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    pub fn clear(&mut self) {
        self.read.clear();
        self.write.clear();
        self.deadlines.clear();
    }
}

impl Reactor for InterestSet {
    fn register(&mut self, token: Token, op: Operation) {
        match op {
            Operation::Read => self.read.insert(token),
            Operation::Write => self.write.insert(token),
        };
    }

    fn deregister(&mut self, token: Token, op: Operation) {
        match op {
            Operation::Read => self.read.remove(&token),
            Operation::Write => self.write.remove(&token),
        };
    }

    fn set_timeout(&mut self, token: Token, deadline: Option<Instant>) {
        match deadline {
            Some(at) => {
                self.deadlines.insert(token, at);
            }
            None => {
                self.deadlines.remove(&token);
            }
        }
    }
}
