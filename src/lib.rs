//! This library provides tools to build a transparent, relaying HTTP reverse
//! proxy.
//!
//! It handles network polling, HTTP/1.x parsing and keep-alive pipelining in
//! a fast single threaded event loop. Each accepted connection becomes a
//! [pipeline::Pipeline]: a pair of protocol state machines relaying bytes
//! between the client and an upstream server chosen per request by an
//! injected [exchange::Router] policy.
//!
//! The proxy is transparent: requests are forwarded byte for byte apart from
//! a small set of rewritten headers, responses are relayed back in request
//! order, and a connection can be handed over wholesale to an external
//! handler (for locally served paths or multiplexed websocket upgrades).
//!
//! ```ignore
//! let config = ProxyConfig {
//!     listen_addresses: vec!["127.0.0.1:8080".parse().unwrap()],
//!     ..Default::default()
//! };
//!
//! let mut server = Server::try_new(config, Box::new(router))?;
//! let handle = server.handle();
//!
//! thread::spawn(move || server.run());
//!
//! // later:
//! handle.stop();
//! ```
#![cfg_attr(feature = "unstable", feature(test))]
#[cfg(all(feature = "unstable", test))]
extern crate test;

#[macro_use]
extern crate log;

#[macro_use]
pub mod util;
#[macro_use]
pub mod logging;

pub mod answers;
pub mod buffer;
pub mod config;
pub mod exchange;
pub mod fault;
pub mod flow;
pub mod headers;
pub mod parser;
pub mod pipeline;
pub mod pool;
pub mod registry;
pub mod server;
pub mod socket;
pub mod stream;
pub mod timer;

use std::{cell::RefCell, fmt, ops, rc::Rc, time::Instant};

use mio::Token;

pub use crate::{
    config::ProxyConfig,
    exchange::{LocalHandler, Route, Router, UpgradeHandler},
    fault::RelayFault,
    server::{Server, ServerHandle},
    socket::UpstreamAddr,
};

/// readiness bits, decoupled from the polling backend so that interest and
/// received events can be masked against each other
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
pub struct Ready(pub u16);

impl Ready {
    pub const EMPTY: Ready = Ready(0);
    pub const READABLE: Ready = Ready(0b0001);
    pub const WRITABLE: Ready = Ready(0b0010);
    pub const ERROR: Ready = Ready(0b0100);
    pub const HUP: Ready = Ready(0b1000);

    pub const ALL: Ready = Ready(0b0011);

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        self.contains(Ready::READABLE)
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.contains(Ready::WRITABLE)
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.contains(Ready::ERROR)
    }

    #[inline]
    pub fn is_hup(&self) -> bool {
        self.contains(Ready::HUP)
    }

    #[inline]
    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }

    #[inline]
    pub fn contains(&self, other: Ready) -> bool {
        (*self & other) == other
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    #[inline]
    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl ops::BitOrAssign for Ready {
    #[inline]
    fn bitor_assign(&mut self, other: Ready) {
        self.0 |= other.0;
    }
}

impl ops::BitAnd for Ready {
    type Output = Ready;

    #[inline]
    fn bitand(self, other: Ready) -> Ready {
        Ready(self.0 & other.0)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let flags = [
            (Ready::READABLE, "Readable"),
            (Ready::WRITABLE, "Writable"),
            (Ready::ERROR, "Error"),
            (Ready::HUP, "Hup"),
        ];

        let mut one = false;
        for (flag, msg) in flags.iter() {
            if self.contains(*flag) {
                if one {
                    write!(f, " | ")?;
                }
                write!(f, "{msg}")?;
                one = true;
            }
        }

        if !one {
            f.write_str("(empty)")?;
        }

        Ok(())
    }
}

impl From<&mio::event::Event> for Ready {
    fn from(e: &mio::event::Event) -> Self {
        let mut r = Ready::EMPTY;
        if e.is_readable() {
            r.insert(Ready::READABLE);
        }
        if e.is_writable() {
            r.insert(Ready::WRITABLE);
        }
        if e.is_error() {
            r.insert(Ready::ERROR);
        }
        if e.is_read_closed() || e.is_write_closed() {
            r.insert(Ready::HUP);
        }
        r
    }
}

/// interest is what the state machine wants, event is what the kernel
/// reported; a socket direction runs only when both bits are set
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub interest: Ready,
    pub event: Ready,
}

impl Default for Readiness {
    fn default() -> Readiness {
        Readiness::new()
    }
}

impl Readiness {
    pub fn new() -> Readiness {
        Readiness {
            interest: Ready::EMPTY,
            event: Ready::EMPTY,
        }
    }

    pub fn reset(&mut self) {
        self.interest = Ready::EMPTY;
        self.event = Ready::EMPTY;
    }

    /// filters the readiness we got from mio with the interest we want
    pub fn filter_interest(&self) -> Ready {
        self.interest & self.event
    }
}

/// result of a session-level dispatch round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionResult {
    /// the session can continue to wait for events
    Continue,
    /// the whole session must be closed
    Close,
    /// the session relinquishes its client socket to an external handler
    Handover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptError {
    IoError,
    TooManySessions,
    WouldBlock,
    BlockedAddress,
    RegistryFull,
}

/// Sessions and listeners are all stored in the server's slab, indexed by
/// their [mio::Token]s. The event loop only ever talks to them through this
/// trait.
pub trait ProxySession {
    /// dispatch loop of the session's state machine; called whenever one of
    /// the session's tokens received an event, and once more after timeouts.
    /// The session receives its own handle so it can register new tokens
    /// (e.g. an upstream socket) pointing back at itself
    fn ready(&mut self, session: Rc<RefCell<dyn ProxySession>>) -> SessionResult;
    /// the event loop got an event for one of the session's tokens
    fn update_readiness(&mut self, token: Token, events: Ready);
    /// one of the session's timeouts triggered
    fn timeout(&mut self, token: Token) -> SessionResult;
    /// last moment this session saw socket or timer activity
    fn last_event(&self) -> Instant;
    /// deregister sockets and release resources; called exactly once, by the
    /// session manager
    fn close(&mut self);
    /// the server is shutting down; returns Close once the session has
    /// nothing left in flight
    fn shutting_down(&mut self) -> SessionResult;
    /// all tokens owned by this session
    fn tokens(&self) -> Vec<Token>;
    /// display the session's internal state, for zombie diagnostics
    fn print_state(&self, context: &str);
    /// after a `SessionResult::Handover`, releases the raw client stream and
    /// everything an external handler needs along with it
    fn take_handover(&mut self) -> Option<pipeline::HandoverPayload> {
        None
    }
}
