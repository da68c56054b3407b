//! Two aggregates that keep answering each other: a causal cycle the
//! unit-of-work cascade must refuse to follow forever.

use keel_core::aggregate::{AggregateCore, AggregateRoot, Transitions};
use keel_core::domain::{DomainHandlers, NavigationPath};
use keel_core::error::DomainError;
use keel_core::event::DomainEvent;
use keel_core::types::TypeNameRegistry;
use serde::{Deserialize, Serialize};

/// A ping was opened against a pong.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingOpened {
    /// The pong this ping plays against.
    pub peer: String,
}
impl DomainEvent for PingOpened {}

/// A pong was opened against a ping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PongOpened {
    /// The ping this pong plays against.
    pub peer: String,
}
impl DomainEvent for PongOpened {}

/// The ping hit the ball towards its pong.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingHit {
    /// Receiving pong.
    pub pong_id: String,
}
impl DomainEvent for PingHit {}

/// The pong hit the ball back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PongHit {
    /// Receiving ping.
    pub ping_id: String,
}
impl DomainEvent for PongHit {}

/// Serving side of the rally.
#[derive(Debug, Default)]
pub struct Ping {
    core: AggregateCore,
    peer: String,
    volleys: u32,
}

impl Ping {
    /// Opens a ping playing against `peer`.
    ///
    /// # Errors
    ///
    /// Propagates errors from raising the creation event.
    pub fn open(id: &str, peer: &str) -> Result<Self, DomainError> {
        let mut ping = Self {
            core: AggregateCore::new(id),
            ..Self::default()
        };
        ping.on_event(PingOpened {
            peer: peer.to_owned(),
        })?;
        Ok(ping)
    }

    /// Starts the rally.
    ///
    /// # Errors
    ///
    /// Propagates errors from raising the event.
    pub fn serve(&mut self) -> Result<(), DomainError> {
        self.on_event(PingHit {
            pong_id: self.peer.clone(),
        })
    }

    /// Number of hits made.
    #[must_use]
    pub fn volleys(&self) -> u32 {
        self.volleys
    }
}

impl AggregateRoot for Ping {
    fn core(&self) -> &AggregateCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut AggregateCore {
        &mut self.core
    }

    fn register_transitions(transitions: &mut Transitions<Self>) {
        transitions
            .on(|ping: &mut Self, event: &PingOpened| ping.peer.clone_from(&event.peer))
            .on(|ping: &mut Self, _: &PingHit| ping.volleys += 1);
    }

    fn register_domain_handlers(handlers: &mut DomainHandlers<Self>) {
        handlers.on(
            NavigationPath::from_event(|event: &PongHit| Some(event.ping_id.clone())),
            |ping: &mut Self, _: &PongHit| ping.serve(),
        );
    }
}

/// Returning side of the rally.
#[derive(Debug, Default)]
pub struct Pong {
    core: AggregateCore,
    peer: String,
    volleys: u32,
}

impl Pong {
    /// Opens a pong playing against `peer`.
    ///
    /// # Errors
    ///
    /// Propagates errors from raising the creation event.
    pub fn open(id: &str, peer: &str) -> Result<Self, DomainError> {
        let mut pong = Self {
            core: AggregateCore::new(id),
            ..Self::default()
        };
        pong.on_event(PongOpened {
            peer: peer.to_owned(),
        })?;
        Ok(pong)
    }

    /// Number of hits made.
    #[must_use]
    pub fn volleys(&self) -> u32 {
        self.volleys
    }
}

impl AggregateRoot for Pong {
    fn core(&self) -> &AggregateCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut AggregateCore {
        &mut self.core
    }

    fn register_transitions(transitions: &mut Transitions<Self>) {
        transitions
            .on(|pong: &mut Self, event: &PongOpened| pong.peer.clone_from(&event.peer))
            .on(|pong: &mut Self, _: &PongHit| pong.volleys += 1);
    }

    fn register_domain_handlers(handlers: &mut DomainHandlers<Self>) {
        handlers.on(
            NavigationPath::from_event(|event: &PingHit| Some(event.pong_id.clone())),
            |pong: &mut Self, _: &PingHit| {
                let ping_id = pong.peer.clone();
                pong.on_event(PongHit { ping_id })
            },
        );
    }
}

/// Registers the rally model's names.
///
/// # Errors
///
/// Returns a type-name error if any name is already taken.
pub fn register(types: &mut TypeNameRegistry) -> Result<(), DomainError> {
    types
        .register_aggregate::<Ping>("rally.ping")?
        .register_aggregate::<Pong>("rally.pong")?
        .register_event::<PingOpened>("rally.ping-opened")?
        .register_event::<PongOpened>("rally.pong-opened")?
        .register_event::<PingHit>("rally.ping-hit")?
        .register_event::<PongHit>("rally.pong-hit")?;
    Ok(())
}
