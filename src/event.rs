//! Typed event bus for proxy lifecycle events.

use ahash::AHashMap;
use std::{
    any::{Any, TypeId},
    panic::{self, AssertUnwindSafe},
};
use uuid::Uuid;

pub trait Event: 'static {
    fn name(&self) -> &'static str;
}

/// Fired once a login has been validated, before the player is admitted.
#[derive(Debug, Clone)]
pub struct PlayerLoginEvent {
    pub username: String,
    pub uuid: Uuid,
    cancelled: bool,
    kick_reason: String,
}

impl PlayerLoginEvent {
    pub fn new(username: impl Into<String>, uuid: Uuid) -> Self {
        Self {
            username: username.into(),
            uuid,
            cancelled: false,
            kick_reason: String::new(),
        }
    }

    pub fn cancel(&mut self, kick_reason: impl Into<String>) {
        self.cancelled = true;
        self.kick_reason = kick_reason.into();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn kick_reason(&self) -> &str {
        &self.kick_reason
    }
}

/// The player spawned on a backend.
#[derive(Debug, Clone)]
pub struct PlayerJoinEvent {
    pub username: String,
    pub server: String,
}

#[derive(Debug, Clone)]
pub struct PlayerQuitEvent {
    pub username: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct PlayerTransferEvent {
    pub username: String,
    pub from: Option<String>,
    pub to: String,
}

/// The tick loop is about to run its first tick.
#[derive(Debug, Clone)]
pub struct ServerStartEvent;

/// The proxy is shutting down; players are still connected.
#[derive(Debug, Clone)]
pub struct ServerStopEvent;

/// Fired whenever the advertised server status is rebuilt. Listeners may
/// rewrite any field; the result is what the ping reply carries.
#[derive(Debug, Clone)]
pub struct QueryRegenerateEvent {
    pub motd: String,
    pub sub_motd: String,
    pub online_players: usize,
    pub max_players: u32,
}

impl Event for PlayerLoginEvent {
    fn name(&self) -> &'static str {
        "PlayerLoginEvent"
    }
}

impl Event for PlayerJoinEvent {
    fn name(&self) -> &'static str {
        "PlayerJoinEvent"
    }
}

impl Event for PlayerQuitEvent {
    fn name(&self) -> &'static str {
        "PlayerQuitEvent"
    }
}

impl Event for PlayerTransferEvent {
    fn name(&self) -> &'static str {
        "PlayerTransferEvent"
    }
}

impl Event for ServerStartEvent {
    fn name(&self) -> &'static str {
        "ServerStartEvent"
    }
}

impl Event for ServerStopEvent {
    fn name(&self) -> &'static str {
        "ServerStopEvent"
    }
}

impl Event for QueryRegenerateEvent {
    fn name(&self) -> &'static str {
        "QueryRegenerateEvent"
    }
}

type Listener<E> = Box<dyn FnMut(&mut E)>;

/// Listeners keyed by event type, called in registration order.
#[derive(Default)]
pub struct EventBus {
    listeners: AHashMap<TypeId, Box<dyn Any>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<E: Event>(&mut self, listener: impl FnMut(&mut E) + 'static) {
        let entry = self
            .listeners
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Box::new(Vec::<Listener<E>>::new()) as Box<dyn Any>);
        if let Some(listeners) = entry.downcast_mut::<Vec<Listener<E>>>() {
            listeners.push(Box::new(listener));
        }
    }

    pub fn listener_count<E: Event>(&self) -> usize {
        self.listeners
            .get(&TypeId::of::<E>())
            .and_then(|l| l.downcast_ref::<Vec<Listener<E>>>())
            .map_or(0, Vec::len)
    }

    /// Calls every listener of `E`. A panicking listener is logged and the
    /// remaining listeners still run.
    pub fn fire<E: Event>(&mut self, event: &mut E) {
        let Some(listeners) = self
            .listeners
            .get_mut(&TypeId::of::<E>())
            .and_then(|l| l.downcast_mut::<Vec<Listener<E>>>())
        else {
            return;
        };
        for listener in listeners.iter_mut() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| listener(event)));
            if result.is_err() {
                tracing::error!("Listener for {} panicked", event.name());
            }
        }
    }
}
