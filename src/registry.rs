//! A minimal, swappable reference registry mapping `(ipv4, port)` to a
//! running device-client actor, with idempotent get-or-create semantics.
//!
//! Sits above the actor the same way any concurrent-map-backed resource
//! cache sits above the sans-IO state it hands out handles to: callers
//! never construct an actor directly, they ask the registry for one.

use std::net::Ipv4Addr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::actor::{self, ActorHandle};
use crate::config::Config;
use crate::error::StartError;

/// Concurrent map from target to actor, with at most one actor ever
/// started per target.
pub struct Registry {
    actors: DashMap<(Ipv4Addr, u16), Arc<OnceCell<ActorHandle>>>,
    config: Config,
}

impl Registry {
    pub fn new(config: Config) -> Self {
        Self {
            actors: DashMap::new(),
            config,
        }
    }

    /// Returns the actor for `(ipv4, port)`, starting it on first use.
    ///
    /// Idempotent and thread-safe: concurrent callers racing on the same
    /// target observe exactly one actor being spawned. If start-up fails,
    /// the slot is left empty so a later call can retry.
    pub async fn get_actor(&self, ipv4: Ipv4Addr, port: u16) -> Result<ActorHandle, StartError> {
        let cell = self
            .actors
            .entry((ipv4, port))
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let handle = cell
            .get_or_try_init(|| actor::start(ipv4, port, self.config))
            .await?;

        Ok(handle.clone())
    }
}
