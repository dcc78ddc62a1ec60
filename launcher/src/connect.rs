//! Concurrent connection establishment for every slot of a launch.
//!
//! All slots are connected at once from the calling task. Sockets are
//! non-blocking and driven by the runtime's readiness notifications, so a
//! single thread can carry thousands of pending connects; a slow or dead peer
//! only holds up its own slot.

use crate::error::ConnectError;
use crate::metrics_defs::{CONNECT_DURATION, SLOTS_FAILED, SLOTS_READY};
use crate::transport::Transport;
use shared::{counter, histogram};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

/// One `(region, launch)` unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId {
    pub region: usize,
    pub launch: usize,
}

impl SlotId {
    /// Position of the slot in region-major order.
    pub fn index(&self, launches: usize) -> usize {
        self.region * launches + self.launch
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.region, self.launch)
    }
}

/// Where the slots of one region connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub server_name: String,
    pub port: u16,
    /// Skip resolution and connect here.
    pub connect_to: Option<SocketAddr>,
}

pub struct SlotConnection<S> {
    pub slot: SlotId,
    pub state: Result<S, ConnectError>,
}

impl<S> SlotConnection<S> {
    pub fn is_ready(&self) -> bool {
        self.state.is_ok()
    }
}

pub struct Orchestrator<T> {
    transport: Arc<T>,
    connect_timeout: Option<Duration>,
}

impl<T: Transport> Orchestrator<T> {
    pub fn new(transport: T, connect_timeout: Option<Duration>) -> Self {
        Orchestrator {
            transport: Arc::new(transport),
            connect_timeout,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Connects `launches` slots to every target and returns one entry per
    /// slot in region-major order once every slot is ready or failed.
    pub async fn connect_all(
        &self,
        targets: &[Target],
        launches: usize,
    ) -> Vec<SlotConnection<T::Stream>> {
        let started = Instant::now();
        let mut states: Vec<Option<Result<T::Stream, ConnectError>>> =
            (0..targets.len() * launches).map(|_| None).collect();
        let mut regions = JoinSet::new();

        // Each region resolves on its own task and starts its slots as soon as
        // its address is known.
        for (region, target) in targets.iter().enumerate() {
            let transport = self.transport.clone();
            let target = target.clone();
            let connect_timeout = self.connect_timeout;
            regions.spawn(connect_region(
                transport,
                target,
                region,
                launches,
                connect_timeout,
            ));
        }

        while let Some(joined) = regions.join_next().await {
            match joined {
                Ok(slots) => {
                    for (slot, state) in slots {
                        if let Err(e) = &state {
                            tracing::warn!(%slot, error = %e, "slot failed to connect");
                        }
                        states[slot.index(launches)] = Some(state);
                    }
                }
                Err(e) => tracing::error!("connect task panicked: {}", e),
            }
        }

        let connections: Vec<_> = states
            .into_iter()
            .enumerate()
            .map(|(index, state)| SlotConnection {
                slot: SlotId {
                    region: index / launches,
                    launch: index % launches,
                },
                state: state
                    .unwrap_or_else(|| Err(ConnectError::Tcp("connect task aborted".into()))),
            })
            .collect();

        let ready = connections.iter().filter(|c| c.is_ready()).count();
        let failed = connections.len() - ready;
        counter!(SLOTS_READY).increment(ready as u64);
        counter!(SLOTS_FAILED).increment(failed as u64);
        histogram!(CONNECT_DURATION).record(started.elapsed().as_secs_f64());
        tracing::info!(
            transport = self.transport.name(),
            ready,
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "connect phase complete"
        );

        connections
    }
}

type SlotState<S> = (SlotId, Result<S, ConnectError>);

async fn connect_region<T: Transport>(
    transport: Arc<T>,
    target: Target,
    region: usize,
    launches: usize,
    connect_timeout: Option<Duration>,
) -> Vec<SlotState<T::Stream>> {
    let addr = match resolve(&target).await {
        Ok(addr) => addr,
        Err(e) => {
            tracing::warn!(server = %target.server_name, error = %e, "region unreachable");
            return (0..launches)
                .map(|launch| (SlotId { region, launch }, Err(e.clone())))
                .collect();
        }
    };

    let mut pending = JoinSet::new();
    for launch in 0..launches {
        let slot = SlotId { region, launch };
        let transport = transport.clone();
        let server_name = target.server_name.clone();
        pending.spawn(async move {
            let connect = transport.connect(addr, &server_name);
            let state = match connect_timeout {
                Some(limit) => tokio::time::timeout(limit, connect)
                    .await
                    .unwrap_or(Err(ConnectError::Timeout)),
                None => connect.await,
            };
            (slot, state)
        });
    }

    let mut slots = Vec::with_capacity(launches);
    while let Some(joined) = pending.join_next().await {
        match joined {
            Ok(slot_state) => slots.push(slot_state),
            Err(e) => tracing::error!(region, "connect task panicked: {}", e),
        }
    }
    slots
}

async fn resolve(target: &Target) -> Result<SocketAddr, ConnectError> {
    if let Some(addr) = target.connect_to {
        return Ok(addr);
    }
    let resolve_error = |reason: String| ConnectError::Resolve {
        host: target.server_name.clone(),
        reason,
    };
    tokio::net::lookup_host((target.server_name.as_str(), target.port))
        .await
        .map_err(|e| resolve_error(e.to_string()))?
        .next()
        .ok_or_else(|| resolve_error("no addresses".into()))
}
