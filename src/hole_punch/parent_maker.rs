//! Keeps a natted node registered with enough parents.
//!
//! Registrations and keepalives are request/response pairs matched by
//! timeout id and resent with the hole-punching retry policy. A parent that
//! stops answering, answers `NotRegistered` or sends `HpExpire` is reported
//! lost and registered again.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use natpunch_core::timer::TimeoutId;
use rand::seq::SliceRandom;

use super::{HpActor, HpCommand, HpEvent};
use crate::config::ParentMakerConfig;
use crate::error::Error;
use crate::protocol::{Address, Body, KeepAliveStatus, Message, RegisterStatus};

struct PendingRequest {
    id: TimeoutId,
    body: Body,
    retries_left: u32,
    rto: Duration,
}

struct ParentSlot {
    /// Address the server advertises once it answered, configured one before.
    addr: Address,
    registered: bool,
    pending: Option<PendingRequest>,
}

pub(super) struct ParentMaker {
    config: ParentMakerConfig,
    slots: HashMap<SocketAddr, ParentSlot>,
    requests: HashMap<TimeoutId, SocketAddr>,
    running: bool,
}

impl ParentMaker {
    pub(super) fn new(config: ParentMakerConfig) -> Self {
        Self {
            config,
            slots: HashMap::new(),
            requests: HashMap::new(),
            running: false,
        }
    }

    fn registered(&self) -> usize {
        self.slots.values().filter(|s| s.registered).count()
    }

    fn busy(&self) -> usize {
        self.slots
            .values()
            .filter(|s| s.registered || s.pending.is_some())
            .count()
    }
}

impl HpActor {
    pub(super) async fn start_parent_maker(&mut self) {
        if self.parent_maker.running {
            return;
        }
        if self.me.is_open() {
            log::debug!("open node needs no parents");
            return;
        }
        if self.parent_maker.config.servers.is_empty() {
            log::warn!("no parent candidates configured");
            return;
        }
        self.parent_maker.running = true;
        let period = self.parent_maker.config.refresh_period();
        self.timer
            .schedule_periodic(period, period, |_| HpCommand::Refresh);
        self.fill_parents().await;
    }

    /// Registers with unused candidates, in random order, until
    /// `max_parents` are taken.
    async fn fill_parents(&mut self) {
        let mut candidates: Vec<Address> = self.parent_maker.config.servers.clone();
        candidates.shuffle(&mut rand::thread_rng());
        for server in candidates {
            if self.parent_maker.busy() >= self.parent_maker.config.max_parents {
                break;
            }
            let key = server.socket_addr();
            let idle = self
                .parent_maker
                .slots
                .get(&key)
                .map_or(true, |s| !s.registered && s.pending.is_none());
            if idle {
                self.parent_maker.slots.entry(key).or_insert(ParentSlot {
                    addr: server,
                    registered: false,
                    pending: None,
                });
                let body = Body::HpRegisterRequest {
                    wait_time: 0,
                    overlay_id: self.me.overlay_id(),
                };
                self.parent_request(key, body).await;
            }
        }
    }

    async fn parent_request(&mut self, key: SocketAddr, body: Body) {
        let pending = PendingRequest {
            id: TimeoutId::random(),
            body,
            retries_left: self.config.rto_retries.saturating_sub(1),
            rto: self.config.rto(),
        };
        self.send_parent_request(key, pending).await;
    }

    async fn send_parent_request(&mut self, key: SocketAddr, pending: PendingRequest) {
        let src = self.src(self.main_port());
        let Some(slot) = self.parent_maker.slots.get_mut(&key) else {
            return;
        };
        if let Some(old) = slot.pending.take() {
            self.parent_maker.requests.remove(&old.id);
            self.timer.cancel(old.id);
        }
        let msg = Message::new(src, slot.addr, pending.body.clone()).with_timeout(pending.id);
        self.timer.schedule_with_id(
            pending.id,
            pending.rto,
            HpCommand::ParentTimeout { id: pending.id },
        );
        self.parent_maker.requests.insert(pending.id, key);
        slot.pending = Some(pending);
        self.send(msg).await;
    }

    pub(super) async fn parent_timeout(&mut self, id: TimeoutId) {
        let Some(key) = self.parent_maker.requests.remove(&id) else {
            return;
        };
        let scale = self.config.rto_scale;
        let Some(slot) = self.parent_maker.slots.get_mut(&key) else {
            return;
        };
        let Some(mut pending) = slot.pending.take() else {
            return;
        };
        if pending.retries_left > 0 {
            pending.retries_left -= 1;
            pending.rto = pending.rto.mul_f64(scale);
            pending.id = TimeoutId::random();
            self.send_parent_request(key, pending).await;
            return;
        }
        log::warn!("parent {} does not answer", slot.addr);
        if slot.registered {
            self.parent_lost(key);
        }
    }

    fn parent_lost(&mut self, key: SocketAddr) {
        let Some(slot) = self.parent_maker.slots.get_mut(&key) else {
            return;
        };
        if !slot.registered {
            return;
        }
        slot.registered = false;
        let addr = slot.addr;
        log::info!("lost parent {addr}");
        self.emit(HpEvent::ParentLost(addr));
    }

    /// Finds the slot a response belongs to and clears its pending request.
    fn take_response(&mut self, msg: &Message) -> Option<SocketAddr> {
        let key = self.parent_maker.requests.remove(&msg.timeout_id)?;
        self.timer.cancel(msg.timeout_id);
        let slot = self.parent_maker.slots.get_mut(&key)?;
        slot.pending = None;
        Some(key)
    }

    pub(super) async fn on_register_response(
        &mut self,
        msg: &Message,
        status: RegisterStatus,
        remote: SocketAddr,
    ) {
        let Some(key) = self.take_response(msg) else {
            log::debug!("drop register response {} from {remote}", msg.timeout_id);
            return;
        };
        let Some(slot) = self.parent_maker.slots.get_mut(&key) else {
            return;
        };
        match status {
            RegisterStatus::Accepted => {
                slot.addr = msg.src.addr;
                if !slot.registered {
                    slot.registered = true;
                    let addr = slot.addr;
                    log::info!("registered with parent {addr}");
                    self.emit(HpEvent::ParentRegistered(addr));
                }
            }
            RegisterStatus::Rejected => {
                log::warn!("parent {} rejected us", slot.addr);
                self.parent_lost(key);
            }
        }
    }

    pub(super) async fn on_keepalive_response(
        &mut self,
        msg: &Message,
        status: KeepAliveStatus,
        remote: SocketAddr,
    ) {
        let Some(key) = self.take_response(msg) else {
            log::debug!("drop keepalive response {} from {remote}", msg.timeout_id);
            return;
        };
        if status == KeepAliveStatus::NotRegistered {
            self.parent_lost(key);
            self.fill_parents().await;
        }
    }

    pub(super) async fn on_expire(&mut self, remote: SocketAddr) {
        if !self.parent_maker.slots.contains_key(&remote) {
            log::debug!("expire notice from unknown server {remote}");
            return;
        }
        let e = Error::SessionExpired {
            parent: self.parent_maker.slots[&remote].addr.node_id,
        };
        log::info!("{e}");
        self.parent_lost(remote);
        self.fill_parents().await;
    }

    pub(super) async fn refresh_parents(&mut self) {
        let registered: Vec<SocketAddr> = self
            .parent_maker
            .slots
            .iter()
            .filter(|(_, s)| s.registered && s.pending.is_none())
            .map(|(key, _)| *key)
            .collect();
        for key in registered {
            self.parent_request(key, Body::HpKeepAliveRequest).await;
        }
        if self.parent_maker.registered() < self.parent_maker.config.min_parents {
            log::warn!(
                "{} of at least {} parents",
                self.parent_maker.registered(),
                self.parent_maker.config.min_parents
            );
        }
        self.fill_parents().await;
    }

    pub(super) async fn unregister_all(&mut self) {
        let registered: Vec<Address> = self
            .parent_maker
            .slots
            .values_mut()
            .filter(|s| s.registered)
            .map(|s| {
                s.registered = false;
                s.addr
            })
            .collect();
        for parent in registered {
            let msg = Message::new(
                self.src(self.main_port()),
                parent,
                Body::HpUnregisterRequest {
                    delay: 0,
                    prev_status: RegisterStatus::Accepted,
                },
            )
            .with_timeout(TimeoutId::random());
            self.send(msg).await;
            self.emit(HpEvent::ParentLost(parent));
        }
    }
}
