//! Hook points for probe logic.
//!
//! Probes observe and veto protocol events through typed callback closures,
//! never through inheritance. Each probe registers a [`HookSet`] under its
//! stable [`ProbeId`]; dispatch looks the set up by id, so hook identity
//! survives reconnects and never depends on pointer comparisons.
//!
//! Every invocation carries an [`EventContext`] naming the probe, the
//! connection generation and (when relevant) the channel involved. This is
//! the explicit per-call replacement for "current receiving connection"
//! style globals.

use std::collections::HashMap;

use gauntlet_wire::{ChannelKind, ControlMessage};

/// Stable identifier for one probe instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeId(pub u64);

/// Per-call context threaded through every hook invocation.
#[derive(Debug, Clone, Copy)]
pub struct EventContext {
    /// Probe this event belongs to.
    pub probe: ProbeId,
    /// Connection generation (bumped on every reconnect).
    pub generation: u32,
    /// Channel index involved, when the event is channel-scoped.
    pub channel: Option<u16>,
}

/// Direction of a remote procedure invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcDirection {
    /// Server calling into the fake client.
    Inbound,
    /// Fake client calling the server.
    Outbound,
}

type ChannelFilter = Box<dyn FnMut(&EventContext, ChannelKind, u16) -> bool>;
type ObjectFilter = Box<dyn FnMut(&EventContext, &str) -> bool>;
type RawObserver = Box<dyn FnMut(&EventContext, &[u8])>;
type RpcFilter = Box<dyn FnMut(&EventContext, RpcDirection, &str) -> bool>;
type ControlObserver = Box<dyn FnMut(&EventContext, &ControlMessage)>;

/// The typed callbacks one probe may install.
///
/// Filters return `true` to accept and `false` to veto. Absent callbacks
/// accept everything and observe nothing.
#[derive(Default)]
pub struct HookSet {
    channel_filter: Option<ChannelFilter>,
    object_filter: Option<ObjectFilter>,
    pre_send: Option<RawObserver>,
    post_send: Option<RawObserver>,
    raw_receive: Option<RawObserver>,
    rpc_filter: Option<RpcFilter>,
    control_observer: Option<ControlObserver>,
}

impl HookSet {
    /// Empty hook set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept or deny a new channel by kind and index.
    pub fn on_channel(mut self, f: impl FnMut(&EventContext, ChannelKind, u16) -> bool + 'static) -> Self {
        self.channel_filter = Some(Box::new(f));
        self
    }

    /// Accept or deny creation of a replicated object by class name.
    pub fn on_object(mut self, f: impl FnMut(&EventContext, &str) -> bool + 'static) -> Self {
        self.object_filter = Some(Box::new(f));
        self
    }

    /// Observe logical bunch bytes before any transport transform.
    pub fn on_pre_send(mut self, f: impl FnMut(&EventContext, &[u8]) + 'static) -> Self {
        self.pre_send = Some(Box::new(f));
        self
    }

    /// Observe the actual socket bytes after transport transforms.
    pub fn on_post_send(mut self, f: impl FnMut(&EventContext, &[u8]) + 'static) -> Self {
        self.post_send = Some(Box::new(f));
        self
    }

    /// Observe raw received packet bytes.
    pub fn on_raw_receive(mut self, f: impl FnMut(&EventContext, &[u8]) + 'static) -> Self {
        self.raw_receive = Some(Box::new(f));
        self
    }

    /// Observe every remote procedure invocation, with veto power.
    pub fn on_rpc(mut self, f: impl FnMut(&EventContext, RpcDirection, &str) -> bool + 'static) -> Self {
        self.rpc_filter = Some(Box::new(f));
        self
    }

    /// Observe decoded control messages.
    pub fn on_control(mut self, f: impl FnMut(&EventContext, &ControlMessage) + 'static) -> Self {
        self.control_observer = Some(Box::new(f));
        self
    }
}

/// Registry mapping probe ids to their hook sets.
#[derive(Default)]
pub struct HookRegistry {
    hooks: HashMap<ProbeId, HookSet>,
}

impl HookRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) the hook set for a probe.
    pub fn register(&mut self, probe: ProbeId, hooks: HookSet) {
        self.hooks.insert(probe, hooks);
    }

    /// Remove a probe's hooks, if present.
    pub fn deregister(&mut self, probe: ProbeId) {
        self.hooks.remove(&probe);
    }

    /// Whether a probe has hooks installed.
    pub fn is_registered(&self, probe: ProbeId) -> bool {
        self.hooks.contains_key(&probe)
    }

    /// Run the channel filter. Missing hooks accept.
    pub fn filter_channel(&mut self, ctx: &EventContext, kind: ChannelKind, index: u16) -> bool {
        match self.hooks.get_mut(&ctx.probe).and_then(|h| h.channel_filter.as_mut()) {
            Some(f) => f(ctx, kind, index),
            None => true,
        }
    }

    /// Run the object-class filter. Missing hooks accept.
    pub fn filter_object(&mut self, ctx: &EventContext, class_name: &str) -> bool {
        match self.hooks.get_mut(&ctx.probe).and_then(|h| h.object_filter.as_mut()) {
            Some(f) => f(ctx, class_name),
            None => true,
        }
    }

    /// Deliver the logical bunch bytes about to be sent.
    pub fn observe_pre_send(&mut self, ctx: &EventContext, bytes: &[u8]) {
        if let Some(f) = self.hooks.get_mut(&ctx.probe).and_then(|h| h.pre_send.as_mut()) {
            f(ctx, bytes);
        }
    }

    /// Deliver the socket bytes that were actually sent.
    pub fn observe_post_send(&mut self, ctx: &EventContext, bytes: &[u8]) {
        if let Some(f) = self.hooks.get_mut(&ctx.probe).and_then(|h| h.post_send.as_mut()) {
            f(ctx, bytes);
        }
    }

    /// Deliver raw received bytes.
    pub fn observe_raw_receive(&mut self, ctx: &EventContext, bytes: &[u8]) {
        if let Some(f) = self.hooks.get_mut(&ctx.probe).and_then(|h| h.raw_receive.as_mut()) {
            f(ctx, bytes);
        }
    }

    /// Run the RPC filter. Missing hooks accept.
    pub fn filter_rpc(&mut self, ctx: &EventContext, direction: RpcDirection, name: &str) -> bool {
        match self.hooks.get_mut(&ctx.probe).and_then(|h| h.rpc_filter.as_mut()) {
            Some(f) => f(ctx, direction, name),
            None => true,
        }
    }

    /// Deliver a decoded control message.
    pub fn observe_control(&mut self, ctx: &EventContext, message: &ControlMessage) {
        if let Some(f) = self.hooks.get_mut(&ctx.probe).and_then(|h| h.control_observer.as_mut()) {
            f(ctx, message);
        }
    }
}
