//! LokiProxy: an interactive HTTP(S) intercepting proxy core.
//!
//! A client points its outbound HTTP proxy at the listening endpoint; each
//! request is observed, optionally paused for an operator decision,
//! optionally rewritten by rules, and forwarded upstream (or answered by a
//! mock). `CONNECT` requests relay opaquely. A local certificate authority
//! mints per-host leaves for future TLS termination.
//!
//! The control surface is decoupled through [`bus::EventBus`]: the core
//! publishes [`bus::Event`]s, an observer sends [`bus::Command`]s, and flow
//! data is read through [`proxy::FlowsView`].

pub mod bus;
pub mod ca;
pub mod cli;
pub mod error;
pub mod flows;
pub mod proxy;
pub mod rules;

pub use bus::{Command, Event, EventBus};
pub use flows::{Flow, FlowStore, Message, Scheme};
pub use proxy::{FlowsView, ProxyConfig, ProxyServer};
pub use rules::{MockResponse, Phase, RulesDoc, Ruleset};
