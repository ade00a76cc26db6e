//! # Inky Renderer Core Library
//!
//! Decision core of a battery-powered e-ink picture frame. The device spends
//! nearly all of its life asleep; each time it wakes it fetches one image,
//! draws it, works out when to wake next and goes back to sleep.
//!
//! ## Components
//!
//! ### Wake Scheduler ([`scheduler`])
//! A pure function of the current time, an optional nightly sleep window,
//! a set of labeled wake times and a fallback interval. It always returns a
//! [`scheduler::WakeDecision`] strictly in the future, degrading to the next
//! top of the hour when configuration is malformed.
//!
//! ### Resilient Fetch Pipeline ([`fetch`])
//! Pulls one JPEG over an unreliable link. A bounded number of attempts,
//! each with its own timeout, a rolling inactivity deadline on every read,
//! a byte ceiling checked before allocation, and baseline-JPEG validation
//! before anything reaches the renderer.
//!
//! ### Bounded Log Relay ([`relay`])
//! A fixed-size, lossy queue of formatted log lines fed by a `tracing`
//! layer and drained to a publish sink while it is connected.
//!
//! ## Data Flow
//! 1. Load [`config::Config`] and the [`cycle::PersistedState`] from the last wake
//! 2. Pick the endpoint chosen by the previous decision
//! 3. Fetch, validate and render
//! 4. Ask the scheduler for the next wake, persist it, drain the relay, sleep

pub mod clock;
pub mod config;
pub mod cycle;
pub mod fetch;
pub mod jpeg;
pub mod relay;
pub mod renderer;
pub mod scheduler;
pub mod stream;
pub mod target;
pub mod transport;

pub use config::Config;
pub use cycle::{CycleOutcome, PersistedState, WakeCycle, WakeReason};
pub use scheduler::WakeDecision;
