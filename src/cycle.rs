//! # Wake Cycle
//!
//! One pass of the device's life: wake, pick an endpoint, fetch and draw an
//! image, decide the next wake, hand back the state to persist. The cycle
//! never aborts early; every failure is logged, shown on the panel and still
//! followed by a wake decision, so the device always goes back to sleep with
//! an alarm set.
//!
//! State that must survive sleep lives in [`PersistedState`], passed in and
//! returned by value.

use crate::config::{Config, VERSION};
use crate::fetch::{self, FetchError};
use crate::renderer::{RenderError, Renderer};
use crate::scheduler::{calculate_next_wake, WakeDecision};
use crate::transport::Transport;
use chrono::{DateTime, Local, TimeZone};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const STANDBY_TEXT: &str = "Please Stand By";

/// Carried across sleep.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub splash_shown: bool,
    /// Endpoint chosen by the previous wake decision.
    pub pending_endpoint: Option<String>,
    /// Schedule label behind `pending_endpoint`, if any.
    pub pending_label: Option<String>,
    pub next_wake_epoch: Option<i64>,
}

impl PersistedState {
    /// Read saved state. A missing or unreadable file yields the default
    /// state, as after a cold boot.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match fs::read(path) {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "corrupt wake state, starting fresh");
                Self::default()
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no saved wake state");
                Self::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read wake state");
                Self::default()
            }
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        if let Some(parent) = path.as_ref().parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, data)
    }

    fn record(&mut self, decision: &WakeDecision) {
        self.pending_endpoint = Some(decision.endpoint.clone());
        self.pending_label = decision.source_label.clone();
        self.next_wake_epoch = Some(decision.epoch);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum WakeReason {
    /// Reset or first power-up.
    PowerOn,
    /// Scheduled alarm.
    Timer,
    /// User pressed the wake button.
    Button,
}

#[derive(Error, Debug)]
pub enum CycleError {
    #[error("API URL not specified")]
    NoApiRoot,

    #[error("no renderer endpoint specified")]
    NoEndpoint,

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("render failed: {0}")]
    Render(#[from] RenderError),
}

impl CycleError {
    /// Short text for the panel.
    pub fn status_text(&self) -> &'static str {
        match self {
            Self::NoApiRoot => "API URL not specified!",
            Self::NoEndpoint => "No renderer endpoint specified!",
            Self::Fetch(_) | Self::Render(_) => "Image fetch/render failed!",
        }
    }
}

/// Endpoint for this wake: the button endpoint on a button wake, else the
/// endpoint the previous decision chose, else the configured default.
pub fn select_endpoint<'a>(
    reason: WakeReason,
    state: &'a PersistedState,
    config: &'a Config,
) -> Option<&'a str> {
    let non_empty = |s: &&str| !s.trim().is_empty();

    let button = match reason {
        WakeReason::Button => config.renderer.button.as_deref().filter(non_empty),
        _ => None,
    };
    button
        .or_else(|| state.pending_endpoint.as_deref().filter(non_empty))
        .or_else(|| Some(config.renderer.default.as_str()).filter(non_empty))
}

/// Source of the current time.
pub trait WallClock {
    type Tz: TimeZone;

    fn now(&self) -> DateTime<Self::Tz>;
}

/// The host's local clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    type Tz = Local;

    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// What one cycle did.
#[derive(Debug)]
pub struct CycleOutcome {
    /// State to persist before sleeping.
    pub state: PersistedState,
    pub decision: WakeDecision,
    /// Endpoint requested this cycle, if one was selected.
    pub endpoint: Option<String>,
    /// Attempts used on success, or why nothing new was drawn.
    pub result: Result<u32, CycleError>,
}

impl CycleOutcome {
    pub fn rendered(&self) -> bool {
        self.result.is_ok()
    }
}

pub struct WakeCycle<'a, T, R, C> {
    config: &'a Config,
    transport: T,
    renderer: R,
    clock: C,
}

impl<'a, T, R, C> WakeCycle<'a, T, R, C>
where
    T: Transport,
    R: Renderer,
    C: WallClock,
{
    pub fn new(config: &'a Config, transport: T, renderer: R, clock: C) -> Self {
        Self {
            config,
            transport,
            renderer,
            clock,
        }
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn into_parts(self) -> (T, R) {
        (self.transport, self.renderer)
    }

    pub fn run(&mut self, mut state: PersistedState, reason: WakeReason) -> CycleOutcome {
        info!(?reason, "woke up");
        if reason == WakeReason::PowerOn {
            state.splash_shown = false;
        }

        if !state.splash_shown {
            let splash = format!("--- Inky Renderer (v{VERSION}) ---");
            if let Err(e) = self.renderer.draw_status(&splash) {
                warn!(error = %e, "could not draw splash");
            }
            state.splash_shown = true;
        } else {
            info!(version = VERSION, rotation = self.config.display.rotation, "--- Inky Renderer");
        }

        let endpoint = select_endpoint(reason, &state, self.config).map(str::to_string);
        let result = self.render_frame(endpoint.as_deref());
        if let Err(e) = &result {
            error!(error = %e, "no new frame this cycle");
            if let Err(render_err) = self.renderer.draw_status(e.status_text()) {
                warn!(error = %render_err, "could not draw failure status");
            }
        }

        // the fetch may have taken a while: decide from a fresh reading
        let now = self.clock.now();
        let decision = calculate_next_wake(&now, &self.config.schedule_inputs());
        info!(
            epoch = decision.epoch,
            endpoint = %decision.endpoint,
            label = ?decision.source_label,
            "next wake scheduled"
        );
        state.record(&decision);

        CycleOutcome {
            state,
            decision,
            endpoint,
            result,
        }
    }

    fn render_frame(&mut self, endpoint: Option<&str>) -> Result<u32, CycleError> {
        if self.config.api.trim().is_empty() {
            return Err(CycleError::NoApiRoot);
        }
        let endpoint = endpoint.ok_or(CycleError::NoEndpoint)?;
        info!(endpoint, "rendering");

        if self.config.renderer.clear_display {
            self.renderer.draw_status(STANDBY_TEXT)?;
        }

        let payload = fetch::fetch(
            &mut self.transport,
            &self.config.request_spec(endpoint),
            &self.config.fetch_policy(),
        )?;
        let attempts = payload.attempts();
        let (bytes, hints) = payload.into_parts();

        self.renderer.draw_jpeg(&bytes, !hints.no_dithering)?;
        for (slot, message) in hints.messages.iter().enumerate() {
            let Some(text) = message else { continue };
            if let Err(e) = self.renderer.draw_message(slot, text) {
                warn!(slot, error = %e, "could not draw overlay message");
            }
        }
        Ok(attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::testing::{Canned, ScriptedTransport};
    use crate::jpeg::fixtures::jpeg_with_frame;
    use crate::renderer::testing::{Drawn, RecordingRenderer};
    use chrono::FixedOffset;

    struct FixedClock(DateTime<FixedOffset>);

    impl WallClock for FixedClock {
        type Tz = FixedOffset;

        fn now(&self) -> DateTime<FixedOffset> {
            self.0
        }
    }

    fn at(h: u32, m: u32) -> FixedClock {
        let tz = FixedOffset::east_opt(0).unwrap();
        FixedClock(tz.with_ymd_and_hms(2024, 6, 1, h, m, 0).unwrap())
    }

    fn config() -> Config {
        let mut config = Config {
            api: "http://frames.local".into(),
            ..Config::default()
        };
        config.renderer.button = Some("/render/button".into());
        config
            .renderer
            .wakes
            .insert("09:00".into(), "/render/apod".into());
        config
    }

    fn instant(mut config: Config) -> Config {
        // keep retries fast in tests
        config.renderer.retries = 2;
        config
    }

    fn requested_path(transport: &ScriptedTransport, i: usize) -> String {
        transport.requests[i].url.path().to_string()
    }

    #[test]
    fn endpoint_selection_order() {
        let config = config();
        let pending = PersistedState {
            pending_endpoint: Some("/render/apod".into()),
            ..PersistedState::default()
        };
        let fresh = PersistedState::default();

        assert_eq!(
            select_endpoint(WakeReason::Button, &pending, &config),
            Some("/render/button")
        );
        assert_eq!(
            select_endpoint(WakeReason::Timer, &pending, &config),
            Some("/render/apod")
        );
        assert_eq!(
            select_endpoint(WakeReason::Timer, &fresh, &config),
            Some("/render/unsplash,wallhaven")
        );

        let mut bare = config.clone();
        bare.renderer.button = None;
        bare.renderer.default = String::new();
        assert_eq!(
            select_endpoint(WakeReason::Button, &pending, &bare),
            Some("/render/apod")
        );
        assert_eq!(select_endpoint(WakeReason::Button, &fresh, &bare), None);
    }

    #[test]
    fn successful_cycle_draws_image_and_overlays() {
        let config = config();
        let image = jpeg_with_frame(0xC0);
        let transport = ScriptedTransport::new(vec![Ok(Canned::jpeg(&image)
            .with_header("X-No-Dithering", "true")
            .with_header("X-Inky-Message-0", "Astronomy Picture of the Day"))]);
        let state = PersistedState {
            splash_shown: true,
            pending_endpoint: Some("/render/apod".into()),
            pending_label: Some("09:00".into()),
            next_wake_epoch: None,
        };

        let mut cycle = WakeCycle::new(&config, transport, RecordingRenderer::default(), at(9, 0));
        let outcome = cycle.run(state, WakeReason::Timer);

        assert!(outcome.rendered());
        assert_eq!(outcome.endpoint.as_deref(), Some("/render/apod"));
        let (transport, renderer) = cycle.into_parts();
        assert_eq!(requested_path(&transport, 0), "/api/v1/render/apod");
        assert_eq!(
            renderer.drawn,
            [
                Drawn::Image {
                    bytes: image.len(),
                    dither: false
                },
                Drawn::Message(0, "Astronomy Picture of the Day".into()),
            ]
        );

        // no window, no interval: the 09:00 label is tomorrow, top of hour wins
        let ten = at(10, 0).0.timestamp();
        assert_eq!(outcome.decision.epoch, ten);
        assert_eq!(outcome.state.pending_endpoint.as_deref(), Some("/render/unsplash,wallhaven"));
        assert_eq!(outcome.state.pending_label, None);
        assert_eq!(outcome.state.next_wake_epoch, Some(ten));
    }

    #[test]
    fn power_on_shows_splash_again() {
        let config = config();
        let image = jpeg_with_frame(0xC0);
        let transport = ScriptedTransport::new(vec![Ok(Canned::jpeg(&image))]);
        let state = PersistedState {
            splash_shown: true,
            ..PersistedState::default()
        };

        let mut cycle = WakeCycle::new(&config, transport, RecordingRenderer::default(), at(8, 0));
        let outcome = cycle.run(state, WakeReason::PowerOn);
        assert!(outcome.state.splash_shown);
        assert_eq!(cycle.renderer().statuses(), ["--- Inky Renderer (v0.0.1-beta.1) ---"]);

        // a labeled wake before the top of the hour takes precedence
        assert_eq!(outcome.decision.epoch, at(9, 0).0.timestamp());
        assert_eq!(outcome.decision.endpoint, "/render/apod");
        assert_eq!(outcome.state.pending_label.as_deref(), Some("09:00"));
    }

    #[test]
    fn failed_fetch_still_schedules_next_wake() {
        let config = instant(config());
        let html = || Ok(Canned::jpeg(b"<html/>").with_header("Content-Type", "text/html"));
        let transport = ScriptedTransport::new(vec![html(), html()]);
        let state = PersistedState {
            splash_shown: true,
            ..PersistedState::default()
        };

        let mut cycle = WakeCycle::new(&config, transport, RecordingRenderer::default(), at(12, 30));
        let outcome = cycle.run(state, WakeReason::Timer);

        assert!(matches!(
            outcome.result,
            Err(CycleError::Fetch(FetchError::RetriesExhausted { attempts: 2, .. }))
        ));
        assert_eq!(cycle.renderer().statuses(), ["Image fetch/render failed!"]);
        assert_eq!(outcome.decision.epoch, at(13, 0).0.timestamp());
    }

    #[test]
    fn button_wake_uses_button_endpoint() {
        let config = config();
        let transport = ScriptedTransport::new(vec![Ok(Canned::jpeg(&jpeg_with_frame(0xC0)))]);
        let state = PersistedState {
            splash_shown: true,
            pending_endpoint: Some("/render/apod".into()),
            ..PersistedState::default()
        };

        let mut cycle = WakeCycle::new(&config, transport, RecordingRenderer::default(), at(15, 0));
        let outcome = cycle.run(state, WakeReason::Button);
        assert!(outcome.rendered());
        let (transport, _) = cycle.into_parts();
        assert_eq!(requested_path(&transport, 0), "/api/v1/render/button");
    }

    #[test]
    fn missing_api_skips_fetch() {
        let config = Config::default();
        let transport = ScriptedTransport::new(vec![]);
        let state = PersistedState {
            splash_shown: true,
            ..PersistedState::default()
        };

        let mut cycle = WakeCycle::new(&config, transport, RecordingRenderer::default(), at(15, 0));
        let outcome = cycle.run(state, WakeReason::Timer);
        assert!(matches!(outcome.result, Err(CycleError::NoApiRoot)));
        assert_eq!(cycle.renderer().statuses(), ["API URL not specified!"]);
        let (transport, _) = cycle.into_parts();
        assert!(transport.requests.is_empty());
        assert!(outcome.state.next_wake_epoch.is_some());
    }

    #[test]
    fn missing_endpoint_skips_fetch_and_still_schedules() {
        let mut config = config();
        config.renderer.default = String::new();
        config.renderer.button = None;
        let transport = ScriptedTransport::new(vec![]);
        let state = PersistedState {
            splash_shown: true,
            ..PersistedState::default()
        };

        let mut cycle = WakeCycle::new(&config, transport, RecordingRenderer::default(), at(15, 0));
        let outcome = cycle.run(state, WakeReason::Button);
        assert!(matches!(outcome.result, Err(CycleError::NoEndpoint)));
        assert_eq!(outcome.endpoint, None);
        assert_eq!(cycle.renderer().statuses(), ["No renderer endpoint specified!"]);
        let (transport, _) = cycle.into_parts();
        assert!(transport.requests.is_empty());
        assert!(outcome.state.next_wake_epoch.is_some());
    }

    #[test]
    fn render_failure_is_reported() {
        let config = config();
        let transport = ScriptedTransport::new(vec![Ok(Canned::jpeg(&jpeg_with_frame(0xC0)))]);
        let renderer = RecordingRenderer {
            fail_images: true,
            ..RecordingRenderer::default()
        };
        let state = PersistedState {
            splash_shown: true,
            ..PersistedState::default()
        };

        let mut cycle = WakeCycle::new(&config, transport, renderer, at(15, 0));
        let outcome = cycle.run(state, WakeReason::Timer);
        assert!(matches!(outcome.result, Err(CycleError::Render(_))));
    }

    #[test]
    fn standby_notice_precedes_fetch() {
        let mut config = config();
        config.renderer.clear_display = true;
        let transport = ScriptedTransport::new(vec![Ok(Canned::jpeg(&jpeg_with_frame(0xC0)))]);
        let state = PersistedState {
            splash_shown: true,
            ..PersistedState::default()
        };

        let mut cycle = WakeCycle::new(&config, transport, RecordingRenderer::default(), at(15, 0));
        cycle.run(state, WakeReason::Timer);
        assert_eq!(cycle.renderer().drawn[0], Drawn::Status(STANDBY_TEXT.into()));
        assert!(matches!(cycle.renderer().drawn[1], Drawn::Image { dither: true, .. }));
    }

    #[test]
    fn state_survives_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let state = PersistedState {
            splash_shown: true,
            pending_endpoint: Some("/render/apod".into()),
            pending_label: Some("09:00".into()),
            next_wake_epoch: Some(1_717_232_400),
        };
        state.save(&path).unwrap();
        assert_eq!(PersistedState::load(&path), state);
    }

    #[test]
    fn missing_or_corrupt_state_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        assert_eq!(PersistedState::load(&path), PersistedState::default());

        fs::write(&path, b"{not json").unwrap();
        assert_eq!(PersistedState::load(&path), PersistedState::default());

        // older files missing newer fields still load
        fs::write(&path, br#"{"splash_shown":true}"#).unwrap();
        assert!(PersistedState::load(&path).splash_shown);
    }
}
