use crate::actuator::Unit;
use crate::watchdog::{Watchdog, WatchdogEvent};
use std::time::{Duration, Instant};
use teleop_shared::config::{HostConfig, SafeAction};
use teleop_shared::transport::RelayLink;
use teleop_shared::{
    Command, LatestSink, LatestSource, LogThrottle, Observation, RelayError, SendStatus, UnitId,
};
use tokio::sync::watch;
use tokio::time::sleep;

const LOG_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub period: Duration,
    pub watchdog_timeout: Duration,
    pub safe_action: SafeAction,
    pub jpeg_quality: u8,
    pub run_duration: Option<Duration>,
}

impl From<&HostConfig> for LoopSettings {
    fn from(cfg: &HostConfig) -> Self {
        Self {
            period: cfg.period(),
            watchdog_timeout: cfg.watchdog_timeout(),
            safe_action: cfg.safe_action.clone(),
            jpeg_quality: cfg.jpeg_quality,
            run_duration: cfg.run_duration(),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub accepted: bool,
    pub stale: bool,
    /// `send_action` calls made this tick.
    pub dispatched: usize,
    /// `None` if the observation could not be encoded.
    pub published: Option<SendStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub ticks: u64,
    pub commands_accepted: u64,
    pub malformed_commands: u64,
    pub stale_ticks: u64,
    pub deadline_misses: u64,
    pub observations_dropped: u64,
}

struct Throttles {
    malformed: LogThrottle,
    device: LogThrottle,
    no_receiver: LogThrottle,
    rejected: LogThrottle,
    deadline: LogThrottle,
}

impl Throttles {
    fn new() -> Self {
        Self {
            malformed: LogThrottle::new(LOG_INTERVAL),
            device: LogThrottle::new(LOG_INTERVAL),
            no_receiver: LogThrottle::new(LOG_INTERVAL),
            rejected: LogThrottle::new(LOG_INTERVAL),
            deadline: LogThrottle::new(LOG_INTERVAL),
        }
    }
}

/// Fixed-rate host loop: drain the latest command, apply the watchdog
/// policy, drive every unit once, publish one observation.
///
/// Owns the units and the link; both are released exactly once, either by
/// [`HostLoop::teardown`] or on drop.
pub struct HostLoop<Tx: LatestSink, Rx: LatestSource> {
    units: Vec<Unit>,
    unit_ids: Vec<UnitId>,
    link: RelayLink<Tx, Rx>,
    watchdog: Watchdog,
    settings: LoopSettings,
    stats: LoopStats,
    throttles: Throttles,
    torn_down: bool,
}

impl<Tx: LatestSink, Rx: LatestSource> HostLoop<Tx, Rx> {
    pub fn new(
        units: Vec<Unit>,
        link: RelayLink<Tx, Rx>,
        settings: LoopSettings,
        start: Instant,
    ) -> Self {
        let unit_ids = units.iter().map(|u| u.id.clone()).collect();
        Self {
            units,
            unit_ids,
            link,
            watchdog: Watchdog::new(settings.watchdog_timeout, start),
            settings,
            stats: LoopStats::default(),
            throttles: Throttles::new(),
            torn_down: false,
        }
    }

    #[cfg(test)]
    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    #[cfg(test)]
    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn tick(&mut self, now: Instant) -> TickReport {
        self.stats.ticks += 1;

        let command = self.receive_command(now);

        if let Some(WatchdogEvent::BecameStale { silent_for }) = self.watchdog.poll(now) {
            tracing::warn!(
                "Command not received for {} ms (limit {} ms). \
                 Dispatching {:?} until commands resume.",
                silent_for.as_millis(),
                self.watchdog.threshold().as_millis(),
                self.settings.safe_action
            );
        }
        let stale = self.watchdog.is_stale();
        if stale {
            self.stats.stale_ticks += 1;
        }
        let trusted = if stale { None } else { command.as_ref() };

        let mut observation = Observation::default();
        let mut dispatched = 0;
        for unit in &mut self.units {
            if !unit.is_connected() {
                continue;
            }
            let action = match trusted.and_then(|c| c.action(&unit.id)) {
                Some(action) => action.clone(),
                None => unit.safe_action(&self.settings.safe_action),
            };

            dispatched += 1;
            let snapshot = unit
                .dispatch(&action)
                .and_then(|applied| unit.capture(applied));
            match snapshot {
                Ok(obs) => {
                    observation.units.insert(unit.id.clone(), obs);
                }
                Err(source) => {
                    if let Some(suppressed) = self.throttles.device.ready(now) {
                        let err = RelayError::DeviceDisconnected {
                            unit: unit.id.to_string(),
                            source,
                        };
                        tracing::error!(
                            "{err}; unit left out of this observation \
                             ({suppressed} similar suppressed)"
                        );
                    }
                }
            }
        }

        let published = match observation.encode(self.settings.jpeg_quality) {
            Ok(bytes) => Some(self.link.tx.publish(bytes)),
            Err(e) => {
                tracing::error!("failed to encode observation: {e}");
                None
            }
        };
        if published != Some(SendStatus::Delivered) {
            self.stats.observations_dropped += 1;
        }
        match published {
            Some(SendStatus::WouldBlock) => {
                if let Some(suppressed) = self.throttles.no_receiver.ready(now) {
                    tracing::info!(
                        "Dropping observation, no client connected \
                         ({suppressed} dropped since last notice)"
                    );
                }
            }
            Some(SendStatus::Rejected) => {
                if let Some(suppressed) = self.throttles.rejected.ready(now) {
                    tracing::error!(
                        "Dropping observation, too large for one frame \
                         ({suppressed} dropped since last notice)"
                    );
                }
            }
            _ => {}
        }

        TickReport {
            accepted: command.is_some(),
            stale,
            dispatched,
            published,
        }
    }

    fn receive_command(&mut self, now: Instant) -> Option<Command> {
        let bytes = self.link.rx.try_receive_latest()?;
        match Command::decode(&bytes, &self.unit_ids) {
            Ok(cmd) => {
                if self.watchdog.accept(now) {
                    tracing::info!("Commands resumed, watchdog released");
                }
                self.stats.commands_accepted += 1;
                Some(cmd)
            }
            Err(e) => {
                self.stats.malformed_commands += 1;
                if let Some(suppressed) = self.throttles.malformed.ready(now) {
                    let err = RelayError::MalformedFrame(e);
                    tracing::warn!("ignoring command: {err} ({suppressed} similar suppressed)");
                }
                None
            }
        }
    }

    /// Tick at the configured rate until `shutdown` flips (or its sender
    /// goes away) or the optional run duration elapses. A stop request lets
    /// the current tick finish.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let started = Instant::now();
        let period = self.settings.period;
        tracing::info!("Waiting for commands...");

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            let tick_start = Instant::now();
            self.tick(tick_start);

            if let Some(limit) = self.settings.run_duration
                && started.elapsed() >= limit
            {
                tracing::info!("Run duration of {limit:?} reached.");
                break;
            }

            let elapsed = tick_start.elapsed();
            match period.checked_sub(elapsed) {
                Some(rest) if !rest.is_zero() => {
                    tokio::select! {
                        _ = sleep(rest) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                _ => {
                    self.stats.deadline_misses += 1;
                    if let Some(suppressed) = self.throttles.deadline.ready(Instant::now()) {
                        let err = RelayError::DeadlineMissed { elapsed, period };
                        tracing::warn!("{err} ({suppressed} more since last notice)");
                    }
                }
            }
        }
    }

    /// Disconnect every unit and close the link. Runs once; later calls
    /// (including the one from `Drop`) do nothing.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        tracing::info!("Shutting down host.");
        for unit in &mut self.units {
            unit.disconnect();
        }
        self.link.close();
        let s = &self.stats;
        tracing::info!(
            "{} ticks, {} commands accepted, {} malformed, {} stale ticks, {} deadline misses",
            s.ticks,
            s.commands_accepted,
            s.malformed_commands,
            s.stale_ticks,
            s.deadline_misses
        );
    }
}

impl<Tx: LatestSink, Rx: LatestSource> Drop for HostLoop<Tx, Rx> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::Camera;
    use crate::actuator::mock::{MockActuator, MockCamera, MockLog};
    use std::sync::{Arc, Mutex};
    use teleop_shared::Action;
    use teleop_shared::transport::{LoopbackReceiver, LoopbackSender, loopback};

    const PERIOD: Duration = Duration::from_millis(33);

    struct Rig {
        host: HostLoop<LoopbackSender, LoopbackReceiver>,
        /// Client end: publishes commands.
        cmd_tx: LoopbackSender,
        /// Client end: receives observations.
        obs_rx: Option<LoopbackReceiver>,
        logs: Vec<Arc<Mutex<MockLog>>>,
        start: Instant,
    }

    fn settings(safe_action: SafeAction) -> LoopSettings {
        LoopSettings {
            period: PERIOD,
            watchdog_timeout: Duration::from_millis(500),
            safe_action,
            jpeg_quality: 80,
            run_duration: None,
        }
    }

    fn rig_with(settings: LoopSettings, fail_observation_on: Option<&str>) -> Rig {
        let mut units = Vec::new();
        let mut logs = Vec::new();
        for name in ["arm1", "arm2"] {
            let channels = [("joint0", 1.0), ("gripper.pos", 2.0)];
            let (mut act, log) = MockActuator::new(name, &channels);
            act.connected = true;
            act.fail_observation = fail_observation_on == Some(name);
            let cams: Vec<Box<dyn Camera>> = vec![Box::new(MockCamera { name: "wrist".into() })];
            units.push(Unit::new(UnitId::new(name).unwrap(), Box::new(act), cams));
            logs.push(log);
        }
        let (cmd_tx, cmd_rx) = loopback();
        let (obs_tx, obs_rx) = loopback();
        let link = RelayLink { tx: obs_tx, rx: cmd_rx };
        let start = Instant::now();
        Rig {
            host: HostLoop::new(units, link, settings, start),
            cmd_tx,
            obs_rx: Some(obs_rx),
            logs,
            start,
        }
    }

    fn rig() -> Rig {
        rig_with(settings(SafeAction::Idle { targets: Action::new() }), None)
    }

    fn at(start: Instant, tick: u32) -> Instant {
        start + PERIOD * tick
    }

    fn send(rig: &Rig, body: &str) {
        assert_eq!(rig.cmd_tx.publish(body.as_bytes().to_vec()), SendStatus::Delivered);
    }

    fn ids() -> Vec<UnitId> {
        vec![UnitId::new("arm1").unwrap(), UnitId::new("arm2").unwrap()]
    }

    #[test]
    fn one_dispatch_per_unit_per_tick_and_commands_apply_once() {
        let mut rig = rig();
        for t in 0..10 {
            if t == 0 || t == 5 {
                let body = format!(r#"{{"arm1_joint0": {}, "arm2_joint0": -1.5}}"#, 10 + t);
                send(&rig, &body);
            }
            let now = at(rig.start, t);
            let report = rig.host.tick(now);
            assert_eq!(report.dispatched, 2);
            assert_eq!(report.accepted, t == 0 || t == 5);
        }
        for log in &rig.logs {
            assert_eq!(log.lock().unwrap().dispatched.len(), 10);
        }
        let arm1 = rig.logs[0].lock().unwrap();
        let commanded: Vec<_> = arm1
            .dispatched
            .iter()
            .enumerate()
            .filter(|(_, a)| a.get("joint0").is_some_and(|v| *v >= 10.0))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(commanded, vec![0, 5]);
        // Ticks without a command got the idle action, not a replay.
        assert_eq!(arm1.dispatched[1]["joint0"], 0.0);
    }

    #[test]
    fn goes_stale_after_threshold_and_dispatches_safe_action() {
        let mut rig = rig();
        send(&rig, r#"{"arm1_joint0": 10}"#);
        assert!(rig.host.tick(at(rig.start, 0)).accepted);

        let mut first_stale = None;
        for t in 1..=19 {
            let report = rig.host.tick(at(rig.start, t));
            if report.stale && first_stale.is_none() {
                first_stale = Some(t);
            }
        }
        // 500 ms at 33 ms per tick: 15 ticks = 495 ms, 16 ticks = 528 ms.
        assert_eq!(first_stale, Some(16));
        assert_eq!(rig.host.stats().stale_ticks, 4);

        let arm1 = rig.logs[0].lock().unwrap();
        assert_eq!(arm1.dispatched.len(), 20);
        for action in &arm1.dispatched[16..] {
            assert_eq!(action["joint0"], 0.0);
            assert_eq!(action["gripper.pos"], 0.0);
        }
    }

    #[test]
    fn a_command_after_staleness_is_applied_immediately() {
        let mut rig = rig();
        rig.host.tick(at(rig.start, 20));
        assert!(rig.host.watchdog().is_stale());

        send(&rig, r#"{"arm1_joint0": 42}"#);
        let report = rig.host.tick(at(rig.start, 21));
        assert!(report.accepted);
        assert!(!report.stale);
        let last_joint0 = |log: &Arc<Mutex<MockLog>>| {
            log.lock().unwrap().dispatched.last().unwrap()["joint0"]
        };
        assert_eq!(last_joint0(&rig.logs[0]), 42.0);
        // arm2 was not in the command, so it got the safe action.
        assert_eq!(last_joint0(&rig.logs[1]), 0.0);
    }

    #[test]
    fn hold_position_retargets_last_observed_state() {
        let mut rig = rig_with(settings(SafeAction::HoldPosition), None);
        send(&rig, r#"{"arm1_joint0": 7.5}"#);
        rig.host.tick(at(rig.start, 0));
        rig.host.tick(at(rig.start, 1));
        let arm1 = rig.logs[0].lock().unwrap();
        assert_eq!(arm1.dispatched[1]["joint0"], 7.5);
        assert_eq!(arm1.dispatched[1]["gripper.pos"], 2.0);
    }

    #[test]
    fn gap_between_commands_holds_position_by_default() {
        let mut rig = rig_with(settings(SafeAction::default()), None);
        send(&rig, r#"{"arm1_joint0": 7.5, "arm2_joint0": -3}"#);
        for t in 0..4 {
            let report = rig.host.tick(at(rig.start, t));
            assert!(!report.stale);
            assert_eq!(report.accepted, t == 0);
        }
        for (log, held) in rig.logs.iter().zip([7.5, -3.0]) {
            let log = log.lock().unwrap();
            assert_eq!(log.dispatched.len(), 4);
            assert!(log.dispatched.iter().all(|a| a["joint0"] == held), "{:?}", log.dispatched);
        }
    }

    #[test]
    fn malformed_command_does_not_feed_the_watchdog() {
        let mut rig = rig();
        let before = rig.host.watchdog().last_accepted();
        assert!(rig.cmd_tx.publish(vec![0xde, 0xad, 0xbe, 0xef]) == SendStatus::Delivered);
        let report = rig.host.tick(at(rig.start, 3));
        assert!(!report.accepted);
        assert_eq!(report.dispatched, 2);
        assert_eq!(rig.host.watchdog().last_accepted(), before);
        assert_eq!(rig.host.stats().malformed_commands, 1);

        send(&rig, r#"{"arm1_joint0": "fast"}"#);
        assert!(!rig.host.tick(at(rig.start, 4)).accepted);
        assert_eq!(rig.host.watchdog().last_accepted(), before);
    }

    #[test]
    fn observation_carries_every_unit_and_camera() {
        let mut rig = rig();
        send(&rig, r#"{"arm1_joint0": 3, "arm2_joint0": 4}"#);
        let report = rig.host.tick(at(rig.start, 0));
        assert_eq!(report.published, Some(SendStatus::Delivered));

        let bytes = rig.obs_rx.as_mut().unwrap().try_receive_latest().unwrap();
        let obs = Observation::decode(&bytes, &ids()).unwrap();
        for (id, expected) in ids().iter().zip([3.0, 4.0]) {
            let unit = obs.unit(id).unwrap();
            assert_eq!(unit.state["joint0"], expected);
            assert_eq!(unit.applied["joint0"], expected);
            assert!(unit.cameras["wrist"].is_some());
        }
    }

    #[test]
    fn failing_unit_is_left_out_but_others_publish() {
        let mut rig = rig_with(settings(SafeAction::HoldPosition), Some("arm2"));
        let report = rig.host.tick(at(rig.start, 0));
        assert_eq!(report.dispatched, 2);
        let bytes = rig.obs_rx.as_mut().unwrap().try_receive_latest().unwrap();
        let obs = Observation::decode(&bytes, &ids()).unwrap();
        assert!(obs.unit(&ids()[0]).is_some());
        assert!(obs.unit(&ids()[1]).is_none());
    }

    #[test]
    fn no_receiver_is_not_an_error() {
        let mut rig = rig();
        rig.obs_rx = None;
        let report = rig.host.tick(at(rig.start, 0));
        assert_eq!(report.published, Some(SendStatus::WouldBlock));
        assert_eq!(report.dispatched, 2);
        assert_eq!(rig.host.stats().observations_dropped, 1);
    }

    #[tokio::test]
    async fn keeps_cadence_without_a_receiver() {
        let mut s = settings(SafeAction::HoldPosition);
        s.run_duration = Some(Duration::from_millis(330));
        let mut rig = rig_with(s, None);
        rig.obs_rx = None;
        let (_stop_tx, stop_rx) = watch::channel(false);

        let started = Instant::now();
        rig.host.run(stop_rx).await;
        let elapsed = started.elapsed();

        let ticks = rig.host.stats().ticks;
        assert!((8..=13).contains(&ticks), "ran {ticks} ticks in {elapsed:?}");
        assert!(elapsed < Duration::from_millis(600));
    }

    #[tokio::test]
    async fn stop_signal_ends_the_loop() {
        let mut rig = rig();
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            let _ = stop_tx.send(true);
        });
        tokio::time::timeout(Duration::from_secs(2), rig.host.run(stop_rx))
            .await
            .expect("loop stops on signal");
        assert!(rig.host.stats().ticks >= 2);
    }

    #[test]
    fn teardown_runs_exactly_once() {
        let rig = rig();
        let logs = rig.logs.clone();
        let Rig { mut host, .. } = rig;
        host.teardown();
        host.teardown();
        drop(host);
        for log in logs {
            assert_eq!(log.lock().unwrap().disconnects, 1);
        }
    }

    #[test]
    fn teardown_runs_on_unwind() {
        let rig = rig();
        let logs = rig.logs.clone();
        let Rig { host, .. } = rig;
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _host = host;
            panic!("actuator driver bug");
        }));
        assert!(result.is_err());
        for log in logs {
            assert_eq!(log.lock().unwrap().disconnects, 1);
        }
    }
}
