//! Operator episode control and the recording loop.

use crate::client_loop::ClientLoop;
use crate::dataset::{EpisodeSink, Frame};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use std::io;
use std::time::{Duration, Instant};
use teleop_shared::config::ClientConfig;
use teleop_shared::{LatestSink, LatestSource, SendStatus, get_current_timestamp_ms};
use tokio::sync::watch;
use tokio::time::sleep;

const KEY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Operator requests, shared through a `watch` channel. `episodes_ended`
/// only grows; the recorder compares it with the count it has handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpisodeControl {
    pub episodes_ended: u64,
    pub stop: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    EndEpisode,
    Stop,
}

/// Apply one operator key. Returns `false` once recording should stop.
pub fn apply_key(control: &watch::Sender<EpisodeControl>, key: char) -> bool {
    match key {
        'n' => {
            tracing::info!("'n' pressed: finishing current episode.");
            control.send_modify(|c| c.episodes_ended += 1);
            true
        }
        'm' => {
            tracing::info!("'m' pressed: finishing current episode and stopping.");
            control.send_modify(|c| c.stop = true);
            false
        }
        _ => true,
    }
}

/// Map one terminal key event onto the control channel. Raw mode turns
/// Ctrl-C into a key event, so it stops recording here. Returns `false` once
/// the reader should exit.
pub fn handle_key_event(control: &watch::Sender<EpisodeControl>, key: KeyEvent) -> bool {
    if key.kind != KeyEventKind::Press {
        return true;
    }
    match key.code {
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            tracing::info!("Ctrl-C pressed: finishing current episode and stopping.");
            control.send_modify(|c| c.stop = true);
            false
        }
        KeyCode::Char(ch) => apply_key(control, ch.to_ascii_lowercase()),
        _ => true,
    }
}

/// Handle terminal events until recording stops. `next_event` waits at most
/// the given interval and yields `Ok(None)` when nothing arrived.
pub fn read_keys<F>(control: &watch::Sender<EpisodeControl>, mut next_event: F)
where
    F: FnMut(Duration) -> io::Result<Option<Event>>,
{
    while !control.borrow().stop {
        match next_event(KEY_POLL_INTERVAL) {
            Ok(Some(Event::Key(key))) => {
                if !handle_key_event(control, key) {
                    return;
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("stopped reading operator keys: {e}");
                return;
            }
        }
    }
}

fn next_terminal_event(timeout: Duration) -> io::Result<Option<Event>> {
    if event::poll(timeout)? {
        event::read().map(Some)
    } else {
        Ok(None)
    }
}

/// Raw mode for as long as the guard lives.
struct RawModeGuard(bool);

impl RawModeGuard {
    fn new() -> Self {
        match terminal::enable_raw_mode() {
            Ok(()) => Self(true),
            Err(e) => {
                tracing::warn!("terminal raw mode unavailable: {e}");
                Self(false)
            }
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.0
            && let Err(e) = terminal::disable_raw_mode()
        {
            tracing::warn!("failed to restore terminal mode: {e}");
        }
    }
}

/// Terminal reads block, so keys are read on a dedicated OS thread. The
/// terminal is back in cooked mode once the thread has exited.
pub fn spawn_key_reader(
    control: watch::Sender<EpisodeControl>,
) -> io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("episode-keys".into())
        .spawn(move || {
            let _raw = RawModeGuard::new();
            read_keys(&control, next_terminal_event);
        })
}

#[derive(Debug, Clone)]
pub struct RecordSettings {
    /// Control loop period, used in both phases.
    pub period: Duration,
    /// Interval between recorded frames.
    pub frame_period: Duration,
    pub reset_time: Duration,
    pub task: String,
}

impl From<&ClientConfig> for RecordSettings {
    fn from(cfg: &ClientConfig) -> Self {
        Self {
            period: cfg.period(),
            frame_period: cfg.dataset.period(),
            reset_time: cfg.dataset.reset_time(),
            task: cfg.dataset.task.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordSummary {
    pub episodes: u32,
    pub frames: u64,
    pub gaps: u64,
    /// Recording ticks whose command did not reach the host.
    pub unsent_commands: u64,
}

/// Runs episodes back to back: a reset phase where the operator keeps
/// teleoperating but nothing is stored, then a recording phase until `n`
/// (next episode) or `m` / ctrl-c (stop).
pub struct Recorder {
    settings: RecordSettings,
    control: watch::Receiver<EpisodeControl>,
    handled_ends: u64,
}

impl Recorder {
    pub fn new(settings: RecordSettings, control: watch::Receiver<EpisodeControl>) -> Self {
        Self {
            settings,
            control,
            handled_ends: 0,
        }
    }

    fn poll(&mut self) -> Option<Request> {
        let ctrl = *self.control.borrow_and_update();
        if ctrl.stop {
            return Some(Request::Stop);
        }
        if ctrl.episodes_ended > self.handled_ends {
            self.handled_ends = ctrl.episodes_ended;
            return Some(Request::EndEpisode);
        }
        None
    }

    async fn pace(&self, tick_start: Instant) {
        if let Some(rest) = self.settings.period.checked_sub(tick_start.elapsed()) {
            sleep(rest).await;
        }
    }

    pub async fn run<Tx, Rx, S>(
        &mut self,
        client: &mut ClientLoop<Tx, Rx>,
        sink: &mut S,
    ) -> anyhow::Result<RecordSummary>
    where
        Tx: LatestSink,
        Rx: LatestSource,
        S: EpisodeSink,
    {
        let mut summary = RecordSummary::default();

        'episodes: loop {
            tracing::info!(
                "Reset the environment, recording starts in {:?}",
                self.settings.reset_time
            );
            let reset_until = Instant::now() + self.settings.reset_time;
            while Instant::now() < reset_until {
                let tick_start = Instant::now();
                client.tick(tick_start);
                if self.poll() == Some(Request::Stop) {
                    break 'episodes;
                }
                self.pace(tick_start).await;
            }
            // A key pressed during the reset does not end the new episode.
            self.poll_discarding_ends();
            if self.control.borrow().stop {
                break;
            }

            tracing::info!("Recording episode {}...", summary.episodes + 1);
            let mut stop = false;
            let mut next_frame = Instant::now();
            loop {
                let tick_start = Instant::now();
                let tick = client.tick(tick_start);
                if tick.status != Some(SendStatus::Delivered) {
                    summary.unsent_commands += 1;
                }

                if tick_start >= next_frame {
                    next_frame += self.settings.frame_period;
                    if next_frame < tick_start {
                        next_frame = tick_start + self.settings.frame_period;
                    }
                    match tick.observation {
                        Some(observation) => {
                            let frame = Frame {
                                timestamp_ms: get_current_timestamp_ms(),
                                action: tick.command,
                                observation,
                            };
                            sink.add_frame(&frame, &self.settings.task)?;
                            summary.frames += 1;
                        }
                        None => summary.gaps += 1,
                    }
                }

                match self.poll() {
                    Some(Request::EndEpisode) => break,
                    Some(Request::Stop) => {
                        stop = true;
                        break;
                    }
                    None => {}
                }
                self.pace(tick_start).await;
            }

            tracing::info!("Saving episode");
            let saved = sink.save_episode().await?;
            summary.episodes += 1;
            tracing::info!(
                "Episode {} saved ({} frames).",
                saved.episode_index,
                saved.frames
            );
            if stop {
                break;
            }
        }

        tracing::info!("Finalising dataset");
        sink.push().await?;
        Ok(summary)
    }

    fn poll_discarding_ends(&mut self) {
        self.handled_ends = self.control.borrow_and_update().episodes_ended;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::EpisodeSummary;
    use crate::teleop::Leader;
    use crate::teleop::mock::MockLeader;
    use std::collections::VecDeque;
    use teleop_shared::transport::{LoopbackReceiver, LoopbackSender, RelayLink, loopback};
    use teleop_shared::{Observation, UnitId, UnitObservation};

    #[derive(Default)]
    struct MemorySink {
        current: Vec<Frame>,
        saved: Vec<usize>,
        pushed: bool,
    }

    impl EpisodeSink for MemorySink {
        fn add_frame(&mut self, frame: &Frame, _task: &str) -> anyhow::Result<()> {
            self.current.push(frame.clone());
            Ok(())
        }

        async fn save_episode(&mut self) -> anyhow::Result<EpisodeSummary> {
            let frames = std::mem::take(&mut self.current).len();
            self.saved.push(frames);
            Ok(EpisodeSummary {
                episode_index: self.saved.len() as i64 - 1,
                frames,
            })
        }

        async fn push(&mut self) -> anyhow::Result<()> {
            self.pushed = true;
            Ok(())
        }
    }

    type TestClient = ClientLoop<LoopbackSender, LoopbackReceiver>;

    fn client() -> (TestClient, LoopbackSender, LoopbackReceiver) {
        let leader = Leader::new(
            UnitId::new("arm1").unwrap(),
            Box::new(MockLeader::new(&[("gripper.pos", 30.0)])),
        );
        let (cmd_tx, cmd_rx) = loopback();
        let (obs_tx, obs_rx) = loopback();
        let client = ClientLoop::new(vec![leader], RelayLink { tx: cmd_tx, rx: obs_rx });
        (client, obs_tx, cmd_rx)
    }

    fn settings(reset_time: Duration) -> RecordSettings {
        RecordSettings {
            period: Duration::from_millis(10),
            frame_period: Duration::from_millis(20),
            reset_time,
            task: "test".into(),
        }
    }

    fn press(ch: char) -> io::Result<Option<Event>> {
        Ok(Some(Event::Key(KeyEvent::new(KeyCode::Char(ch), KeyModifiers::NONE))))
    }

    /// Replays `events` one per poll, then reports timeouts.
    fn scripted(
        events: Vec<io::Result<Option<Event>>>,
    ) -> impl FnMut(Duration) -> io::Result<Option<Event>> {
        let mut events = VecDeque::from(events);
        move |_| events.pop_front().unwrap_or(Ok(None))
    }

    #[test]
    fn keys_map_to_control_updates() {
        let (tx, rx) = watch::channel(EpisodeControl::default());
        let release = KeyEvent::new_with_kind(
            KeyCode::Char('n'),
            KeyModifiers::NONE,
            KeyEventKind::Release,
        );
        read_keys(
            &tx,
            scripted(vec![
                press('n'),
                Ok(None),
                press('x'),
                Ok(Some(Event::Key(release))),
                Ok(Some(Event::FocusGained)),
                press('N'),
                press('m'),
                press('n'),
            ]),
        );
        assert_eq!(
            *rx.borrow(),
            EpisodeControl {
                episodes_ended: 2,
                stop: true
            }
        );
    }

    #[test]
    fn ctrl_c_stops_recording() {
        let (tx, rx) = watch::channel(EpisodeControl::default());
        let ctrl_c = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL);
        assert!(handle_key_event(&tx, KeyEvent::new(KeyCode::Char('c'), KeyModifiers::NONE)));
        assert!(!rx.borrow().stop);
        assert!(!handle_key_event(&tx, ctrl_c));
        assert!(rx.borrow().stop);
    }

    #[test]
    fn reader_exits_once_stop_is_set_elsewhere() {
        let (tx, rx) = watch::channel(EpisodeControl::default());
        let signal = tx.clone();
        let mut polls = 0;
        read_keys(&tx, |_| {
            polls += 1;
            if polls == 3 {
                signal.send_modify(|c| c.stop = true);
            }
            Ok(None)
        });
        assert_eq!(polls, 3);
        assert!(rx.borrow().stop);
        assert_eq!(rx.borrow().episodes_ended, 0);
    }

    #[test]
    fn reader_exits_on_terminal_error() {
        let (tx, rx) = watch::channel(EpisodeControl::default());
        read_keys(
            &tx,
            scripted(vec![press('n'), Err(io::Error::other("not a terminal"))]),
        );
        assert_eq!(rx.borrow().episodes_ended, 1);
        assert!(!rx.borrow().stop);
    }

    #[tokio::test]
    async fn records_until_stopped_and_pushes() {
        let (mut client, obs_tx, _cmd_rx) = client();
        let (control_tx, control_rx) = watch::channel(EpisodeControl::default());

        let host = tokio::spawn(async move {
            let mut obs = Observation::default();
            obs.units
                .insert(UnitId::new("arm1").unwrap(), UnitObservation::default());
            let arm = obs.units.get_mut(&UnitId::new("arm1").unwrap()).unwrap();
            arm.state.insert("gripper.pos".into(), 29.0);
            let bytes = obs.encode(80).unwrap();
            for _ in 0..60 {
                let _ = obs_tx.publish(bytes.clone());
                sleep(Duration::from_millis(5)).await;
            }
        });
        let operator = tokio::spawn(async move {
            sleep(Duration::from_millis(120)).await;
            apply_key(&control_tx, 'n');
            sleep(Duration::from_millis(120)).await;
            apply_key(&control_tx, 'm');
        });

        let mut sink = MemorySink::default();
        let mut recorder = Recorder::new(settings(Duration::ZERO), control_rx);
        let summary = tokio::time::timeout(
            Duration::from_secs(5),
            recorder.run(&mut client, &mut sink),
        )
        .await
        .expect("recorder stops")
        .unwrap();

        operator.await.unwrap();
        host.abort();
        assert_eq!(summary.episodes, 2);
        assert_eq!(sink.saved.len(), 2);
        assert!(sink.saved.iter().all(|n| *n > 0), "{:?}", sink.saved);
        assert!(sink.pushed);
        assert_eq!(summary.frames, sink.saved.iter().sum::<usize>() as u64);
        assert_eq!(summary.unsent_commands, 0);
    }

    #[tokio::test]
    async fn commands_without_a_host_are_counted() {
        let (mut client, _obs_tx, cmd_rx) = client();
        drop(cmd_rx);
        let (control_tx, control_rx) = watch::channel(EpisodeControl::default());
        tokio::spawn(async move {
            sleep(Duration::from_millis(60)).await;
            apply_key(&control_tx, 'm');
        });

        let mut sink = MemorySink::default();
        let mut recorder = Recorder::new(settings(Duration::ZERO), control_rx);
        let summary = tokio::time::timeout(
            Duration::from_secs(5),
            recorder.run(&mut client, &mut sink),
        )
        .await
        .expect("recorder stops")
        .unwrap();

        assert_eq!(summary.episodes, 1);
        assert!(summary.unsent_commands >= 2, "{summary:?}");
    }

    #[tokio::test]
    async fn stop_during_reset_saves_nothing() {
        let (mut client, _obs_tx, _cmd_rx) = client();
        let (control_tx, control_rx) = watch::channel(EpisodeControl::default());
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            control_tx.send_modify(|c| c.stop = true);
        });

        let mut sink = MemorySink::default();
        let mut recorder = Recorder::new(settings(Duration::from_secs(10)), control_rx);
        let summary = tokio::time::timeout(
            Duration::from_secs(5),
            recorder.run(&mut client, &mut sink),
        )
        .await
        .expect("stop honoured during reset")
        .unwrap();

        assert_eq!(summary.episodes, 0);
        assert!(sink.saved.is_empty());
        assert!(sink.pushed);
        assert!(client.stats().ticks >= 2);
    }
}
