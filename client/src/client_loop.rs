use crate::teleop::{Leader, disconnect_leaders};
use std::time::{Duration, Instant};
use teleop_shared::transport::RelayLink;
use teleop_shared::{
    Command, LatestSink, LatestSource, LogThrottle, Observation, RelayError, SendStatus, UnitId,
};

const LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Result of one client tick.
#[derive(Debug, Clone)]
pub struct ClientTick {
    pub command: Command,
    /// `None` when no leader produced an action, so nothing was sent.
    pub status: Option<SendStatus>,
    /// Latest observation that arrived since the previous tick, if any.
    pub observation: Option<Observation>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub ticks: u64,
    pub commands_sent: u64,
    pub commands_dropped: u64,
    pub observations: u64,
    pub malformed_observations: u64,
}

/// Operator-side half of the relay: leaders in, commands out, observations
/// back. Never waits on the host.
pub struct ClientLoop<Tx: LatestSink, Rx: LatestSource> {
    leaders: Vec<Leader>,
    unit_ids: Vec<UnitId>,
    link: RelayLink<Tx, Rx>,
    stats: ClientStats,
    leader_errors: LogThrottle,
    malformed: LogThrottle,
    no_receiver: LogThrottle,
    rejected: LogThrottle,
    torn_down: bool,
}

impl<Tx: LatestSink, Rx: LatestSource> ClientLoop<Tx, Rx> {
    pub fn new(leaders: Vec<Leader>, link: RelayLink<Tx, Rx>) -> Self {
        let unit_ids = leaders.iter().map(|l| l.id.clone()).collect();
        Self {
            leaders,
            unit_ids,
            link,
            stats: ClientStats::default(),
            leader_errors: LogThrottle::new(LOG_INTERVAL),
            malformed: LogThrottle::new(LOG_INTERVAL),
            no_receiver: LogThrottle::new(LOG_INTERVAL),
            rejected: LogThrottle::new(LOG_INTERVAL),
            torn_down: false,
        }
    }

    #[cfg(test)]
    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    pub fn tick(&mut self, now: Instant) -> ClientTick {
        self.stats.ticks += 1;

        let mut command = Command::default();
        for leader in &mut self.leaders {
            if !leader.is_connected() {
                continue;
            }
            match leader.get_action() {
                Ok(action) => {
                    command.units.insert(leader.id.clone(), action);
                }
                Err(source) => {
                    if let Some(suppressed) = self.leader_errors.ready(now) {
                        let err = RelayError::DeviceDisconnected {
                            unit: leader.id.to_string(),
                            source,
                        };
                        tracing::warn!(
                            "{err}; unit left out of this command ({suppressed} similar suppressed)"
                        );
                    }
                }
            }
        }

        let status = self.send(&command, now);
        let observation = self.receive_observation(now);

        ClientTick {
            command,
            status,
            observation,
        }
    }

    fn send(&mut self, command: &Command, now: Instant) -> Option<SendStatus> {
        // An empty envelope would be rejected by the host anyway; sending
        // nothing lets its watchdog see the silence.
        if command.units.is_empty() {
            return None;
        }
        let bytes = match command.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("failed to encode command: {e}");
                return None;
            }
        };
        let status = self.link.tx.publish(bytes);
        match status {
            SendStatus::Delivered => self.stats.commands_sent += 1,
            SendStatus::Rejected => {
                self.stats.commands_dropped += 1;
                if let Some(suppressed) = self.rejected.ready(now) {
                    tracing::error!(
                        "Dropping command, too large for one frame \
                         ({suppressed} dropped since last notice)"
                    );
                }
            }
            SendStatus::WouldBlock => {
                self.stats.commands_dropped += 1;
                if let Some(suppressed) = self.no_receiver.ready(now) {
                    tracing::info!(
                        "Dropping command, host not connected \
                         ({suppressed} dropped since last notice)"
                    );
                }
            }
        }
        Some(status)
    }

    fn receive_observation(&mut self, now: Instant) -> Option<Observation> {
        let bytes = self.link.rx.try_receive_latest()?;
        match Observation::decode(&bytes, &self.unit_ids) {
            Ok(obs) => {
                self.stats.observations += 1;
                Some(obs)
            }
            Err(e) => {
                self.stats.malformed_observations += 1;
                if let Some(suppressed) = self.malformed.ready(now) {
                    let err = RelayError::MalformedFrame(e);
                    tracing::warn!("ignoring observation: {err} ({suppressed} similar suppressed)");
                }
                None
            }
        }
    }

    /// Disconnect leaders and close the link. Idempotent.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        tracing::info!("Disconnecting teleop devices and relay link.");
        disconnect_leaders(&mut self.leaders);
        self.link.close();
        let s = &self.stats;
        tracing::info!(
            "{} ticks, {} commands sent, {} dropped, {} observations, {} malformed",
            s.ticks,
            s.commands_sent,
            s.commands_dropped,
            s.observations,
            s.malformed_observations
        );
    }
}

impl<Tx: LatestSink, Rx: LatestSource> Drop for ClientLoop<Tx, Rx> {
    fn drop(&mut self) {
        self.teardown();
    }
}
