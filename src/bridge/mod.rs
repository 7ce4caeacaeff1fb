//! The bridge context and its per-frame tick.
//!
//! [`Bridge`] owns every piece of the core: the inbound queue, the
//! recommendation store, the advisor supervisor and the optional viewer
//! server. The host builds one at startup, calls [`Bridge::tick`] once per
//! frame from its single game thread, and calls [`Bridge::shutdown`] on exit.
//! `tick` never blocks on I/O; the only blocking call is the advisor
//! handshake inside [`Bridge::start_advisor`], which the host makes outside
//! its frame loop.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::broadcast::BroadcastServer;
use crate::events::{BridgeEvent, EventSink};
use crate::protocol::{self, Inbound};
use crate::queue::{InboundMessage, InboundQueue, Origin};
use crate::store::RecommendationStore;
use crate::supervisor::{ProcessSupervisor, SupervisorSettings};

/// Why a game command was refused. The message is echoed to the issuer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Invalid command: {0}")]
    Unknown(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Command not available now: {0}")]
    Unavailable(String),
}

/// Renders the game state sent to the advisor and viewers.
pub trait StateSerializer {
    fn serialize(&self) -> String;

    /// Whether the state changed since the last call. Resets on read.
    fn take_state_change(&mut self) -> bool {
        false
    }
}

/// Applies text commands to the game.
pub trait CommandExecutor {
    /// Returns `Ok(true)` when the command changed the state.
    fn execute(&mut self, command: &str) -> Result<bool, CommandError>;

    /// Whether the game is currently waiting for a command.
    fn ready_for_command(&self) -> bool;
}

/// What one tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub processed: usize,
    pub rejected: usize,
    pub advisor_died: bool,
    pub state_sent: bool,
}

pub struct Bridge {
    inbound: InboundQueue,
    store: Arc<RecommendationStore>,
    supervisor: ProcessSupervisor,
    server: Option<BroadcastServer>,
    events: EventSink,
    frames: u64,
}

impl Bridge {
    pub fn new(settings: SupervisorSettings, events: EventSink) -> Self {
        let inbound = InboundQueue::new();
        let store = Arc::new(RecommendationStore::with_events(events.clone()));
        let supervisor = ProcessSupervisor::new(settings, inbound.clone(), events.clone());
        Self {
            inbound,
            store,
            supervisor,
            server: None,
            events,
            frames: 0,
        }
    }

    /// Launch (or relaunch) the advisor. `None` uses the configured command.
    /// Blocks for at most the handshake timeout.
    pub fn start_advisor(&mut self, command: Option<&str>) -> bool {
        match command {
            Some(command) => self.supervisor.start(command),
            None => self.supervisor.start_configured(),
        }
    }

    pub fn stop_advisor(&mut self) {
        self.supervisor.stop();
    }

    /// Start the viewer server, creating it on first use.
    pub fn start_broadcast(&mut self, host: &str, port: u16) -> bool {
        let server = self.server.get_or_insert_with(|| {
            BroadcastServer::new(
                host,
                self.inbound.clone(),
                Arc::clone(&self.store),
                self.events.clone(),
            )
        });
        server.start(port)
    }

    pub fn stop_broadcast(&mut self) {
        if let Some(server) = self.server.as_mut() {
            server.stop();
        }
    }

    /// One frame: check the advisor, apply everything queued, push state if
    /// anything changed.
    pub fn tick<G>(&mut self, game: &mut G) -> TickReport
    where
        G: StateSerializer + CommandExecutor,
    {
        self.frames += 1;
        let mut report = TickReport {
            advisor_died: self.supervisor.poll(),
            ..TickReport::default()
        };

        let mut changed = false;
        for message in self.inbound.drain() {
            if !self.supervisor.accepts(message.origin) {
                debug!(origin = ?message.origin, "dropping line from a stale advisor");
                continue;
            }
            report.processed += 1;
            match self.route(&message, game) {
                Ok(command_changed) => changed |= command_changed,
                Err(()) => report.rejected += 1,
            }
        }

        let game_changed = game.take_state_change();
        let snapshot_requested = self.supervisor.take_snapshot_request();
        if changed || game_changed || snapshot_requested {
            let state = game.serialize();
            self.supervisor.send(&state);
            if let Some(server) = self.server.as_ref() {
                server.broadcast(&state);
            }
            report.state_sent = true;
        }
        report
    }

    fn route<G>(&mut self, message: &InboundMessage, game: &mut G) -> Result<bool, ()>
    where
        G: CommandExecutor,
    {
        match protocol::classify(&message.text) {
            Inbound::Empty => Ok(false),
            Inbound::Recommendations(document) => {
                if self.store.update_value(document) {
                    if let (Some(server), Some(snapshot)) = (self.server.as_ref(), self.store.get()) {
                        server.broadcast(&snapshot.payload());
                    }
                }
                Ok(false)
            }
            Inbound::Clear => {
                self.store.clear();
                if let Some(server) = self.server.as_ref() {
                    server.broadcast(protocol::CLEAR_SENTINEL);
                }
                Ok(false)
            }
            Inbound::Command(command) => match game.execute(command) {
                Ok(changed) => {
                    debug!(command, changed, "executed command");
                    Ok(changed)
                }
                Err(e) => {
                    warn!(command, origin = ?message.origin, "command rejected: {e}");
                    self.events.emit(BridgeEvent::CommandRejected {
                        command: command.to_string(),
                        error: e.to_string(),
                    });
                    let reply = protocol::error_reply(&e.to_string(), game.ready_for_command());
                    self.reply(message.origin, &reply);
                    Err(())
                }
            },
        }
    }

    fn reply(&self, origin: Origin, payload: &str) {
        let delivered = match origin {
            Origin::Advisor { .. } => self.supervisor.send(payload),
            Origin::Viewer(id) => self
                .server
                .as_ref()
                .is_some_and(|server| server.send_to(id, payload)),
        };
        if !delivered {
            debug!(origin = ?origin, "error reply could not be delivered");
        }
    }

    /// Stop the advisor and the viewer server.
    pub fn shutdown(&mut self) {
        info!(frames = self.frames, "shutting down bridge");
        self.supervisor.stop();
        self.stop_broadcast();
    }

    pub fn store(&self) -> &Arc<RecommendationStore> {
        &self.store
    }

    pub fn inbound(&self) -> &InboundQueue {
        &self.inbound
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn supervisor_mut(&mut self) -> &mut ProcessSupervisor {
        &mut self.supervisor
    }

    pub fn server(&self) -> Option<&BroadcastServer> {
        self.server.as_ref()
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.supervisor.stop();
        self.stop_broadcast();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::ConnectionId;
    use std::net::TcpStream;
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};
    use tungstenite::{Message, WebSocket};

    /// A counter game: `inc` changes state, `noop` does not, `busy` is
    /// refused, anything else is unknown.
    #[derive(Default)]
    struct Counter {
        value: u32,
        external_change: bool,
        executed: Vec<String>,
    }

    impl StateSerializer for Counter {
        fn serialize(&self) -> String {
            format!(r#"{{"value":{}}}"#, self.value)
        }

        fn take_state_change(&mut self) -> bool {
            std::mem::take(&mut self.external_change)
        }
    }

    impl CommandExecutor for Counter {
        fn execute(&mut self, command: &str) -> Result<bool, CommandError> {
            self.executed.push(command.to_string());
            match command {
                "inc" => {
                    self.value += 1;
                    Ok(true)
                }
                "noop" => Ok(false),
                "busy" => Err(CommandError::Unavailable("busy".to_string())),
                other => Err(CommandError::Unknown(other.to_string())),
            }
        }

        fn ready_for_command(&self) -> bool {
            true
        }
    }

    fn bridge() -> Bridge {
        Bridge::new(SupervisorSettings::default(), EventSink::disabled())
    }

    fn viewer(id: u64, text: &str) -> InboundMessage {
        InboundMessage::new(Origin::Viewer(ConnectionId(id)), text)
    }

    #[test]
    fn idle_tick_sends_nothing() {
        let mut bridge = bridge();
        let mut game = Counter::default();
        let report = bridge.tick(&mut game);
        assert_eq!(report, TickReport::default());
        assert_eq!(bridge.frames(), 1);
    }

    #[test]
    fn drains_every_queued_command_in_order() {
        let mut bridge = bridge();
        let mut game = Counter::default();
        bridge.inbound().push(viewer(1, "inc"));
        bridge.inbound().push(viewer(2, "noop"));
        bridge.inbound().push(viewer(1, "inc"));

        let report = bridge.tick(&mut game);

        assert_eq!(game.executed, vec!["inc", "noop", "inc"]);
        assert_eq!(game.value, 2);
        assert_eq!(report.processed, 3);
        assert!(report.state_sent);
        assert!(bridge.inbound().is_empty());
    }

    #[test]
    fn unchanged_state_is_not_sent() {
        let mut bridge = bridge();
        let mut game = Counter::default();
        bridge.inbound().push(viewer(1, "noop"));
        assert!(!bridge.tick(&mut game).state_sent);

        game.external_change = true;
        assert!(bridge.tick(&mut game).state_sent);
    }

    #[test]
    fn rejected_commands_are_counted_and_reported() {
        let (tx, rx) = mpsc::channel();
        let mut bridge = Bridge::new(SupervisorSettings::default(), EventSink::new(tx));
        let mut game = Counter::default();
        bridge.inbound().push(viewer(1, "fly"));

        let report = bridge.tick(&mut game);

        assert_eq!(report.rejected, 1);
        assert!(!report.state_sent);
        let events: Vec<_> = rx.try_iter().collect();
        assert!(events.contains(&BridgeEvent::CommandRejected {
            command: "fly".to_string(),
            error: "Invalid command: fly".to_string(),
        }));
    }

    #[test]
    fn recommendations_and_clear_update_the_store() {
        let mut bridge = bridge();
        let mut game = Counter::default();

        bridge.inbound().push(viewer(
            1,
            r#"{"type":"recommendations","cardScores":{"Bash":90},"recommendedAction":"play Bash"}"#,
        ));
        bridge.tick(&mut game);
        assert_eq!(bridge.store().score_for("Bash"), Some(90));
        assert!(game.executed.is_empty());

        bridge.inbound().push(viewer(1, r#"{"type":"clear"}"#));
        bridge.tick(&mut game);
        assert!(bridge.store().get().is_none());
    }

    #[test]
    fn lines_from_an_unaccepted_advisor_are_dropped() {
        let mut bridge = bridge();
        let mut game = Counter::default();
        bridge
            .inbound()
            .push(InboundMessage::new(Origin::Advisor { generation: 4 }, "inc"));

        let report = bridge.tick(&mut game);

        assert_eq!(report.processed, 0);
        assert!(game.executed.is_empty());
    }

    #[test]
    fn blank_lines_are_skipped() {
        let mut bridge = bridge();
        let mut game = Counter::default();
        bridge.inbound().push(viewer(1, "   "));
        let report = bridge.tick(&mut game);
        assert_eq!(report.processed, 1);
        assert!(game.executed.is_empty());
    }

    // ── with a live viewer server ──

    fn connect(bridge: &Bridge) -> WebSocket<TcpStream> {
        let addr = bridge.server().unwrap().local_addr().unwrap();
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let (socket, _) = match tungstenite::client(format!("ws://{addr}/"), stream) {
            Ok(pair) => pair,
            Err(e) => panic!("websocket handshake failed: {e}"),
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while bridge.server().unwrap().client_count() == 0 {
            assert!(Instant::now() < deadline, "viewer never registered");
            thread::sleep(Duration::from_millis(10));
        }
        socket
    }

    fn read_text(socket: &mut WebSocket<TcpStream>) -> String {
        match socket.read().unwrap() {
            Message::Text(text) => text.as_str().to_string(),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    /// Tick until the inbound queue has been consumed at least once.
    fn tick_until_processed(bridge: &mut Bridge, game: &mut Counter) -> TickReport {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let report = bridge.tick(game);
            if report.processed > 0 {
                return report;
            }
            assert!(Instant::now() < deadline, "no inbound message arrived");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn viewer_command_changes_state_and_state_is_broadcast() {
        let mut bridge = bridge();
        assert!(bridge.start_broadcast("127.0.0.1", 0));
        let mut game = Counter::default();
        let mut client = connect(&bridge);

        client.send(Message::text("inc".to_string())).unwrap();
        let report = tick_until_processed(&mut bridge, &mut game);

        assert!(report.state_sent);
        assert_eq!(read_text(&mut client), r#"{"value":1}"#);
        bridge.shutdown();
    }

    #[test]
    fn rejected_viewer_command_gets_error_reply() {
        let mut bridge = bridge();
        assert!(bridge.start_broadcast("127.0.0.1", 0));
        let mut game = Counter::default();
        let mut client = connect(&bridge);

        client.send(Message::text("busy".to_string())).unwrap();
        tick_until_processed(&mut bridge, &mut game);

        let reply: serde_json::Value = serde_json::from_str(&read_text(&mut client)).unwrap();
        assert_eq!(reply["error"], "Command not available now: busy");
        assert_eq!(reply["ready_for_command"], true);
        bridge.shutdown();
    }

    #[test]
    fn recommendations_are_relayed_and_clear_sends_sentinel() {
        let mut bridge = bridge();
        assert!(bridge.start_broadcast("127.0.0.1", 0));
        let mut game = Counter::default();
        let mut client = connect(&bridge);

        bridge.inbound().push(viewer(
            99,
            r#"{"type":"recommendations","cardScores":{"Zap":40}}"#,
        ));
        bridge.tick(&mut game);
        let relayed: serde_json::Value = serde_json::from_str(&read_text(&mut client)).unwrap();
        assert_eq!(relayed["cardScores"]["Zap"], 40);

        bridge.inbound().push(viewer(99, r#"{"type":"clear"}"#));
        bridge.tick(&mut game);
        assert_eq!(read_text(&mut client), protocol::CLEAR_SENTINEL);
        bridge.shutdown();
    }

    #[cfg(unix)]
    mod advisor {
        use super::*;
        use serial_test::serial;

        fn script(dir: &std::path::Path, body: &str) -> String {
            let path = dir.join("advisor.sh");
            std::fs::write(&path, body).unwrap();
            format!("/bin/sh {}", path.display())
        }

        #[test]
        #[serial]
        fn advisor_gets_state_after_handshake_and_its_advice_lands_in_the_store() {
            let tmp = tempfile::tempdir().unwrap();
            let settings = SupervisorSettings {
                error_log: tmp.path().join("advisor_errors.log"),
                handshake_timeout: Duration::from_secs(5),
                ..SupervisorSettings::default()
            };
            let mut bridge = Bridge::new(settings, EventSink::disabled());
            let mut game = Counter::default();
            let command = script(
                tmp.path(),
                "echo ready\n\
                 while read line; do\n\
                   echo '{\"type\":\"recommendations\",\"cardScores\":{\"Strike\":50}}'\n\
                 done\n",
            );

            assert!(bridge.start_advisor(Some(&command)));
            let first = bridge.tick(&mut game);
            assert!(first.state_sent, "handshake should trigger a snapshot");

            let deadline = Instant::now() + Duration::from_secs(5);
            while bridge.store().score_for("Strike").is_none() {
                assert!(Instant::now() < deadline, "advice never arrived");
                bridge.tick(&mut game);
                thread::sleep(Duration::from_millis(10));
            }
            bridge.shutdown();
            assert!(!bridge.supervisor_mut().is_alive());
        }

        #[test]
        #[serial]
        fn line_from_a_timed_out_attempt_is_dropped_by_tick() {
            let tmp = tempfile::tempdir().unwrap();
            let settings = SupervisorSettings {
                error_log: tmp.path().join("advisor_errors.log"),
                handshake_timeout: Duration::from_millis(200),
                ..SupervisorSettings::default()
            };
            let mut bridge = Bridge::new(settings, EventSink::disabled());
            let mut game = Counter::default();

            assert!(!bridge.start_advisor(Some(&script(tmp.path(), "exec sleep 5\n"))));
            let timed_out = Origin::Advisor {
                generation: bridge.supervisor().generation(),
            };
            bridge.inbound().push(InboundMessage::new(timed_out, "inc"));
            bridge.inbound().push(viewer(1, "noop"));

            let report = bridge.tick(&mut game);
            assert_eq!(report.processed, 1);
            assert_eq!(game.executed, vec!["noop"]);
            assert_eq!(game.value, 0);
            assert!(bridge.inbound().is_empty());
        }

        #[test]
        #[serial]
        fn advisor_command_errors_are_echoed_to_the_advisor() {
            let tmp = tempfile::tempdir().unwrap();
            let received = tmp.path().join("received.txt");
            let settings = SupervisorSettings {
                error_log: tmp.path().join("advisor_errors.log"),
                handshake_timeout: Duration::from_secs(5),
                ..SupervisorSettings::default()
            };
            let mut bridge = Bridge::new(settings, EventSink::disabled());
            let mut game = Counter::default();
            let command = script(
                tmp.path(),
                &format!(
                    "echo ready\necho fly\nwhile read line; do echo \"$line\" >> {}; done\n",
                    received.display()
                ),
            );

            assert!(bridge.start_advisor(Some(&command)));
            tick_until_processed(&mut bridge, &mut game);

            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                let contents = std::fs::read_to_string(&received).unwrap_or_default();
                if contents.contains("\"error\":\"Invalid command: fly\"") {
                    break;
                }
                assert!(Instant::now() < deadline, "no error reply in: {contents}");
                thread::sleep(Duration::from_millis(20));
            }
            bridge.shutdown();
        }
    }
}
