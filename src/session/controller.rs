//! The session state machine

use crossbeam_channel::{select, unbounded, Receiver, Sender};

use super::{SessionCommand, SessionSettings, SessionState, UiEvent};
use crate::audio::capture::AudioCapture;
use crate::audio::sink::SinkOpener;
use crate::error::Error;
use crate::network::{InboundStream, PeerId, PeerState, Reliability, Transport, TransportEvent};
use crate::pipeline::{
    Direction, EndReason, PipelineEvent, PipelineStats, ReceivePipeline, SendPipeline,
};
use crate::protocol::{Action, ActionType, Command, FormatDescriptor};

/// Drives one node's side of a streaming session.
///
/// Collaborators are injected, so the same controller runs against a real
/// microphone and TCP or against in-memory fakes.
pub struct SessionController {
    transport: Box<dyn Transport>,
    capture: Box<dyn AudioCapture>,
    sinks: Box<dyn SinkOpener>,
    settings: SessionSettings,
    state: SessionState,
    peer: Option<PeerId>,
    /// Display name sent with the last stream request we accepted.
    requested_by: Option<String>,
    send: Option<SendPipeline>,
    receive: Option<ReceivePipeline>,
    /// Inbound stream that arrived before its format announcement.
    held_stream: Option<InboundStream>,
    ui: Option<Sender<UiEvent>>,
    pipeline_tx: Sender<PipelineEvent>,
    pipeline_rx: Receiver<PipelineEvent>,
}

impl SessionController {
    pub fn new(
        transport: Box<dyn Transport>,
        capture: Box<dyn AudioCapture>,
        sinks: Box<dyn SinkOpener>,
        settings: SessionSettings,
    ) -> Self {
        let (pipeline_tx, pipeline_rx) = unbounded();
        Self {
            transport,
            capture,
            sinks,
            settings,
            state: SessionState::Idle,
            peer: None,
            requested_by: None,
            send: None,
            receive: None,
            held_stream: None,
            ui: None,
            pipeline_tx,
            pipeline_rx,
        }
    }

    /// Report session changes on `ui`.
    pub fn with_ui(mut self, ui: Sender<UiEvent>) -> Self {
        self.ui = Some(ui);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn connected_peer(&self) -> Option<&PeerId> {
        self.peer.as_ref()
    }

    pub fn requested_by(&self) -> Option<&str> {
        self.requested_by.as_deref()
    }

    pub fn local_peer(&self) -> &PeerId {
        self.transport.local_peer()
    }

    pub fn send_stats(&self) -> Option<PipelineStats> {
        self.send.as_ref().map(|p| p.stats())
    }

    pub fn receive_stats(&self) -> Option<PipelineStats> {
        self.receive.as_ref().map(|p| p.stats())
    }

    /// Serve events until [`SessionCommand::Shutdown`] or until either
    /// input channel closes.
    pub fn run(mut self, transport_events: Receiver<TransportEvent>, commands: Receiver<SessionCommand>) {
        let pipeline_events = self.pipeline_rx.clone();
        tracing::info!(peer = %self.local_peer(), "Session controller running");

        loop {
            select! {
                recv(commands) -> command => match command {
                    Ok(SessionCommand::Shutdown) | Err(_) => break,
                    Ok(command) => self.handle_command(command),
                },
                recv(transport_events) -> event => match event {
                    Ok(event) => self.handle_transport_event(event),
                    Err(_) => {
                        tracing::warn!("Transport event channel closed");
                        break;
                    }
                },
                recv(pipeline_events) -> event => {
                    if let Ok(event) = event {
                        self.handle_pipeline_event(event);
                    }
                },
            }
        }

        self.shutdown();
        tracing::info!("Session controller stopped");
    }

    pub fn handle_command(&mut self, command: SessionCommand) {
        tracing::debug!(?command, state = %self.state, "Session command");

        match command {
            SessionCommand::Advertise => match self.state {
                SessionState::Idle | SessionState::Browsing => self.advertise(),
                _ => self.ignored_command(command),
            },
            SessionCommand::Browse => match self.state {
                SessionState::Idle | SessionState::Advertising => {
                    self.transport.stop_advertising();
                    self.set_state(SessionState::Browsing);
                    if let Err(e) = self.transport.browse() {
                        tracing::warn!(error = %e, "Browsing failed");
                    }
                }
                _ => self.ignored_command(command),
            },
            SessionCommand::FinishBrowsing => match self.state {
                SessionState::Browsing => self.advertise(),
                _ => self.ignored_command(command),
            },
            SessionCommand::RequestStream => match self.state {
                SessionState::Connected => self.request_stream(),
                _ => self.ignored_command(command),
            },
            SessionCommand::StopStream => match self.state {
                SessionState::AwaitingAudio | SessionState::ReceivingAudio => {
                    if let Err(e) = self.send_action(Action::stop_streaming(), Reliability::Reliable) {
                        tracing::warn!(error = %e, "Failed to ask peer to stop streaming");
                    }
                    self.teardown_receive();
                    self.set_state(SessionState::Connected);
                }
                _ => self.ignored_command(command),
            },
            SessionCommand::StopSending => match self.state {
                SessionState::SendingAudio => {
                    self.teardown_send();
                    self.announce_capture_stopped();
                    self.set_state(SessionState::Connected);
                }
                _ => self.ignored_command(command),
            },
            SessionCommand::Disconnect => {
                if self.peer.is_some() {
                    self.teardown_all();
                    self.peer = None;
                    self.transport.disconnect();
                    self.advertise();
                } else {
                    self.ignored_command(command);
                }
            }
            SessionCommand::Shutdown => self.shutdown(),
        }
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerStateChanged { peer, state } => self.handle_peer_state(peer, state),
            TransportEvent::MessageReceived { peer, bytes } => {
                if !self.is_current_peer(&peer) {
                    tracing::debug!(peer = %peer, "Ignoring message from unknown peer");
                    return;
                }
                match Action::decode(&bytes) {
                    Ok(action) => self.handle_action(action),
                    Err(e) => {
                        tracing::warn!(peer = %peer, error = %e, bytes = bytes.len(), "Dropping malformed action");
                    }
                }
            }
            TransportEvent::StreamOpened { peer, name, stream } => {
                if !self.is_current_peer(&peer) {
                    tracing::debug!(peer = %peer, "Ignoring stream from unknown peer");
                    return;
                }
                if name != self.settings.stream_name {
                    tracing::warn!(peer = %peer, name = %name, "Ignoring unexpected stream");
                    return;
                }
                self.accept_stream(stream);
            }
        }
    }

    /// React to a decoded action from the connected peer. Actions that make
    /// no sense in the current state are ignored.
    pub fn handle_action(&mut self, action: Action) {
        let kind = action.action_type();
        tracing::debug!(action = ?kind, state = %self.state, "Action received");

        match action.command {
            Command::StartStreamingAudio { peer } => match self.state {
                SessionState::Connected => {
                    self.requested_by = peer.clone();
                    self.emit(UiEvent::OpenStreamingView { requested_by: peer });
                    self.start_sending();
                }
                _ => self.ignored_action(kind),
            },
            Command::StopStreamingAudio => match self.state {
                SessionState::SendingAudio => {
                    self.teardown_send();
                    self.set_state(SessionState::Connected);
                }
                _ => self.ignored_action(kind),
            },
            Command::StartCapturingAudioStream { format } => match self.state {
                SessionState::AwaitingAudio => self.start_receiving(format),
                _ => self.ignored_action(kind),
            },
            Command::StopCapturingAudioStream => match self.state {
                SessionState::AwaitingAudio | SessionState::ReceivingAudio => {
                    self.teardown_receive();
                    self.set_state(SessionState::Connected);
                }
                _ => self.ignored_action(kind),
            },
        }
    }

    pub fn handle_pipeline_event(&mut self, event: PipelineEvent) {
        let PipelineEvent::Ended {
            direction,
            pipeline,
            reason,
        } = event;

        let current = match direction {
            Direction::Send => self.send.as_ref().map(|p| p.id()),
            Direction::Receive => self.receive.as_ref().map(|p| p.id()),
        };
        if current != Some(pipeline) {
            tracing::debug!(pipeline, ?direction, "Ignoring event from stale pipeline");
            return;
        }

        match &reason {
            EndReason::EndOfStream => tracing::info!(pipeline, ?direction, "Stream ended"),
            EndReason::Failed(error) => tracing::warn!(pipeline, ?direction, %error, "Stream failed"),
        }

        match direction {
            Direction::Send => {
                self.teardown_send();
                self.announce_capture_stopped();
            }
            Direction::Receive => {
                self.teardown_receive();
            }
        }
        self.set_state(SessionState::Connected);
    }

    /// Handle every pipeline event already queued. Returns how many there were.
    pub fn process_pending_pipeline_events(&mut self) -> usize {
        let events: Vec<_> = self.pipeline_rx.try_iter().collect();
        let count = events.len();
        for event in events {
            self.handle_pipeline_event(event);
        }
        count
    }

    fn handle_peer_state(&mut self, peer: PeerId, state: PeerState) {
        match state {
            PeerState::Connecting => {
                tracing::info!(peer = %peer, "Peer connecting");
            }
            PeerState::Connected => {
                if let Some(current) = &self.peer {
                    if current.id != peer.id {
                        tracing::warn!(peer = %peer, current = %current, "Ignoring second peer");
                    }
                    return;
                }
                match self.state {
                    SessionState::Idle | SessionState::Advertising | SessionState::Browsing => {
                        tracing::info!(peer = %peer, "Peer connected");
                        self.transport.stop_advertising();
                        self.peer = Some(peer);
                        self.set_state(SessionState::Connected);
                    }
                    _ => tracing::warn!(peer = %peer, state = %self.state, "Unexpected connection"),
                }
            }
            PeerState::NotConnected => {
                if !self.is_current_peer(&peer) {
                    return;
                }
                tracing::warn!(peer = %peer, state = %self.state, "Peer lost");
                self.teardown_all();
                self.peer = None;
                self.advertise();
            }
        }
    }

    fn is_current_peer(&self, peer: &PeerId) -> bool {
        self.peer.as_ref().is_some_and(|current| current.id == peer.id)
    }

    fn advertise(&mut self) {
        match self.transport.start_advertising() {
            Ok(()) => self.set_state(SessionState::Advertising),
            Err(e) => {
                tracing::error!(error = %e, "Failed to start advertising");
                self.set_state(SessionState::Idle);
            }
        }
    }

    fn request_stream(&mut self) {
        let name = self.transport.local_peer().display_name.clone();
        match self.send_action(Action::start_streaming(Some(name)), Reliability::Reliable) {
            Ok(()) => self.set_state(SessionState::AwaitingAudio),
            Err(e) => tracing::warn!(error = %e, "Failed to request stream"),
        }
    }

    /// Microphone side: announce the format, open the stream, start capture.
    fn start_sending(&mut self) {
        let format = match self.capture.format() {
            Ok(format) => format,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot stream, capture unavailable");
                self.emit(UiEvent::CloseStreamingView);
                return;
            }
        };
        warn_if_inconsistent(&format);

        if let Err(e) = self.send_action(Action::start_capturing(format), Reliability::Unreliable) {
            tracing::warn!(error = %e, "Failed to announce stream format");
            self.emit(UiEvent::CloseStreamingView);
            return;
        }

        match self.open_send_pipeline(&format) {
            Ok(pipeline) => {
                tracing::info!(pipeline = pipeline.id(), to = ?self.requested_by, "Streaming microphone");
                self.send = Some(pipeline);
                self.set_state(SessionState::SendingAudio);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to start streaming");
                self.capture.stop();
                self.announce_capture_stopped();
                self.emit(UiEvent::CloseStreamingView);
            }
        }
    }

    fn open_send_pipeline(&mut self, format: &FormatDescriptor) -> Result<SendPipeline, Error> {
        let outbound = self.transport.open_byte_stream(&self.settings.stream_name)?;
        let (mut pipeline, producer) =
            SendPipeline::start(outbound, format, &self.settings.pipeline, self.pipeline_tx.clone())?;
        if let Err(e) = self.capture.start(producer) {
            pipeline.stop();
            return Err(e.into());
        }
        Ok(pipeline)
    }

    /// Recording side: open the sink for `format` and start the pipeline.
    fn start_receiving(&mut self, format: FormatDescriptor) {
        warn_if_inconsistent(&format);

        match self.open_receive_pipeline(format) {
            Ok(pipeline) => {
                tracing::info!(
                    pipeline = pipeline.id(),
                    path = %self.settings.output_path.display(),
                    "Recording peer microphone"
                );
                self.receive = Some(pipeline);
                self.set_state(SessionState::ReceivingAudio);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot record stream");
                self.held_stream = None;
                if let Err(e) = self.send_action(Action::stop_streaming(), Reliability::Reliable) {
                    tracing::warn!(error = %e, "Failed to ask peer to stop streaming");
                }
                self.set_state(SessionState::Connected);
            }
        }
    }

    fn open_receive_pipeline(&mut self, format: FormatDescriptor) -> Result<ReceivePipeline, Error> {
        let sink = self.sinks.open(&self.settings.output_path, &format)?;
        let mut pipeline =
            ReceivePipeline::start(sink, format, &self.settings.pipeline, self.pipeline_tx.clone())?;
        if let Some(stream) = self.held_stream.take() {
            pipeline.attach(stream)?;
        }
        Ok(pipeline)
    }

    fn accept_stream(&mut self, stream: InboundStream) {
        match (self.state, self.receive.as_mut()) {
            (SessionState::ReceivingAudio, Some(pipeline)) if !pipeline.is_attached() => {
                if let Err(e) = pipeline.attach(stream) {
                    tracing::warn!(error = %e, "Failed to attach inbound stream");
                }
            }
            (SessionState::AwaitingAudio, _) => {
                // Its bounded queue caps what piles up until the format arrives.
                tracing::debug!("Holding inbound stream until its format arrives");
                self.held_stream = Some(stream);
            }
            _ => tracing::debug!(state = %self.state, "Dropping unexpected inbound stream"),
        }
    }

    fn announce_capture_stopped(&mut self) {
        if let Err(e) = self.send_action(Action::stop_capturing(), Reliability::Reliable) {
            tracing::warn!(error = %e, "Failed to tell peer the stream stopped");
        }
    }

    fn teardown_send(&mut self) {
        self.capture.stop();
        if let Some(mut pipeline) = self.send.take() {
            pipeline.stop();
            self.emit(UiEvent::CloseStreamingView);
        }
    }

    fn teardown_receive(&mut self) {
        self.held_stream = None;
        if let Some(mut pipeline) = self.receive.take() {
            pipeline.stop();
            self.emit(UiEvent::RecordingFinished {
                path: self.settings.output_path.clone(),
            });
        }
    }

    fn teardown_all(&mut self) {
        self.teardown_send();
        self.teardown_receive();
        self.requested_by = None;
    }

    fn shutdown(&mut self) {
        self.teardown_all();
        if self.peer.take().is_some() {
            self.transport.disconnect();
        }
        self.transport.stop_advertising();
        self.set_state(SessionState::Idle);
    }

    fn send_action(&mut self, action: Action, reliability: Reliability) -> Result<(), Error> {
        let bytes = action.stamped().encode()?;
        self.transport.send_message(&bytes, reliability)?;
        Ok(())
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        tracing::info!(from = %self.state, to = %state, "Session state changed");
        self.state = state;
        self.emit(UiEvent::StateChanged(state));
    }

    fn emit(&self, event: UiEvent) {
        if let Some(ui) = &self.ui {
            let _ = ui.send(event);
        }
    }

    fn ignored_command(&self, command: SessionCommand) {
        tracing::debug!(?command, state = %self.state, "Command not valid in this state");
    }

    fn ignored_action(&self, action: ActionType) {
        tracing::debug!(?action, state = %self.state, "Action not valid in this state, ignoring");
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.teardown_all();
    }
}

fn warn_if_inconsistent(format: &FormatDescriptor) {
    if !format.has_consistent_frame_size() {
        tracing::warn!(
            bytes_per_frame = format.bytes_per_frame,
            channels = format.channels_per_frame,
            bits = format.bits_per_channel,
            "Format frame size does not match its channel layout"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mock::MockCapture;
    use crate::audio::sink::MemorySinkOpener;
    use crate::network::MemoryTransport;
    use crate::protocol::SampleKind;
    use std::time::Duration;

    struct Harness {
        controller: SessionController,
        events: Receiver<TransportEvent>,
        remote: MemoryTransport,
        remote_events: Receiver<TransportEvent>,
        ui: Receiver<UiEvent>,
    }

    impl Harness {
        fn new(capture: MockCapture) -> Self {
            let ((local, events), (remote, remote_events)) = MemoryTransport::pair("local", "remote");
            let (sinks, _log) = MemorySinkOpener::new();
            let (ui_tx, ui) = unbounded();
            let controller = SessionController::new(
                Box::new(local),
                Box::new(capture),
                Box::new(sinks),
                SessionSettings::default(),
            )
            .with_ui(ui_tx);
            Self {
                controller,
                events,
                remote,
                remote_events,
                ui,
            }
        }

        fn connected(capture: MockCapture) -> Self {
            let mut harness = Self::new(capture);
            harness.remote.start_advertising().unwrap();
            harness.controller.handle_command(SessionCommand::Browse);
            harness.pump();
            assert_eq!(harness.controller.state(), SessionState::Connected);
            harness.remote_events.try_iter().count();
            harness.ui.try_iter().count();
            harness
        }

        fn pump(&mut self) {
            let events: Vec<_> = self.events.try_iter().collect();
            for event in events {
                self.controller.handle_transport_event(event);
            }
        }

        fn deliver(&mut self, action: Action) {
            let bytes = action.encode().unwrap();
            self.remote.send_message(&bytes, Reliability::Reliable).unwrap();
            self.pump();
        }

        fn remote_actions(&self) -> Vec<Action> {
            self.remote_events
                .try_iter()
                .filter_map(|event| match event {
                    TransportEvent::MessageReceived { bytes, .. } => Action::decode(&bytes).ok(),
                    _ => None,
                })
                .collect()
        }
    }

    fn format() -> FormatDescriptor {
        FormatDescriptor::linear_pcm(44100.0, 1, 32, SampleKind::Float)
    }

    #[test]
    fn test_only_connection_reaches_connected() {
        let (capture, _) = MockCapture::new(format());
        let mut harness = Harness::new(capture);
        assert_eq!(harness.controller.state(), SessionState::Idle);

        harness.controller.handle_action(Action::start_streaming(None));
        assert_eq!(harness.controller.state(), SessionState::Idle);

        harness.controller.handle_command(SessionCommand::Advertise);
        assert_eq!(harness.controller.state(), SessionState::Advertising);

        harness.remote.browse().unwrap();
        harness.pump();
        assert_eq!(harness.controller.state(), SessionState::Connected);
        assert_eq!(harness.controller.connected_peer(), Some(harness.remote.local_peer()));
    }

    #[test]
    fn test_out_of_context_actions_are_ignored() {
        let (capture, _) = MockCapture::new(format());
        let mut harness = Harness::new(capture);

        harness.controller.handle_action(Action::stop_capturing());
        harness.controller.handle_action(Action::stop_streaming());
        harness.controller.handle_action(Action::start_capturing(format()));
        assert_eq!(harness.controller.state(), SessionState::Idle);
        assert!(harness.ui.try_recv().is_err());

        let mut harness = Harness::connected(MockCapture::new(format()).0);
        harness.deliver(Action::stop_capturing());
        harness.deliver(Action::start_capturing(format()));
        assert_eq!(harness.controller.state(), SessionState::Connected);
    }

    #[test]
    fn test_malformed_message_leaves_state_unchanged() {
        let mut harness = Harness::connected(MockCapture::new(format()).0);
        harness.remote.send_message(&[0x01, 0x02, 0x03], Reliability::Reliable).unwrap();
        harness.pump();
        assert_eq!(harness.controller.state(), SessionState::Connected);
        assert!(harness.ui.try_recv().is_err());
    }

    #[test]
    fn test_failed_stream_request_stays_connected() {
        let mut harness = Harness::connected(MockCapture::new(format()).0);
        // Sever the link without letting the controller see the notice.
        harness.remote.disconnect();

        harness.controller.handle_command(SessionCommand::RequestStream);
        assert_eq!(harness.controller.state(), SessionState::Connected);
        assert!(harness.ui.try_recv().is_err());
        assert!(harness.remote_actions().is_empty());
    }

    #[test]
    fn test_failed_format_announcement_leaves_capture_stopped() {
        let (capture, handle) = MockCapture::new(format());
        let mut harness = Harness::connected(capture);
        harness.remote.disconnect();

        harness.controller.handle_action(Action::start_streaming(Some("remote".to_string())));
        assert_eq!(harness.controller.state(), SessionState::Connected);
        assert_eq!(handle.start_count(), 0);
        assert!(!handle.is_running());
        assert!(harness.ui.try_iter().any(|event| event == UiEvent::CloseStreamingView));
    }

    #[test]
    fn test_stream_request_without_microphone_is_noop() {
        let (capture, handle) = MockCapture::unavailable();
        let mut harness = Harness::connected(capture);

        harness.deliver(Action::start_streaming(Some("remote".to_string())));
        assert_eq!(harness.controller.state(), SessionState::Connected);
        assert_eq!(handle.start_count(), 0);
        assert!(harness.remote_actions().is_empty());
    }

    #[test]
    fn test_stream_request_starts_sending() {
        let (capture, handle) = MockCapture::new(format());
        let mut harness = Harness::connected(capture);

        harness.deliver(Action::start_streaming(Some("recorder".to_string())));
        assert_eq!(harness.controller.state(), SessionState::SendingAudio);
        assert_eq!(harness.controller.requested_by(), Some("recorder"));
        assert!(handle.is_running());

        let ui: Vec<_> = harness.ui.try_iter().collect();
        assert_eq!(
            ui,
            vec![
                UiEvent::OpenStreamingView {
                    requested_by: Some("recorder".to_string())
                },
                UiEvent::StateChanged(SessionState::SendingAudio),
            ]
        );

        let actions = harness.remote_actions();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].command, Command::StartCapturingAudioStream { format: format() });

        harness.deliver(Action::stop_streaming());
        assert_eq!(harness.controller.state(), SessionState::Connected);
        assert!(!handle.is_running());
    }

    #[test]
    fn test_request_stream_awaits_audio() {
        let mut harness = Harness::connected(MockCapture::new(format()).0);
        harness.controller.handle_command(SessionCommand::RequestStream);
        assert_eq!(harness.controller.state(), SessionState::AwaitingAudio);

        let actions = harness.remote_actions();
        assert_eq!(
            actions[0].command,
            Command::StartStreamingAudio {
                peer: Some("local".to_string())
            }
        );
        assert!(actions[0].time.is_some());

        // Truncated format payload: dropped, still waiting.
        let bad = br#"{"actionToTake":"startCapturingAudioStream","data":"AAAA"}"#;
        harness.remote.send_message(bad, Reliability::Reliable).unwrap();
        harness.pump();
        assert_eq!(harness.controller.state(), SessionState::AwaitingAudio);

        harness.deliver(Action::start_capturing(format()));
        assert_eq!(harness.controller.state(), SessionState::ReceivingAudio);

        harness.deliver(Action::stop_capturing());
        assert_eq!(harness.controller.state(), SessionState::Connected);
    }

    #[test]
    fn test_peer_loss_tears_down_and_advertises() {
        let (capture, handle) = MockCapture::new(format());
        let mut harness = Harness::connected(capture);
        harness.deliver(Action::start_streaming(None));
        assert_eq!(harness.controller.state(), SessionState::SendingAudio);

        harness.remote.disconnect();
        harness.pump();
        assert_eq!(harness.controller.state(), SessionState::Advertising);
        assert!(harness.controller.connected_peer().is_none());
        assert!(!handle.is_running());
        assert!(harness.controller.send_stats().is_none());
    }

    #[test]
    fn test_stale_pipeline_events_are_ignored() {
        let mut harness = Harness::connected(MockCapture::new(format()).0);
        harness.controller.handle_pipeline_event(PipelineEvent::Ended {
            direction: Direction::Receive,
            pipeline: u64::MAX,
            reason: EndReason::EndOfStream,
        });
        assert_eq!(harness.controller.state(), SessionState::Connected);
    }

    #[test]
    fn test_run_loop_stops_on_shutdown() {
        let (capture, _) = MockCapture::new(format());
        let harness = Harness::new(capture);
        let (commands, command_rx) = unbounded();
        let events = harness.events.clone();
        let ui = harness.ui.clone();
        let controller = harness.controller;

        let worker = std::thread::spawn(move || controller.run(events, command_rx));
        commands.send(SessionCommand::Advertise).unwrap();
        assert_eq!(
            ui.recv_timeout(Duration::from_secs(5)).unwrap(),
            UiEvent::StateChanged(SessionState::Advertising)
        );
        commands.send(SessionCommand::Shutdown).unwrap();
        worker.join().unwrap();
        assert_eq!(
            ui.recv_timeout(Duration::from_secs(5)).unwrap(),
            UiEvent::StateChanged(SessionState::Idle)
        );
    }
}
