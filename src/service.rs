//! Background tunnel service
//!
//! The service side of the session protocol: it accepts [`ServiceCommand`]s
//! on one endpoint, drives the tunnel engine and broadcasts [`SessionEvent`]s
//! to every registered observer. It remembers the last profile that connected
//! successfully so a bare connect can reuse it.

use crate::config::TunnelProfile;
use crate::engine::{ProtectFn, TunnelEngine, protect_nothing};
use crate::error::VpnError;
use crate::ipc::{
    ChannelNotice, DEFAULT_ENDPOINT_CAPACITY, Endpoint, ServiceCommand, SessionChannel,
    SessionEvent, SessionState, StatusPayload, TransportError,
};
use crate::loader::LoadLibrary;
use crate::platform::Capabilities;
use crate::session::{BindingHandle, ServiceControl};
use crate::vpn::{InterfaceConfig, TunnelInterfaceConfigurator};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub struct VpnService<E: TunnelEngine> {
    engine: E,
    configurator: TunnelInterfaceConfigurator,
    observers: SessionChannel<SessionEvent>,
    state: SessionState,
    last_profile: Option<TunnelProfile>,
    protect: ProtectFn,
}

impl<E: TunnelEngine> VpnService<E> {
    /// Create a service and the stream of observer-channel notices
    pub fn new(
        engine: E,
        capabilities: Capabilities,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelNotice>) {
        let (observers, notices) = SessionChannel::with_notices("observer");
        let service = Self {
            engine,
            configurator: TunnelInterfaceConfigurator::new(capabilities),
            observers,
            state: SessionState::Disconnected,
            last_profile: None,
            protect: protect_nothing(),
        };
        (service, notices)
    }

    pub fn with_protect(mut self, protect: ProtectFn) -> Self {
        self.protect = protect;
        self
    }

    /// Seed the profile a bare connect falls back to
    pub fn with_last_profile(mut self, profile: TunnelProfile) -> Self {
        self.last_profile = Some(profile);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn handle(&mut self, command: ServiceCommand) {
        match command {
            ServiceCommand::RegisterObserver(endpoint) => {
                let id = endpoint.id();
                self.observers.register(endpoint.clone());
                if let Err(e) = endpoint.deliver(SessionEvent::Registered) {
                    warn!("Could not acknowledge {}: {}", id, e);
                }
            }
            ServiceCommand::RequestStatus => self.report_status(),
            ServiceCommand::Connect { profile: Some(raw) } => match TunnelProfile::from_json(&raw) {
                Ok(profile) => self.bring_up(profile),
                Err(e) => self.fail(e.into()),
            },
            ServiceCommand::Connect { profile: None } => match self.last_profile.clone() {
                Some(profile) => self.bring_up(profile),
                None => {
                    info!("Connect requested without a profile and none was used before");
                    self.observers.broadcast(SessionEvent::StatusReport(StatusPayload::new(
                        SessionState::Disconnected,
                        None,
                    )));
                }
            },
            ServiceCommand::Disconnect => {
                self.engine.shutdown();
                self.set_state(SessionState::Disconnected);
                self.observers.broadcast(SessionEvent::Disconnected);
            }
        }
    }

    fn report_status(&self) {
        let name = self.last_profile.as_ref().map(|p| p.name.clone());
        self.observers
            .broadcast(SessionEvent::StatusReport(StatusPayload::new(self.state, name)));
    }

    fn bring_up(&mut self, profile: TunnelProfile) {
        if self.state == SessionState::Connected {
            debug!("Replacing the running tunnel");
            self.engine.shutdown();
        }

        self.set_state(SessionState::Connecting);
        self.observers.broadcast(SessionEvent::StatusReport(StatusPayload::new(
            SessionState::Connecting,
            Some(profile.name.clone()),
        )));

        match self.establish(&profile) {
            Ok(()) => {
                info!("Tunnel {} is up", profile.name);
                self.last_profile = Some(profile);
                self.set_state(SessionState::Connected);
                self.observers.broadcast(SessionEvent::Connected);
            }
            Err(e) => self.fail(e),
        }
    }

    fn establish(&mut self, profile: &TunnelProfile) -> Result<(), VpnError> {
        let config = InterfaceConfig::build(profile, &self.configurator.resolver())?;
        let directives = self.configurator.directives(&config);
        self.engine.establish(&directives, &self.protect)?;
        Ok(())
    }

    fn fail(&mut self, err: VpnError) {
        error!("Connection attempt failed: {}", err);
        self.set_state(SessionState::Disconnected);
        self.observers.broadcast(SessionEvent::Disconnected);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("Service {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }
}

impl<E: TunnelEngine + 'static> VpnService<E> {
    /// Serve commands until every command endpoint is dropped
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<ServiceCommand>,
        mut notices: mpsc::UnboundedReceiver<ChannelNotice>,
    ) {
        info!("Tunnel service started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                Some(notice) = notices.recv() => match notice {
                    ChannelNotice::SubscriberLost(id) => info!("Observer {} went away", id),
                    ChannelNotice::DeliveryFailed(id) => warn!("{}", TransportError::DeliveryFailed(id)),
                },
            }
        }

        self.engine.shutdown();
        info!("Tunnel service stopped");
    }

    /// Run on a background task, returning its command endpoint
    pub fn spawn(
        self,
        notices: mpsc::UnboundedReceiver<ChannelNotice>,
    ) -> Endpoint<ServiceCommand> {
        let (endpoint, commands) = Endpoint::new(DEFAULT_ENDPOINT_CAPACITY);
        tokio::spawn(self.run(commands, notices));
        endpoint
    }
}

/// Load the engine's native library and start the service
///
/// A load failure aborts startup: nothing can tunnel without the engine.
pub fn start<E: TunnelEngine + 'static>(
    engine: E,
    capabilities: Capabilities,
    loader: &dyn LoadLibrary,
) -> Result<Endpoint<ServiceCommand>, VpnError> {
    if let Some(library) = engine.library() {
        info!("Loading engine library {}", library);
        loader.ensure_loaded(library)?;
    }

    let (service, notices) = VpnService::new(engine, capabilities);
    Ok(service.spawn(notices))
}

/// In-process [`ServiceControl`] that launches the service on demand
pub struct LocalBinder<F>
where
    F: FnMut() -> Result<Endpoint<ServiceCommand>, VpnError> + Send,
{
    launch: F,
    endpoint: Option<Endpoint<ServiceCommand>>,
    binding: Option<BindingHandle>,
    /// Set once a launch fails fatally; no relaunch is attempted after that
    fatal: Option<String>,
}

impl<F> LocalBinder<F>
where
    F: FnMut() -> Result<Endpoint<ServiceCommand>, VpnError> + Send,
{
    pub fn new(launch: F) -> Self {
        Self {
            launch,
            endpoint: None,
            binding: None,
            fatal: None,
        }
    }
}

impl<F> ServiceControl for LocalBinder<F>
where
    F: FnMut() -> Result<Endpoint<ServiceCommand>, VpnError> + Send,
{
    fn start_service(&mut self) -> Result<(), TransportError> {
        if self.endpoint.as_ref().is_some_and(|e| !e.is_terminated()) {
            return Ok(());
        }
        if let Some(reason) = &self.fatal {
            return Err(TransportError::ServiceStart(reason.clone()));
        }

        match (self.launch)() {
            Ok(endpoint) => {
                self.endpoint = Some(endpoint);
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                error!("Tunnel service cannot start: {}", e);
                self.fatal = Some(e.to_string());
                Err(TransportError::ServiceStart(e.to_string()))
            }
            Err(e) => Err(TransportError::ServiceStart(e.to_string())),
        }
    }

    fn bind(&mut self, binding: BindingHandle) -> Result<(), TransportError> {
        self.start_service()?;
        let endpoint = self
            .endpoint
            .clone()
            .ok_or_else(|| TransportError::BindFailed("service has no endpoint".to_string()))?;
        binding.connected(endpoint)?;
        self.binding = Some(binding);
        Ok(())
    }

    fn unbind(&mut self) {
        if self.binding.take().is_some() {
            debug!("Released service binding");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DryRunEngine;
    use crate::loader::LoadError;
    use crate::session::{SessionCoordinator, SessionSettings, UserNotice};
    use crate::vpn::InterfaceDirective;
    use std::time::Duration;

    const PROFILE: &str = r#"{
        "name": "office",
        "addresses": ["10.8.0.2/32"],
        "dnsServers": ["10.0.0.53"],
        "splitTunnelType": 1,
        "splitTunnelSites": ["10.0.0.0/8"]
    }"#;

    fn service() -> VpnService<DryRunEngine> {
        VpnService::new(DryRunEngine::new(), Capabilities::minimal()).0
    }

    fn observe(service: &mut VpnService<DryRunEngine>) -> mpsc::Receiver<SessionEvent> {
        let (endpoint, mut rx) = Endpoint::new(16);
        service.handle(ServiceCommand::RegisterObserver(endpoint));
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::Registered);
        rx
    }

    fn drain(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn report(state: SessionState, name: Option<&str>) -> SessionEvent {
        SessionEvent::StatusReport(StatusPayload::new(state, name.map(str::to_string)))
    }

    #[test]
    fn test_connect_with_profile() {
        let mut service = service();
        let mut rx = observe(&mut service);

        service.handle(ServiceCommand::Connect {
            profile: Some(PROFILE.to_string()),
        });

        assert_eq!(
            drain(&mut rx),
            vec![
                report(SessionState::Connecting, Some("office")),
                SessionEvent::Connected
            ]
        );
        assert_eq!(service.state(), SessionState::Connected);
        assert!(service
            .engine()
            .applied()
            .contains(&InterfaceDirective::AddRoute("10.0.0.0/8".parse().unwrap())));
    }

    #[test]
    fn test_status_reports_last_profile() {
        let mut service = service();
        let mut rx = observe(&mut service);

        service.handle(ServiceCommand::RequestStatus);
        assert_eq!(drain(&mut rx), vec![report(SessionState::Disconnected, None)]);

        service.handle(ServiceCommand::Connect {
            profile: Some(PROFILE.to_string()),
        });
        drain(&mut rx);
        service.handle(ServiceCommand::RequestStatus);
        assert_eq!(
            drain(&mut rx),
            vec![report(SessionState::Connected, Some("office"))]
        );
    }

    #[test]
    fn test_bare_connect_without_history() {
        let mut service = service();
        let mut rx = observe(&mut service);

        service.handle(ServiceCommand::Connect { profile: None });
        assert_eq!(drain(&mut rx), vec![report(SessionState::Disconnected, None)]);
        assert!(!service.engine().is_up());
    }

    #[test]
    fn test_bare_connect_reuses_last_profile() {
        let profile = TunnelProfile::from_json(PROFILE).unwrap();
        let mut service = service().with_last_profile(profile);
        let mut rx = observe(&mut service);

        service.handle(ServiceCommand::Connect { profile: None });
        assert_eq!(drain(&mut rx).last(), Some(&SessionEvent::Connected));
    }

    #[test]
    fn test_bad_profile_fails_attempt() {
        let mut service = service();
        let mut rx = observe(&mut service);

        let bad = PROFILE.replace("10.0.0.0/8", "10.0.0.0/40");
        service.handle(ServiceCommand::Connect { profile: Some(bad) });

        let events = drain(&mut rx);
        assert_eq!(events.last(), Some(&SessionEvent::Disconnected));
        assert_eq!(service.state(), SessionState::Disconnected);
        assert!(!service.engine().is_up());
    }

    #[test]
    fn test_engine_failure_is_not_retried() {
        let (mut service, _notices) =
            VpnService::new(DryRunEngine::failing("handshake"), Capabilities::minimal());
        let mut rx = observe(&mut service);

        service.handle(ServiceCommand::Connect {
            profile: Some(PROFILE.to_string()),
        });
        assert_eq!(
            drain(&mut rx),
            vec![
                report(SessionState::Connecting, Some("office")),
                SessionEvent::Disconnected
            ]
        );
    }

    #[test]
    fn test_disconnect_shuts_engine_down() {
        let mut service = service();
        let mut rx = observe(&mut service);
        service.handle(ServiceCommand::Connect {
            profile: Some(PROFILE.to_string()),
        });
        drain(&mut rx);

        service.handle(ServiceCommand::Disconnect);
        assert_eq!(drain(&mut rx), vec![SessionEvent::Disconnected]);
        assert!(!service.engine().is_up());
    }

    struct FailingLoader;

    impl LoadLibrary for FailingLoader {
        fn ensure_loaded(&self, name: &str) -> Result<(), LoadError> {
            Err(LoadError::NotFound(name.to_string()))
        }
    }

    struct NativeEngine(DryRunEngine);

    impl TunnelEngine for NativeEngine {
        fn library(&self) -> Option<&str> {
            Some("engine")
        }

        fn establish(
            &mut self,
            directives: &[InterfaceDirective],
            protect: &ProtectFn,
        ) -> Result<(), crate::engine::EngineError> {
            self.0.establish(directives, protect)
        }

        fn shutdown(&mut self) {
            self.0.shutdown();
        }
    }

    #[tokio::test]
    async fn test_load_failure_aborts_start() {
        let result = start(
            NativeEngine(DryRunEngine::new()),
            Capabilities::minimal(),
            &FailingLoader,
        );
        assert!(matches!(result, Err(VpnError::Load(LoadError::NotFound(_)))));
    }

    #[tokio::test]
    async fn test_engine_without_library_skips_loader() {
        let result = start(DryRunEngine::new(), Capabilities::minimal(), &FailingLoader);
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_fatal_launch_failure_is_not_retried() {
        let launches = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = launches.clone();
        let mut binder = LocalBinder::new(move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            start(
                NativeEngine(DryRunEngine::new()),
                Capabilities::minimal(),
                &FailingLoader,
            )
        });

        assert!(matches!(
            binder.start_service(),
            Err(TransportError::ServiceStart(_))
        ));
        assert!(matches!(
            binder.start_service(),
            Err(TransportError::ServiceStart(_))
        ));
        assert_eq!(launches.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_fatal_launch_failure_is_retried() {
        let launches = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = launches.clone();
        let mut binder = LocalBinder::new(move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err::<Endpoint<ServiceCommand>, VpnError>(TransportError::EndpointTerminated.into())
        });

        assert!(binder.start_service().is_err());
        assert!(binder.start_service().is_err());
        assert_eq!(launches.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_tap_connects_through_local_service() {
        let binder = LocalBinder::new(|| {
            let (service, notices) = VpnService::new(DryRunEngine::new(), Capabilities::minimal());
            Ok(service.spawn(notices))
        });
        let settings = SessionSettings::default().with_connect_profile(PROFILE);
        let (coordinator, handle) = SessionCoordinator::new(settings, binder);
        let mut view = handle.view();
        let task = tokio::spawn(coordinator.run());

        handle.start_listening().unwrap();
        handle.tap().unwrap();

        let connected = tokio::time::timeout(
            Duration::from_secs(5),
            view.wait_for(|v| v.state == SessionState::Connected),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(connected.label, "office");
        assert!(connected.active);

        handle.tap().unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            view.wait_for(|v| v.state == SessionState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();

        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_first_run_surfaces_setup_notice() {
        let binder = LocalBinder::new(|| {
            let (service, notices) = VpnService::new(DryRunEngine::new(), Capabilities::minimal());
            Ok(service.spawn(notices))
        });
        let (coordinator, mut handle) = SessionCoordinator::new(SessionSettings::default(), binder);
        let view = handle.view();
        let task = tokio::spawn(coordinator.run());

        handle.start_listening().unwrap();
        handle.tap().unwrap();

        let notice = tokio::time::timeout(Duration::from_secs(5), handle.next_notice())
            .await
            .unwrap();
        assert_eq!(notice, Some(UserNotice::SetupRequired));

        // The reply to the bare connect arrives after the status reply
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(view.borrow().state, SessionState::Error);
        assert!(!view.borrow().active);

        handle.shutdown().unwrap();
        task.await.unwrap();
    }
}
