//! Ordered start/stop of long-lived subsystems.
//!
//! Services are grouped into [`ServiceStage`]s. Shutdown always walks the
//! stages in [`ServiceStage::SHUTDOWN_ORDER`]; start walks them in reverse so
//! every stage comes up after the stages it depends on.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::errors::{WalletError, WalletResult};

/// How the application is going down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownKind {
    /// Immediate exit, no further interaction.
    Hard,
    /// Presentation is disposed but the process stays alive for a restart.
    Soft,
    /// Suspend only; services stay registered.
    Standby,
}

impl ShutdownKind {
    /// Whether services are stopped and dropped after being notified.
    pub fn releases_services(self) -> bool {
        match self {
            ShutdownKind::Hard | ShutdownKind::Soft => true,
            ShutdownKind::Standby => false,
        }
    }
}

impl fmt::Display for ShutdownKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ShutdownKind::Hard => "hard",
            ShutdownKind::Soft => "soft",
            ShutdownKind::Standby => "standby",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceStage {
    /// Services bound to the open wallet (payment and transaction tracking).
    WalletScoped,
    WalletManager,
    Backup,
    /// Installation-level singletons such as configuration.
    Installation,
}

impl ServiceStage {
    pub const SHUTDOWN_ORDER: [ServiceStage; 4] = [
        ServiceStage::WalletScoped,
        ServiceStage::WalletManager,
        ServiceStage::Backup,
        ServiceStage::Installation,
    ];

    pub fn start_order() -> impl Iterator<Item = ServiceStage> {
        Self::SHUTDOWN_ORDER.into_iter().rev()
    }
}

/// Contract every long-lived subsystem exposes to the registry.
pub trait ManagedService: Send + Sync {
    fn name(&self) -> &str;

    /// Bring the service up. `false` means it could not start sufficiently.
    fn start(&self) -> bool;

    /// Stop and block until every pending write is durable.
    fn stop_and_wait(&self);

    fn on_shutdown(&self, kind: ShutdownKind);
}

struct Registration {
    stage: ServiceStage,
    service: Arc<dyn ManagedService>,
    running: bool,
}

/// Tracks registered services and drives them in stage order.
///
/// The internal lock is only held to read or update the registration list,
/// never while a service method runs.
#[derive(Default)]
pub struct ManagedServiceRegistry {
    registrations: Mutex<Vec<Registration>>,
}

impl ManagedServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, stage: ServiceStage, service: Arc<dyn ManagedService>) {
        log::debug!("Registering service '{}' in stage {:?}", service.name(), stage);
        self.registrations.lock().push(Registration {
            stage,
            service,
            running: false,
        });
    }

    pub fn len(&self) -> usize {
        self.registrations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.lock().is_empty()
    }

    /// Names of services currently started, in registration order.
    pub fn running_services(&self) -> Vec<String> {
        self.registrations
            .lock()
            .iter()
            .filter(|r| r.running)
            .map(|r| r.service.name().to_string())
            .collect()
    }

    pub fn contains(&self, service: &Arc<dyn ManagedService>) -> bool {
        self.registrations
            .lock()
            .iter()
            .any(|r| Arc::ptr_eq(&r.service, service))
    }

    pub fn stage_len(&self, stage: ServiceStage) -> usize {
        self.registrations
            .lock()
            .iter()
            .filter(|r| r.stage == stage)
            .count()
    }

    /// Start every stage, dependencies first.
    pub fn start_all(&self) -> WalletResult<()> {
        let stages: Vec<ServiceStage> = ServiceStage::start_order().collect();
        self.start_stages(&stages)
    }

    pub fn start_stage(&self, stage: ServiceStage) -> WalletResult<()> {
        self.start_stages(&[stage])
    }

    /// Stop the running services of one stage, in reverse registration order.
    pub fn stop_stage_and_wait(&self, stage: ServiceStage) {
        for service in self.snapshot(stage, true).into_iter().rev() {
            log::debug!("Stopping service '{}'", service.name());
            service.stop_and_wait();
            self.mark(&service, false);
        }
    }

    /// Stop a stage and drop its registrations.
    pub fn release_stage(&self, stage: ServiceStage) -> usize {
        self.stop_stage_and_wait(stage);
        let mut registrations = self.registrations.lock();
        let before = registrations.len();
        registrations.retain(|r| r.stage != stage);
        before - registrations.len()
    }

    /// Stop every running service in shutdown order.
    pub fn stop_all_and_wait(&self) {
        for stage in ServiceStage::SHUTDOWN_ORDER {
            self.stop_stage_and_wait(stage);
        }
    }

    /// Notify every service in shutdown order.
    ///
    /// For HARD and SOFT each stage is stopped right after its notification
    /// and the registry is emptied at the end. STANDBY only notifies.
    pub fn on_shutdown(&self, kind: ShutdownKind) {
        log::info!("Shutdown ({}) requested for {} services", kind, self.len());
        for stage in ServiceStage::SHUTDOWN_ORDER {
            for service in self.snapshot(stage, false) {
                service.on_shutdown(kind);
            }
            if kind.releases_services() {
                self.stop_stage_and_wait(stage);
            }
        }

        if kind.releases_services() {
            self.registrations.lock().clear();
        }
    }

    fn start_stages(&self, stages: &[ServiceStage]) -> WalletResult<()> {
        let mut started: Vec<Arc<dyn ManagedService>> = Vec::new();

        for &stage in stages {
            let pending: Vec<_> = self
                .snapshot(stage, false)
                .into_iter()
                .filter(|service| !self.is_running(service))
                .collect();

            for service in pending {
                if service.start() {
                    log::debug!("Started service '{}'", service.name());
                    self.mark(&service, true);
                    started.push(service);
                    continue;
                }

                let name = service.name().to_string();
                log::error!("Service '{}' failed to start; rolling back", name);
                for running in started.iter().rev() {
                    running.stop_and_wait();
                    self.mark(running, false);
                }
                return Err(WalletError::ServiceStart(name));
            }
        }
        Ok(())
    }

    fn snapshot(&self, stage: ServiceStage, running_only: bool) -> Vec<Arc<dyn ManagedService>> {
        self.registrations
            .lock()
            .iter()
            .filter(|r| r.stage == stage && (!running_only || r.running))
            .map(|r| Arc::clone(&r.service))
            .collect()
    }

    pub fn is_running(&self, service: &Arc<dyn ManagedService>) -> bool {
        self.registrations
            .lock()
            .iter()
            .any(|r| r.running && Arc::ptr_eq(&r.service, service))
    }

    fn mark(&self, service: &Arc<dyn ManagedService>, running: bool) {
        if let Some(registration) = self
            .registrations
            .lock()
            .iter_mut()
            .find(|r| Arc::ptr_eq(&r.service, service))
        {
            registration.running = running;
        }
    }
}

impl fmt::Debug for ManagedServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registrations = self.registrations.lock();
        f.debug_list()
            .entries(
                registrations
                    .iter()
                    .map(|r| (r.stage, r.service.name().to_string(), r.running)),
            )
            .finish()
    }
}
