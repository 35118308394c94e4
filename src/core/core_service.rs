//! Orchestrator for the core services and protocol adapters.
//!
//! Boot order is registration order: core services first (Topic, Message,
//! Subscription when built by `Broker`), then adapters, so an adapter only
//! accepts traffic once the registries it depends on are live. Shutdown runs
//! the exact reverse. Registration after boot is rejected.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::core::service::Service;
use crate::protocol::{ProtocolRegistry, ProtocolServer, ProtocolStatsSnapshot};
use crate::utils::{BrokerError, Result};

pub const CORE_SERVICE: &str = "CoreService";

/// Fresh aggregate over every registered adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerStats {
    pub uptime_secs: i64,
    pub total_requests: u64,
    pub total_messages: u64,
    pub total_bad_requests: u64,
    pub total_errors: u64,
    pub protocols: Vec<ProtocolStatsSnapshot>,
}

pub struct CoreService {
    services: Mutex<Vec<Arc<dyn Service>>>,
    protocols: ProtocolRegistry,
    runners: Mutex<Vec<JoinHandle<()>>>,
    booted: AtomicBool,
    started_at: Mutex<DateTime<Utc>>,
}

impl CoreService {
    /// `protocols` is shared with `MessageService` for outbound lookup.
    pub fn new(protocols: ProtocolRegistry) -> Self {
        info!("Initializing {CORE_SERVICE}...");
        Self {
            services: Mutex::new(Vec::new()),
            protocols,
            runners: Mutex::new(Vec::new()),
            booted: AtomicBool::new(false),
            started_at: Mutex::new(Utc::now()),
        }
    }

    pub fn register_service(&self, service: Arc<dyn Service>) -> Result<()> {
        if self.booted.load(Ordering::SeqCst) {
            warn!("Rejected late registration of {}", service.name());
            return Err(BrokerError::AlreadyBooted {
                service: CORE_SERVICE,
            });
        }
        info!("Registered core service {}", service.name());
        self.services.lock().push(service);
        Ok(())
    }

    pub fn add_protocol_server(&self, server: Arc<dyn ProtocolServer>) -> Result<()> {
        if self.booted.load(Ordering::SeqCst) {
            warn!(
                "Rejected late registration of protocol server {}",
                server.protocol_server_type()
            );
            return Err(BrokerError::AlreadyBooted {
                service: CORE_SERVICE,
            });
        }
        info!("Registered protocol server {}", server.protocol_server_type());
        self.protocols.register(server)
    }

    /// Boots every core service, then every adapter, then starts each
    /// adapter's run loop. The first failure aborts the sequence and stops
    /// whatever already started, in reverse order. A `CoreService` whose
    /// boot failed cannot be booted again.
    pub async fn boot(&self) -> Result<()> {
        if self.booted.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadyBooted {
                service: CORE_SERVICE,
            });
        }
        info!("Booting {CORE_SERVICE}...");
        *self.started_at.lock() = Utc::now();

        let services = self.services.lock().clone();
        let mut started: Vec<Arc<dyn Service>> = Vec::with_capacity(services.len());
        for service in services {
            if let Err(e) = service.boot() {
                error!("Failed to boot {}: {e}", service.name());
                self.stop_services(&started).await;
                return Err(BrokerError::ServiceBoot {
                    service: service.name().to_string(),
                    reason: e.to_string(),
                });
            }
            started.push(service);
        }

        let mut running: Vec<Arc<dyn ProtocolServer>> = Vec::new();
        for server in self.protocols.all() {
            let name = server.protocol_server_type().to_string();
            if let Err(e) = server.boot().await {
                error!("Failed to boot protocol server {name}: {e}");
                warn!("Rolling back {CORE_SERVICE} boot");
                self.stop_adapters(&running).await;
                self.stop_services(&started).await;
                return Err(BrokerError::ServiceBoot {
                    service: name,
                    reason: e.to_string(),
                });
            }
            running.push(server.clone());
            let runner = tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    error!("Protocol server {name} exited with error: {e}");
                }
            });
            self.runners.lock().push(runner);
        }

        info!("{CORE_SERVICE} booted successfully");
        Ok(())
    }

    /// Stops adapters, then core services, in reverse boot order.
    pub async fn shutdown(&self) {
        info!("Shutting down {CORE_SERVICE}...");
        self.stop_adapters(&self.protocols.all()).await;
        let services = self.services.lock().clone();
        self.stop_services(&services).await;
        info!("{CORE_SERVICE} stopped");
    }

    async fn stop_adapters(&self, servers: &[Arc<dyn ProtocolServer>]) {
        for server in servers.iter().rev() {
            info!("Stopping protocol server {}", server.protocol_server_type());
            server.stop_server().await;
        }

        let runners: Vec<JoinHandle<()>> = self.runners.lock().drain(..).collect();
        for runner in runners {
            if let Err(e) = runner.await {
                error!("Protocol server task ended abnormally: {e}");
            }
        }
    }

    async fn stop_services(&self, services: &[Arc<dyn Service>]) {
        for service in services.iter().rev() {
            service.stop().await;
        }
    }

    pub fn is_booted(&self) -> bool {
        self.booted.load(Ordering::SeqCst)
    }

    pub fn all_protocol_servers(&self) -> Vec<Arc<dyn ProtocolServer>> {
        self.protocols.all()
    }

    pub fn protocol_server(&self, protocol: &str) -> Option<Arc<dyn ProtocolServer>> {
        self.protocols.get(protocol)
    }

    pub fn total_requests_from_protocol_servers(&self) -> u64 {
        self.protocols.all().iter().map(|s| s.total_requests()).sum()
    }

    pub fn total_messages_from_protocol_servers(&self) -> u64 {
        self.protocols.all().iter().map(|s| s.total_messages()).sum()
    }

    pub fn total_bad_requests_from_protocol_servers(&self) -> u64 {
        self.protocols
            .all()
            .iter()
            .map(|s| s.total_bad_requests())
            .sum()
    }

    pub fn total_errors_from_protocol_servers(&self) -> u64 {
        self.protocols.all().iter().map(|s| s.total_errors()).sum()
    }

    /// Time since boot (or construction, before boot).
    pub fn running_time(&self) -> chrono::TimeDelta {
        Utc::now() - *self.started_at.lock()
    }

    pub fn stats(&self) -> BrokerStats {
        let protocols: Vec<ProtocolStatsSnapshot> = self
            .protocols
            .all()
            .iter()
            .map(|s| s.stats().snapshot(s.protocol_server_type()))
            .collect();
        BrokerStats {
            uptime_secs: self.running_time().num_seconds(),
            total_requests: protocols.iter().map(|p| p.total_requests).sum(),
            total_messages: protocols.iter().map(|p| p.total_messages).sum(),
            total_bad_requests: protocols.iter().map(|p| p.total_bad_requests).sum(),
            total_errors: protocols.iter().map(|p| p.total_errors).sum(),
            protocols,
        }
    }
}
