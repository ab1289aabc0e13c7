use super::{bootstrap_state_root, RuntimeError, StatePaths};
use crate::config::Settings;
use crate::gateway::{ChatGateway, OutboxGateway};
use crate::ipc::MailboxConsumer;
use crate::scheduler::Scheduler;
use crate::shared::EventLog;
use crate::store::Store;
use crate::tenant::{ensure_workspace, Tenant, TenantRegistry};
use crate::worker::WorkerRunner;
use std::sync::Arc;

/// Everything a host loop needs, opened once at startup and shared by
/// reference with every thread.
#[derive(Clone)]
pub struct HostContext {
    pub paths: StatePaths,
    pub store: Store,
    pub registry: TenantRegistry,
    pub scheduler: Scheduler,
    pub runner: WorkerRunner,
    pub consumer: MailboxConsumer,
    pub gateway: Arc<dyn ChatGateway>,
    pub trigger_prefix: String,
    pub log: EventLog,
}

impl HostContext {
    pub fn open(settings: &Settings) -> Result<Self, RuntimeError> {
        let paths = StatePaths::new(&settings.state_root);
        let gateway: Arc<dyn ChatGateway> = Arc::new(OutboxGateway::new(
            paths.outbox_messages_dir(),
            paths.group_metadata_path(),
        ));
        Self::open_with_gateway(settings, gateway)
    }

    pub fn open_with_gateway(
        settings: &Settings,
        gateway: Arc<dyn ChatGateway>,
    ) -> Result<Self, RuntimeError> {
        let paths = StatePaths::new(&settings.state_root);
        bootstrap_state_root(&paths)?;
        let log = EventLog::new(&paths.logs_dir(), settings.logging.level);

        let store = Store::open(&paths.store_path())?;
        let registry = TenantRegistry::new(store.clone(), settings.main_tenant_id()?);
        let scheduler = Scheduler::new(store.clone(), settings.resolve_timezone()?, log.clone());
        let runner = WorkerRunner::from_settings(settings, paths.clone(), log.clone());
        let consumer = MailboxConsumer::new(
            paths.clone(),
            registry.clone(),
            scheduler.clone(),
            gateway.clone(),
            log.clone(),
        );

        Ok(Self {
            paths,
            store,
            registry,
            scheduler,
            runner,
            consumer,
            gateway,
            trigger_prefix: settings.trigger_prefix(),
            log,
        })
    }

    /// Registers the configured privileged tenant (a no-op when it already
    /// exists) and makes sure its workspace is in place.
    pub fn register_main_tenant(
        &self,
        settings: &Settings,
        now: i64,
    ) -> Result<Tenant, RuntimeError> {
        let tenant = self.registry.register(
            self.registry.main_id(),
            &settings.main_tenant.name,
            &settings.main_tenant.chat,
            now,
        )?;
        ensure_workspace(&self.paths, &tenant.id)?;
        Ok(tenant)
    }
}
