pub mod resolver;
pub mod validator;

use resolver::find_activities_of_type;
use rmig_core::{
    ActivatedJob, ConnectorError, CreateInstance, ElementActivation, EntityType, GatewayStrategy,
    MappingRecord, MigratorMode, Pagination, SourceConnector, SourceProcessInstance,
    TargetConnector, DEFAULT_JOB_TYPE, LEGACY_ID_VARIABLE, PARALLEL_GATEWAY_ACTIVITY_TYPE,
};
use rmig_interceptors::InterceptorPipeline;
use rmig_storage::{MappingStore, StorageError};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use resolver::{resolve_active_flow_nodes, BranchHistory};
pub use validator::{RuntimeValidator, ValidationError};

const ENTITY: EntityType = EntityType::RuntimeProcessInstance;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("mapping store failure: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error("failed to write report output: {0}")]
    Output(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeMigratorConfig {
    pub page_size: usize,
    pub gateway_strategy: GatewayStrategy,
    pub job_type: String,
    pub job_type_validation: bool,
    pub max_jobs_per_activation: usize,
}

impl Default for RuntimeMigratorConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            gateway_strategy: GatewayStrategy::default(),
            job_type: DEFAULT_JOB_TYPE.to_string(),
            job_type_validation: true,
            max_jobs_per_activation: 100,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub mode: MigratorMode,
    pub fetched: usize,
    pub already_mapped: usize,
    pub migrated: usize,
    pub skipped: usize,
    pub retried: usize,
    pub still_skipped: usize,
    pub vanished: usize,
    pub jobs_activated: usize,
    pub externally_started_jobs: usize,
    pub unresolved_jobs: usize,
    pub listed: usize,
}

struct PreparedInstance {
    request: CreateInstance,
    activations: Vec<ElementActivation>,
}

enum Preparation {
    Ready(PreparedInstance),
    Skip(String),
}

struct PendingActivation {
    legacy_id: String,
    activations: Vec<ElementActivation>,
}

/// Moves active root process instances from the source engine to the target engine.
///
/// Each instance is created on the target with a `legacyId` variable, parked on its none start
/// event by a migrator job, and then moved onto the resolved elements once that job is
/// activated. The mapping row for an instance is committed together with its creation.
pub struct RuntimeMigrator<S, T> {
    config: RuntimeMigratorConfig,
    source: S,
    target: T,
    store: MappingStore,
    pipeline: InterceptorPipeline,
    validator: RuntimeValidator,
    pending: BTreeMap<i64, PendingActivation>,
}

impl<S: SourceConnector, T: TargetConnector> RuntimeMigrator<S, T> {
    pub fn new(
        config: RuntimeMigratorConfig,
        source: S,
        target: T,
        store: MappingStore,
        pipeline: InterceptorPipeline,
    ) -> Self {
        let validator = RuntimeValidator::new(
            config.gateway_strategy,
            config.job_type.clone(),
            config.job_type_validation,
        );
        Self {
            config,
            source,
            target,
            store,
            pipeline,
            validator,
            pending: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &RuntimeMigratorConfig {
        &self.config
    }

    pub fn store(&self) -> &MappingStore {
        &self.store
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn into_parts(self) -> (S, T, MappingStore) {
        (self.source, self.target, self.store)
    }

    /// Run one pass. `ListSkipped` prints to stdout; use [`RuntimeMigrator::list_skipped`] to
    /// direct the listing elsewhere.
    pub fn run(&mut self, mode: MigratorMode) -> Result<MigrationReport, MigrationError> {
        info!(mode = %mode, "starting runtime migration pass");
        let mut report = MigrationReport {
            mode,
            ..MigrationReport::default()
        };

        let result = match mode {
            MigratorMode::Migrate => self.migrate_pass(&mut report),
            MigratorMode::RetrySkipped => self.retry_pass(&mut report),
            MigratorMode::ListSkipped => {
                let stdout = std::io::stdout();
                let mut out = stdout.lock();
                self.list_skipped(&mut out).map(|listed| {
                    report.listed = listed;
                })
            }
        };

        if let Err(err) = &result {
            error!(mode = %mode, error = %err, "runtime migration halted");
        }
        result?;

        info!(
            mode = %mode,
            fetched = report.fetched,
            migrated = report.migrated,
            skipped = report.skipped,
            retried = report.retried,
            still_skipped = report.still_skipped,
            jobs_activated = report.jobs_activated,
            "runtime migration pass finished"
        );
        Ok(report)
    }

    fn migrate_pass(&mut self, report: &mut MigrationReport) -> Result<(), MigrationError> {
        let resume = self.store.find_latest(ENTITY)?;
        debug!(resume = ?resume, "resuming after latest mapped process instance");

        let mut pagination = Pagination::after(self.config.page_size)
            .with_total(self.source.count_active_root_instances()?);

        while let Some(page) = pagination.next_page(|request| {
            let after = request
                .after
                .map(SourceProcessInstance::cursor)
                .or_else(|| resume.clone());
            self.source
                .list_active_root_instances_after(after.as_ref(), request.limit)
        })? {
            for instance in page {
                self.migrate_instance(instance, report)?;
            }
            if self.pending.len() >= self.config.page_size {
                self.activate_migrator_jobs(report)?;
            }
        }

        self.activate_migrator_jobs(report)
    }

    fn migrate_instance(
        &mut self,
        instance: SourceProcessInstance,
        report: &mut MigrationReport,
    ) -> Result<(), MigrationError> {
        report.fetched += 1;
        if self.store.exists(&instance.id)? {
            debug!(legacy_id = %instance.id, "process instance already handled");
            report.already_mapped += 1;
            return Ok(());
        }

        match self.prepare(&instance)? {
            Preparation::Ready(prepared) => {
                self.create_and_map(&instance, prepared, false)?;
                report.migrated += 1;
            }
            Preparation::Skip(reason) => {
                warn!(legacy_id = %instance.id, reason = %reason, "skipping process instance");
                self.store.insert(&MappingRecord::skipped(
                    instance.id.clone(),
                    ENTITY,
                    instance.start_time,
                    reason,
                ))?;
                report.skipped += 1;
            }
        }
        Ok(())
    }

    fn retry_pass(&mut self, report: &mut MigrationReport) -> Result<(), MigrationError> {
        let mut pagination =
            Pagination::pinned(self.config.page_size).with_total(self.store.count_skipped(ENTITY)?);

        while let Some(page) = pagination
            .next_page(|request| self.store.find_skipped(ENTITY, request.offset, request.limit))?
        {
            for record in page {
                if !self.retry_record(record, report)? {
                    pagination.keep(1);
                }
            }
            if self.pending.len() >= self.config.page_size {
                self.activate_migrator_jobs(report)?;
            }
        }

        self.activate_migrator_jobs(report)
    }

    /// Returns whether the record left the skipped set.
    fn retry_record(
        &mut self,
        record: MappingRecord,
        report: &mut MigrationReport,
    ) -> Result<bool, MigrationError> {
        report.fetched += 1;
        let Some(instance) = self.source.find_process_instance(&record.legacy_id)? else {
            warn!(
                "Process instance with legacyId {} doesn't exist anymore. Has it been completed or cancelled in the meantime?",
                record.legacy_id
            );
            report.vanished += 1;
            return Ok(false);
        };

        match self.prepare(&instance)? {
            Preparation::Ready(prepared) => {
                self.create_and_map(&instance, prepared, true)?;
                report.retried += 1;
                Ok(true)
            }
            Preparation::Skip(reason) => {
                info!(legacy_id = %instance.id, reason = %reason, "process instance is still not migratable");
                report.still_skipped += 1;
                Ok(false)
            }
        }
    }

    /// Resolve, validate and intercept everything the target needs before anything is sent.
    fn prepare(&self, instance: &SourceProcessInstance) -> Result<Preparation, MigrationError> {
        let tree = self.source.activity_tree(&instance.id)?;
        if let Err(err) = self.validator.validate_tree(&tree) {
            return Ok(Preparation::Skip(err.to_string()));
        }

        let mut history = BranchHistory::new();
        if self.config.gateway_strategy == GatewayStrategy::ActivateLastActivities {
            for gateway in find_activities_of_type(&tree, PARALLEL_GATEWAY_ACTIVITY_TYPE) {
                let completed = self
                    .source
                    .completed_activities_before(&instance.id, &gateway.activity_id)?;
                history.insert(gateway.id.clone(), completed);
            }
        }
        let flow_nodes = resolve_active_flow_nodes(&tree, self.config.gateway_strategy, &history);
        debug!(
            legacy_id = %instance.id,
            count = flow_nodes.len(),
            "resolved active flow nodes"
        );
        if let Err(err) = self.validator.validate_flow_nodes(instance, &flow_nodes) {
            return Ok(Preparation::Skip(err.to_string()));
        }

        let definitions = self
            .target
            .search_definitions(&instance.process_definition_key)?;
        let definition = match self.validator.select_definition(instance, definitions) {
            Ok(definition) => definition,
            Err(err) => return Ok(Preparation::Skip(err.to_string())),
        };
        if let Err(err) = self.validator.validate_definition(&definition, &flow_nodes) {
            return Ok(Preparation::Skip(err.to_string()));
        }

        let mut variables = match self.pipeline.transform(self.source.variables(&instance.id)?) {
            Ok(variables) => variables,
            Err(err) => return Ok(Preparation::Skip(err.to_string())),
        };
        variables.insert(
            LEGACY_ID_VARIABLE.to_string(),
            Value::String(instance.id.clone()),
        );

        let mut activations = Vec::with_capacity(flow_nodes.len());
        for (scope_id, node) in &flow_nodes {
            let mut local = match self.pipeline.transform(self.source.variables(scope_id)?) {
                Ok(local) => local,
                Err(err) => return Ok(Preparation::Skip(err.to_string())),
            };
            if let Some(sub_process_instance_id) = &node.sub_process_instance_id {
                local.insert(
                    LEGACY_ID_VARIABLE.to_string(),
                    Value::String(sub_process_instance_id.clone()),
                );
            }
            activations.push(ElementActivation {
                element_id: node.activity_id.clone(),
                variables: local,
            });
        }

        Ok(Preparation::Ready(PreparedInstance {
            request: CreateInstance {
                definition_key: definition.key,
                business_id: definition.business_id,
                tenant_id: definition.tenant_id,
                variables,
            },
            activations,
        }))
    }

    fn create_and_map(
        &mut self,
        instance: &SourceProcessInstance,
        prepared: PreparedInstance,
        retry: bool,
    ) -> Result<(), MigrationError> {
        debug!(legacy_id = %instance.id, "starting target process instance");
        let tx = self.store.begin()?;
        let handle = self.target.create_instance(&prepared.request)?;
        if retry {
            tx.update_target_key(&instance.id, handle.instance_key)?;
        } else {
            tx.insert(&MappingRecord::migrated(
                instance.id.clone(),
                ENTITY,
                handle.instance_key,
                instance.start_time,
            ))?;
        }
        tx.commit()?;
        info!(
            legacy_id = %instance.id,
            instance_key = handle.instance_key,
            "started target process instance"
        );

        self.pending.insert(
            handle.instance_key,
            PendingActivation {
                legacy_id: instance.id.clone(),
                activations: prepared.activations,
            },
        );
        Ok(())
    }

    fn activate_migrator_jobs(&mut self, report: &mut MigrationReport) -> Result<(), MigrationError> {
        let mut seen = BTreeSet::new();
        loop {
            let jobs = self
                .target
                .activate_jobs(&self.config.job_type, self.config.max_jobs_per_activation)?;
            debug!(count = jobs.len(), "migrator jobs found");

            let fresh: Vec<ActivatedJob> = jobs
                .into_iter()
                .filter(|job| seen.insert(job.key))
                .collect();
            if fresh.is_empty() {
                break;
            }
            for job in fresh {
                self.hand_over(job, report)?;
            }
        }

        if !self.pending.is_empty() {
            let legacy_ids: Vec<&str> = self
                .pending
                .values()
                .map(|pending| pending.legacy_id.as_str())
                .collect();
            warn!(
                count = legacy_ids.len(),
                legacy_ids = ?legacy_ids,
                "no migrator job surfaced for started process instances"
            );
            self.pending.clear();
        }
        Ok(())
    }

    fn hand_over(&mut self, job: ActivatedJob, report: &mut MigrationReport) -> Result<(), MigrationError> {
        let Some(legacy_id) = job.legacy_id().map(str::to_string) else {
            info!(
                "Process instance with key [{}] was externally started, skipping migrator job activation.",
                job.process_instance_key
            );
            report.externally_started_jobs += 1;
            return Ok(());
        };

        let activations = match self.pending.remove(&job.process_instance_key) {
            Some(pending) => pending.activations,
            None => match self.reresolve(&legacy_id, job.process_instance_key)? {
                Some(activations) => activations,
                None => {
                    report.unresolved_jobs += 1;
                    return Ok(());
                }
            },
        };

        self.target
            .modify_instance(job.process_instance_key, job.element_instance_key, &activations)?;
        debug!(
            legacy_id = %legacy_id,
            instance_key = job.process_instance_key,
            activations = activations.len(),
            "moved target process instance onto active elements"
        );
        report.jobs_activated += 1;
        Ok(())
    }

    /// Rebuild activations for a job whose instance was started by an earlier, interrupted run.
    fn reresolve(
        &self,
        legacy_id: &str,
        instance_key: i64,
    ) -> Result<Option<Vec<ElementActivation>>, MigrationError> {
        if self.store.find_target_key(legacy_id)? != Some(instance_key) {
            warn!(
                legacy_id,
                instance_key, "migrator job belongs to an unmapped target instance, leaving it"
            );
            return Ok(None);
        }
        let Some(instance) = self.source.find_process_instance(legacy_id)? else {
            warn!(
                "Process instance with legacyId {} doesn't exist anymore. Has it been completed or cancelled in the meantime?",
                legacy_id
            );
            return Ok(None);
        };
        match self.prepare(&instance)? {
            Preparation::Ready(prepared) => Ok(Some(prepared.activations)),
            Preparation::Skip(reason) => {
                warn!(legacy_id, reason = %reason, "cannot rebuild activations for migrator job");
                Ok(None)
            }
        }
    }

    /// Print skipped instances with their reasons. Returns the number of rows listed.
    pub fn list_skipped(&self, out: &mut impl Write) -> Result<usize, MigrationError> {
        let name = ENTITY.display_name().to_lowercase();
        let total = self.store.count_skipped(ENTITY)?;
        if total == 0 {
            writeln!(out, "No {name}s were skipped during previous migration")?;
            return Ok(0);
        }
        writeln!(out, "Previously skipped {name}s:")?;

        let report = Pagination::offset(self.config.page_size)
            .with_total(total)
            .for_each::<MigrationError>(
                |request| {
                    self.store
                        .find_skipped(ENTITY, request.offset, request.limit)
                        .map_err(MigrationError::from)
                },
                |record| {
                    writeln!(
                        out,
                        "{}: {}",
                        record.legacy_id,
                        record.skip_reason.as_deref().unwrap_or_default()
                    )?;
                    Ok(())
                },
            )?;
        Ok(report.items_visited)
    }
}
