use crate::SnapshotError;
use rmig_core::{
    ActivatedJob, ConnectorError, CreateInstance, ElementActivation, InstanceHandle, KeyAllocator,
    TargetConnector, TargetDefinition, VariableMap,
};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Partition used for keys minted by the journal engine.
pub const JOURNAL_PARTITION: i64 = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct DefinitionsFile {
    #[serde(default)]
    definitions: Vec<TargetDefinition>,
}

/// One line of the target journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum JournalEntry {
    #[serde(rename_all = "camelCase")]
    CreateInstance {
        instance_key: i64,
        definition_key: i64,
        business_id: String,
        #[serde(default)]
        tenant_id: Option<String>,
        start_element_id: Option<String>,
        start_element_instance_key: Option<i64>,
        #[serde(default)]
        jobs: Vec<JournalJob>,
        #[serde(default)]
        variables: VariableMap,
    },
    #[serde(rename_all = "camelCase")]
    ModifyInstance {
        instance_key: i64,
        terminated_element_instance_key: i64,
        activations: Vec<ElementActivation>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalJob {
    pub key: i64,
    pub job_type: String,
}

/// Target-side view of an instance rebuilt from the journal.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalInstance {
    pub instance_key: i64,
    pub definition_key: i64,
    pub business_id: String,
    pub variables: VariableMap,
    pub active_elements: Vec<ElementActivation>,
    pub terminated_element_instances: Vec<i64>,
}

#[derive(Debug, Default)]
struct JournalState {
    keys: KeyAllocator,
    instances: BTreeMap<i64, JournalInstance>,
    outstanding: Vec<ActivatedJob>,
    handed_out: BTreeSet<i64>,
}

impl JournalState {
    fn apply(&mut self, entry: &JournalEntry) -> Result<(), String> {
        match entry {
            JournalEntry::CreateInstance {
                instance_key,
                definition_key,
                business_id,
                start_element_id,
                start_element_instance_key,
                jobs,
                variables,
                ..
            } => {
                self.keys.resume_after(*instance_key);
                if let Some(element_instance_key) = start_element_instance_key {
                    self.keys.resume_after(*element_instance_key);
                }
                let job_variables: serde_json::Map<String, serde_json::Value> = variables
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect();
                for job in jobs {
                    self.keys.resume_after(job.key);
                    self.outstanding.push(ActivatedJob {
                        key: job.key,
                        job_type: job.job_type.clone(),
                        process_instance_key: *instance_key,
                        element_instance_key: start_element_instance_key.unwrap_or(*instance_key),
                        element_id: start_element_id.clone().unwrap_or_default(),
                        variables: job_variables.clone(),
                    });
                }
                self.instances.insert(
                    *instance_key,
                    JournalInstance {
                        instance_key: *instance_key,
                        definition_key: *definition_key,
                        business_id: business_id.clone(),
                        variables: variables.clone(),
                        active_elements: Vec::new(),
                        terminated_element_instances: Vec::new(),
                    },
                );
                Ok(())
            }
            JournalEntry::ModifyInstance {
                instance_key,
                terminated_element_instance_key,
                activations,
            } => {
                let instance = self
                    .instances
                    .get_mut(instance_key)
                    .ok_or_else(|| format!("unknown process instance key {instance_key}"))?;
                instance
                    .terminated_element_instances
                    .push(*terminated_element_instance_key);
                instance.active_elements.extend(activations.iter().cloned());
                self.outstanding.retain(|job| {
                    !(job.process_instance_key == *instance_key
                        && job.element_instance_key == *terminated_element_instance_key)
                });
                Ok(())
            }
        }
    }

    fn next_key(&mut self, operation: &str) -> Result<i64, ConnectorError> {
        self.keys
            .next_key()
            .ok_or_else(|| ConnectorError::on_target(operation, "key space exhausted"))
    }
}

/// Target engine backed by a definitions file and an append-only command journal.
///
/// Every accepted command is appended before its effect becomes visible, so reopening the
/// journal reproduces the engine state, including migrator jobs that were never handled.
#[derive(Debug)]
pub struct JournalTarget {
    definitions: Vec<TargetDefinition>,
    journal_path: PathBuf,
    state: RefCell<JournalState>,
}

impl JournalTarget {
    pub fn open(
        definitions_path: impl AsRef<Path>,
        journal_path: impl AsRef<Path>,
    ) -> Result<Self, SnapshotError> {
        let definitions_path = definitions_path.as_ref();
        let raw = fs::read_to_string(definitions_path).map_err(|source| SnapshotError::Io {
            path: definitions_path.display().to_string(),
            source,
        })?;
        let file: DefinitionsFile =
            serde_json::from_str(&raw).map_err(|source| SnapshotError::Json {
                path: definitions_path.display().to_string(),
                source,
            })?;
        let target = Self::with_definitions(file.definitions, journal_path)?;
        info!(
            definitions = target.definitions.len(),
            instances = target.state.borrow().instances.len(),
            journal = %target.journal_path.display(),
            "opened target journal"
        );
        Ok(target)
    }

    /// Replays an existing journal at `journal_path`, if any.
    pub fn with_definitions(
        definitions: Vec<TargetDefinition>,
        journal_path: impl AsRef<Path>,
    ) -> Result<Self, SnapshotError> {
        let journal_path = journal_path.as_ref().to_path_buf();
        let mut state = JournalState {
            keys: KeyAllocator::for_partition(JOURNAL_PARTITION),
            ..JournalState::default()
        };
        for definition in &definitions {
            state.keys.resume_after(definition.key);
        }

        match fs::read_to_string(&journal_path) {
            Ok(raw) => {
                for (index, line) in raw.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let journal_error = |message: String| SnapshotError::Journal {
                        path: journal_path.display().to_string(),
                        line: index + 1,
                        message,
                    };
                    let entry: JournalEntry = serde_json::from_str(line)
                        .map_err(|err| journal_error(err.to_string()))?;
                    state.apply(&entry).map_err(journal_error)?;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(SnapshotError::Io {
                    path: journal_path.display().to_string(),
                    source,
                })
            }
        }

        Ok(Self {
            definitions,
            journal_path,
            state: RefCell::new(state),
        })
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    pub fn instance(&self, instance_key: i64) -> Option<JournalInstance> {
        self.state.borrow().instances.get(&instance_key).cloned()
    }

    pub fn instance_count(&self) -> usize {
        self.state.borrow().instances.len()
    }

    /// Jobs still waiting on a start event, handed out or not.
    pub fn outstanding_jobs(&self) -> Vec<ActivatedJob> {
        self.state.borrow().outstanding.clone()
    }

    fn append(&self, operation: &str, entry: &JournalEntry) -> Result<(), ConnectorError> {
        let target_error = |err: String| ConnectorError::on_target(operation, err);
        let mut line = serde_json::to_string(entry).map_err(|err| target_error(err.to_string()))?;
        line.push('\n');
        if let Some(parent) = self.journal_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| target_error(err.to_string()))?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal_path)
            .map_err(|err| target_error(err.to_string()))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|err| target_error(err.to_string()))
    }
}

impl TargetConnector for JournalTarget {
    fn create_instance(&self, request: &CreateInstance) -> Result<InstanceHandle, ConnectorError> {
        let definition = self
            .definitions
            .iter()
            .find(|definition| definition.key == request.definition_key)
            .ok_or_else(|| {
                ConnectorError::on_target(
                    "create_instance",
                    format!("unknown process definition key {}", request.definition_key),
                )
            })?;

        let mut state = self.state.borrow_mut();
        let instance_key = state.next_key("create_instance")?;
        let (start_element_id, start_element_instance_key, jobs) = match &definition.start_event
        {
            Some(start_event) => {
                let element_instance_key = state.next_key("create_instance")?;
                let mut jobs = Vec::with_capacity(start_event.listener_job_types.len());
                for job_type in &start_event.listener_job_types {
                    jobs.push(JournalJob {
                        key: state.next_key("create_instance")?,
                        job_type: job_type.clone(),
                    });
                }
                (Some(start_event.id.clone()), Some(element_instance_key), jobs)
            }
            None => (None, None, Vec::new()),
        };

        let entry = JournalEntry::CreateInstance {
            instance_key,
            definition_key: definition.key,
            business_id: definition.business_id.clone(),
            tenant_id: request.tenant_id.clone(),
            start_element_id,
            start_element_instance_key,
            jobs,
            variables: request.variables.clone(),
        };
        self.append("create_instance", &entry)?;
        state
            .apply(&entry)
            .map_err(|message| ConnectorError::on_target("create_instance", message))?;
        debug!(instance_key, definition_key = definition.key, "created target instance");

        Ok(InstanceHandle {
            instance_key,
            definition_key: definition.key,
        })
    }

    fn modify_instance(
        &self,
        instance_key: i64,
        terminate_element_instance_key: i64,
        activations: &[ElementActivation],
    ) -> Result<(), ConnectorError> {
        let mut state = self.state.borrow_mut();
        if !state.instances.contains_key(&instance_key) {
            return Err(ConnectorError::on_target(
                "modify_instance",
                format!("unknown process instance key {instance_key}"),
            ));
        }
        let entry = JournalEntry::ModifyInstance {
            instance_key,
            terminated_element_instance_key: terminate_element_instance_key,
            activations: activations.to_vec(),
        };
        self.append("modify_instance", &entry)?;
        state
            .apply(&entry)
            .map_err(|message| ConnectorError::on_target("modify_instance", message))?;
        debug!(
            instance_key,
            activations = activations.len(),
            "modified target instance"
        );
        Ok(())
    }

    fn search_definitions(
        &self,
        business_id: &str,
    ) -> Result<Vec<TargetDefinition>, ConnectorError> {
        Ok(self
            .definitions
            .iter()
            .filter(|definition| definition.business_id == business_id)
            .cloned()
            .collect())
    }

    fn activate_jobs(
        &self,
        job_type: &str,
        max_jobs: usize,
    ) -> Result<Vec<ActivatedJob>, ConnectorError> {
        let mut state = self.state.borrow_mut();
        let JournalState {
            outstanding,
            handed_out,
            ..
        } = &mut *state;
        let jobs: Vec<ActivatedJob> = outstanding
            .iter()
            .filter(|job| job.job_type == job_type && !handed_out.contains(&job.key))
            .take(max_jobs)
            .cloned()
            .collect();
        handed_out.extend(jobs.iter().map(|job| job.key));
        Ok(jobs)
    }
}
