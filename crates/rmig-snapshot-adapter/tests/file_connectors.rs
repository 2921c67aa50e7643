use rmig_core::{
    ElementActivation, SourceConnector, TargetConnector, VariableMap, LEGACY_ID_VARIABLE,
};
use rmig_snapshot_adapter::{JournalEntry, JournalTarget, SnapshotError, SnapshotSource};
use serde_json::{json, Value};
use std::fs;
use tempfile::TempDir;

fn write_definitions(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("target-definitions.json");
    let body = json!({
        "definitions": [
            {
                "key": 2251799813685249_i64,
                "businessId": "order",
                "version": 1,
                "flowNodeIds": ["start", "T1"],
                "startEvent": {"id": "start", "listenerJobTypes": ["migrator"]}
            },
            {
                "key": 2251799813685250_i64,
                "businessId": "order",
                "version": 2,
                "flowNodeIds": ["start", "T1", "T2"],
                "startEvent": {"id": "start", "listenerJobTypes": ["migrator", "audit"]}
            }
        ]
    });
    fs::write(&path, body.to_string()).expect("write definitions");
    path
}

#[test]
fn snapshot_file_is_loaded_and_ordered() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("source-snapshot.json");
    let body = json!({
        "instances": [
            {
                "id": "b",
                "processDefinitionKey": "order",
                "startTime": "2026-03-01T08:00:00Z",
                "activityTree": {"id": "b", "activityId": "order", "activityType": "processDefinition"}
            },
            {
                "id": "a",
                "processDefinitionKey": "order",
                "startTime": "2026-03-01T08:00:00Z",
                "activityTree": {"id": "a", "activityId": "order", "activityType": "processDefinition"}
            }
        ]
    });
    fs::write(&path, body.to_string()).expect("write snapshot");

    let source = SnapshotSource::load(&path).expect("load snapshot");
    let page = source
        .list_active_root_instances_after(None, 10)
        .expect("page");
    let ids: Vec<&str> = page.iter().map(|instance| instance.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
}

#[test]
fn missing_or_malformed_snapshot_is_an_error() {
    let dir = TempDir::new().expect("tempdir");
    let missing = SnapshotSource::load(dir.path().join("absent.json")).expect_err("missing");
    assert!(matches!(missing, SnapshotError::Io { .. }));

    let path = dir.path().join("broken.json");
    fs::write(&path, "{\"instances\": [").expect("write");
    let broken = SnapshotSource::load(&path).expect_err("malformed");
    assert!(matches!(broken, SnapshotError::Json { .. }));
}

#[test]
fn journal_records_commands_as_json_lines() {
    let dir = TempDir::new().expect("tempdir");
    let definitions = write_definitions(&dir);
    let journal = dir.path().join("state").join("target-journal.jsonl");
    let target = JournalTarget::open(&definitions, &journal).expect("open target");

    assert_eq!(target.search_definitions("order").expect("search").len(), 2);
    assert!(target.search_definitions("invoice").expect("search").is_empty());

    let mut variables = VariableMap::new();
    variables.insert(LEGACY_ID_VARIABLE.to_string(), Value::String("p1".to_string()));
    let handle = target
        .create_instance(&rmig_core::CreateInstance {
            definition_key: 2251799813685250,
            business_id: "order".to_string(),
            tenant_id: None,
            variables,
        })
        .expect("create");

    let jobs = target.activate_jobs("migrator", 5).expect("jobs");
    assert_eq!(jobs.len(), 1);
    target
        .modify_instance(
            handle.instance_key,
            jobs[0].element_instance_key,
            &[ElementActivation {
                element_id: "T2".to_string(),
                variables: VariableMap::new(),
            }],
        )
        .expect("modify");

    let raw = fs::read_to_string(&journal).expect("journal");
    let entries: Vec<JournalEntry> = raw
        .lines()
        .map(|line| serde_json::from_str(line).expect("entry"))
        .collect();
    assert_eq!(entries.len(), 2);
    assert!(matches!(entries[0], JournalEntry::CreateInstance { .. }));
    assert!(matches!(entries[1], JournalEntry::ModifyInstance { .. }));

    // terminating the start event cancels every listener job parked on it
    let reopened = JournalTarget::open(&definitions, &journal).expect("reopen");
    let audit = reopened.activate_jobs("audit", 5).expect("audit jobs");
    assert!(audit.is_empty());
    assert!(reopened.activate_jobs("migrator", 5).expect("jobs").is_empty());
}
