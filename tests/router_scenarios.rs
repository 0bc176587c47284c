//! Router fan-out behavior against in-process managers.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_yaml::{Mapping, Value};

use metaroot::activity::{ActivityStream, NullActivityStream};
use metaroot::manager::{AdminOp, Manager, Targets};
use metaroot::reactions::Reactions;
use metaroot::result::{status, CallResult};
use metaroot::router::{Router, READ_ONLY_MESSAGE};
use metaroot::Dispatcher;

/// Manager that answers every operation with `{status, "op:name"}` and
/// remembers what it was asked to do.
struct TestManager {
    name: &'static str,
    status: i64,
    calls: Arc<Mutex<Vec<String>>>,
}

impl TestManager {
    fn boxed(name: &'static str, status: i64, calls: Arc<Mutex<Vec<String>>>) -> Box<dyn Manager> {
        Box::new(Self { name, status, calls })
    }
}

#[async_trait]
impl Manager for TestManager {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn initialize(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn finalize(&mut self) {}

    async fn apply(&mut self, op: &AdminOp) -> Option<anyhow::Result<CallResult>> {
        self.calls.lock().unwrap().push(op.name().to_owned());
        Some(Ok(CallResult::new(
            self.status,
            Value::String(format!("{}:{}", op.name(), self.name)),
        )))
    }
}

/// Manager that implements nothing at all.
struct DeafManager;

#[async_trait]
impl Manager for DeafManager {
    fn name(&self) -> &'static str {
        "DeafManager"
    }

    async fn initialize(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn finalize(&mut self) {}

    async fn apply(&mut self, _op: &AdminOp) -> Option<anyhow::Result<CallResult>> {
        None
    }
}

/// Journal capturing every record it is handed.
#[derive(Default)]
struct RecordingJournal {
    entries: Arc<Mutex<Vec<(String, i64)>>>,
}

#[async_trait]
impl ActivityStream for RecordingJournal {
    async fn record(&self, action_id: &str, _params: &Value, result: &CallResult) {
        self.entries
            .lock()
            .unwrap()
            .push((action_id.to_owned(), result.status));
    }
}

/// Reactions that fire once per error and assert the running prior count.
struct CountingReactions {
    fired: Arc<Mutex<Vec<u32>>>,
}

#[async_trait]
impl Reactions for CountingReactions {
    async fn occur_in_response_to(
        &self,
        _class_name: &str,
        _action: &str,
        _payload: &Value,
        result: &CallResult,
        prior_count: u32,
    ) -> u32 {
        self.fired.lock().unwrap().push(prior_count);
        u32::from(result.is_error())
    }
}

fn group_atts(name: &str) -> Mapping {
    let mut atts = Mapping::new();
    atts.insert(Value::String("name".into()), Value::String(name.into()));
    atts
}

fn per_manager_response<'a>(result: &'a CallResult, manager: &str) -> &'a Value {
    result
        .response
        .as_mapping()
        .unwrap()
        .get(manager)
        .unwrap_or_else(|| panic!("no response entry for {manager}"))
}

#[tokio::test]
async fn fan_out_reaches_every_manager_in_order() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut router = Router::with_parts(
        vec![
            TestManager::boxed("Handler1", 0, calls.clone()),
            TestManager::boxed("Handler2", 0, calls.clone()),
        ],
        Box::new(NullActivityStream),
        Box::new(CountingReactions { fired: Arc::new(Mutex::new(Vec::new())) }),
        false,
    );

    let result = router.add_group(group_atts("g"), &Targets::Any).await.unwrap();
    assert_eq!(result.status, 0);

    let first = CallResult::from_wire(per_manager_response(&result, "Handler1")).unwrap();
    assert_eq!(first.response.as_str(), Some("add_group:Handler1"));
    let second = CallResult::from_wire(per_manager_response(&result, "Handler2")).unwrap();
    assert_eq!(second.response.as_str(), Some("add_group:Handler2"));

    assert_eq!(*calls.lock().unwrap(), vec!["add_group", "add_group"]);
}

#[tokio::test]
async fn aggregate_status_is_the_sum_of_manager_statuses() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut router = Router::with_parts(
        vec![
            TestManager::boxed("Handler1", 3, calls.clone()),
            TestManager::boxed("Handler2", 4, calls.clone()),
        ],
        Box::new(NullActivityStream),
        Box::new(CountingReactions { fired: Arc::new(Mutex::new(Vec::new())) }),
        false,
    );

    let result = router.delete_user("u".into(), &Targets::Any).await.unwrap();
    assert_eq!(result.status, 7);

    // Per-manager statuses stay visible for callers that need precision.
    let response = result.response.as_mapping().unwrap();
    let sum: i64 = response
        .iter()
        .map(|(_, wire)| CallResult::from_wire(wire).unwrap().status)
        .sum();
    assert_eq!(sum, result.status);
}

#[tokio::test]
async fn targeting_filters_managers_by_name() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut router = Router::with_parts(
        vec![
            TestManager::boxed("Handler1", 0, calls.clone()),
            TestManager::boxed("Handler2", 5, calls.clone()),
        ],
        Box::new(NullActivityStream),
        Box::new(CountingReactions { fired: Arc::new(Mutex::new(Vec::new())) }),
        false,
    );

    let targets = Targets::Named(vec!["Handler2".into()]);
    let result = router.get_user("u".into(), &targets).await.unwrap();

    assert_eq!(result.status, 5);
    let response = result.response.as_mapping().unwrap();
    assert_eq!(response.len(), 1);
    assert!(response.get("Handler2").is_some());
    assert_eq!(calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn managers_without_the_operation_are_skipped() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut router = Router::with_parts(
        vec![
            Box::new(DeafManager),
            TestManager::boxed("Handler1", 0, calls.clone()),
        ],
        Box::new(NullActivityStream),
        Box::new(CountingReactions { fired: Arc::new(Mutex::new(Vec::new())) }),
        false,
    );

    let result = router.list_groups(&Targets::Any).await.unwrap();
    let response = result.response.as_mapping().unwrap();
    assert_eq!(response.len(), 1);
    assert!(response.get("Handler1").is_some());
    assert!(response.get("DeafManager").is_none());
}

#[tokio::test]
async fn read_only_blocks_writes_before_any_manager() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let journal = RecordingJournal::default();
    let entries = journal.entries.clone();
    let mut router = Router::with_parts(
        vec![TestManager::boxed("Handler1", 0, calls.clone())],
        Box::new(journal),
        Box::new(CountingReactions { fired: Arc::new(Mutex::new(Vec::new())) }),
        true,
    );

    let result = router.add_group(group_atts("g"), &Targets::Any).await.unwrap();
    assert_eq!(result.status, status::DELIVERY_FAILED);
    assert_eq!(result.response.as_str(), Some(READ_ONLY_MESSAGE));
    assert!(calls.lock().unwrap().is_empty());

    // The refusal itself is journaled, under the catch-all manager name.
    let entries = entries.lock().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, "add_group:any");
    assert_eq!(entries[0].1, status::DELIVERY_FAILED);
}

#[tokio::test]
async fn read_only_still_allows_reads() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut router = Router::with_parts(
        vec![TestManager::boxed("Handler1", 0, calls.clone())],
        Box::new(NullActivityStream),
        Box::new(CountingReactions { fired: Arc::new(Mutex::new(Vec::new())) }),
        true,
    );

    let result = router.exists_group("g".into(), &Targets::Any).await.unwrap();
    assert!(result.is_success());
    assert_eq!(calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn every_fanned_out_call_is_journaled() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let journal = RecordingJournal::default();
    let entries = journal.entries.clone();
    let mut router = Router::with_parts(
        vec![
            TestManager::boxed("Handler1", 0, calls.clone()),
            TestManager::boxed("Handler2", 9, calls.clone()),
        ],
        Box::new(journal),
        Box::new(CountingReactions { fired: Arc::new(Mutex::new(Vec::new())) }),
        false,
    );

    router
        .associate_user_to_group("u".into(), "g".into(), &Targets::Any)
        .await
        .unwrap();

    let entries = entries.lock().unwrap();
    assert_eq!(
        *entries,
        vec![
            ("associate_user_to_group:Handler1".to_owned(), 0),
            ("associate_user_to_group:Handler2".to_owned(), 9),
        ]
    );
}

#[tokio::test]
async fn reactions_see_the_running_prior_count() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let fired = Arc::new(Mutex::new(Vec::new()));
    let mut router = Router::with_parts(
        vec![
            TestManager::boxed("Handler1", 2, calls.clone()),
            TestManager::boxed("Handler2", 2, calls.clone()),
            TestManager::boxed("Handler3", 0, calls.clone()),
        ],
        Box::new(NullActivityStream),
        Box::new(CountingReactions { fired: fired.clone() }),
        false,
    );

    router.update_user(group_atts("u"), &Targets::Any).await.unwrap();

    // Both failures fire one reaction each; the third call observes both.
    assert_eq!(*fired.lock().unwrap(), vec![0, 1, 2]);
}

#[tokio::test]
async fn envelopes_dispatch_through_the_action_table() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut router = Router::with_parts(
        vec![
            TestManager::boxed("Handler1", 0, calls.clone()),
            TestManager::boxed("Handler2", 0, calls.clone()),
        ],
        Box::new(NullActivityStream),
        Box::new(CountingReactions { fired: Arc::new(Mutex::new(Vec::new())) }),
        false,
    );

    let message: Value = serde_yaml::from_str(
        "{action: add_group, group_atts: {name: g1}, managers: [Handler2]}",
    )
    .unwrap();
    let result = Dispatcher::dispatch(&mut router, &message).await;
    assert!(result.is_success());
    assert_eq!(result.response.as_mapping().unwrap().len(), 1);

    // An envelope without the managers key targets everything.
    let message: Value = serde_yaml::from_str("{action: list_groups}").unwrap();
    let result = Dispatcher::dispatch(&mut router, &message).await;
    assert_eq!(result.response.as_mapping().unwrap().len(), 2);
}

#[tokio::test]
async fn missing_parameter_resolves_to_452_with_null() {
    let mut router = Router::with_parts(
        vec![],
        Box::new(NullActivityStream),
        Box::new(CountingReactions { fired: Arc::new(Mutex::new(Vec::new())) }),
        false,
    );

    let message: Value = serde_yaml::from_str("{action: get_group}").unwrap();
    let result = Dispatcher::dispatch(&mut router, &message).await;
    assert_eq!(result, CallResult::new(status::MISSING_PARAMETER, Value::Null));
}

/// Manager whose backend throws instead of reporting a status.
struct ExplodingManager;

#[async_trait]
impl Manager for ExplodingManager {
    fn name(&self) -> &'static str {
        "ExplodingManager"
    }

    async fn initialize(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn finalize(&mut self) {}

    async fn apply(&mut self, _op: &AdminOp) -> Option<anyhow::Result<CallResult>> {
        Some(Err(anyhow::anyhow!("backend connection lost")))
    }
}

#[tokio::test]
async fn manager_panics_become_internal_errors_at_the_dispatcher() {
    let mut router = Router::with_parts(
        vec![Box::new(ExplodingManager)],
        Box::new(NullActivityStream),
        Box::new(CountingReactions { fired: Arc::new(Mutex::new(Vec::new())) }),
        false,
    );

    let message: Value = serde_yaml::from_str("{action: delete_group, name: g}").unwrap();
    let result = Dispatcher::dispatch(&mut router, &message).await;
    assert_eq!(result.status, status::HANDLER_FAILED);
}
