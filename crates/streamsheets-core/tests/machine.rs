use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use streamsheets_core::endpoint::{EndpointError, Response};
use streamsheets_core::machine::Repeat;
use streamsheets_core::{
    EndpointRegistry, LoopbackEndpoint, Machine, MachineConfig, MachineState, ManualClock,
    Message, StepOutcome, StreamEndpoint, StreamsheetsError, TriggerConfig, TriggerKind,
};
use streamsheets_engine::engine::ErrorCode;
use streamsheets_engine::engine::value::{as_number, as_text};
use tokio::sync::oneshot;

/// Endpoint whose responses are sent by the test.
#[derive(Default)]
struct ManualEndpoint {
    pending: Mutex<Vec<Option<oneshot::Sender<Response>>>>,
}

impl ManualEndpoint {
    fn requests(&self) -> usize {
        self.pending.lock().len()
    }

    fn respond(&self, index: usize, response: Response) {
        let sender = self.pending.lock()[index].take();
        if let Some(sender) = sender {
            let _ = sender.send(response);
        }
    }

    fn is_closed(&self, index: usize) -> bool {
        self.pending.lock()[index]
            .as_ref()
            .is_none_or(|sender| sender.is_closed())
    }
}

impl StreamEndpoint for ManualEndpoint {
    fn publish(&self, _message: &Message, _topic: Option<&str>) -> Result<(), EndpointError> {
        Ok(())
    }

    fn request(&self, _message: Message) -> oneshot::Receiver<Response> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().push(Some(tx));
        rx
    }
}

fn number(machine: &Machine, sheet: &str, cell: &str) -> f64 {
    as_number(&machine.cell_value(sheet, cell).unwrap()).unwrap_or(f64::NAN)
}

fn text(machine: &Machine, sheet: &str, cell: &str) -> String {
    as_text(&machine.cell_value(sheet, cell).unwrap())
}

fn error(machine: &Machine, sheet: &str, cell: &str) -> Option<ErrorCode> {
    ErrorCode::from_dynamic(&machine.cell_value(sheet, cell).unwrap())
}

fn with_endpoint(clock: &Arc<ManualClock>) -> (Machine, Arc<ManualEndpoint>) {
    let endpoint = Arc::new(ManualEndpoint::default());
    let mut registry = EndpointRegistry::new();
    registry.register("svc", endpoint.clone());
    (Machine::new("test", registry, clock.clone()), endpoint)
}

fn request_sheet(clock: &Arc<ManualClock>) -> (Machine, Arc<ManualEndpoint>) {
    let (mut machine, endpoint) = with_endpoint(clock);
    machine
        .add_sheet("S1", TriggerConfig::default(), None, None)
        .unwrap();
    machine
        .set_cell("S1", "A1", r#"=REQUEST("svc", "ping")"#)
        .unwrap();
    machine.set_cell("S1", "B1", "=REQUESTINFO(A1)").unwrap();
    (machine, endpoint)
}

#[test]
fn test_sleep_suspends_only_its_sheet() {
    let clock = Arc::new(ManualClock::new(0));
    let mut machine = Machine::new("test", EndpointRegistry::new(), clock.clone());
    machine
        .add_sheet("S1", TriggerConfig::default(), None, None)
        .unwrap();
    machine
        .add_sheet("S2", TriggerConfig::default(), None, None)
        .unwrap();
    machine.set_cell("S1", "A1", "=SLEEP(1)").unwrap();
    machine.set_cell("S1", "B1", "=GETCYCLE()").unwrap();
    machine.set_cell("S2", "A1", "=GETCYCLE()").unwrap();
    machine.start();

    let outcomes = machine.cycle().unwrap();
    assert_eq!(outcomes, vec![StepOutcome::Suspended, StepOutcome::Completed]);
    assert_eq!(number(&machine, "S1", "B1"), 0.0);

    clock.set(500);
    let outcomes = machine.cycle().unwrap();
    assert_eq!(outcomes[0], StepOutcome::Suspended);
    assert_eq!(number(&machine, "S1", "B1"), 0.0);
    assert_eq!(number(&machine, "S2", "A1"), 2.0);

    clock.set(1000);
    let outcomes = machine.cycle().unwrap();
    assert_eq!(outcomes[0], StepOutcome::Completed);
    // resumed within the first step
    assert_eq!(number(&machine, "S1", "B1"), 1.0);
    assert_eq!(number(&machine, "S2", "A1"), 3.0);

    let outcomes = machine.cycle().unwrap();
    assert_eq!(outcomes[0], StepOutcome::Suspended);
    assert_eq!(number(&machine, "S1", "B1"), 1.0);
}

#[test]
fn test_tiny_sleep_never_blocks() {
    let clock = Arc::new(ManualClock::new(0));
    let mut machine = Machine::new("test", EndpointRegistry::new(), clock.clone());
    machine
        .add_sheet("S1", TriggerConfig::default(), None, None)
        .unwrap();
    machine.set_cell("S1", "A1", "=SLEEP(0.0005)").unwrap();
    machine.set_cell("S1", "B1", "=GETCYCLE()").unwrap();
    machine.start();
    assert_eq!(machine.cycle().unwrap(), vec![StepOutcome::Completed]);
    assert_eq!(machine.cycle().unwrap(), vec![StepOutcome::Completed]);
    assert_eq!(number(&machine, "S1", "B1"), 2.0);
}

#[test]
fn test_request_is_issued_once_until_resolved() {
    let clock = Arc::new(ManualClock::new(0));
    let (mut machine, endpoint) = request_sheet(&clock);
    machine
        .set_cell("S1", "C1", r#"=READ(INBOXDATA("", "", "answer"))"#)
        .unwrap();
    // entry-time evaluation dispatches nothing
    assert_eq!(endpoint.requests(), 0);
    machine.start();

    machine.cycle().unwrap();
    let first = text(&machine, "S1", "A1");
    assert!(!first.is_empty());
    assert_eq!(machine.cell_value("S1", "B1").unwrap().as_bool().ok(), Some(false));

    machine.cycle().unwrap();
    assert_eq!(text(&machine, "S1", "A1"), first);
    assert_eq!(endpoint.requests(), 1);
    assert_eq!(machine.sheet("S1").unwrap().runtime().lock().requests.len(), 1);

    endpoint.respond(0, Ok(Message::with_id("resp", json!({"answer": 42}))));
    machine.cycle().unwrap();
    // the response lands in the inbox and a fresh request goes out
    assert_eq!(number(&machine, "S1", "C1"), 42.0);
    assert_ne!(text(&machine, "S1", "A1"), first);
    assert_eq!(endpoint.requests(), 2);

    machine.stop();
    assert_eq!(machine.state(), MachineState::Stopped);
    assert_eq!(machine.sheet("S1").unwrap().runtime().lock().requests.len(), 0);
    assert!(endpoint.is_closed(1));
}

#[test]
fn test_pending_request_keeps_id_when_payload_disappears() {
    let clock = Arc::new(ManualClock::new(0));
    let (mut machine, endpoint) = with_endpoint(&clock);
    machine
        .add_sheet("S1", TriggerConfig::default(), None, None)
        .unwrap();
    machine
        .hub()
        .outbox()
        .lock()
        .put(Message::with_id("m1", json!({"q": 1})));
    machine
        .set_cell("S1", "A1", r#"=REQUEST("svc", OUTBOX("m1"))"#)
        .unwrap();
    machine.start();

    machine.cycle().unwrap();
    let first = text(&machine, "S1", "A1");
    assert!(!first.is_empty());

    machine.hub().outbox().lock().delete("m1");
    machine.cycle().unwrap();
    assert_eq!(text(&machine, "S1", "A1"), first);
    assert_eq!(error(&machine, "S1", "A1"), None);
    assert_eq!(endpoint.requests(), 1);

    // once resolved, the next request needs a payload again
    endpoint.respond(0, Ok(Message::with_id("resp", json!({}))));
    machine.cycle().unwrap();
    assert_eq!(error(&machine, "S1", "A1"), Some(ErrorCode::NoMsg));
    assert_eq!(endpoint.requests(), 1);
}

#[test]
fn test_request_info_reports_rejection() {
    let clock = Arc::new(ManualClock::new(0));
    let (mut machine, endpoint) = request_sheet(&clock);
    machine.start();

    machine.cycle().unwrap();
    let first = text(&machine, "S1", "A1");
    endpoint.respond(0, Err("boom".to_string()));

    machine.cycle().unwrap();
    assert_eq!(text(&machine, "S1", "A1"), first);
    assert_eq!(error(&machine, "S1", "B1"), Some(ErrorCode::Err));
    assert_eq!(endpoint.requests(), 1);

    // once the rejection was observed the cell may ask again
    machine.cycle().unwrap();
    assert_ne!(text(&machine, "S1", "A1"), first);
    assert_eq!(endpoint.requests(), 2);
    assert_eq!(machine.cell_value("S1", "B1").unwrap().as_bool().ok(), Some(false));
}

#[test]
fn test_request_timeout_rejects() {
    let clock = Arc::new(ManualClock::new(0));
    let (mut machine, endpoint) = with_endpoint(&clock);
    machine
        .add_sheet("S1", TriggerConfig::default(), None, None)
        .unwrap();
    machine
        .set_cell("S1", "A1", r#"=REQUEST("svc", "ping", "", 100)"#)
        .unwrap();
    machine.set_cell("S1", "B1", "=REQUESTINFO(A1)").unwrap();
    machine.start();

    machine.cycle().unwrap();
    clock.set(100);
    machine.cycle().unwrap();
    assert_eq!(error(&machine, "S1", "B1"), Some(ErrorCode::Err));
    assert!(endpoint.is_closed(0));
}

#[test]
fn test_editing_a_cell_cancels_its_request() {
    let clock = Arc::new(ManualClock::new(0));
    let (mut machine, endpoint) = request_sheet(&clock);
    machine.start();
    machine.cycle().unwrap();
    assert_eq!(machine.sheet("S1").unwrap().runtime().lock().requests.len(), 1);

    machine.set_cell("S1", "A1", "5").unwrap();
    assert_eq!(machine.sheet("S1").unwrap().runtime().lock().requests.len(), 0);
    assert!(endpoint.is_closed(0));
}

#[test]
fn test_unknown_endpoint() {
    let clock = Arc::new(ManualClock::new(0));
    let mut machine = Machine::new("test", EndpointRegistry::new(), clock);
    machine
        .add_sheet("S1", TriggerConfig::default(), None, None)
        .unwrap();
    machine
        .set_cell("S1", "A1", r#"=REQUEST("nowhere", "ping")"#)
        .unwrap();
    machine
        .set_cell("S1", "A2", r#"=PUBLISH("nowhere", "ping")"#)
        .unwrap();
    assert_eq!(error(&machine, "S1", "A1"), Some(ErrorCode::NoProducer));
    assert_eq!(error(&machine, "S1", "A2"), Some(ErrorCode::NoProducer));
}

#[test]
fn test_loopback_response_reaches_other_sheet() {
    let config = MachineConfig::parse(
        r#"
[[sheets]]
name = "S1"
cells = """
A1: =REQUEST("loop", "ping", INBOX("S2"))
"""

[[sheets]]
name = "S2"
trigger = { type = "arrival" }
cells = """
A1: =READ(INBOXDATA("", ""))
B1: =GETCYCLE()
"""

[[endpoints]]
name = "loop"
kind = "loopback"
"#,
    )
    .unwrap();
    let mut machine = config.build(Arc::new(ManualClock::new(0))).unwrap();
    machine.start();

    let outcomes = machine.cycle().unwrap();
    assert_eq!(outcomes, vec![StepOutcome::Completed, StepOutcome::Skipped]);

    let outcomes = machine.cycle().unwrap();
    assert_eq!(outcomes, vec![StepOutcome::Completed, StepOutcome::Completed]);
    assert_eq!(text(&machine, "S2", "A1"), "ping");
    assert_eq!(number(&machine, "S2", "B1"), 1.0);
}

#[test]
fn test_time_aggregate_sums_a_sliding_window() {
    let clock = Arc::new(ManualClock::new(0));
    let mut machine = Machine::new("test", EndpointRegistry::new(), clock.clone());
    machine
        .add_sheet("S1", TriggerConfig::default(), None, None)
        .unwrap();
    machine.set_cell("S1", "B1", "=TIMEAGGREGATE(A1, 5, 9)").unwrap();
    machine.start();

    let mut sums = Vec::new();
    for i in 1..=5 {
        machine.set_cell("S1", "A1", &i.to_string()).unwrap();
        machine.cycle().unwrap();
        sums.push(number(&machine, "S1", "B1"));
        clock.advance(1250);
    }
    assert_eq!(sums, vec![1.0, 3.0, 6.0, 10.0, 14.0]);

    // a restart starts with an empty window
    machine.stop();
    machine.start();
    machine.cycle().unwrap();
    assert_eq!(number(&machine, "S1", "B1"), 5.0);
}

#[test]
fn test_table_update_appends_row_without_touching_corner() {
    let clock = Arc::new(ManualClock::new(0));
    let mut machine = Machine::new("test", EndpointRegistry::new(), clock);
    machine
        .add_sheet("S1", TriggerConfig::default(), None, None)
        .unwrap();
    for (cell, input) in [("A1", "\"key\""), ("B1", "\"a\""), ("C1", "\"b\""), ("A2", "\"x\"")] {
        machine.set_cell("S1", cell, input).unwrap();
    }
    machine
        .set_cell("S1", "D1", r#"=TABLE_UPDATE(A1:C3, 7, "y", "b", 1, 0)"#)
        .unwrap();
    assert_eq!(text(&machine, "S1", "A3"), "");
    machine.start();
    machine.cycle().unwrap();

    assert_eq!(text(&machine, "S1", "A1"), "key");
    assert_eq!(text(&machine, "S1", "A3"), "y");
    assert_eq!(number(&machine, "S1", "C3"), 7.0);
    assert_eq!(text(&machine, "S1", "A2"), "x");
}

#[test]
fn test_loop_over_message_elements() {
    let clock = Arc::new(ManualClock::new(0));
    let mut machine = Machine::new("test", EndpointRegistry::new(), clock);
    machine
        .add_sheet("S1", TriggerConfig::default(), Some("[data][items]"), None)
        .unwrap();
    machine
        .set_cell("S1", "A1", r#"=READ(INBOXDATA("", "", "v"))"#)
        .unwrap();
    machine.set_cell("S1", "B1", "=LOOPINDEX()").unwrap();
    machine
        .put_message(
            "S1",
            Message::with_id("m1", json!({"items": [{"v": 10}, {"v": 20}]})),
        )
        .unwrap();
    machine.start();

    machine.cycle().unwrap();
    assert_eq!(number(&machine, "S1", "A1"), 10.0);
    assert_eq!(number(&machine, "S1", "B1"), 0.0);

    machine.cycle().unwrap();
    assert_eq!(number(&machine, "S1", "A1"), 20.0);
    assert_eq!(number(&machine, "S1", "B1"), 1.0);

    machine.cycle().unwrap();
    assert_eq!(error(&machine, "S1", "A1"), Some(ErrorCode::NoMsg));
    assert!(machine.sheet("S1").unwrap().inbox().lock().is_empty());
}

#[test]
fn test_endless_loop_wraps_around() {
    let clock = Arc::new(ManualClock::new(0));
    let mut machine = Machine::new("test", EndpointRegistry::new(), clock);
    let trigger = TriggerConfig::new(TriggerKind::Always).endless();
    assert_eq!(trigger.repeat, Repeat::Endless);
    machine
        .add_sheet("S1", trigger, Some("[data][items]"), None)
        .unwrap();
    machine
        .set_cell("S1", "A1", r#"=READ(INBOXDATA("", "", "v"))"#)
        .unwrap();
    machine
        .put_message(
            "S1",
            Message::with_id("m1", json!({"items": [{"v": 10}, {"v": 20}]})),
        )
        .unwrap();
    machine.start();

    let mut seen = Vec::new();
    for _ in 0..3 {
        machine.cycle().unwrap();
        seen.push(number(&machine, "S1", "A1"));
    }
    assert_eq!(seen, vec![10.0, 20.0, 10.0]);
}

#[test]
fn test_step_and_cycle_depend_on_state() {
    let clock = Arc::new(ManualClock::new(0));
    let mut machine = Machine::new("test", EndpointRegistry::new(), clock);
    machine
        .add_sheet("S1", TriggerConfig::new(TriggerKind::Once), None, None)
        .unwrap();
    machine.set_cell("S1", "A1", "=GETCYCLE()").unwrap();

    assert!(matches!(machine.cycle(), Err(StreamsheetsError::NotRunning)));
    assert_eq!(machine.step().unwrap(), vec![StepOutcome::Completed]);
    assert_eq!(machine.step().unwrap(), vec![StepOutcome::Completed]);
    assert_eq!(number(&machine, "S1", "A1"), 2.0);

    machine.start();
    assert!(matches!(machine.step(), Err(StreamsheetsError::StepWhileRunning)));
    // ONCE never fires on its own
    assert_eq!(machine.cycle().unwrap(), vec![StepOutcome::Skipped]);

    machine.pause();
    assert_eq!(machine.state(), MachineState::Paused);
    assert_eq!(machine.step().unwrap(), vec![StepOutcome::Completed]);
    assert_eq!(number(&machine, "S1", "A1"), 1.0);
}

#[test]
fn test_machine_start_and_stop_sheets() {
    let loopback = Arc::new(LoopbackEndpoint::new());
    let mut registry = EndpointRegistry::new();
    registry.register("loop", loopback.clone());
    let mut machine = Machine::new("test", registry, Arc::new(ManualClock::new(0)));
    machine
        .add_sheet("Init", TriggerConfig::new(TriggerKind::MachineStart), None, None)
        .unwrap();
    machine
        .add_sheet("Bye", TriggerConfig::new(TriggerKind::MachineStop), None, None)
        .unwrap();
    machine.set_cell("Init", "A1", "=GETCYCLE()").unwrap();
    machine
        .set_cell("Bye", "A1", r#"=PUBLISH("loop", "bye", "shutdown")"#)
        .unwrap();

    machine.start();
    assert_eq!(number(&machine, "Init", "A1"), 1.0);
    let outcomes = machine.cycle().unwrap();
    assert_eq!(outcomes, vec![StepOutcome::Skipped, StepOutcome::Skipped]);
    assert_eq!(number(&machine, "Init", "A1"), 1.0);
    assert!(loopback.published().is_empty());

    machine.stop();
    let published = loopback.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0.as_deref(), Some("shutdown"));
    assert_eq!(published[0].1.data, json!("bye"));
}

#[test]
fn test_outbox_write_read_delete() {
    let clock = Arc::new(ManualClock::new(0));
    let mut machine = Machine::new("test", EndpointRegistry::new(), clock);
    machine
        .add_sheet("S1", TriggerConfig::default(), None, None)
        .unwrap();
    machine
        .set_cell("S1", "A1", r#"=WRITE(OUTBOXDATA("out", "temp"), 21)"#)
        .unwrap();
    machine
        .set_cell("S1", "B1", r#"=READ(OUTBOXDATA("out", "temp"))"#)
        .unwrap();
    assert_eq!(text(&machine, "S1", "A1"), "temp");
    assert_eq!(error(&machine, "S1", "B1"), Some(ErrorCode::NoMsg));
    assert!(machine.hub().outbox().lock().is_empty());

    machine.start();
    machine.cycle().unwrap();
    assert_eq!(number(&machine, "S1", "B1"), 21.0);
    assert_eq!(
        machine.hub().outbox().lock().get("out").map(|m| m.data.clone()),
        Some(json!({"temp": 21}))
    );

    machine
        .set_cell("S1", "C1", r#"=DELETE(OUTBOXDATA("out", "temp"))"#)
        .unwrap();
    machine.cycle().unwrap();
    assert_eq!(number(&machine, "S1", "B1"), 21.0);
    assert_eq!(
        machine.hub().outbox().lock().get("out").map(|m| m.data.clone()),
        Some(json!({}))
    );

    machine.stop();
    assert!(machine.hub().outbox().lock().is_empty());
}

#[test]
fn test_sheet_errors() {
    let clock = Arc::new(ManualClock::new(0));
    let mut machine = Machine::new("test", EndpointRegistry::new(), clock);
    machine
        .add_sheet("S1", TriggerConfig::default(), None, None)
        .unwrap();
    assert!(matches!(
        machine.add_sheet("S1", TriggerConfig::default(), None, None),
        Err(StreamsheetsError::DuplicateSheet(_))
    ));
    assert!(matches!(
        machine.add_sheet("S2", TriggerConfig::default(), Some("data.items"), None),
        Err(StreamsheetsError::InvalidLoopPath(_))
    ));
    assert!(matches!(
        machine.set_cell("S1", "1A", "5"),
        Err(StreamsheetsError::InvalidCellRef(_))
    ));
    assert!(matches!(
        machine.set_cell("nope", "A1", "5"),
        Err(StreamsheetsError::UnknownSheet(_))
    ));
    machine
        .set_cell("S1", "A1", r#"=READ(INBOXDATA("nope", "", "v"))"#)
        .unwrap();
    assert_eq!(error(&machine, "S1", "A1"), Some(ErrorCode::Name));
}

#[test]
fn test_custom_functions_load_and_reload() {
    let path = std::env::temp_dir().join(format!("streamsheets-core-{}-bump.rhai", std::process::id()));
    std::fs::write(&path, "fn bump(x) { x + 1 }").unwrap();

    let clock = Arc::new(ManualClock::new(0));
    let mut machine = Machine::new("test", EndpointRegistry::new(), clock);
    machine
        .add_sheet("S1", TriggerConfig::default(), None, None)
        .unwrap();
    assert!(matches!(
        machine.reload_functions(),
        Err(StreamsheetsError::NoFunctionsLoaded)
    ));

    machine.load_functions(&path).unwrap();
    machine.set_cell("S1", "A1", "1").unwrap();
    machine.set_cell("S1", "B1", "=bump(A1)").unwrap();
    assert_eq!(number(&machine, "S1", "B1"), 2.0);

    std::fs::write(&path, "fn bump(x) { x + 10 }").unwrap();
    assert_eq!(machine.reload_functions().unwrap(), 1);
    assert_eq!(number(&machine, "S1", "B1"), 11.0);

    // a broken script keeps the previous functions
    std::fs::write(&path, "fn bump(x) { x + ").unwrap();
    assert!(matches!(
        machine.reload_functions(),
        Err(StreamsheetsError::RhaiCompile(_))
    ));
    assert!(machine.custom_functions().unwrap().contains("x + 10"));
    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_return_with_retry_replays_loop_element() {
    let clock = Arc::new(ManualClock::new(0));
    let mut machine = Machine::new("test", EndpointRegistry::new(), clock);
    machine
        .add_sheet("S1", TriggerConfig::default(), Some("[data][items]"), None)
        .unwrap();
    machine.set_cell("S1", "A1", "=LOOPINDEX()").unwrap();
    machine.set_cell("S1", "B1", "=GETCYCLE()").unwrap();
    machine.set_cell("S1", "C1", "=RETURN(A5)").unwrap();
    machine.set_cell("S1", "D1", "=GETCYCLE()").unwrap();
    machine.set_cell("S1", "A5", "TRUE").unwrap();
    machine
        .put_message("S1", Message::with_id("m1", json!({"items": [1, 2, 3]})))
        .unwrap();
    machine.start();

    assert_eq!(machine.cycle().unwrap(), vec![StepOutcome::Returned]);
    assert_eq!(number(&machine, "S1", "A1"), 0.0);
    assert_eq!(number(&machine, "S1", "B1"), 1.0);
    // cells after RETURN are not evaluated
    assert_eq!(number(&machine, "S1", "D1"), 0.0);

    machine.cycle().unwrap();
    assert_eq!(number(&machine, "S1", "A1"), 0.0);
    assert_eq!(number(&machine, "S1", "B1"), 2.0);

    machine.set_cell("S1", "A5", "FALSE").unwrap();
    machine.cycle().unwrap();
    assert_eq!(number(&machine, "S1", "A1"), 0.0);
    assert_eq!(number(&machine, "S1", "B1"), 3.0);

    machine.cycle().unwrap();
    assert_eq!(number(&machine, "S1", "A1"), 1.0);
    assert_eq!(number(&machine, "S1", "B1"), 4.0);
    assert_eq!(number(&machine, "S1", "D1"), 0.0);
}

#[test]
fn test_pause_keeps_time_aggregate_window() {
    let clock = Arc::new(ManualClock::new(0));
    let mut machine = Machine::new("test", EndpointRegistry::new(), clock.clone());
    machine
        .add_sheet("S1", TriggerConfig::default(), None, None)
        .unwrap();
    machine.set_cell("S1", "B1", "=TIMEAGGREGATE(A1, 5, 9)").unwrap();
    machine.start();

    machine.set_cell("S1", "A1", "1").unwrap();
    machine.cycle().unwrap();
    clock.advance(1000);

    machine.pause();
    assert_eq!(machine.state(), MachineState::Paused);
    assert!(matches!(machine.cycle(), Err(StreamsheetsError::NotRunning)));
    machine.start();
    assert_eq!(machine.state(), MachineState::Running);

    machine.set_cell("S1", "A1", "2").unwrap();
    machine.cycle().unwrap();
    assert_eq!(number(&machine, "S1", "B1"), 3.0);
}

#[test]
fn test_time_aggregate_evicts_at_exact_period() {
    let clock = Arc::new(ManualClock::new(0));
    let mut machine = Machine::new("test", EndpointRegistry::new(), clock.clone());
    machine
        .add_sheet("S1", TriggerConfig::default(), None, None)
        .unwrap();
    machine.set_cell("S1", "B1", "=TIMEAGGREGATE(A1, 5, 9)").unwrap();
    machine.start();

    let mut sums = Vec::new();
    for i in 1..=6 {
        machine.set_cell("S1", "A1", &i.to_string()).unwrap();
        machine.cycle().unwrap();
        sums.push(number(&machine, "S1", "B1"));
        clock.advance(1000);
    }
    assert_eq!(sums, vec![1.0, 3.0, 6.0, 10.0, 15.0, 20.0]);
}

#[test]
fn test_replacing_sleep_cell_cancels_wake() {
    let clock = Arc::new(ManualClock::new(0));
    let mut machine = Machine::new("test", EndpointRegistry::new(), clock);
    machine
        .add_sheet("S1", TriggerConfig::default(), None, None)
        .unwrap();
    machine.set_cell("S1", "A1", "=SLEEP(10)").unwrap();
    machine.set_cell("S1", "B1", "=GETCYCLE()").unwrap();
    machine.start();

    assert_eq!(machine.cycle().unwrap(), vec![StepOutcome::Suspended]);
    assert_eq!(number(&machine, "S1", "B1"), 0.0);

    machine.set_cell("S1", "A1", "=1 + 1").unwrap();
    assert_eq!(machine.cycle().unwrap(), vec![StepOutcome::Completed]);
    assert_eq!(number(&machine, "S1", "A1"), 2.0);
    assert_eq!(number(&machine, "S1", "B1"), 2.0);
}

#[test]
fn test_json_range_spills_into_sheet() {
    let clock = Arc::new(ManualClock::new(0));
    let mut machine = Machine::new("test", EndpointRegistry::new(), clock);
    machine
        .add_sheet("S1", TriggerConfig::default(), None, None)
        .unwrap();
    machine
        .set_cell("S1", "A1", r#"=JSON_RANGE("{\"a\": 1, \"b\": {\"c\": \"x\"}}", @A3)"#)
        .unwrap();
    machine
        .set_cell("S1", "B1", r#"=JSON_RANGE("[7, 8, 9]", A7:B7, "array")"#)
        .unwrap();
    machine.set_cell("S1", "C7", "\"keep\"").unwrap();
    // entry-time evaluation writes nothing
    assert_eq!(text(&machine, "S1", "A3"), "");
    machine.start();
    machine.cycle().unwrap();

    assert_eq!(text(&machine, "S1", "A3"), "a");
    assert_eq!(number(&machine, "S1", "B3"), 1.0);
    assert_eq!(text(&machine, "S1", "A4"), "b");
    assert_eq!(text(&machine, "S1", "B5"), "c");
    assert_eq!(text(&machine, "S1", "C5"), "x");

    assert_eq!(number(&machine, "S1", "A7"), 7.0);
    assert_eq!(number(&machine, "S1", "B7"), 8.0);
    assert_eq!(text(&machine, "S1", "C7"), "keep");
}

#[test]
fn test_encoded_ranges_decode_to_same_values() {
    let clock = Arc::new(ManualClock::new(0));
    let mut machine = Machine::new("test", EndpointRegistry::new(), clock);
    machine
        .add_sheet("S1", TriggerConfig::default(), None, None)
        .unwrap();
    for (cell, input) in [("A1", "1"), ("B1", "2"), ("A2", "3"), ("B2", "4")] {
        machine.set_cell("S1", cell, input).unwrap();
    }
    for (cell, input) in [("A12", "\"a\""), ("B12", "\"b\""), ("A13", "5"), ("B13", "6")] {
        machine.set_cell("S1", cell, input).unwrap();
    }
    machine.set_cell("S1", "D1", "=RANGE(A1:B2, false)").unwrap();
    machine
        .set_cell("S1", "E1", r#"=JSON_RANGE(D1, A6:B7, "range", false)"#)
        .unwrap();
    machine.set_cell("S1", "D2", "=ARRAY(A1:B2)").unwrap();
    machine
        .set_cell("S1", "E2", r#"=JSON_RANGE(D2, @A9, "array")"#)
        .unwrap();
    machine.set_cell("S1", "D3", "=DICTIONARY(A12:B13)").unwrap();
    machine
        .set_cell("S1", "E3", r#"=JSON_RANGE(D3, @A15, "dictionary")"#)
        .unwrap();
    machine.start();
    machine.cycle().unwrap();

    for (source, copy) in [("A1", "A6"), ("B1", "B6"), ("A2", "A7"), ("B2", "B7")] {
        assert_eq!(number(&machine, "S1", copy), number(&machine, "S1", source));
    }
    let flat: Vec<f64> = ["A9", "B9", "C9", "D9"]
        .iter()
        .map(|cell| number(&machine, "S1", cell))
        .collect();
    assert_eq!(flat, vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(text(&machine, "S1", "A15"), "a");
    assert_eq!(text(&machine, "S1", "B15"), "b");
    assert_eq!(number(&machine, "S1", "A16"), 5.0);
    assert_eq!(number(&machine, "S1", "B16"), 6.0);
}

#[test]
fn test_delete_all_inbox_messages_and_keep_metadata_id() {
    let clock = Arc::new(ManualClock::new(0));
    let mut machine = Machine::new("test", EndpointRegistry::new(), clock);
    machine
        .add_sheet("S1", TriggerConfig::default(), None, None)
        .unwrap();
    machine
        .add_sheet("S2", TriggerConfig::new(TriggerKind::MachineStart), None, None)
        .unwrap();
    machine
        .set_cell("S1", "A1", r#"=DELETE(INBOXMETADATA("S2", "m1", "id"))"#)
        .unwrap();
    machine
        .set_cell("S1", "B1", r#"=READ(INBOXMETADATA("S2", "m1", "id"))"#)
        .unwrap();
    machine
        .set_cell("S1", "A2", r#"=DELETE(INBOX("S2", "*"))"#)
        .unwrap();
    machine.start();
    machine
        .put_message("S2", Message::with_id("m1", json!({"v": 1})))
        .unwrap();
    machine
        .put_message("S2", Message::with_id("m2", json!({"v": 2})))
        .unwrap();

    machine.cycle().unwrap();
    assert_eq!(error(&machine, "S1", "A1"), Some(ErrorCode::NoMsgData));
    assert_eq!(text(&machine, "S1", "B1"), "m1");
    assert!(machine.sheet("S2").unwrap().inbox().lock().is_empty());

    machine.cycle().unwrap();
    assert_eq!(error(&machine, "S1", "A1"), Some(ErrorCode::NoMsg));
    assert_eq!(error(&machine, "S1", "A2"), None);
    assert!(machine.sheet("S2").unwrap().inbox().lock().is_empty());
}
