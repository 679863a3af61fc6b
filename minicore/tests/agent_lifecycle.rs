//! Loop-level lifecycle tests.
//!
//! These drive `AgentLoop::run` with scripted model and environment doubles
//! and check the JSONL event stream and the persisted trajectory together:
//! ordering, finalization for every stop reason, budgets, timeouts, crash
//! recovery and corrective retries.

use std::sync::Arc;

use serde_json::Value;

use minicore::core::parser::COMPLETION_SENTINEL;
use minicore::core::types::{Role, StopReason};
use minicore::interrupt::Interrupt;
use minicore::io::environment::{ExecOutcome, ExecOutput};
use minicore::io::model::ModelError;
use minicore::io::trajectory::{Trajectory, load_trajectory};
use minicore::test_support::{
    FailingEnvironment, ScriptedEnvironment, ScriptedExec, ScriptedModel, ScriptedReply, TestRun,
    command_reply, text_reply,
};

fn completion(summary: &str) -> ScriptedReply {
    text_reply(&format!("Done.\n{COMPLETION_SENTINEL}\n{summary}"), 0.01)
}

fn exited(stdout: &str) -> ScriptedExec {
    ScriptedExec::Outcome(ExecOutcome::exited(stdout, "", 0))
}

fn load(run: &TestRun) -> Trajectory {
    load_trajectory(&run.trajectory_path()).expect("trajectory")
}

/// Checks the properties every run must satisfy, whatever its stop reason.
fn assert_stream_invariants(events: &[Value], trajectory: &Trajectory) {
    assert_eq!(events.first().expect("events")["type"], "start");
    assert_eq!(events.last().expect("events")["type"], "finish");
    assert_eq!(events.iter().filter(|e| e["type"] == "start").count(), 1);
    assert_eq!(events.iter().filter(|e| e["type"] == "finish").count(), 1);

    for (i, event) in events.iter().enumerate() {
        if event["type"] == "command" {
            let next = &events[i + 1];
            assert_eq!(next["type"], "output", "command must be followed by its output");
            assert_eq!(next["data"]["step"], event["data"]["step"]);
        }
    }
    let commands = events.iter().filter(|e| e["type"] == "command").count();
    let commanded_steps = trajectory
        .steps
        .iter()
        .filter(|s| s.command.is_some())
        .count();
    assert_eq!(commands, commanded_steps);

    let finish = &events.last().expect("events")["data"];
    assert_eq!(
        finish["total_steps"].as_u64(),
        Some(trajectory.steps.len() as u64)
    );
    assert_eq!(finish["status"], trajectory.exit_status.as_str());
    for (i, step) in trajectory.steps.iter().enumerate() {
        assert_eq!(step.step as usize, i + 1);
    }

    let totals: Vec<f64> = events
        .iter()
        .filter(|e| e["type"] == "cost")
        .map(|e| e["data"]["total_cost"].as_f64().expect("total_cost"))
        .collect();
    assert!(totals.windows(2).all(|w| w[1] >= w[0]), "cost decreased: {totals:?}");
}

/// Verifies a response that declares completion immediately ends the run in
/// one step without running anything.
#[test]
fn immediate_completion_takes_one_step() {
    let run = TestRun::new().expect("run");
    let env = Arc::new(ScriptedEnvironment::new(Vec::new()));
    let outcome = run
        .agent(
            ScriptedModel::new(vec![completion("No changes needed.")]),
            Arc::clone(&env),
        )
        .run(run.task());

    assert_eq!(outcome.status, StopReason::Completed);
    assert_eq!(outcome.steps, 1);
    assert_eq!(outcome.result, "No changes needed.");
    assert!(env.commands().is_empty());
    assert_eq!(run.sink.kinds(), ["start", "thought", "cost", "finish"]);

    let trajectory = load(&run);
    assert_eq!(trajectory.exit_status, StopReason::Completed);
    assert_eq!(trajectory.steps.len(), 1);
    assert_eq!(trajectory.steps[0].command, None);
    assert_eq!(trajectory.result, "No changes needed.");
    assert_eq!(outcome.trajectory.as_deref(), Some(run.trajectory_path().as_path()));
    assert_stream_invariants(&run.sink.events(), &trajectory);
}

/// Verifies the sentinel as the first line of command output submits the
/// rest of the output.
#[test]
fn sentinel_in_command_output_submits_result() {
    let run = TestRun::new().expect("run");
    let outcome = run.run(
        vec![command_reply("git diff", 0.01)],
        vec![exited(&format!("{COMPLETION_SENTINEL}\ndiff --git a/x b/x\n"))],
    );

    assert_eq!(outcome.status, StopReason::Completed);
    assert_eq!(outcome.steps, 1);
    assert_eq!(outcome.result, "diff --git a/x b/x\n");
    assert_eq!(
        run.sink.kinds(),
        ["start", "thought", "cost", "command", "output", "finish"]
    );
    assert_stream_invariants(&run.sink.events(), &load(&run));
}

/// Verifies `step_limit = 2` stops after exactly two recorded steps.
#[test]
fn step_limit_short_circuits() {
    let mut run = TestRun::new().expect("run");
    run.config.agent.step_limit = 2;
    let outcome = run.run(
        vec![
            command_reply("ls", 0.01),
            command_reply("ls src", 0.01),
            command_reply("ls tests", 0.01),
        ],
        Vec::new(),
    );

    assert_eq!(outcome.status, StopReason::StepLimit);
    assert_eq!(outcome.steps, 2);

    let events = run.sink.events();
    let error = &events[events.len() - 2];
    assert_eq!(error["type"], "error");
    assert_eq!(error["data"]["kind"], "budget_exceeded");
    assert_eq!(error["data"]["recoverable"], false);

    let trajectory = load(&run);
    assert_eq!(trajectory.exit_status, StopReason::StepLimit);
    assert_eq!(trajectory.steps.len(), 2);
    assert_eq!(trajectory.model_calls, 2);
    assert_stream_invariants(&events, &trajectory);
}

/// Verifies the cost ceiling wins over the step ceiling when both trip on the
/// same step.
#[test]
fn cost_limit_takes_precedence_over_step_limit() {
    let mut run = TestRun::new().expect("run");
    run.config.agent.cost_limit = 0.05;
    run.config.agent.step_limit = 2;
    let outcome = run.run(
        vec![command_reply("ls", 0.03), command_reply("pwd", 0.03)],
        Vec::new(),
    );

    assert_eq!(outcome.status, StopReason::CostLimit);
    assert_eq!(outcome.steps, 2);
    assert!((outcome.total_cost - 0.06).abs() < 1e-9);

    let trajectory = load(&run);
    assert_eq!(trajectory.exit_status, StopReason::CostLimit);
    assert!((trajectory.total_cost - 0.06).abs() < 1e-9);
    assert_stream_invariants(&run.sink.events(), &trajectory);
}

/// Verifies a timed-out command is reported on its output event and the run
/// carries on with the model's next thought.
#[test]
fn timeout_is_reported_and_run_continues() {
    let run = TestRun::new().expect("run");
    let model = Arc::new(ScriptedModel::new(vec![
        command_reply("sleep 100", 0.01),
        command_reply("echo ok", 0.01),
        completion("Finished after retry."),
    ]));
    let env = ScriptedEnvironment::new(vec![
        ScriptedExec::Outcome(ExecOutcome::TimedOut {
            output: ExecOutput::new("partial", ""),
        }),
        exited("ok\n"),
    ]);
    let outcome = run.agent(Arc::clone(&model), env).run(run.task());

    assert_eq!(outcome.status, StopReason::Completed);
    assert_eq!(outcome.steps, 3);

    let events = run.sink.events();
    let timed_out = events
        .iter()
        .position(|e| e["type"] == "output" && e["data"]["timed_out"] == true)
        .expect("timeout output");
    let output = &events[timed_out]["data"];
    assert!(output["exit_code"].is_null());
    assert!(output["error"].as_str().expect("error").contains("timed out"));
    assert_eq!(events[timed_out + 1]["type"], "thought");

    let second_call = &model.conversations()[1];
    let feedback = second_call.last().expect("message");
    assert_eq!(feedback.role, Role::User);
    assert!(feedback.content.contains("sleep 100"));

    let trajectory = load(&run);
    let step = &trajectory.steps[0];
    assert_eq!(step.output.as_ref().expect("output").exit_code, None);
    assert_stream_invariants(&events, &trajectory);
}

/// Verifies `abort_on_timeout` turns a timeout into a terminal error.
#[test]
fn abort_on_timeout_stops_with_error() {
    let mut run = TestRun::new().expect("run");
    run.config.agent.abort_on_timeout = true;
    let outcome = run.run(
        vec![command_reply("sleep 100", 0.01)],
        vec![ScriptedExec::Outcome(ExecOutcome::TimedOut {
            output: ExecOutput::default(),
        })],
    );

    assert_eq!(outcome.status, StopReason::Error);
    let events = run.sink.events();
    let error = &events[events.len() - 2];
    assert_eq!(error["data"]["kind"], "execution_timeout");
    assert_stream_invariants(&events, &load(&run));
}

/// Verifies a model failure at step 3 leaves three steps, an `error` status
/// and a diagnostic in the trajectory.
#[test]
fn model_failure_at_step_three_is_recorded() {
    let run = TestRun::new().expect("run");
    let outcome = run.run(
        vec![
            command_reply("ls", 0.01),
            command_reply("cat README.md", 0.01),
            ScriptedReply::Fail(ModelError::Api("upstream returned 500".to_string())),
        ],
        Vec::new(),
    );

    assert_eq!(outcome.status, StopReason::Error);
    assert_eq!(outcome.steps, 3);

    let events = run.sink.events();
    let error = &events[events.len() - 2]["data"];
    assert_eq!(error["kind"], "model_failure");
    assert_eq!(error["step"], 3);
    assert_eq!(error["recoverable"], false);

    let trajectory = load(&run);
    assert_eq!(trajectory.exit_status, StopReason::Error);
    assert_eq!(trajectory.steps.len(), 3);
    assert_eq!(trajectory.steps[2].response, "");
    assert!(
        trajectory
            .diagnostic
            .as_deref()
            .expect("diagnostic")
            .contains("upstream returned 500")
    );
    assert_stream_invariants(&events, &trajectory);
}

/// Verifies a panic inside an iteration is contained and classified.
#[test]
fn panic_in_model_is_contained() {
    let run = TestRun::new().expect("run");
    let outcome = run.run(
        vec![
            command_reply("ls", 0.01),
            ScriptedReply::Panic("backend exploded".to_string()),
        ],
        Vec::new(),
    );

    assert_eq!(outcome.status, StopReason::Error);
    assert_eq!(outcome.steps, 2);
    let events = run.sink.events();
    assert_eq!(events[events.len() - 2]["data"]["kind"], "unclassified");
    let trajectory = load(&run);
    assert!(
        trajectory
            .diagnostic
            .as_deref()
            .expect("diagnostic")
            .contains("backend exploded")
    );
    assert_stream_invariants(&events, &trajectory);
}

/// Verifies an unclassified failure at step 3 leaves three recorded steps,
/// an `error` status and the panic message as diagnostic.
#[test]
fn panic_at_step_three_is_unclassified() {
    let run = TestRun::new().expect("run");
    let outcome = run.run(
        vec![
            command_reply("ls", 0.01),
            command_reply("pwd", 0.01),
            ScriptedReply::Panic("tokenizer state corrupted".to_string()),
        ],
        vec![exited("src\n"), exited("/work\n")],
    );

    assert_eq!(outcome.status, StopReason::Error);
    assert_eq!(outcome.steps, 3);
    assert!(
        outcome
            .diagnostic
            .as_deref()
            .expect("diagnostic")
            .contains("tokenizer state corrupted")
    );

    let events = run.sink.events();
    let error = &events[events.len() - 2]["data"];
    assert_eq!(error["kind"], "unclassified");
    assert_eq!(error["step"], 3);
    assert_eq!(error["recoverable"], false);

    let trajectory = load(&run);
    assert_eq!(trajectory.exit_status, StopReason::Error);
    assert_eq!(trajectory.steps.len(), 3);
    assert_eq!(trajectory.steps[0].command.as_deref(), Some("ls"));
    assert_eq!(trajectory.steps[1].command.as_deref(), Some("pwd"));
    assert_eq!(trajectory.steps[2].command, None);
    assert!(
        trajectory
            .diagnostic
            .as_deref()
            .expect("diagnostic")
            .contains("tokenizer state corrupted")
    );
    assert_stream_invariants(&events, &trajectory);
}

/// Verifies an environment that cannot run commands ends the run with the
/// full error chain as detail.
#[test]
fn environment_failure_reports_context_chain() {
    let run = TestRun::new().expect("run");
    let outcome = run
        .agent(
            ScriptedModel::new(vec![command_reply("ls", 0.01)]),
            FailingEnvironment::new("permission denied"),
        )
        .run(run.task());

    assert_eq!(outcome.status, StopReason::Error);
    assert_eq!(outcome.steps, 1);
    let events = run.sink.events();
    let error = &events[events.len() - 2]["data"];
    assert_eq!(error["kind"], "unclassified");
    assert!(
        error["detail"]
            .as_str()
            .expect("detail")
            .ends_with("permission denied")
    );
    assert_eq!(
        run.sink.kinds(),
        ["start", "thought", "cost", "command", "output", "error", "finish"]
    );
    let output = &events[4]["data"];
    assert!(output["exit_code"].is_null());
    assert_eq!(output["stdout"], "");
    assert!(
        output["error"]
            .as_str()
            .expect("error")
            .contains("permission denied")
    );

    let trajectory = load(&run);
    let step = trajectory.steps[0].output.as_ref().expect("output");
    assert_eq!(step.exit_code, None);
    assert!(step.error.as_deref().expect("error").contains("permission denied"));
    assert_stream_invariants(&events, &trajectory);
}

/// Verifies a panic while running a command still pairs the command with an
/// output event before the run stops.
#[test]
fn panic_in_environment_keeps_output_paired() {
    let run = TestRun::new().expect("run");
    let outcome = run.run(
        vec![command_reply("ls", 0.01)],
        vec![ScriptedExec::Panic("sandbox vanished".to_string())],
    );

    assert_eq!(outcome.status, StopReason::Error);
    assert_eq!(outcome.steps, 1);
    let events = run.sink.events();
    assert_eq!(
        run.sink.kinds(),
        ["start", "thought", "cost", "command", "output", "error", "finish"]
    );
    assert!(
        events[4]["data"]["error"]
            .as_str()
            .expect("error")
            .contains("sandbox vanished")
    );
    assert_eq!(events[5]["data"]["kind"], "unclassified");
    assert_stream_invariants(&events, &load(&run));
}

/// Verifies a response with two commands gets a corrective message and the
/// run recovers on the next step.
#[test]
fn multiple_commands_trigger_corrective_retry() {
    let run = TestRun::new().expect("run");
    let model = Arc::new(ScriptedModel::new(vec![
        text_reply("```bash\nls\n```\nand\n```bash\npwd\n```", 0.01),
        command_reply("ls", 0.01),
        completion("Listed."),
    ]));
    let env = Arc::new(ScriptedEnvironment::new(Vec::new()));
    let outcome = run
        .agent(Arc::clone(&model), Arc::clone(&env))
        .run(run.task());

    assert_eq!(outcome.status, StopReason::Completed);
    assert_eq!(outcome.steps, 3);
    assert_eq!(env.commands(), ["ls"]);
    assert_eq!(
        run.sink.kinds(),
        [
            "start", "thought", "cost", "error", "thought", "cost", "command", "output",
            "thought", "cost", "finish"
        ]
    );
    let events = run.sink.events();
    assert_eq!(events[3]["data"]["kind"], "parse_ambiguity");
    assert_eq!(events[3]["data"]["recoverable"], true);
    assert_eq!(events[3]["data"]["step"], 1);

    let correction = model.conversations()[1]
        .last()
        .expect("message")
        .content
        .clone();
    assert!(correction.contains("contained 2"));

    let trajectory = load(&run);
    assert!(trajectory.steps[0].format_error.is_some());
    assert_eq!(trajectory.steps[0].command, None);
    assert_stream_invariants(&events, &trajectory);
}

/// Verifies consecutive format errors beyond the configured bound stop the run.
#[test]
fn format_error_bound_stops_run() {
    let mut run = TestRun::new().expect("run");
    run.config.agent.max_format_errors = 2;
    let outcome = run.run(
        vec![
            text_reply("thinking out loud", 0.01),
            text_reply("still thinking", 0.01),
            text_reply("no command again", 0.01),
            command_reply("ls", 0.01),
        ],
        Vec::new(),
    );

    assert_eq!(outcome.status, StopReason::Error);
    assert_eq!(outcome.steps, 3);

    let events = run.sink.events();
    let errors: Vec<&Value> = events.iter().filter(|e| e["type"] == "error").collect();
    assert_eq!(errors.len(), 3);
    assert_eq!(errors[0]["data"]["recoverable"], true);
    assert_eq!(errors[1]["data"]["recoverable"], true);
    assert_eq!(errors[2]["data"]["recoverable"], false);
    assert_eq!(errors[2]["data"]["kind"], "parse_ambiguity");
    assert_stream_invariants(&events, &load(&run));
}

/// Verifies a successful parse resets the consecutive format error count.
#[test]
fn successful_parse_resets_format_errors() {
    let mut run = TestRun::new().expect("run");
    run.config.agent.max_format_errors = 1;
    let outcome = run.run(
        vec![
            text_reply("no command", 0.01),
            command_reply("ls", 0.01),
            text_reply("no command", 0.01),
            completion("ok"),
        ],
        Vec::new(),
    );

    assert_eq!(outcome.status, StopReason::Completed);
    assert_eq!(outcome.steps, 4);
}

/// Verifies an interrupt requested mid-command lets the command finish and
/// stops before the next step.
#[test]
fn interrupt_stops_before_next_step() {
    let run = TestRun::new().expect("run");
    let interrupt = Interrupt::new();
    let outcome = run
        .agent(
            ScriptedModel::new(vec![command_reply("make", 0.01), command_reply("ls", 0.01)]),
            ScriptedEnvironment::new(vec![ScriptedExec::Interrupting {
                interrupt: interrupt.clone(),
                force: false,
                outcome: ExecOutcome::exited("built\n", "", 0),
            }]),
        )
        .with_interrupt(interrupt)
        .run(run.task());

    assert_eq!(outcome.status, StopReason::Interrupted);
    assert_eq!(outcome.steps, 1);
    assert_eq!(
        run.sink.kinds(),
        ["start", "thought", "cost", "command", "output", "finish"]
    );
    let trajectory = load(&run);
    assert_eq!(trajectory.exit_status, StopReason::Interrupted);
    assert_stream_invariants(&run.sink.events(), &trajectory);
}

/// Verifies a forced interrupt that kills the command still finalizes.
#[test]
fn forced_interrupt_finalizes_with_killed_output() {
    let run = TestRun::new().expect("run");
    let interrupt = Interrupt::new();
    let outcome = run
        .agent(
            ScriptedModel::new(vec![command_reply("sleep 100", 0.01)]),
            ScriptedEnvironment::new(vec![ScriptedExec::Interrupting {
                interrupt: interrupt.clone(),
                force: true,
                outcome: ExecOutcome::Interrupted {
                    output: ExecOutput::new("half", ""),
                },
            }]),
        )
        .with_interrupt(interrupt)
        .run(run.task());

    assert_eq!(outcome.status, StopReason::Interrupted);
    assert_eq!(outcome.steps, 1);
    let events = run.sink.events();
    let output = events
        .iter()
        .find(|e| e["type"] == "output")
        .expect("output");
    assert!(output["data"]["exit_code"].is_null());
    assert_stream_invariants(&events, &load(&run));
}

/// Verifies an interrupt raised before the run starts yields an empty,
/// finalized trajectory.
#[test]
fn interrupt_before_first_step() {
    let run = TestRun::new().expect("run");
    let interrupt = Interrupt::new();
    interrupt.request();
    let outcome = run
        .agent(
            ScriptedModel::new(vec![command_reply("ls", 0.01)]),
            ScriptedEnvironment::new(Vec::new()),
        )
        .with_interrupt(interrupt)
        .run(run.task());

    assert_eq!(outcome.status, StopReason::Interrupted);
    assert_eq!(outcome.steps, 0);
    assert_eq!(run.sink.kinds(), ["start", "finish"]);
    let trajectory = load(&run);
    assert!(trajectory.steps.is_empty());
    assert_eq!(trajectory.messages.len(), 2);
}

/// Verifies output beyond `max_output_length`, or bytes dropped by the
/// process layer, mark the step and event as truncated.
#[test]
fn long_output_is_truncated() {
    let mut run = TestRun::new().expect("run");
    run.config.headless.max_output_length = 10;
    let outcome = run.run(
        vec![
            command_reply("cat big.log", 0.01),
            command_reply("cat small.log", 0.01),
            completion("done"),
        ],
        vec![
            exited(&"x".repeat(50)),
            ScriptedExec::Outcome(ExecOutcome::Exited {
                output: ExecOutput {
                    stdout: "tiny".to_string(),
                    stderr: String::new(),
                    dropped_bytes: 5,
                },
                exit_code: Some(0),
            }),
        ],
    );

    assert_eq!(outcome.status, StopReason::Completed);
    let events = run.sink.events();
    let outputs: Vec<&Value> = events.iter().filter(|e| e["type"] == "output").collect();
    assert_eq!(outputs[0]["data"]["truncated"], true);
    assert!(
        outputs[0]["data"]["stdout"]
            .as_str()
            .expect("stdout")
            .contains("truncated, 50 total chars")
    );
    assert_eq!(outputs[1]["data"]["truncated"], true);
    assert_eq!(outputs[1]["data"]["stdout"], "tiny");

    let trajectory = load(&run);
    assert!(trajectory.steps[0].truncated);
    assert!(trajectory.steps[1].truncated);
    assert_stream_invariants(&events, &trajectory);
}

/// Verifies the trajectory keeps usage totals and the full conversation.
#[test]
fn trajectory_records_usage_and_messages() {
    let run = TestRun::new().expect("run");
    run.run(
        vec![command_reply("ls", 0.02), completion("listed")],
        vec![exited("a.rs\nb.rs\n")],
    );

    let trajectory = load(&run);
    assert_eq!(trajectory.model_calls, 2);
    assert_eq!(trajectory.input_tokens, 200);
    assert!((trajectory.total_cost - 0.03).abs() < 1e-9);
    assert!((trajectory.steps[0].cost - 0.02).abs() < 1e-9);
    let roles: Vec<Role> = trajectory.messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        [
            Role::System,
            Role::User,
            Role::Assistant,
            Role::User,
            Role::Assistant
        ]
    );
    assert!(trajectory.messages[3].content.contains("a.rs"));
}
